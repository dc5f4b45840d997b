use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use medflow_core::constants::DEFAULT_DATA_DIR;
use medflow_core::pipeline::{IntakeRequest, OfflineProposer, PipelineOrchestrator, SessionView};
use medflow_core::{
    ClinicalRecord, ContentHash, CoreConfig, FileEhrStore, FileSessionStore, IntegrityGate,
    SessionId, Verdict,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "medflow")]
#[command(about = "MedFlow triage pipeline CLI")]
struct Cli {
    /// Data directory for sessions and EHR records (default: MEDFLOW_DATA_DIR or ./medflow_data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// YAML configuration file (default: MEDFLOW_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan text for red flags
    Scan { text: String },
    /// Run one rules-only triage turn (no generative stages)
    Triage {
        /// Patient narrative
        text: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        patient: String,
        /// Record consent and write the sealed record to the EHR store
        #[arg(long)]
        consent: bool,
    },
    /// Show a session's latched level and history
    Show { session: String },
    /// Close a session
    Close {
        session: String,
        #[arg(long)]
        expected_version: u64,
    },
    /// Compute the content hash of a clinical record JSON file
    Seal {
        record: PathBuf,
        /// Consent time (RFC 3339); defaults to now
        #[arg(long)]
        consent_at: Option<DateTime<Utc>>,
    },
    /// Check a clinical record JSON file against a sealed hash
    Verify {
        record: PathBuf,
        #[arg(long)]
        hash: String,
        /// Consent time (RFC 3339) captured with the hash
        #[arg(long)]
        consent_at: DateTime<Utc>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli).await? {
        Some(output) => println!("{output}"),
        None => println!("Use 'medflow --help' for commands"),
    }
    Ok(())
}

/// Runs a parsed command and returns what should be printed.
async fn execute(cli: Cli) -> anyhow::Result<Option<String>> {
    let Some(command) = cli.command else {
        return Ok(None);
    };
    let config = load_config(cli.data_dir, cli.config)?;

    let output = match command {
        Commands::Scan { text } => {
            let report = config.rule_engine()?.scan(&text);
            serde_json::to_string_pretty(&report)?
        }
        Commands::Triage {
            text,
            session,
            patient,
            consent,
        } => {
            let orchestrator = orchestrator(config)?;
            let response = orchestrator
                .run(IntakeRequest {
                    session_id: session,
                    patient_id: patient,
                    message: text,
                    consent,
                })
                .await?;
            serde_json::to_string_pretty(&response)?
        }
        Commands::Show { session } => {
            let orchestrator = orchestrator(config)?;
            let session = orchestrator.latch().get(&SessionId::parse(&session)?)?;
            serde_json::to_string_pretty(&SessionView::from(&session))?
        }
        Commands::Close {
            session,
            expected_version,
        } => {
            let orchestrator = orchestrator(config)?;
            let closed = orchestrator
                .latch()
                .close(&SessionId::parse(&session)?, expected_version)?;
            serde_json::to_string_pretty(&SessionView::from(&closed))?
        }
        Commands::Seal { record, consent_at } => {
            let record = read_record(&record)?;
            let sealed =
                IntegrityGate::capture_consent(record, consent_at.unwrap_or_else(Utc::now))?;
            serde_json::to_string_pretty(&serde_json::json!({
                "case_id": sealed.record.case_id,
                "content_hash": sealed.content_hash,
                "consent_captured_at": sealed.consent_captured_at,
            }))?
        }
        Commands::Verify {
            record,
            hash,
            consent_at,
        } => {
            let record = read_record(&record)?;
            let verdict = IntegrityGate::verify(&record, &ContentHash::parse(&hash)?, consent_at)?;
            if let Verdict::Block { reason } = &verdict {
                anyhow::bail!("integrity gate blocked: {reason}");
            }
            serde_json::to_string_pretty(&verdict)?
        }
    };
    Ok(Some(output))
}

fn load_config(data_dir: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<CoreConfig> {
    let data_dir = data_dir
        .or_else(|| std::env::var_os("MEDFLOW_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let config_file = config.or_else(|| std::env::var_os("MEDFLOW_CONFIG").map(PathBuf::from));
    Ok(CoreConfig::load(data_dir, config_file.as_deref())?)
}

/// File-backed orchestrator without generative stages.
fn orchestrator(config: CoreConfig) -> anyhow::Result<PipelineOrchestrator> {
    let store = FileSessionStore::open(config.sessions_dir())?;
    let ehr = FileEhrStore::new(config.ehr_dir());
    Ok(PipelineOrchestrator::new(
        Arc::new(config),
        Arc::new(store),
        Arc::new(OfflineProposer),
        Arc::new(ehr),
    )?)
}

fn read_record(path: &Path) -> anyhow::Result<ClinicalRecord> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medflow_core::CaseId;
    use serde_json::Value;

    async fn run(args: &[&str]) -> anyhow::Result<Value> {
        let cli = Cli::try_parse_from(std::iter::once("medflow").chain(args.iter().copied()))?;
        let output = execute(cli).await?.unwrap_or_default();
        Ok(serde_json::from_str(&output)?)
    }

    #[tokio::test]
    async fn scan_prints_flags() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf-8 path");
        let report = run(&["scan", "sudden chest pain", "--data-dir", data_dir])
            .await
            .expect("scan");
        assert_eq!(report["level"], "emergency");
        assert_eq!(report["primary"]["category"], "cardiac");
    }

    #[tokio::test]
    async fn triage_latches_across_invocations() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf-8 path");

        let first = run(&[
            "triage", "high fever", "--session", "enc-1", "--patient", "p-1", "--data-dir",
            data_dir,
        ])
        .await
        .expect("first turn");
        assert_eq!(first["triage"]["level"], "urgent");
        assert_eq!(first["metadata"]["degraded"], true);

        let second = run(&[
            "triage", "a bit better", "--session", "enc-1", "--patient", "p-1", "--data-dir",
            data_dir,
        ])
        .await
        .expect("second turn");
        assert_eq!(second["triage"]["level"], "urgent");

        let shown = run(&["show", "enc-1", "--data-dir", data_dir])
            .await
            .expect("show");
        assert_eq!(shown["latch_version"], 2);

        let closed = run(&["close", "enc-1", "--expected-version", "2", "--data-dir", data_dir])
            .await
            .expect("close");
        assert_eq!(closed["closed"], true);
    }

    #[tokio::test]
    async fn seal_and_verify_a_written_record() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf-8 path");

        let turn = run(&[
            "triage",
            "vomiting blood",
            "--session",
            "enc-2",
            "--patient",
            "p-2",
            "--consent",
            "--data-dir",
            data_dir,
        ])
        .await
        .expect("turn");
        assert_eq!(turn["workflow_status"], "saved");

        let case_id = CaseId::parse(turn["ehr"]["case_id"].as_str().expect("case id"))
            .expect("valid case id");
        let config = load_config(Some(dir.path().to_path_buf()), None).expect("config");
        let stored = FileEhrStore::new(config.ehr_dir())
            .read(&case_id)
            .expect("stored case");
        let record_path = dir.path().join("record.json");
        std::fs::write(
            &record_path,
            serde_json::to_string(&stored.sealed.record).expect("serialize"),
        )
        .expect("write record");
        let record_arg = record_path.to_str().expect("utf-8 path");
        let consent_at = stored.sealed.consent_captured_at.to_rfc3339();

        let sealed = run(&["seal", record_arg, "--consent-at", &consent_at])
            .await
            .expect("seal");
        assert_eq!(
            sealed["content_hash"],
            stored.sealed.content_hash.to_string()
        );

        let hash = stored.sealed.content_hash.to_string();
        let verdict = run(&["verify", record_arg, "--hash", &hash, "--consent-at", &consent_at])
            .await
            .expect("verify");
        assert_eq!(verdict["verdict"], "allow");

        let mut tampered = stored.sealed.record.clone();
        tampered.content.summary.chief_complaint = "nothing serious".into();
        std::fs::write(
            &record_path,
            serde_json::to_string(&tampered).expect("serialize"),
        )
        .expect("write record");
        let err = run(&["verify", record_arg, "--hash", &hash, "--consent-at", &consent_at])
            .await
            .expect_err("tampered record is blocked");
        assert!(err.to_string().contains("blocked"), "{err}");
    }
}
