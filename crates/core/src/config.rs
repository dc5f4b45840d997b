//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services.
//! Binaries read environment variables and the optional YAML file; nothing in this crate
//! reads the environment during request handling.
//!
//! YAML layout (every section optional):
//!
//! ```yaml
//! rules:
//!   categories:
//!     - name: cardiac
//!       severity: emergency
//!       phrases: ["chest pain"]
//!   high_risk_groups: ["diabetes"]
//! pipeline:
//!   retry_budget: 2
//!   backoff_ms: 200
//!   stage_timeout_ms: 15000
//!   stage_timeouts_ms:
//!     triage: 10000
//!   safety_net_questions: ["Has your condition worsened?"]
//! ```

use crate::constants::{
    DEFAULT_BACKOFF_MS, DEFAULT_RETRY_BUDGET, DEFAULT_SAFETY_NET_QUESTIONS,
    DEFAULT_STAGE_TIMEOUT_MS, EHR_DIR_NAME, MAX_RETRY_BUDGET, SESSIONS_DIR_NAME,
};
use crate::pipeline::Stage;
use crate::rules::{RuleEngine, RuleTable};
use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest backoff between two attempts, however large the attempt number.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry, timeout and fallback settings for generative stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Retries after the first attempt.
    pub retry_budget: u32,
    pub backoff_ms: u64,
    pub stage_timeout_ms: u64,
    pub stage_timeouts_ms: BTreeMap<Stage, u64>,
    pub safety_net_questions: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_ms: DEFAULT_BACKOFF_MS,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            stage_timeouts_ms: BTreeMap::new(),
            safety_net_questions: DEFAULT_SAFETY_NET_QUESTIONS
                .iter()
                .map(|q| (*q).to_owned())
                .collect(),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> CoreResult<()> {
        if self.retry_budget > MAX_RETRY_BUDGET {
            return Err(CoreError::Config(format!(
                "retry_budget must be at most {MAX_RETRY_BUDGET}, got {}",
                self.retry_budget
            )));
        }
        if self.stage_timeout_ms == 0 || self.stage_timeouts_ms.values().any(|ms| *ms == 0) {
            return Err(CoreError::Config("stage timeouts must be positive".into()));
        }
        if let Some(stage) = self
            .stage_timeouts_ms
            .keys()
            .find(|stage| !stage.is_generative())
        {
            return Err(CoreError::Config(format!(
                "stage '{stage}' is deterministic and takes no timeout"
            )));
        }
        if self.safety_net_questions.iter().all(|q| q.trim().is_empty()) {
            return Err(CoreError::Config(
                "at least one non-empty safety-net question is required".into(),
            ));
        }
        Ok(())
    }

    /// Per-attempt timeout for `stage`.
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        let ms = self
            .stage_timeouts_ms
            .get(&stage)
            .copied()
            .unwrap_or(self.stage_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `retry` (1-based): `backoff_ms * 2^(retry - 1)`, capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }

    /// Safety-net questions with blanks removed.
    pub fn safety_net_questions(&self) -> Vec<String> {
        self.safety_net_questions
            .iter()
            .map(|q| q.trim().to_owned())
            .filter(|q| !q.is_empty())
            .collect()
    }
}

/// Contents of the optional YAML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub rules: RuleTable,
    pub pipeline: PipelineSettings,
}

/// Strictly parse the YAML configuration file.
///
/// Uses `serde_path_to_error` so a bad field is reported with its path (for example
/// `pipeline.retry_budget`).
pub fn parse_config_yaml(yaml_text: &str) -> CoreResult<ConfigFile> {
    if yaml_text.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
    match serde_path_to_error::deserialize(deserializer) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            let path = err.path().to_string();
            let source = err.into_inner();
            let path = if path.is_empty() || path == "." {
                "<root>"
            } else {
                path.as_str()
            };
            Err(CoreError::YamlDeserialization(format!(
                "configuration mismatch at {path}: {source}"
            )))
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    rules: RuleTable,
    pipeline: PipelineSettings,
}

impl CoreConfig {
    /// Create a new `CoreConfig`, validating the rule table and pipeline settings.
    pub fn new(
        data_dir: PathBuf,
        rules: RuleTable,
        pipeline: PipelineSettings,
    ) -> CoreResult<Self> {
        rules.validate()?;
        pipeline.validate()?;
        Ok(Self {
            data_dir,
            rules,
            pipeline,
        })
    }

    /// Built-in rules and settings rooted at `data_dir`.
    pub fn with_defaults(data_dir: PathBuf) -> CoreResult<Self> {
        Self::new(data_dir, RuleTable::default(), PipelineSettings::default())
    }

    /// Builds the configuration from `data_dir` and an optional YAML file.
    pub fn load(data_dir: PathBuf, config_file: Option<&Path>) -> CoreResult<Self> {
        let file = match config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(CoreError::FileRead)?;
                parse_config_yaml(&text)?
            }
            None => ConfigFile::default(),
        };
        Self::new(data_dir, file.rules, file.pipeline)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR_NAME)
    }

    pub fn ehr_dir(&self) -> PathBuf {
        self.data_dir.join(EHR_DIR_NAME)
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn pipeline(&self) -> &PipelineSettings {
        &self.pipeline
    }

    /// Compiles the configured rule table.
    pub fn rule_engine(&self) -> CoreResult<RuleEngine> {
        RuleEngine::new(&self.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = CoreConfig::with_defaults(PathBuf::from("/tmp/medflow")).expect("valid");
        assert_eq!(cfg.pipeline().retry_budget, DEFAULT_RETRY_BUDGET);
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/tmp/medflow/sessions"));
        assert_eq!(cfg.ehr_dir(), PathBuf::from("/tmp/medflow/ehr"));
    }

    #[test]
    fn empty_yaml_is_all_defaults() {
        assert_eq!(parse_config_yaml("  \n").expect("empty"), ConfigFile::default());
    }

    #[test]
    fn per_stage_timeouts_override_the_default() {
        let cfg = parse_config_yaml(
            "pipeline:\n  stage_timeout_ms: 1000\n  stage_timeouts_ms:\n    triage: 250\n",
        )
        .expect("valid yaml");
        assert_eq!(
            cfg.pipeline.timeout_for(Stage::Triage),
            Duration::from_millis(250)
        );
        assert_eq!(
            cfg.pipeline.timeout_for(Stage::Summary),
            Duration::from_millis(1000)
        );
        // Rules section omitted: built-in table.
        assert_eq!(cfg.rules, RuleTable::default());
    }

    #[test]
    fn unknown_fields_report_their_path() {
        let err = parse_config_yaml("pipeline:\n  retries: 3\n").expect_err("unknown field");
        match err {
            CoreError::YamlDeserialization(msg) => {
                assert!(msg.contains("pipeline"), "{msg}");
                assert!(msg.contains("retries"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn retry_budget_is_capped() {
        let pipeline = PipelineSettings {
            retry_budget: MAX_RETRY_BUDGET + 1,
            ..PipelineSettings::default()
        };
        let err = CoreConfig::new(PathBuf::from("x"), RuleTable::default(), pipeline)
            .expect_err("too many retries");
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn deterministic_stages_cannot_have_timeouts() {
        let err = parse_config_yaml("pipeline:\n  stage_timeouts_ms:\n    workflow: 100\n")
            .and_then(|file| CoreConfig::new(PathBuf::from("x"), file.rules, file.pipeline))
            .expect_err("workflow is deterministic");
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = PipelineSettings {
            backoff_ms: 100,
            ..PipelineSettings::default()
        };
        assert_eq!(settings.backoff_for(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_for(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_for(3), Duration::from_millis(400));
        assert_eq!(settings.backoff_for(60), MAX_BACKOFF);
    }

    #[test]
    fn load_reads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "pipeline:\n  retry_budget: 0").expect("write");
        let cfg = CoreConfig::load(PathBuf::from("data"), Some(file.path())).expect("load");
        assert_eq!(cfg.pipeline().retry_budget, 0);
    }
}
