use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use medflow_core::constants::DEFAULT_DATA_DIR;
use medflow_core::pipeline::{HttpProposer, OfflineProposer, PipelineOrchestrator, Proposer};
use medflow_core::{CoreConfig, FileEhrStore, FileSessionStore};

/// Main entry point for the MedFlow server
///
/// Resolves configuration once, builds the file-backed session and EHR stores and serves the
/// REST API.
///
/// # Environment Variables
/// - `MEDFLOW_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `MEDFLOW_DATA_DIR`: Directory for sessions and EHR records (default: "medflow_data")
/// - `MEDFLOW_CONFIG`: Optional YAML file with rule tables and pipeline settings
/// - `MEDFLOW_PROPOSER_URL`: Base URL of the generative stage service; when unset every
///   generative stage runs on its deterministic fallback
///
/// # Errors
/// Returns an error if:
/// - the configuration file cannot be read or fails validation,
/// - the data directories cannot be created,
/// - the proposer URL is invalid, or
/// - the server address cannot be bound.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(env_filter()?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("MEDFLOW_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let data_dir = std::env::var("MEDFLOW_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.into());
    let config_file = std::env::var("MEDFLOW_CONFIG").ok().map(PathBuf::from);

    let cfg = Arc::new(CoreConfig::load(
        PathBuf::from(data_dir),
        config_file.as_deref(),
    )?);

    let proposer: Arc<dyn Proposer> = match std::env::var("MEDFLOW_PROPOSER_URL") {
        Ok(url) if !url.trim().is_empty() => {
            tracing::info!(proposer_url = %url, "using remote proposer");
            Arc::new(HttpProposer::new(url)?)
        }
        _ => {
            tracing::warn!("MEDFLOW_PROPOSER_URL not set; generative stages will degrade");
            Arc::new(OfflineProposer)
        }
    };

    let store = Arc::new(FileSessionStore::open(cfg.sessions_dir())?);
    let ehr = Arc::new(FileEhrStore::new(cfg.ehr_dir()));
    let orchestrator = PipelineOrchestrator::new(cfg.clone(), store, proposer, ehr)?;

    tracing::info!(
        addr = %rest_addr,
        data_dir = %cfg.data_dir().display(),
        "++ Starting MedFlow REST"
    );

    let app = router(AppState::new(Arc::new(orchestrator)));
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// `RUST_LOG` plus info level for this binary and the workspace libraries.
fn env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    Ok(tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(concat!(env!("CARGO_CRATE_NAME"), "=info").parse()?)
        .add_directive("medflow_core=info".parse()?)
        .add_directive("api_rest=info".parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_names_this_binary() {
        let filter = env_filter().expect("valid directives").to_string();
        assert!(filter.contains("medflow_run=info"), "{filter}");
        assert!(filter.contains("medflow_core=info"), "{filter}");
    }
}
