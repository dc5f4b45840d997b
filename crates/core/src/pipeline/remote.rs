//! HTTP-backed proposer.
//!
//! Each generative stage is served by `POST {base_url}/propose/{stage}` with the
//! [`StageRequest`] as the JSON body. The response body is the candidate JSON, returned
//! untouched for the orchestrator to validate.

use super::{Proposer, ProposerError, StageRequest};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Connect timeout for the proposer service. Per-attempt timeouts are enforced by the
/// orchestrator.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest error body kept in a [`ProposerError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpProposer {
    client: Client,
    base_url: String,
}

impl HttpProposer {
    /// Builds a proposer for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ProposerError::Transport`] if `base_url` is not an http(s) URL or the client
    /// cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProposerError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_owned();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProposerError::Transport(format!(
                "proposer URL must start with http:// or https://: '{base_url}'"
            )));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProposerError::Transport(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint serving `request.stage`.
    pub fn endpoint(&self, request: &StageRequest) -> String {
        format!("{}/propose/{}", self.base_url, request.stage)
    }
}

#[async_trait]
impl Proposer for HttpProposer {
    async fn propose(&self, request: &StageRequest) -> Result<serde_json::Value, ProposerError> {
        let url = self.endpoint(request);
        tracing::debug!(stage = %request.stage, url = %url, "calling remote proposer");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ProposerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ProposerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProposerError::InvalidCandidate(format!("response is not JSON: {e}")))
    }
}
