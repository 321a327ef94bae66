//! Pass-through to the synth collaborator that produces the session's audio.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::envelope::SESSION_ID_HEADER;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("synth request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("synth responded with {0}")]
    Status(StatusCode),
}

#[async_trait]
pub trait SynthCodeSource: Send + Sync {
    /// `Ok(None)` when the collaborator has nothing for this session.
    async fn fetch(&self, session_id: &str) -> Result<Option<String>, SynthError>;
}

/// Used when no synth collaborator is configured.
pub struct NoSynthSource;

#[async_trait]
impl SynthCodeSource for NoSynthSource {
    async fn fetch(&self, _session_id: &str) -> Result<Option<String>, SynthError> {
        Ok(None)
    }
}

pub struct HttpSynthCodeSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSynthCodeSource {
    pub fn new(url: impl Into<String>) -> Result<Self, SynthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SynthCodeSource for HttpSynthCodeSource {
    async fn fetch(&self, session_id: &str) -> Result<Option<String>, SynthError> {
        let response = self
            .client
            .get(&self.url)
            .header(SESSION_ID_HEADER, session_id)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await?;
                debug!(session = %session_id, bytes = body.len(), "synth code fetched");
                Ok(Some(body))
            }
            status => Err(SynthError::Status(status)),
        }
    }
}
