//! NLU runtime client (Rasa REST channel).
//!
//! `POST {base}/webhooks/rest/webhook` with `{sender, message}`; the runtime answers with a JSON
//! array of reply fragments. Every call carries a fixed timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NluError {
    #[error("nlu request timed out after {0:?}")]
    Timeout(Duration),
    #[error("nlu request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("nlu api error: {0}")]
    Api(String),
    #[error("nlu response malformed: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for NluError {
    fn from(e: reqwest::Error) -> Self {
        NluError::Request(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRequest<'a> {
    pub sender: &'a str,
    pub message: &'a str,
}

/// One reply fragment. Fragments without text (images, buttons) decode with `text == None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFragment {
    #[serde(default)]
    pub text: Option<String>,
}

/// Seam between the router and the NLU runtime so tests can substitute a fake.
#[async_trait]
pub trait NluRuntime: Send + Sync {
    async fn send(
        &self,
        base_url: &str,
        sender: &str,
        message: &str,
    ) -> Result<Vec<ReplyFragment>, NluError>;
}

#[derive(Clone)]
pub struct NluClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl NluClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for NluClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl NluRuntime for NluClient {
    async fn send(
        &self,
        base_url: &str,
        sender: &str,
        message: &str,
    ) -> Result<Vec<ReplyFragment>, NluError> {
        let url = format!("{}/webhooks/rest/webhook", base_url.trim_end_matches('/'));
        let body = WebhookRequest { sender, message };
        let res = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(NluError::Api(format!("{} {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| NluError::Decode(e.to_string()))
    }
}

impl NluClient {
    fn classify(&self, e: reqwest::Error) -> NluError {
        if e.is_timeout() {
            NluError::Timeout(self.timeout)
        } else {
            NluError::Request(e)
        }
    }
}
