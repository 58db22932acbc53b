//! Outbound build webhooks.

use crate::model::{Build, Repo};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const USER_AGENT_VALUE: &str = concat!("conduit/", env!("CARGO_PKG_VERSION"));

pub const EVENT_BUILD: &str = "build";
pub const ACTION_UPDATED: &str = "updated";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("webhook endpoint returned {status}")]
    Status { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookData {
    pub event: String,
    pub action: String,
    pub repo: Repo,
    pub build: Build,
}

impl WebhookData {
    /// Payload announcing that a build changed.
    pub fn build_updated(repo: &Repo, build: &Build) -> Self {
        Self {
            event: EVENT_BUILD.to_string(),
            action: ACTION_UPDATED.to_string(),
            repo: repo.clone(),
            build: build.clone(),
        }
    }
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, data: &WebhookData) -> Result<(), WebhookError>;
}

/// Posts webhook payloads as JSON to each configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpWebhookSender {
    pub fn new(endpoints: Vec<String>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT_VALUE)
            .build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, data: &WebhookData) -> Result<(), WebhookError> {
        for url in &self.endpoints {
            debug!(url = %url, event = %data.event, action = %data.action, "sending webhook");
            let response = self.client.post(url).json(data).send().await?;
            if !response.status().is_success() {
                return Err(WebhookError::Status {
                    status: response.status().as_u16(),
                });
            }
        }
        Ok(())
    }
}
