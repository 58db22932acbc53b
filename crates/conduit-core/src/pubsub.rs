//! Build event bus.

use crate::model::{Build, Repo, Stage, Visibility};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("cannot encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Event published for one repository, scoped by its visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub repository: String,
    pub visibility: Visibility,
    pub data: serde_json::Value,
}

/// Payload of a build change event.
#[derive(Debug, Clone, Serialize)]
pub struct BuildEvent<'a> {
    pub repo: &'a Repo,
    pub build: &'a Build,
    #[serde(skip_serializing_if = "no_stages")]
    pub stages: &'a [Stage],
}

fn no_stages(stages: &&[Stage]) -> bool {
    stages.is_empty()
}

impl Message {
    pub fn build_event(repo: &Repo, build: &Build, stages: &[Stage]) -> Result<Self, PubsubError> {
        let data = serde_json::to_value(BuildEvent {
            repo,
            build,
            stages,
        })?;
        Ok(Self {
            repository: repo.slug.clone(),
            visibility: repo.visibility,
            data,
        })
    }
}

#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), PubsubError>;
}

/// In-process bus over a `tokio` broadcast channel.
///
/// Publishing with no subscribers succeeds; slow subscribers observe
/// `Lagged` rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct BroadcastPubsub {
    tx: broadcast::Sender<Message>,
}

impl BroadcastPubsub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPubsub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Pubsub for BroadcastPubsub {
    async fn publish(&self, message: Message) -> Result<(), PubsubError> {
        // Err only means nobody is listening.
        let _ = self.tx.send(message);
        Ok(())
    }
}
