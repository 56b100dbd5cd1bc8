//! Endpoint discovery feed: how a region learns that local publishers and
//! subscribers came and went.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Appeared,
    Departed,
}

/// One discovery notification for a local endpoint.
///
/// Departed events only need `instance_id`; the other fields may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEvent {
    pub instance_id: String,
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub origin_tag: String,
    pub role: Role,
    pub state: EndpointState,
}

impl EndpointEvent {
    pub fn appeared(
        role: Role,
        instance_id: &str,
        topic_name: &str,
        type_name: &str,
        origin_tag: &str,
    ) -> Self {
        EndpointEvent {
            instance_id: instance_id.to_owned(),
            topic_name: topic_name.to_owned(),
            type_name: type_name.to_owned(),
            origin_tag: origin_tag.to_owned(),
            role,
            state: EndpointState::Appeared,
        }
    }

    pub fn departed(role: Role, instance_id: &str) -> Self {
        EndpointEvent {
            instance_id: instance_id.to_owned(),
            topic_name: String::new(),
            type_name: String::new(),
            origin_tag: String::new(),
            role,
            state: EndpointState::Departed,
        }
    }
}

/// Result of polling a feed. Running out of events is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedPoll {
    Event(EndpointEvent),
    /// Everything available right now has been delivered.
    EndOfBatch,
    /// The feed will not produce anything else.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("discovery feed I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DiscoveryFeed: Send {
    async fn poll(&mut self) -> Result<FeedPoll, FeedError>;
}

/// In-process feed driven through a [`FeedSender`].
#[derive(Debug)]
pub struct ChannelFeed {
    rx: mpsc::UnboundedReceiver<FeedPoll>,
}

#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<FeedPoll>,
}

impl ChannelFeed {
    pub fn channel() -> (FeedSender, ChannelFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FeedSender { tx }, ChannelFeed { rx })
    }
}

impl FeedSender {
    /// Returns false once the feed side is gone.
    pub fn send(&self, event: EndpointEvent) -> bool {
        self.tx.send(FeedPoll::Event(event)).is_ok()
    }

    pub fn end_batch(&self) -> bool {
        self.tx.send(FeedPoll::EndOfBatch).is_ok()
    }
}

#[async_trait]
impl DiscoveryFeed for ChannelFeed {
    async fn poll(&mut self) -> Result<FeedPoll, FeedError> {
        Ok(self.rx.recv().await.unwrap_or(FeedPoll::Closed))
    }
}
