use async_trait::async_trait;
use meridian_core::discovery::{DiscoveryFeed, EndpointEvent, FeedError, FeedPoll};
use meridian_core::model::Role;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use crate::coordination_service::TrackerHandle;

/// Discovery feed reading one JSON [`EndpointEvent`] per line.
///
/// A blank line ends the current batch and end of input closes the feed.
/// Lines that are not UTF-8 or do not parse are logged and skipped.
pub(crate) struct JsonLinesFeed<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFeed<R> {
    pub(crate) fn new(reader: R) -> Self {
        JsonLinesFeed {
            reader,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> DiscoveryFeed for JsonLinesFeed<R> {
    async fn poll(&mut self) -> Result<FeedPoll, FeedError> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(FeedPoll::Closed);
            }
            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!(len = self.buf.len(), error = %e, "skipping discovery line that is not UTF-8");
                    continue;
                }
            };
            if line.trim().is_empty() {
                return Ok(FeedPoll::EndOfBatch);
            }
            match serde_json::from_str::<EndpointEvent>(line) {
                Ok(event) => return Ok(FeedPoll::Event(event)),
                Err(e) => warn!(line = %line, error = %e, "skipping malformed discovery event"),
            }
        }
    }
}

/// Drain a feed into the region's trackers, routing each event by role.
/// Returns when the feed closes, fails, or both trackers are gone.
pub(crate) async fn pump_feed<F: DiscoveryFeed>(
    mut feed: F,
    publishers: TrackerHandle,
    subscribers: TrackerHandle,
) {
    loop {
        match feed.poll().await {
            Ok(FeedPoll::Event(event)) => {
                let tracker = match event.role {
                    Role::Publisher => &publishers,
                    Role::Subscriber => &subscribers,
                };
                if !tracker.endpoint(event) {
                    warn!("interest tracker stopped, discovery pump exiting");
                    return;
                }
            }
            Ok(FeedPoll::EndOfBatch) => debug!("discovery batch drained"),
            Ok(FeedPoll::Closed) => {
                info!("discovery feed closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "discovery feed failed");
                return;
            }
        }
    }
}
