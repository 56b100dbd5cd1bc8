use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::errors::{CoordinationError, Result};
use super::session::SessionState;

/// Stream of watch notifications. Dropping it cancels the watch.
pub struct WatchStream<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
}

impl<T> Stream for WatchStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T: Send + 'static> WatchStream<T> {
    pub fn new(stream: impl Stream<Item = Result<T>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Build a watch from a broadcast of raw store events, keeping only the
    /// ones `select` maps to a notification.
    /// Broadcast lag (slow consumer) is surfaced as `CoordinationError::WatchError`.
    pub fn from_broadcast<E, F>(rx: broadcast::Receiver<E>, mut select: F) -> Self
    where
        E: Clone + Send + 'static,
        F: FnMut(E) -> Option<T> + Send + 'static,
    {
        let stream = BroadcastStream::new(rx).filter_map(move |result| {
            futures::future::ready(match result {
                Ok(event) => select(event).map(Ok),
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(
                    CoordinationError::WatchError(format!(
                        "watch lagged by {} events, consumer should resync",
                        n
                    )),
                )),
            })
        });
        Self::new(stream)
    }

    /// Emit `initial` before the events of `self`.
    pub fn prepend(self, initial: Vec<T>) -> Self {
        Self::new(futures::stream::iter(initial.into_iter().map(Ok)).chain(self))
    }

    /// End the watch with `SessionExpired` once `session` expires.
    pub fn bound_to(self, session: &SessionState) -> Self {
        let session = session.clone();
        Self::new(futures::stream::unfold(Some(self), move |inner| {
            let session = session.clone();
            async move {
                let mut inner = inner?;
                tokio::select! {
                    item = inner.next() => item.map(|item| (item, Some(inner))),
                    _ = session.expired() => Some((Err(CoordinationError::SessionExpired), None)),
                }
            }
        }))
    }
}

impl<T> std::fmt::Debug for WatchStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}
