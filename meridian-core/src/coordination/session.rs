use std::sync::Arc;
use tokio::sync::watch;

use super::errors::{CoordinationError, Result};

/// Liveness of one store session, shared by every handle, watch and
/// leadership opened through it.
///
/// A session only ever goes from live to expired. Backends expire it when
/// the owner closes it or when the server side is lost (lease not renewed).
#[derive(Debug, Clone)]
pub struct SessionState {
    expired_tx: Arc<watch::Sender<bool>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (expired_tx, _) = watch::channel(false);
        SessionState {
            expired_tx: Arc::new(expired_tx),
        }
    }

    pub fn is_expired(&self) -> bool {
        *self.expired_tx.borrow()
    }

    /// Mark the session expired. Returns false if it already was.
    pub fn expire(&self) -> bool {
        self.expired_tx.send_if_modified(|expired| {
            if *expired {
                false
            } else {
                *expired = true;
                true
            }
        })
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_expired() {
            Err(CoordinationError::SessionExpired)
        } else {
            Ok(())
        }
    }

    /// Resolves once the session has expired.
    pub async fn expired(&self) {
        let mut rx = self.expired_tx.subscribe();
        let _ = rx.wait_for(|expired| *expired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn expiry_is_one_way_and_wakes_waiters() {
        let session = SessionState::new();
        assert!(session.ensure_live().is_ok());

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.expired().await })
        };
        assert!(session.expire());
        assert!(!session.expire());
        assert!(matches!(
            session.ensure_live(),
            Err(CoordinationError::SessionExpired)
        ));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
