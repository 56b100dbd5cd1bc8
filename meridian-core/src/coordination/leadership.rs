use tokio::sync::watch;

/// Proof of having won an election, held for as long as leadership lasts.
///
/// The backend that granted it keeps the paired [`LeadershipSignal`]: it
/// fires the signal when the leader record disappears (session loss, lease
/// expiry, deletion) and resigns once this handle is dropped.
#[derive(Debug)]
pub struct Leadership {
    candidate_id: String,
    lost_rx: watch::Receiver<bool>,
}

/// Backend side of a [`Leadership`].
#[derive(Debug, Clone)]
pub struct LeadershipSignal {
    lost_tx: watch::Sender<bool>,
}

impl Leadership {
    pub fn new(candidate_id: &str) -> (Self, LeadershipSignal) {
        let (lost_tx, lost_rx) = watch::channel(false);
        (
            Leadership {
                candidate_id: candidate_id.to_owned(),
                lost_rx,
            },
            LeadershipSignal { lost_tx },
        )
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves once leadership is gone. A backend that went away without
    /// signalling counts as lost.
    pub async fn lost(&mut self) {
        let _ = self.lost_rx.wait_for(|lost| *lost).await;
    }
}

impl LeadershipSignal {
    pub fn revoke(&self) {
        let _ = self.lost_tx.send(true);
    }

    /// Resolves when the [`Leadership`] handle has been dropped.
    pub async fn released(&self) {
        self.lost_tx.closed().await;
    }
}
