use meridian_core::coordination::{CoordinationError, CoordinationStore};
use meridian_metadata_store::CoordinationStorage;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::assignment_engine::AssignmentEngine;
use crate::{resources::Resources, retry::RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LeaderElectionState {
    NoLeader,
    Leading,
    Following,
}

// Leader Election based on the coordination store's election primitive.
// Every routing broker campaigns; the winner runs the Topic Assignment Engine
// until its leadership is lost, then campaigns again.
#[derive(Debug, Clone)]
pub(crate) struct LeaderElection {
    broker_addr: String,
    store: CoordinationStorage,
    path: String,
    state: Arc<Mutex<LeaderElectionState>>,
}

impl LeaderElection {
    pub fn new(store: CoordinationStorage, path: &str, broker_addr: &str) -> Self {
        Self {
            broker_addr: broker_addr.to_owned(),
            store,
            path: path.to_owned(),
            state: Arc::new(Mutex::new(LeaderElectionState::NoLeader)),
        }
    }

    pub async fn get_state(&self) -> LeaderElectionState {
        let state = self.state.lock().await;
        state.clone()
    }

    async fn set_state(&self, new_state: LeaderElectionState) {
        let mut state = self.state.lock().await;
        if *state != new_state {
            debug!(broker = %self.broker_addr, state = ?new_state, "leader election state changed");
            *state = new_state;
        }
    }

    /// Campaign, lead, repeat. Returns once the store session is gone.
    pub async fn start(&self, resources: Resources, retry: RetryPolicy, reassign_orphaned_topics: bool) {
        let mut attempt = 0;
        loop {
            // someone already holds the election root
            match self.store.get_children(&self.path).await {
                Ok(candidates) if !candidates.is_empty() => {
                    self.set_state(LeaderElectionState::Following).await
                }
                _ => self.set_state(LeaderElectionState::NoLeader).await,
            }

            let mut leadership = match self.store.campaign(&self.path, &self.broker_addr).await {
                Ok(leadership) => {
                    attempt = 0;
                    leadership
                }
                Err(CoordinationError::SessionExpired) => {
                    self.set_state(LeaderElectionState::NoLeader).await;
                    info!(broker = %self.broker_addr, "coordination session ended, leaving election");
                    return;
                }
                Err(e) => {
                    let backoff = retry.calculate_backoff(attempt);
                    warn!(broker = %self.broker_addr, error = %e, "election campaign failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            self.set_state(LeaderElectionState::Leading).await;
            info!(broker = %self.broker_addr, "broker is the leader, starting topic assignment");

            let engine =
                AssignmentEngine::new(resources.clone(), retry.clone(), reassign_orphaned_topics);

            // the engine future is dropped, and so stopped, when leadership ends
            tokio::select! {
                _ = leadership.lost() => {
                    warn!(broker = %self.broker_addr, "leadership lost, stopping topic assignment");
                }
                result = engine.run() => {
                    if let Err(e) = result {
                        error!(broker = %self.broker_addr, error = %e, "topic assignment engine stopped");
                    }
                    // dropping the handle resigns so another broker can take over
                    info!(broker = %self.broker_addr, "resigning leadership");
                }
            }
            drop(leadership);
            self.set_state(LeaderElectionState::NoLeader).await;
        }
    }
}
