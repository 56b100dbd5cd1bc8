use futures::StreamExt;
use meridian_core::coordination::{ChildEvent, CoordinationError, Result};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::{
    resources::{assigned_broker, Registration, Resources},
    retry::RetryPolicy,
};

// Versioned writes that lose a race are retried against a fresh snapshot.
const MAX_CONFLICT_RETRIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    /// No topic observed yet.
    Idle,
    Assigning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AssignOutcome {
    Assigned(String),
    AlreadyAssigned(String),
    /// No routing broker is registered yet.
    Pending,
    /// The topic node is gone.
    Vanished,
}

/// Least-loaded broker by assigned topic count; ties go to the first one in
/// snapshot order.
pub(crate) fn select_least_loaded(registrations: &[Registration]) -> Option<&Registration> {
    registrations.iter().min_by_key(|r| r.topics.len())
}

/// Leader-only engine binding every topic to one routing broker.
///
/// Runs as long as this broker holds leadership. Everything it needs is read
/// fresh from the store, so a new leader picks up where the previous one
/// stopped: topics with an assignment are skipped, topics already listed in
/// a registration keep that broker.
#[derive(Debug)]
pub(crate) struct AssignmentEngine {
    resources: Resources,
    retry: RetryPolicy,
    reassign_orphaned_topics: bool,
    state: EngineState,
    // topics seen while no broker was registered
    pending: BTreeSet<String>,
}

impl AssignmentEngine {
    pub(crate) fn new(
        resources: Resources,
        retry: RetryPolicy,
        reassign_orphaned_topics: bool,
    ) -> Self {
        AssignmentEngine {
            resources,
            retry,
            reassign_orphaned_topics,
            state: EngineState::Idle,
            pending: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> EngineState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> impl Iterator<Item = &String> {
        self.pending.iter()
    }

    /// Watch topics and broker registrations until a watch fails.
    pub(crate) async fn run(mut self) -> Result<()> {
        let mut topics = self
            .retry
            .run("watch topics", || self.resources.topic.watch_topics())
            .await?;
        let mut brokers = self
            .retry
            .run("watch brokers", || self.resources.broker.watch_brokers())
            .await?;
        info!("topic assignment engine started");

        loop {
            tokio::select! {
                event = topics.next() => match event {
                    Some(Ok(ChildEvent::Added { name, .. })) => self.on_topic_added(&name).await,
                    Some(Ok(ChildEvent::Removed { name })) => {
                        self.pending.remove(&name);
                    }
                    Some(Err(CoordinationError::WatchError(msg))) => {
                        warn!(error = %msg, "topic watch lagged, replaying all topics");
                        self.replay_topics().await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(CoordinationError::WatchChannelClosed),
                },
                event = brokers.next() => match event {
                    Some(Ok(ChildEvent::Added { name, .. })) => self.on_broker_added(&name).await,
                    Some(Ok(ChildEvent::Removed { name })) => self.on_broker_removed(&name).await,
                    Some(Err(CoordinationError::WatchError(msg))) => {
                        warn!(error = %msg, "broker watch lagged, retrying pending topics");
                        self.retry_pending().await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(CoordinationError::WatchChannelClosed),
                },
            }
        }
    }

    pub(crate) async fn on_topic_added(&mut self, topic: &str) {
        if self.state == EngineState::Idle {
            debug!("assignment engine leaving idle");
            self.state = EngineState::Assigning;
        }
        self.assign_logged(topic).await;
    }

    pub(crate) async fn on_broker_added(&mut self, broker: &str) {
        debug!(broker = %broker, "routing broker registered");
        self.retry_pending().await;
    }

    pub(crate) async fn on_broker_removed(&mut self, broker: &str) {
        warn!(broker = %broker, "routing broker registration disappeared");
        if !self.reassign_orphaned_topics {
            return;
        }
        let topics = match self
            .retry
            .run("list topics", || self.resources.topic.all_topics())
            .await
        {
            Ok(topics) => topics,
            Err(e) => {
                warn!(broker = %broker, error = %e, "cannot list topics for reassignment");
                return;
            }
        };
        for topic in topics {
            match self.release_if_assigned_to(&topic, broker).await {
                Ok(true) => self.assign_logged(&topic).await,
                Ok(false) => {}
                Err(e) => warn!(topic = %topic, error = %e, "failed to release orphaned topic"),
            }
        }
    }

    async fn replay_topics(&mut self) {
        match self
            .retry
            .run("list topics", || self.resources.topic.all_topics())
            .await
        {
            Ok(topics) => {
                for topic in topics {
                    self.on_topic_added(&topic).await;
                }
            }
            Err(e) => warn!(error = %e, "cannot list topics for replay"),
        }
    }

    async fn retry_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for topic in pending {
            self.assign_logged(&topic).await;
        }
    }

    async fn assign_logged(&mut self, topic: &str) {
        match self.assign(topic).await {
            Ok(AssignOutcome::Assigned(broker)) => {
                info!(topic = %topic, broker = %broker, "topic assigned to routing broker");
            }
            Ok(AssignOutcome::AlreadyAssigned(broker)) => {
                debug!(topic = %topic, broker = %broker, "topic already assigned");
            }
            Ok(AssignOutcome::Pending) => {
                info!(topic = %topic, "no routing broker registered, topic pending");
                self.pending.insert(topic.to_owned());
            }
            Ok(AssignOutcome::Vanished) => {
                debug!(topic = %topic, "topic removed before assignment");
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "topic assignment failed");
            }
        }
    }

    /// Bind `topic` to a routing broker unless it already has one.
    pub(crate) async fn assign(&self, topic: &str) -> Result<AssignOutcome> {
        let mut conflicts = 0;
        loop {
            let node = match self
                .retry
                .run("read topic", || self.resources.topic.topic_node(topic))
                .await?
            {
                Some(node) => node,
                None => return Ok(AssignOutcome::Vanished),
            };
            // fresh snapshot, never a cached view of the registrations
            let registrations = self
                .retry
                .run("snapshot brokers", || self.resources.broker.snapshot())
                .await?;

            if let Some(current) = assigned_broker(&node.value) {
                let orphaned = self.reassign_orphaned_topics
                    && !registrations.iter().any(|r| r.broker == current);
                if !orphaned {
                    return Ok(AssignOutcome::AlreadyAssigned(current));
                }
                match self.resources.topic.unassign(topic, node.version).await {
                    Ok(()) => {
                        info!(topic = %topic, broker = %current, "releasing topic of departed broker");
                        continue;
                    }
                    Err(e) if is_conflict(&e) && conflicts < MAX_CONFLICT_RETRIES => {
                        conflicts += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            // a previous leader may have listed the topic before crashing
            let target = match registrations
                .iter()
                .find(|r| r.topics.contains(topic))
                .or_else(|| select_least_loaded(&registrations))
            {
                Some(target) => target,
                None => return Ok(AssignOutcome::Pending),
            };

            if !target.topics.contains(topic) {
                let mut topics = target.topics.clone();
                topics.insert(topic);
                match self
                    .resources
                    .broker
                    .update_topics(&target.broker, &topics, target.version)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if is_conflict(&e) && conflicts < MAX_CONFLICT_RETRIES => {
                        debug!(topic = %topic, broker = %target.broker, "registration changed, re-snapshotting");
                        conflicts += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match self
                .resources
                .topic
                .assign(topic, &target.broker, node.version)
                .await
            {
                Ok(()) => return Ok(AssignOutcome::Assigned(target.broker.clone())),
                Err(CoordinationError::NoNode(_)) => return Ok(AssignOutcome::Vanished),
                Err(e) if is_conflict(&e) && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clear the assignment of `topic` if it points at `broker`.
    async fn release_if_assigned_to(&self, topic: &str, broker: &str) -> Result<bool> {
        let Some(node) = self.resources.topic.topic_node(topic).await? else {
            return Ok(false);
        };
        if assigned_broker(&node.value).as_deref() != Some(broker) {
            return Ok(false);
        }
        self.resources.topic.unassign(topic, node.version).await?;
        Ok(true)
    }
}

fn is_conflict(e: &CoordinationError) -> bool {
    matches!(
        e,
        CoordinationError::VersionMismatch { .. } | CoordinationError::NoNode(_)
    )
}

#[cfg(test)]
#[path = "assignment_engine_test.rs"]
mod assignment_engine_test;
