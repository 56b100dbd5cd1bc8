use futures::StreamExt;
use meridian_core::coordination::{CoordinationError, NodeEvent, WatchStream};
use meridian_core::data_plane::DataPlaneController;
use meridian_core::discovery::{EndpointEvent, EndpointState};
use meridian_core::model::{normalize_topic_name, RegionInterestRecord, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::peer_graph::{PeerChange, PeerInterestSet};
use super::WatchTask;
use crate::{
    resources::Resources,
    retry::RetryPolicy,
    service_configuration::{PeerTeardown, ServiceConfiguration},
    utils::{edge_scope, wan_locator},
};

/// Ledger change caused by one discovery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InterestTransition {
    /// Infrastructure endpoint, duplicate, or unknown instance.
    Ignored,
    /// Count moved but stayed above zero.
    Counted { topic: String, count: usize },
    /// Count went from 0 to 1.
    FirstInterest {
        topic: String,
        type_name: String,
        origin_tag: String,
    },
    /// Count went from 1 to 0.
    LastInterest { topic: String, type_name: String },
}

/// Local reference counts of one role in one region.
///
/// Pure bookkeeping: applying an event only returns the transition, the
/// tracker decides what to write and which commands to issue.
#[derive(Debug)]
pub(crate) struct InterestLedger {
    infrastructure_marker: String,
    counts: HashMap<String, usize>,
    // instance handle -> topic, so departures can be resolved
    instances: HashMap<String, String>,
    type_names: HashMap<String, String>,
}

impl InterestLedger {
    pub(crate) fn new(infrastructure_marker: &str) -> Self {
        InterestLedger {
            infrastructure_marker: infrastructure_marker.to_owned(),
            counts: HashMap::new(),
            instances: HashMap::new(),
            type_names: HashMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, event: &EndpointEvent) -> InterestTransition {
        match event.state {
            EndpointState::Appeared => self.appeared(event),
            EndpointState::Departed => self.departed(&event.instance_id),
        }
    }

    fn appeared(&mut self, event: &EndpointEvent) -> InterestTransition {
        if event.origin_tag == self.infrastructure_marker {
            return InterestTransition::Ignored;
        }
        let topic = normalize_topic_name(&event.topic_name);
        if topic.is_empty() || self.instances.contains_key(&event.instance_id) {
            return InterestTransition::Ignored;
        }
        self.instances
            .insert(event.instance_id.clone(), topic.clone());
        let count = self.counts.entry(topic.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return InterestTransition::Counted {
                topic,
                count: *count,
            };
        }
        self.type_names
            .insert(topic.clone(), event.type_name.clone());
        InterestTransition::FirstInterest {
            topic,
            type_name: event.type_name.clone(),
            origin_tag: event.origin_tag.clone(),
        }
    }

    fn departed(&mut self, instance_id: &str) -> InterestTransition {
        let Some(topic) = self.instances.remove(instance_id) else {
            return InterestTransition::Ignored;
        };
        let Some(count) = self.counts.get_mut(&topic) else {
            return InterestTransition::Ignored;
        };
        *count -= 1;
        if *count > 0 {
            return InterestTransition::Counted {
                count: *count,
                topic,
            };
        }
        self.counts.remove(&topic);
        let type_name = self.type_names.remove(&topic).unwrap_or_default();
        InterestTransition::LastInterest { topic, type_name }
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.counts.get(topic).copied().unwrap_or(0)
    }
}

/// Per-role settings of a region's tracker.
#[derive(Debug, Clone)]
pub(crate) struct TrackerSettings {
    pub(crate) role: Role,
    /// Address of this edge broker, also the region's name in the tree
    pub(crate) region: String,
    /// Locator routing brokers use to reach this region for the role
    pub(crate) region_locator: String,
    /// Routing broker port the region connects to for the role
    pub(crate) routing_port: u16,
    pub(crate) infrastructure_marker: String,
    pub(crate) peer_teardown: PeerTeardown,
}

impl TrackerSettings {
    pub(crate) fn from_config(config: &ServiceConfiguration, role: Role) -> Self {
        let (edge_port, routing_port) = match role {
            Role::Publisher => (config.edge.publisher_port, config.routing.inbound_port),
            Role::Subscriber => (config.edge.subscriber_port, config.routing.outbound_port),
        };
        TrackerSettings {
            role,
            region: config.broker_host.clone(),
            region_locator: wan_locator(&config.broker_host, edge_port),
            routing_port,
            infrastructure_marker: config.edge.infrastructure_marker.clone(),
            peer_teardown: config.policy.peer_teardown,
        }
    }
}

#[derive(Debug)]
pub(crate) enum TrackerMessage {
    Endpoint(EndpointEvent),
    AssignmentChanged { topic: String },
    InterestCount {
        topic: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Sending side of a running [`InterestTracker`].
#[derive(Debug, Clone)]
pub(crate) struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerMessage>,
}

impl TrackerHandle {
    /// Returns false once the tracker has stopped.
    pub(crate) fn endpoint(&self, event: EndpointEvent) -> bool {
        self.tx.send(TrackerMessage::Endpoint(event)).is_ok()
    }

    /// Current local count for a topic, for diagnostics.
    #[cfg(test)]
    pub(crate) async fn interest_count(&self, topic: &str) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerMessage::InterestCount {
                topic: topic.to_owned(),
                reply,
            })
            .ok()?;
        rx.await.ok()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(TrackerMessage::Shutdown);
    }
}

struct TopicAssignment {
    broker: Option<String>,
    // dropping it cancels the watch
    _watch: WatchTask,
}

/// Turns one role's discovery events of one region into region interest
/// records, local forwarding sessions and peer links to assigned routing
/// brokers.
///
/// All state is owned by the actor task; discovery events and assignment
/// notifications are serialized through its channel.
pub(crate) struct InterestTracker {
    settings: TrackerSettings,
    resources: Resources,
    controller: Arc<dyn DataPlaneController>,
    retry: RetryPolicy,
    ledger: InterestLedger,
    peers: PeerInterestSet,
    assignments: HashMap<String, TopicAssignment>,
    // weak so the actor stops when every handle is gone
    notify: mpsc::WeakUnboundedSender<TrackerMessage>,
}

impl InterestTracker {
    pub(crate) fn start(
        settings: TrackerSettings,
        resources: Resources,
        controller: Arc<dyn DataPlaneController>,
        retry: RetryPolicy,
    ) -> (TrackerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = InterestTracker {
            ledger: InterestLedger::new(&settings.infrastructure_marker),
            peers: PeerInterestSet::new(settings.peer_teardown),
            settings,
            resources,
            controller,
            retry,
            assignments: HashMap::new(),
            notify: tx.downgrade(),
        };
        let handle = tokio::spawn(tracker.run(rx));
        (TrackerHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TrackerMessage>) {
        info!(role = %self.settings.role, region = %self.settings.region, "interest tracker started");
        while let Some(message) = rx.recv().await {
            match message {
                TrackerMessage::Endpoint(event) => self.handle_endpoint(event).await,
                TrackerMessage::AssignmentChanged { topic } => {
                    self.handle_assignment_changed(&topic).await
                }
                TrackerMessage::InterestCount { topic, reply } => {
                    let _ = reply.send(self.ledger.count(&topic));
                }
                TrackerMessage::Shutdown => break,
            }
        }
        // cancel every assignment watch before the state goes away
        self.assignments.clear();
        info!(role = %self.settings.role, region = %self.settings.region, "interest tracker stopped");
    }

    async fn handle_endpoint(&mut self, event: EndpointEvent) {
        match self.ledger.apply(&event) {
            InterestTransition::Ignored => {
                trace!(
                    instance = %event.instance_id,
                    origin = %event.origin_tag,
                    "discovery event ignored"
                );
            }
            InterestTransition::Counted { topic, count } => {
                debug!(role = %self.settings.role, topic = %topic, count, "local interest counted");
            }
            InterestTransition::FirstInterest {
                topic,
                type_name,
                origin_tag,
            } => self.on_first_interest(topic, type_name, origin_tag).await,
            InterestTransition::LastInterest { topic, type_name } => {
                self.on_last_interest(topic, type_name).await
            }
        }
    }

    async fn on_first_interest(&mut self, topic: String, type_name: String, origin_tag: String) {
        let role = self.settings.role;
        info!(role = %role, topic = %topic, type_name = %type_name, "first local endpoint for topic");

        if let Err(e) = self
            .retry
            .run("ensure topic", || self.resources.topic.ensure_topic(&topic))
            .await
        {
            error!(topic = %topic, error = %e, "failed to ensure topic path");
            return;
        }

        let record = RegionInterestRecord {
            topic_name: topic.clone(),
            type_name: type_name.clone(),
            origin_tag,
            region: self.settings.region.clone(),
            locator: self.settings.region_locator.clone(),
        };
        if let Err(e) = self
            .retry
            .run("create region interest", || {
                self.resources.topic.create_region_interest(role, &record)
            })
            .await
        {
            error!(topic = %topic, role = %role, error = %e, "failed to publish region interest");
            return;
        }

        self.controller
            .create_local_session(&self.settings.region, &topic, &type_name, role);

        if !self.assignments.contains_key(&topic) {
            match self
                .retry
                .run("watch assignment", || {
                    self.resources.topic.watch_assignment(&topic)
                })
                .await
            {
                Ok(stream) => {
                    let watch = WatchTask::spawn(forward_assignment_events(
                        stream,
                        self.notify.clone(),
                        topic.clone(),
                    ));
                    self.assignments.insert(
                        topic,
                        TopicAssignment {
                            broker: None,
                            _watch: watch,
                        },
                    );
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "failed to watch topic assignment");
                }
            }
        }
    }

    async fn on_last_interest(&mut self, topic: String, type_name: String) {
        let role = self.settings.role;
        info!(role = %role, topic = %topic, "last local endpoint for topic departed");

        // the watch is cancelled here, before any state is discarded
        let assignment = self.assignments.remove(&topic);

        if let Err(e) = self
            .retry
            .run("delete region interest", || {
                self.resources
                    .topic
                    .delete_region_interest(&topic, role, &self.settings.region)
            })
            .await
        {
            error!(topic = %topic, role = %role, error = %e, "failed to withdraw region interest");
        }

        self.controller
            .delete_local_session(&self.settings.region, &topic, &type_name, role);

        if let Some(broker) = assignment.and_then(|a| a.broker) {
            self.release_broker(&broker, &topic);
        }
    }

    async fn handle_assignment_changed(&mut self, topic: &str) {
        if !self.assignments.contains_key(topic) || self.ledger.count(topic) == 0 {
            trace!(topic = %topic, "assignment change for untracked topic ignored");
            return;
        }

        // the event may be coalesced or stale, read the current assignment
        let current = match self
            .retry
            .run("read assignment", || self.resources.topic.assignment(topic))
            .await
        {
            Ok(current) => current,
            Err(e) => {
                error!(topic = %topic, error = %e, "failed to read topic assignment");
                return;
            }
        };

        let Some(entry) = self.assignments.get_mut(topic) else {
            return;
        };
        if entry.broker == current {
            return;
        }
        let previous = std::mem::replace(&mut entry.broker, current.clone());

        if let Some(previous) = previous {
            info!(topic = %topic, broker = %previous, "topic moved off routing broker");
            self.release_broker(&previous, topic);
        }
        if let Some(broker) = current {
            info!(role = %self.settings.role, topic = %topic, broker = %broker, "topic assigned to routing broker");
            let locator = wan_locator(&broker, self.settings.routing_port);
            if self.peers.add(&locator, topic) == PeerChange::Connect {
                self.controller
                    .add_peer(&edge_scope(&self.settings.region), &locator, false);
            }
        }
    }

    fn release_broker(&mut self, broker: &str, topic: &str) {
        let locator = wan_locator(broker, self.settings.routing_port);
        if self.peers.remove(&locator, topic) == PeerChange::Disconnect {
            self.controller
                .remove_peer(&edge_scope(&self.settings.region), &locator, false);
        }
    }
}

async fn forward_assignment_events(
    mut stream: WatchStream<NodeEvent>,
    notify: mpsc::WeakUnboundedSender<TrackerMessage>,
    topic: String,
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(_) => {}
            Err(CoordinationError::WatchError(msg)) => {
                warn!(topic = %topic, error = %msg, "assignment watch lagged, re-reading");
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "assignment watch ended");
                return;
            }
        }
        let Some(tx) = notify.upgrade() else {
            return;
        };
        if tx
            .send(TrackerMessage::AssignmentChanged {
                topic: topic.clone(),
            })
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
#[path = "interest_tracker_test.rs"]
mod interest_tracker_test;
