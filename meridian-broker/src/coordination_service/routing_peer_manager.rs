use futures::StreamExt;
use meridian_core::coordination::{ChildEvent, CoordinationError, NodeEvent, WatchStream};
use meridian_core::data_plane::DataPlaneController;
use meridian_core::model::{RegionInterestRecord, Role};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::peer_graph::{PeerChange, PeerInterestSet, RouteTable, SessionChange};
use super::WatchTask;
use crate::{
    resources::Resources,
    retry::RetryPolicy,
    service_configuration::{PeerTeardown, ServiceConfiguration},
    utils::routing_scope,
};

#[derive(Debug, Clone)]
pub(crate) struct PeerManagerSettings {
    /// Address of this routing broker
    pub(crate) broker: String,
    pub(crate) region_aware_sessions: bool,
    pub(crate) peer_teardown: PeerTeardown,
}

impl PeerManagerSettings {
    pub(crate) fn from_config(config: &ServiceConfiguration) -> Self {
        PeerManagerSettings {
            broker: config.broker_host.clone(),
            region_aware_sessions: config.policy.region_aware_sessions,
            peer_teardown: config.policy.peer_teardown,
        }
    }
}

#[derive(Debug)]
pub(crate) enum PeerManagerMessage {
    /// This broker's registration node changed.
    RegistrationChanged,
    Region {
        topic: String,
        role: Role,
        event: ChildEvent,
    },
    /// A region watch lost events; re-read the children.
    Resync { topic: String, role: Role },
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct PeerManagerHandle {
    tx: mpsc::UnboundedSender<PeerManagerMessage>,
}

impl PeerManagerHandle {
    /// Re-read a topic's regions, as after a lagged watch.
    #[cfg(test)]
    pub(crate) fn resync(&self, topic: &str, role: Role) {
        let _ = self.tx.send(PeerManagerMessage::Resync {
            topic: topic.to_owned(),
            role,
        });
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(PeerManagerMessage::Shutdown);
    }
}

struct TopicWatches {
    _publishers: WatchTask,
    _subscribers: WatchTask,
}

/// Peer Graph Manager of a routing broker.
///
/// Follows the topics assigned to this broker through its registration, and
/// for each of them the publishing and subscribing regions. Regions become
/// peers while some topic needs them; a topic with regions on both sides gets
/// one cross-region session.
pub(crate) struct RoutingPeerManager {
    settings: PeerManagerSettings,
    resources: Resources,
    controller: Arc<dyn DataPlaneController>,
    retry: RetryPolicy,
    routes: RouteTable,
    peers: PeerInterestSet,
    topics: HashMap<String, TopicWatches>,
    registration_watch: Option<WatchTask>,
    notify: mpsc::WeakUnboundedSender<PeerManagerMessage>,
}

impl RoutingPeerManager {
    pub(crate) fn start(
        settings: PeerManagerSettings,
        resources: Resources,
        controller: Arc<dyn DataPlaneController>,
        retry: RetryPolicy,
    ) -> (PeerManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = RoutingPeerManager {
            routes: RouteTable::new(settings.region_aware_sessions),
            peers: PeerInterestSet::new(settings.peer_teardown),
            settings,
            resources,
            controller,
            retry,
            topics: HashMap::new(),
            registration_watch: None,
            notify: tx.downgrade(),
        };
        let handle = tokio::spawn(manager.run(rx));
        (PeerManagerHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerManagerMessage>) {
        let broker = self.settings.broker.clone();
        match self
            .retry
            .run("watch registration", || {
                self.resources.broker.watch_registration(&broker)
            })
            .await
        {
            Ok(stream) => {
                self.registration_watch = Some(WatchTask::spawn(forward_registration_events(
                    stream,
                    self.notify.clone(),
                )));
            }
            Err(e) => {
                error!(broker = %broker, error = %e, "failed to watch broker registration");
                return;
            }
        }
        info!(broker = %broker, "routing peer manager started");

        while let Some(message) = rx.recv().await {
            match message {
                PeerManagerMessage::RegistrationChanged => self.handle_registration_changed().await,
                PeerManagerMessage::Region { topic, role, event } => match event {
                    ChildEvent::Added { name, payload } => {
                        self.handle_region_added(&topic, role, &name, payload).await
                    }
                    ChildEvent::Removed { name } => {
                        self.remove_region(&topic, role, &name);
                        // rebuild from the store in case removals were coalesced
                        self.resync(&topic, role).await;
                    }
                },
                PeerManagerMessage::Resync { topic, role } => self.resync(&topic, role).await,
                PeerManagerMessage::Shutdown => break,
            }
        }

        self.registration_watch = None;
        self.topics.clear();
        info!(broker = %broker, "routing peer manager stopped");
    }

    async fn handle_registration_changed(&mut self) {
        let broker = &self.settings.broker;
        let registration = match self
            .retry
            .run("read registration", || self.resources.broker.registration(broker))
            .await
        {
            Ok(Some(registration)) => registration,
            Ok(None) => {
                warn!(broker = %broker, "broker registration is gone, keeping current routes");
                return;
            }
            Err(e) => {
                error!(broker = %broker, error = %e, "failed to read broker registration");
                return;
            }
        };

        let released: Vec<String> = self
            .topics
            .keys()
            .filter(|topic| !registration.topics.contains(topic))
            .cloned()
            .collect();
        for topic in released {
            self.release_topic(&topic);
        }

        for topic in registration.topics.iter() {
            if !self.topics.contains_key(topic) {
                self.serve_topic(topic).await;
            }
        }
    }

    async fn serve_topic(&mut self, topic: &str) {
        let publishers = match self.watch_role(topic, Role::Publisher).await {
            Some(watch) => watch,
            None => return,
        };
        let subscribers = match self.watch_role(topic, Role::Subscriber).await {
            Some(watch) => watch,
            None => return,
        };
        self.topics.insert(
            topic.to_owned(),
            TopicWatches {
                _publishers: publishers,
                _subscribers: subscribers,
            },
        );
        info!(broker = %self.settings.broker, topic = %topic, "serving assigned topic");
    }

    async fn watch_role(&self, topic: &str, role: Role) -> Option<WatchTask> {
        match self
            .retry
            .run("watch regions", || self.resources.topic.watch_regions(topic, role))
            .await
        {
            Ok(stream) => Some(WatchTask::spawn(forward_region_events(
                stream,
                self.notify.clone(),
                topic.to_owned(),
                role,
            ))),
            Err(e) => {
                error!(topic = %topic, role = %role, error = %e, "failed to watch interested regions");
                None
            }
        }
    }

    /// Stop serving a topic that left this broker's registration.
    fn release_topic(&mut self, topic: &str) {
        self.topics.remove(topic);
        for role in [Role::Publisher, Role::Subscriber] {
            for region in self.routes.regions(topic, role) {
                self.remove_region(topic, role, &region);
            }
        }
        info!(broker = %self.settings.broker, topic = %topic, "released topic");
    }

    async fn handle_region_added(
        &mut self,
        topic: &str,
        role: Role,
        region: &str,
        payload: Option<Value>,
    ) {
        if !self.topics.contains_key(topic) {
            return;
        }
        let parsed = payload.and_then(|value| serde_json::from_value::<RegionInterestRecord>(value).ok());
        let mut record = match parsed {
            Some(record) => record,
            None => match self
                .retry
                .run("read region interest", || {
                    self.resources.topic.region_interest(topic, role, region)
                })
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(topic = %topic, region = %region, "region interest vanished before it was read");
                    return;
                }
                Err(e) => {
                    error!(topic = %topic, region = %region, error = %e, "failed to read region interest");
                    return;
                }
            },
        };
        // the tree position is authoritative
        record.topic_name = topic.to_owned();
        record.region = region.to_owned();

        let update = self.routes.region_added(role, &record);
        if let Some(locator) = update.region_locator {
            debug!(topic = %topic, role = %role, region = %region, "region joined topic");
            if self.peers.add(&locator, topic) == PeerChange::Connect {
                self.controller.add_peer(
                    &routing_scope(&self.settings.broker),
                    &locator,
                    is_primary(role),
                );
            }
        }
        self.apply_session(topic, update.session);
    }

    fn remove_region(&mut self, topic: &str, role: Role, region: &str) {
        let update = self.routes.region_removed(topic, role, region);
        // the session goes before any peer it may still be using
        self.apply_session(topic, update.session);
        if let Some(locator) = update.region_locator {
            debug!(topic = %topic, role = %role, region = %region, "region left topic");
            if self.peers.remove(&locator, topic) == PeerChange::Disconnect {
                self.controller.remove_peer(
                    &routing_scope(&self.settings.broker),
                    &locator,
                    is_primary(role),
                );
            }
        }
    }

    async fn resync(&mut self, topic: &str, role: Role) {
        if !self.topics.contains_key(topic) {
            return;
        }
        let live = match self
            .retry
            .run("list regions", || self.resources.topic.interested_regions(topic, role))
            .await
        {
            Ok(live) => live,
            Err(e) => {
                error!(topic = %topic, role = %role, error = %e, "failed to list interested regions");
                return;
            }
        };
        let known = self.routes.regions(topic, role);
        for region in known.iter().filter(|region| !live.contains(region)) {
            self.remove_region(topic, role, region);
        }
        for region in live.iter().filter(|region| !known.contains(region)) {
            self.handle_region_added(topic, role, region, None).await;
        }
    }

    fn apply_session(&self, topic: &str, change: SessionChange) {
        let broker = &self.settings.broker;
        match change {
            SessionChange::Create { type_name } => {
                info!(broker = %broker, topic = %topic, "creating cross-region session");
                self.controller
                    .create_cross_region_session(broker, topic, &type_name);
            }
            SessionChange::Delete { type_name } => {
                info!(broker = %broker, topic = %topic, "deleting cross-region session");
                self.controller
                    .delete_cross_region_session(broker, topic, &type_name);
            }
            SessionChange::Unchanged => {}
        }
    }
}

/// Publishing regions are primary peers of the routing broker.
fn is_primary(role: Role) -> bool {
    role == Role::Publisher
}

async fn forward_registration_events(
    mut stream: WatchStream<NodeEvent>,
    notify: mpsc::WeakUnboundedSender<PeerManagerMessage>,
) {
    while let Some(event) = stream.next().await {
        if let Err(e) = event {
            if !matches!(e, CoordinationError::WatchError(_)) {
                warn!(error = %e, "registration watch ended");
                return;
            }
        }
        let Some(tx) = notify.upgrade() else {
            return;
        };
        if tx.send(PeerManagerMessage::RegistrationChanged).is_err() {
            return;
        }
    }
}

async fn forward_region_events(
    mut stream: WatchStream<ChildEvent>,
    notify: mpsc::WeakUnboundedSender<PeerManagerMessage>,
    topic: String,
    role: Role,
) {
    while let Some(event) = stream.next().await {
        let message = match event {
            Ok(event) => PeerManagerMessage::Region {
                topic: topic.clone(),
                role,
                event,
            },
            Err(CoordinationError::WatchError(msg)) => {
                warn!(topic = %topic, role = %role, error = %msg, "region watch lagged, resyncing");
                PeerManagerMessage::Resync {
                    topic: topic.clone(),
                    role,
                }
            }
            Err(e) => {
                warn!(topic = %topic, role = %role, error = %e, "region watch ended");
                return;
            }
        };
        let Some(tx) = notify.upgrade() else {
            return;
        };
        if tx.send(message).is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "routing_peer_manager_test.rs"]
mod routing_peer_manager_test;
