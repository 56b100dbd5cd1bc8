use meridian_core::model::{RegionInterestRecord, Role};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::service_configuration::PeerTeardown;

/// What the data plane has to do with a peer after a bookkeeping change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerChange {
    Connect,
    Disconnect,
    Unchanged,
}

/// Remote peer -> topics that currently justify the connection to it.
///
/// A peer is connected exactly while some topic needs it. With
/// [`PeerTeardown::Retain`] a peer stays connected after its last topic
/// leaves and is reused by the next one.
#[derive(Debug)]
pub(crate) struct PeerInterestSet {
    teardown: PeerTeardown,
    peers: HashMap<String, HashSet<String>>,
}

impl PeerInterestSet {
    pub(crate) fn new(teardown: PeerTeardown) -> Self {
        PeerInterestSet {
            teardown,
            peers: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, peer: &str, topic: &str) -> PeerChange {
        match self.peers.get_mut(peer) {
            Some(topics) => {
                topics.insert(topic.to_owned());
                PeerChange::Unchanged
            }
            None => {
                self.peers
                    .insert(peer.to_owned(), HashSet::from([topic.to_owned()]));
                PeerChange::Connect
            }
        }
    }

    pub(crate) fn remove(&mut self, peer: &str, topic: &str) -> PeerChange {
        let Some(topics) = self.peers.get_mut(peer) else {
            return PeerChange::Unchanged;
        };
        if !topics.remove(topic) || !topics.is_empty() {
            return PeerChange::Unchanged;
        }
        match self.teardown {
            PeerTeardown::Retain => PeerChange::Unchanged,
            PeerTeardown::Remove => {
                self.peers.remove(peer);
                PeerChange::Disconnect
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_connected(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    #[cfg(test)]
    pub(crate) fn topics_of(&self, peer: &str) -> usize {
        self.peers.get(peer).map_or(0, HashSet::len)
    }
}

/// Cross-region session action derived from a route change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionChange {
    Create { type_name: String },
    Delete { type_name: String },
    Unchanged,
}

#[derive(Debug, Default)]
struct TopicRoutes {
    type_name: String,
    // region address -> locator of the region for that role
    publishers: BTreeMap<String, String>,
    subscribers: BTreeMap<String, String>,
    session_created: bool,
}

impl TopicRoutes {
    fn regions_mut(&mut self, role: Role) -> &mut BTreeMap<String, String> {
        match role {
            Role::Publisher => &mut self.publishers,
            Role::Subscriber => &mut self.subscribers,
        }
    }

    fn can_bridge(&self, region_aware: bool) -> bool {
        if self.publishers.is_empty() || self.subscribers.is_empty() {
            return false;
        }
        if !region_aware {
            return true;
        }
        // a single region talking to itself does not need the WAN
        !(self.publishers.len() == 1
            && self.subscribers.len() == 1
            && self.publishers.keys().eq(self.subscribers.keys()))
    }

    fn reconcile_session(&mut self, region_aware: bool) -> SessionChange {
        let bridge = self.can_bridge(region_aware);
        if bridge && !self.session_created {
            self.session_created = true;
            SessionChange::Create {
                type_name: self.type_name.clone(),
            }
        } else if !bridge && self.session_created {
            self.session_created = false;
            SessionChange::Delete {
                type_name: self.type_name.clone(),
            }
        } else {
            SessionChange::Unchanged
        }
    }
}

/// Outcome of feeding one region change into the [`RouteTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RouteUpdate {
    /// Locator of the region if it actually joined or left the topic;
    /// `None` for duplicates.
    pub(crate) region_locator: Option<String>,
    pub(crate) session: SessionChange,
}

/// Per-topic publishing and subscribing regions seen by a routing broker,
/// and whether the cross-region session of each topic exists.
#[derive(Debug)]
pub(crate) struct RouteTable {
    region_aware: bool,
    topics: HashMap<String, TopicRoutes>,
}

impl RouteTable {
    pub(crate) fn new(region_aware: bool) -> Self {
        RouteTable {
            region_aware,
            topics: HashMap::new(),
        }
    }

    pub(crate) fn region_added(&mut self, role: Role, record: &RegionInterestRecord) -> RouteUpdate {
        let routes = self.topics.entry(record.topic_name.clone()).or_default();
        if routes.type_name.is_empty() {
            routes.type_name = record.type_name.clone();
        }
        let regions = routes.regions_mut(role);
        if regions.contains_key(&record.region) {
            return RouteUpdate {
                region_locator: None,
                session: SessionChange::Unchanged,
            };
        }
        regions.insert(record.region.clone(), record.locator.clone());
        RouteUpdate {
            region_locator: Some(record.locator.clone()),
            session: routes.reconcile_session(self.region_aware),
        }
    }

    pub(crate) fn region_removed(&mut self, topic: &str, role: Role, region: &str) -> RouteUpdate {
        let Some(routes) = self.topics.get_mut(topic) else {
            return RouteUpdate {
                region_locator: None,
                session: SessionChange::Unchanged,
            };
        };
        let region_locator = routes.regions_mut(role).remove(region);
        let session = routes.reconcile_session(self.region_aware);
        if routes.publishers.is_empty() && routes.subscribers.is_empty() {
            self.topics.remove(topic);
        }
        RouteUpdate {
            region_locator,
            session,
        }
    }

    /// Regions currently known for one side of a topic.
    pub(crate) fn regions(&self, topic: &str, role: Role) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|routes| match role {
                Role::Publisher => routes.publishers.keys().cloned().collect(),
                Role::Subscriber => routes.subscribers.keys().cloned().collect(),
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn session_created(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|routes| routes.session_created)
    }
}

#[cfg(test)]
#[path = "peer_graph_test.rs"]
mod peer_graph_test;
