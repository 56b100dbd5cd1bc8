use meridian_core::coordination::{
    ChildEvent, CoordinationError, CoordinationStore, CreateMode, NodeEvent, Result, WatchStream,
};
use meridian_core::model::TopicSet;
use meridian_metadata_store::CoordinationStorage;

use crate::{resources::BASE_ROUTING_BROKERS_PATH, utils::join_path};

pub(crate) fn broker_registration_path(broker: &str) -> String {
    join_path(&[BASE_ROUTING_BROKERS_PATH, broker])
}

/// A routing broker's registration as read at one version.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Registration {
    pub(crate) broker: String,
    pub(crate) topics: TopicSet,
    pub(crate) version: i64,
}

/// Routing broker registrations under `/routingBrokers`.
#[derive(Debug, Clone)]
pub(crate) struct BrokerResources {
    store: CoordinationStorage,
}

impl BrokerResources {
    pub(crate) fn new(store: CoordinationStorage) -> Self {
        BrokerResources { store }
    }

    pub(crate) async fn create_registration(&self, broker: &str, topics: &TopicSet) -> Result<()> {
        self.store
            .create(
                &broker_registration_path(broker),
                serde_json::to_value(topics)?,
                CreateMode::Ephemeral,
            )
            .await
    }

    pub(crate) async fn delete_registration(&self, broker: &str) -> Result<()> {
        match self.store.delete(&broker_registration_path(broker)).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn registration(&self, broker: &str) -> Result<Option<Registration>> {
        match self.store.get(&broker_registration_path(broker)).await? {
            Some(node) => Ok(Some(Registration {
                broker: broker.to_owned(),
                topics: parse_topic_set(node.value)?,
                version: node.version,
            })),
            None => Ok(None),
        }
    }

    /// Fresh snapshot of every live registration, in child order.
    /// Brokers that vanish while the snapshot is taken are skipped.
    pub(crate) async fn snapshot(&self) -> Result<Vec<Registration>> {
        let brokers = match self.store.get_children(BASE_ROUTING_BROKERS_PATH).await {
            Ok(brokers) => brokers,
            Err(CoordinationError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut registrations = Vec::with_capacity(brokers.len());
        for broker in brokers {
            if let Some(registration) = self.registration(&broker).await? {
                registrations.push(registration);
            }
        }
        Ok(registrations)
    }

    /// Replace a registration's topic set if it is still at `expected_version`.
    pub(crate) async fn update_topics(
        &self,
        broker: &str,
        topics: &TopicSet,
        expected_version: i64,
    ) -> Result<()> {
        self.store
            .set_data_versioned(
                &broker_registration_path(broker),
                serde_json::to_value(topics)?,
                expected_version,
            )
            .await
    }

    pub(crate) async fn watch_registration(&self, broker: &str) -> Result<WatchStream<NodeEvent>> {
        self.store.watch_node(&broker_registration_path(broker)).await
    }

    pub(crate) async fn watch_brokers(&self) -> Result<WatchStream<ChildEvent>> {
        self.store.ensure_path(BASE_ROUTING_BROKERS_PATH).await?;
        self.store
            .watch_children(BASE_ROUTING_BROKERS_PATH, false)
            .await
    }
}

/// Registrations are JSON arrays; an empty node reads as no topics.
pub(crate) fn parse_topic_set(value: serde_json::Value) -> Result<TopicSet> {
    if value.is_null() {
        return Ok(TopicSet::new());
    }
    Ok(serde_json::from_value(value)?)
}
