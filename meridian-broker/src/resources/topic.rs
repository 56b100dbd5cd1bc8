use futures::StreamExt;
use meridian_core::coordination::{
    ChildEvent, CoordinationError, CoordinationStore, CreateMode, NodeEvent, Result, Versioned,
    WatchStream,
};
use meridian_core::model::{RegionInterestRecord, Role};
use meridian_metadata_store::CoordinationStorage;
use serde_json::Value;
use tracing::debug;

use crate::{resources::BASE_TOPICS_PATH, utils::join_path};

/// Store segment of a topic name. Topic names may contain `/` (ROS 2 style
/// `rt/chatter`), which must stay inside a single node under `/topics`.
pub(crate) fn topic_segment(topic_name: &str) -> String {
    let mut segment = String::with_capacity(topic_name.len());
    for c in topic_name.chars() {
        match c {
            '%' => segment.push_str("%25"),
            '/' => segment.push_str("%2F"),
            c => segment.push(c),
        }
    }
    segment
}

/// Inverse of [`topic_segment`]. Unknown escapes are kept as they are.
pub(crate) fn topic_name_of(segment: &str) -> String {
    let mut name = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(at) = rest.find('%') {
        name.push_str(&rest[..at]);
        let escape = &rest[at..];
        if escape.starts_with("%2F") || escape.starts_with("%2f") {
            name.push('/');
            rest = &escape[3..];
        } else if escape.starts_with("%25") {
            name.push('%');
            rest = &escape[3..];
        } else {
            name.push('%');
            rest = &escape[1..];
        }
    }
    name.push_str(rest);
    name
}

pub(crate) fn topic_path(topic_name: &str) -> String {
    join_path(&[BASE_TOPICS_PATH, &topic_segment(topic_name)])
}

pub(crate) fn topic_role_path(topic_name: &str, role: Role) -> String {
    join_path(&[
        BASE_TOPICS_PATH,
        &topic_segment(topic_name),
        role.path_segment(),
    ])
}

pub(crate) fn region_interest_path(topic_name: &str, role: Role, region: &str) -> String {
    join_path(&[
        BASE_TOPICS_PATH,
        &topic_segment(topic_name),
        role.path_segment(),
        region,
    ])
}

fn decode_topic_event(event: ChildEvent) -> ChildEvent {
    match event {
        ChildEvent::Added { name, payload } => ChildEvent::Added {
            name: topic_name_of(&name),
            payload,
        },
        ChildEvent::Removed { name } => ChildEvent::Removed {
            name: topic_name_of(&name),
        },
    }
}

/// Assigned broker carried by a topic node payload, if any.
pub(crate) fn assigned_broker(value: &Value) -> Option<String> {
    match value {
        Value::String(broker) if !broker.is_empty() => Some(broker.clone()),
        _ => None,
    }
}

/// Topic subtrees, their assignment and the region interest records under them.
#[derive(Debug, Clone)]
pub(crate) struct TopicResources {
    store: CoordinationStorage,
}

impl TopicResources {
    pub(crate) fn new(store: CoordinationStorage) -> Self {
        TopicResources { store }
    }

    /// Create `/topics/<topic>` with its `pub` and `sub` children if missing.
    pub(crate) async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        self.store
            .ensure_path(&topic_role_path(topic_name, Role::Publisher))
            .await?;
        self.store
            .ensure_path(&topic_role_path(topic_name, Role::Subscriber))
            .await
    }

    /// Publish this region's interest as an ephemeral node.
    ///
    /// A record left over from an earlier session of the same region is
    /// overwritten.
    pub(crate) async fn create_region_interest(
        &self,
        role: Role,
        record: &RegionInterestRecord,
    ) -> Result<()> {
        let path = region_interest_path(&record.topic_name, role, &record.region);
        let payload = serde_json::to_value(record)?;
        match self
            .store
            .create(&path, payload.clone(), CreateMode::Ephemeral)
            .await
        {
            Err(CoordinationError::NodeExists(_)) => {
                debug!(path = %path, "region interest already present, replacing it");
                // replace so the record is bound to the current session
                match self.store.delete(&path).await {
                    Ok(()) | Err(CoordinationError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store
                    .create(&path, payload, CreateMode::Ephemeral)
                    .await
            }
            other => other,
        }
    }

    /// Remove this region's interest. A record that is already gone is fine.
    pub(crate) async fn delete_region_interest(
        &self,
        topic_name: &str,
        role: Role,
        region: &str,
    ) -> Result<()> {
        let path = region_interest_path(topic_name, role, region);
        match self.store.delete(&path).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn region_interest(
        &self,
        topic_name: &str,
        role: Role,
        region: &str,
    ) -> Result<Option<RegionInterestRecord>> {
        let path = region_interest_path(topic_name, role, region);
        match self.store.get(&path).await? {
            Some(node) => Ok(Some(serde_json::from_value(node.value)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn interested_regions(&self, topic_name: &str, role: Role) -> Result<Vec<String>> {
        match self
            .store
            .get_children(&topic_role_path(topic_name, role))
            .await
        {
            Ok(regions) => Ok(regions),
            Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Raw topic node, for versioned assignment writes.
    pub(crate) async fn topic_node(&self, topic_name: &str) -> Result<Option<Versioned>> {
        self.store.get(&topic_path(topic_name)).await
    }

    pub(crate) async fn assignment(&self, topic_name: &str) -> Result<Option<String>> {
        Ok(self
            .topic_node(topic_name)
            .await?
            .and_then(|node| assigned_broker(&node.value)))
    }

    /// Write `broker` as the topic's assignment if the node is still at
    /// `expected_version`.
    pub(crate) async fn assign(
        &self,
        topic_name: &str,
        broker: &str,
        expected_version: i64,
    ) -> Result<()> {
        self.store
            .set_data_versioned(
                &topic_path(topic_name),
                Value::String(broker.to_owned()),
                expected_version,
            )
            .await
    }

    /// Clear a topic's assignment if the node is still at `expected_version`.
    pub(crate) async fn unassign(&self, topic_name: &str, expected_version: i64) -> Result<()> {
        self.store
            .set_data_versioned(&topic_path(topic_name), Value::Null, expected_version)
            .await
    }

    pub(crate) async fn all_topics(&self) -> Result<Vec<String>> {
        match self.store.get_children(BASE_TOPICS_PATH).await {
            Ok(segments) => Ok(segments.iter().map(|s| topic_name_of(s)).collect()),
            Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn watch_assignment(&self, topic_name: &str) -> Result<WatchStream<NodeEvent>> {
        self.store.watch_node(&topic_path(topic_name)).await
    }

    pub(crate) async fn watch_topics(&self) -> Result<WatchStream<ChildEvent>> {
        self.store.ensure_path(BASE_TOPICS_PATH).await?;
        let events = self.store.watch_children(BASE_TOPICS_PATH, false).await?;
        Ok(WatchStream::new(
            events.map(|event| event.map(decode_topic_event)),
        ))
    }

    pub(crate) async fn watch_regions(
        &self,
        topic_name: &str,
        role: Role,
    ) -> Result<WatchStream<ChildEvent>> {
        let path = topic_role_path(topic_name, role);
        self.store.ensure_path(&path).await?;
        self.store.watch_children(&path, true).await
    }
}
