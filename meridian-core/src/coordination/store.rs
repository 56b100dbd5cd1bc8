use async_trait::async_trait;
use serde_json::Value;

use super::errors::Result;
use super::leadership::Leadership;
use super::watch::WatchStream;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Removed automatically when the owning session ends.
    Ephemeral,
}

/// A node payload together with the version it was read at.
///
/// The version is opaque to callers; it is only meaningful as the
/// `expected_version` of a later [`CoordinationStore::set_data_versioned`].
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: i64,
}

/// Events emitted by [`CoordinationStore::watch_node`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The node exists with this payload.
    Data(Versioned),
    /// The node does not exist (never created, or deleted).
    Absent,
}

/// Events emitted by [`CoordinationStore::watch_children`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added {
        name: String,
        payload: Option<Value>,
    },
    Removed {
        name: String,
    },
}

impl ChildEvent {
    pub fn name(&self) -> &str {
        match self {
            ChildEvent::Added { name, .. } | ChildEvent::Removed { name } => name,
        }
    }
}

/// Hierarchical, watchable key/value tree shared by all brokers.
///
/// Paths are absolute and `/`-separated. Every handle is bound to one
/// session: ephemeral nodes and election candidacy created through it
/// disappear when the session ends.
///
/// Watches emit the current state on install, so a consumer never has to
/// race an initial read against the first notification. Notifications may
/// be coalesced; consumers must re-read the store rather than trust that
/// every intermediate state was delivered. Dropping a [`WatchStream`]
/// cancels the underlying watch.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create every missing node along `path` as an empty persistent node.
    /// Succeeds when the path already exists.
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create `path` with `value`, creating missing parents as empty
    /// persistent nodes. Fails with `NodeExists` if the node is present.
    async fn create(&self, path: &str, value: Value, mode: CreateMode) -> Result<()>;

    /// Overwrite the payload of an existing node. Fails with `NoNode`.
    async fn set_data(&self, path: &str, value: Value) -> Result<()>;

    /// Overwrite the payload only if the node is still at `expected_version`.
    /// Fails with `VersionMismatch` when another writer got there first.
    async fn set_data_versioned(&self, path: &str, value: Value, expected_version: i64)
        -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Versioned>>;

    /// Delete a node. Fails with `NoNode` if it does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names (not full paths) of the direct children of `path`, sorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn watch_node(&self, path: &str) -> Result<WatchStream<NodeEvent>>;

    /// Watch the direct children of `path`. Existing children are reported as
    /// `Added` first. With `fetch_payload` the added child's payload is
    /// attached.
    async fn watch_children(&self, path: &str, fetch_payload: bool)
        -> Result<WatchStream<ChildEvent>>;

    /// Join the election rooted at `election_path` and block until this
    /// session wins it.
    async fn campaign(&self, election_path: &str, candidate_id: &str) -> Result<Leadership>;

    /// End the session, releasing ephemeral nodes and candidacy.
    async fn close(&self) -> Result<()>;
}

/// Parent path of `path`, or `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

/// Name of the last path segment.
pub fn leaf_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Reject paths the tree cannot address.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(super::errors::CoordinationError::InvalidArguments(format!(
            "invalid coordination path: {}",
            path
        )));
    }
    Ok(())
}

/// Every ancestor of `path` from the top down, excluding the root and `path`.
pub fn ancestors_of(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}
