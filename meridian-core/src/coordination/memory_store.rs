use super::{
    errors::{CoordinationError, Result},
    leadership::{Leadership, LeadershipSignal},
    session::SessionState,
    store::{
        ancestors_of, leaf_of, parent_of, validate_path, ChildEvent, CoordinationStore, CreateMode,
        NodeEvent, Versioned,
    },
    watch::WatchStream,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const LATCH_PREFIX: &str = "latch-";

#[derive(Debug)]
struct Node {
    value: Value,
    version: i64,
    owner: Option<u64>,
}

#[derive(Debug, Clone)]
enum StoreEvent {
    Created { path: String, value: Value, version: i64 },
    Updated { path: String, value: Value, version: i64 },
    Deleted { path: String },
}

#[derive(Debug)]
struct Shared {
    tree: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<StoreEvent>,
    // live sessions, keyed by id, valued by a label for diagnostics
    sessions: DashMap<u64, String>,
    next_session: AtomicU64,
    next_sequence: AtomicU64,
}

/// MemoryStore keeps the whole coordination tree in process memory.
///
/// Each `MemoryStore` value is one session over a shared tree: clones share
/// the session, [`MemoryStore::connect`] opens another one. Closing a
/// session drops its ephemeral nodes and election candidacy, which is how
/// tests simulate a broker crash.
/// SHOULD BE USED ONLY FOR TESTING PURPOSES OR SINGLE-PROCESS DEPLOYMENTS
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    session_id: u64,
    session: SessionState,
}

impl MemoryStore {
    pub async fn new() -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            tree: Mutex::new(BTreeMap::new()),
            events,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_sequence: AtomicU64::new(0),
        });
        Ok(Self::open_session(shared, "default"))
    }

    /// Open a new session on the same tree.
    pub fn connect(&self, label: &str) -> MemoryStore {
        Self::open_session(Arc::clone(&self.shared), label)
    }

    fn open_session(shared: Arc<Shared>, label: &str) -> MemoryStore {
        let session_id = shared.next_session.fetch_add(1, Ordering::SeqCst);
        shared.sessions.insert(session_id, label.to_owned());
        MemoryStore {
            shared,
            session_id,
            session: SessionState::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn is_live(&self) -> bool {
        !self.session.is_expired()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    fn ensure_live(&self) -> Result<()> {
        self.session.ensure_live()
    }

    fn emit(&self, event: StoreEvent) {
        // no receivers is fine
        let _ = self.shared.events.send(event);
    }

    fn insert_missing(&self, tree: &mut BTreeMap<String, Node>, path: &str) {
        if tree.contains_key(path) {
            return;
        }
        tree.insert(
            path.to_owned(),
            Node {
                value: Value::Null,
                version: 0,
                owner: None,
            },
        );
        self.emit(StoreEvent::Created {
            path: path.to_owned(),
            value: Value::Null,
            version: 0,
        });
    }

    fn remove_node(&self, tree: &mut BTreeMap<String, Node>, path: &str) -> bool {
        if tree.remove(path).is_some() {
            self.emit(StoreEvent::Deleted {
                path: path.to_owned(),
            });
            true
        } else {
            false
        }
    }

    fn children_in(tree: &BTreeMap<String, Node>, path: &str) -> Vec<(String, Value)> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        tree.range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, node)| (key[prefix.len()..].to_owned(), node.value.clone()))
            .collect()
    }

    async fn latch_holder(&self, election_path: &str) -> Option<String> {
        let tree = self.shared.tree.lock().await;
        Self::children_in(&tree, election_path)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name.starts_with(LATCH_PREFIX))
            .min()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut tree = self.shared.tree.lock().await;
        for ancestor in ancestors_of(path) {
            self.insert_missing(&mut tree, &ancestor);
        }
        self.insert_missing(&mut tree, path);
        Ok(())
    }

    async fn create(&self, path: &str, value: Value, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut tree = self.shared.tree.lock().await;
        if tree.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_owned()));
        }
        for ancestor in ancestors_of(path) {
            self.insert_missing(&mut tree, &ancestor);
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session_id),
        };
        tree.insert(
            path.to_owned(),
            Node {
                value: value.clone(),
                version: 0,
                owner,
            },
        );
        self.emit(StoreEvent::Created {
            path: path.to_owned(),
            value,
            version: 0,
        });
        Ok(())
    }

    async fn set_data(&self, path: &str, value: Value) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut tree = self.shared.tree.lock().await;
        let node = tree
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
        node.value = value.clone();
        node.version += 1;
        let version = node.version;
        self.emit(StoreEvent::Updated {
            path: path.to_owned(),
            value,
            version,
        });
        Ok(())
    }

    async fn set_data_versioned(
        &self,
        path: &str,
        value: Value,
        expected_version: i64,
    ) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut tree = self.shared.tree.lock().await;
        let node = tree
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
        if node.version != expected_version {
            return Err(CoordinationError::VersionMismatch {
                path: path.to_owned(),
                expected: expected_version,
            });
        }
        node.value = value.clone();
        node.version += 1;
        let version = node.version;
        self.emit(StoreEvent::Updated {
            path: path.to_owned(),
            value,
            version,
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        validate_path(path)?;
        self.ensure_live()?;
        let tree = self.shared.tree.lock().await;
        Ok(tree.get(path).map(|node| Versioned {
            value: node.value.clone(),
            version: node.version,
        }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut tree = self.shared.tree.lock().await;
        if self.remove_node(&mut tree, path) {
            Ok(())
        } else {
            Err(CoordinationError::NoNode(path.to_owned()))
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        self.ensure_live()?;
        let tree = self.shared.tree.lock().await;
        Ok(Self::children_in(&tree, path)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn watch_node(&self, path: &str) -> Result<WatchStream<NodeEvent>> {
        validate_path(path)?;
        self.ensure_live()?;
        // subscribe under the lock so no change slips between snapshot and stream
        let tree = self.shared.tree.lock().await;
        let rx = self.shared.events.subscribe();
        let initial = match tree.get(path) {
            Some(node) => NodeEvent::Data(Versioned {
                value: node.value.clone(),
                version: node.version,
            }),
            None => NodeEvent::Absent,
        };
        drop(tree);

        let watched = path.to_owned();
        let stream = WatchStream::from_broadcast(rx, move |event: StoreEvent| match event {
            StoreEvent::Created {
                path,
                value,
                version,
            }
            | StoreEvent::Updated {
                path,
                value,
                version,
            } if path == watched => Some(NodeEvent::Data(Versioned { value, version })),
            StoreEvent::Deleted { path } if path == watched => Some(NodeEvent::Absent),
            _ => None,
        });
        Ok(stream.prepend(vec![initial]).bound_to(&self.session))
    }

    async fn watch_children(
        &self,
        path: &str,
        fetch_payload: bool,
    ) -> Result<WatchStream<ChildEvent>> {
        validate_path(path)?;
        self.ensure_live()?;
        let tree = self.shared.tree.lock().await;
        let rx = self.shared.events.subscribe();
        let initial: Vec<ChildEvent> = Self::children_in(&tree, path)
            .into_iter()
            .map(|(name, value)| ChildEvent::Added {
                name,
                payload: fetch_payload.then_some(value),
            })
            .collect();
        drop(tree);

        let watched = path.to_owned();
        let stream = WatchStream::from_broadcast(rx, move |event: StoreEvent| match event {
            StoreEvent::Created { path, value, .. } if parent_of(&path) == Some(watched.as_str()) => {
                Some(ChildEvent::Added {
                    name: leaf_of(&path).to_owned(),
                    payload: fetch_payload.then_some(value),
                })
            }
            StoreEvent::Deleted { path } if parent_of(&path) == Some(watched.as_str()) => {
                Some(ChildEvent::Removed {
                    name: leaf_of(&path).to_owned(),
                })
            }
            _ => None,
        });
        Ok(stream.prepend(initial).bound_to(&self.session))
    }

    async fn campaign(&self, election_path: &str, candidate_id: &str) -> Result<Leadership> {
        self.ensure_path(election_path).await?;
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
        let latch_name = format!("{}{:010}", LATCH_PREFIX, sequence);
        let latch_path = format!("{}/{}", election_path, latch_name);

        // subscribe before creating the latch so no deletion is missed
        let mut rx = self.shared.events.subscribe();
        self.create(
            &latch_path,
            Value::String(candidate_id.to_owned()),
            CreateMode::Ephemeral,
        )
        .await?;
        let mut guard = LatchGuard {
            store: self.clone(),
            path: Some(latch_path.clone()),
        };
        debug!(candidate = %candidate_id, latch = %latch_path, "joined election");

        loop {
            match self.latch_holder(election_path).await {
                Some(holder) if holder == latch_name => break,
                Some(_) => {}
                None => return Err(CoordinationError::SessionExpired),
            }
            if !self.is_live() {
                return Err(CoordinationError::SessionExpired);
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoordinationError::WatchChannelClosed)
                }
            }
        }

        guard.path = None;
        let (leadership, signal) = Leadership::new(candidate_id);
        tokio::spawn(monitor_latch(self.clone(), latch_path, rx, signal));
        Ok(leadership)
    }

    async fn close(&self) -> Result<()> {
        if !self.session.expire() {
            return Ok(());
        }
        self.shared.sessions.remove(&self.session_id);
        let mut tree = self.shared.tree.lock().await;
        let owned: Vec<String> = tree
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned.iter().rev() {
            self.remove_node(&mut tree, path);
        }
        debug!(
            session_id = self.session_id,
            ephemeral_nodes = owned.len(),
            "coordination session closed"
        );
        Ok(())
    }
}

/// Removes a latch node whose campaign was abandoned before winning.
struct LatchGuard {
    store: MemoryStore,
    path: Option<String>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut tree = store.shared.tree.lock().await;
                store.remove_node(&mut tree, &path);
            });
        }
    }
}

async fn monitor_latch(
    store: MemoryStore,
    latch_path: String,
    mut rx: broadcast::Receiver<StoreEvent>,
    signal: LeadershipSignal,
) {
    // the latch may already be gone if the session closed while we were winning
    if store.shared.tree.lock().await.get(&latch_path).is_none() {
        signal.revoke();
        return;
    }
    loop {
        tokio::select! {
            _ = signal.released() => {
                let mut tree = store.shared.tree.lock().await;
                store.remove_node(&mut tree, &latch_path);
                trace!(latch = %latch_path, "leadership released");
                return;
            }
            _ = store.session.expired() => {
                signal.revoke();
                return;
            }
            event = rx.recv() => match event {
                Ok(StoreEvent::Deleted { path }) if path == latch_path => {
                    signal.revoke();
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if store.shared.tree.lock().await.get(&latch_path).is_none() {
                        signal.revoke();
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    signal.revoke();
                    return;
                }
            }
        }
    }
}
