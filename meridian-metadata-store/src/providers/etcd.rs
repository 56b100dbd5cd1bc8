use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, KeyValue, PutOptions, ResignOptions, Txn,
    TxnOp, WatchOptions, WatchStream as EtcdWatchStream, Watcher,
};
use meridian_core::coordination::{
    ancestors_of, validate_path, ChildEvent, CoordinationError, CoordinationStore,
    CreateMode, Leadership, NodeEvent, Result, SessionState, Versioned, WatchStream,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Coordination store backed by etcd.
///
/// The store handle is one session: a lease granted at connect time and kept
/// alive in the background. Ephemeral nodes are keys bound to that lease and
/// election candidacy uses the etcd election API on the same lease, so both
/// disappear when the process stops renewing it.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    session: Arc<EtcdSession>,
}

struct EtcdSession {
    lease_id: i64,
    state: SessionState,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("lease_id", &self.session.lease_id)
            .field("expired", &self.session.state.is_expired())
            .finish()
    }
}

fn storage_err(err: etcd_client::Error) -> CoordinationError {
    CoordinationError::StorageError(Box::new(err))
}

fn encode(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(bytes)?)
}

fn versioned(kv: &KeyValue) -> Result<Versioned> {
    Ok(Versioned {
        value: decode(kv.value())?,
        version: kv.mod_revision(),
    })
}

/// Direct child name of `key` under `prefix`, if `key` is one level deeper.
fn direct_child<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

impl EtcdStore {
    /// Connect to etcd and open a session whose lease lives `session_ttl`.
    pub async fn new(addr: String, session_ttl: Duration) -> Result<Self> {
        let mut client = Client::connect([addr.as_str()], None)
            .await
            .map_err(storage_err)?;
        let ttl = session_ttl.as_secs().max(2) as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(storage_err)?;
        let lease_id = lease.id();
        info!(etcd = %addr, lease_id, ttl, "coordination session opened");

        let store = EtcdStore {
            client,
            session: Arc::new(EtcdSession {
                lease_id,
                state: SessionState::new(),
                keep_alive: Mutex::new(None),
            }),
        };
        let handle = tokio::spawn(keep_lease_alive(
            store.client.clone(),
            lease_id,
            Duration::from_secs((ttl as u64 / 3).max(1)),
            store.session.state.clone(),
        ));
        *store.session.keep_alive.lock().await = Some(handle);
        Ok(store)
    }

    pub fn session(&self) -> &SessionState {
        &self.session.state
    }

    fn ensure_live(&self) -> Result<()> {
        self.session.state.ensure_live()
    }

    /// Put `value` at `path` only if the key does not exist yet.
    /// Returns whether this call created it.
    async fn put_if_absent(&self, path: &str, value: &Value, lease: Option<i64>) -> Result<bool> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, encode(value)?, options)]);
        let resp = client.txn(txn).await.map_err(storage_err)?;
        Ok(resp.succeeded())
    }

    async fn create_ancestors(&self, path: &str) -> Result<()> {
        for ancestor in ancestors_of(path) {
            self.put_if_absent(&ancestor, &Value::Null, None).await?;
        }
        Ok(())
    }
}

/// Renew the session lease until renewal fails, then expire the session so
/// every later operation, watch and leadership of this store reports it.
async fn keep_lease_alive(client: Client, lease_id: i64, interval: Duration, state: SessionState) {
    if let Err(e) = renew_lease(client, lease_id, interval).await {
        if state.expire() {
            error!(lease_id, error = %e, "lease renewal stopped, coordination session lost");
        }
    }
}

async fn renew_lease(mut client: Client, lease_id: i64, interval: Duration) -> Result<()> {
    let (mut keeper, mut responses) = client
        .lease_keep_alive(lease_id)
        .await
        .map_err(storage_err)?;
    loop {
        tokio::time::sleep(interval).await;
        keeper.keep_alive().await.map_err(storage_err)?;
        match responses.message().await.map_err(storage_err)? {
            Some(resp) if resp.ttl() > 0 => {
                trace!(lease_id, ttl = resp.ttl(), "lease renewed");
            }
            // a zero ttl means the server already dropped the lease
            _ => return Err(CoordinationError::SessionExpired),
        }
    }
}

/// Forward an etcd watch into a channel until the receiving side is dropped,
/// then cancel the server-side watch.
fn forward_watch<T, F>(
    mut watcher: Watcher,
    mut stream: EtcdWatchStream,
    mut translate: F,
) -> WatchStream<T>
where
    T: Send + 'static,
    F: FnMut(EventType, &KeyValue) -> Option<Result<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<T>>(WATCH_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let _ = tx
                                .send(Err(CoordinationError::WatchError(format!(
                                    "watch cancelled by server: {}",
                                    resp.cancel_reason()
                                ))))
                                .await;
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            if let Some(item) = translate(event.event_type(), kv) {
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(CoordinationError::WatchChannelClosed)).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(storage_err(e))).await;
                        break;
                    }
                }
            }
        }
        if let Err(e) = watcher.cancel().await {
            trace!(error = %e, "watch cancel after consumer drop failed");
        }
    });

    WatchStream::new(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        self.create_ancestors(path).await?;
        self.put_if_absent(path, &Value::Null, None).await?;
        Ok(())
    }

    async fn create(&self, path: &str, value: Value, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        self.create_ancestors(path).await?;
        let lease = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session.lease_id),
        };
        if self.put_if_absent(path, &value, lease).await? {
            Ok(())
        } else {
            Err(CoordinationError::NodeExists(path.to_owned()))
        }
    }

    async fn set_data(&self, path: &str, value: Value) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        // ignore_lease keeps an ephemeral node bound to its original lease
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::put(
                path,
                encode(&value)?,
                Some(PutOptions::new().with_ignore_lease()),
            )]);
        let resp = client.txn(txn).await.map_err(storage_err)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(CoordinationError::NoNode(path.to_owned()))
        }
    }

    async fn set_data_versioned(
        &self,
        path: &str,
        value: Value,
        expected_version: i64,
    ) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                path,
                CompareOp::Equal,
                expected_version,
            )])
            .and_then(vec![TxnOp::put(
                path,
                encode(&value)?,
                Some(PutOptions::new().with_ignore_lease()),
            )]);
        let resp = client.txn(txn).await.map_err(storage_err)?;
        if resp.succeeded() {
            return Ok(());
        }
        match self.get(path).await? {
            None => Err(CoordinationError::NoNode(path.to_owned())),
            Some(_) => Err(CoordinationError::VersionMismatch {
                path: path.to_owned(),
                expected: expected_version,
            }),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(storage_err)?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(versioned(kv)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        let resp = client.delete(path, None).await.map_err(storage_err)?;
        if resp.deleted() == 0 {
            Err(CoordinationError::NoNode(path.to_owned()))
        } else {
            Ok(())
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        self.ensure_live()?;
        let prefix = format!("{}/", path);
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(storage_err)?;
        let mut names: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn watch_node(&self, path: &str) -> Result<WatchStream<NodeEvent>> {
        validate_path(path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(storage_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let initial = match resp.kvs().first() {
            Some(kv) => NodeEvent::Data(versioned(kv)?),
            None => NodeEvent::Absent,
        };

        let (watcher, stream) = client
            .watch(
                path,
                Some(WatchOptions::new().with_start_revision(revision + 1)),
            )
            .await
            .map_err(storage_err)?;
        debug!(path = %path, revision, "node watch installed");

        let watch = forward_watch(watcher, stream, |event_type, kv| match event_type {
            EventType::Put => Some(versioned(kv).map(NodeEvent::Data)),
            EventType::Delete => Some(Ok(NodeEvent::Absent)),
        });
        Ok(watch.prepend(vec![initial]).bound_to(&self.session.state))
    }

    async fn watch_children(
        &self,
        path: &str,
        fetch_payload: bool,
    ) -> Result<WatchStream<ChildEvent>> {
        validate_path(path)?;
        self.ensure_live()?;
        let prefix = format!("{}/", path);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(storage_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut initial = Vec::new();
        for kv in resp.kvs() {
            let Ok(key) = kv.key_str() else { continue };
            if let Some(name) = direct_child(key, &prefix) {
                let payload = if fetch_payload {
                    Some(decode(kv.value())?)
                } else {
                    None
                };
                initial.push(ChildEvent::Added {
                    name: name.to_owned(),
                    payload,
                });
            }
        }

        let (watcher, stream) = client
            .watch(
                prefix.as_str(),
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(revision + 1),
                ),
            )
            .await
            .map_err(storage_err)?;
        debug!(path = %path, revision, children = initial.len(), "children watch installed");

        let watch = forward_watch(watcher, stream, move |event_type, kv| {
            let key = kv.key_str().ok()?;
            let name = direct_child(key, &prefix)?.to_owned();
            match event_type {
                // version 1 marks a creation, later puts are data updates
                EventType::Put if kv.version() == 1 => {
                    let payload = if fetch_payload {
                        match decode(kv.value()) {
                            Ok(value) => Some(value),
                            Err(e) => return Some(Err(e)),
                        }
                    } else {
                        None
                    };
                    Some(Ok(ChildEvent::Added { name, payload }))
                }
                EventType::Put => None,
                EventType::Delete => Some(Ok(ChildEvent::Removed { name })),
            }
        });
        Ok(watch.prepend(initial).bound_to(&self.session.state))
    }

    async fn campaign(&self, election_path: &str, candidate_id: &str) -> Result<Leadership> {
        validate_path(election_path)?;
        self.ensure_live()?;
        let mut client = self.client.clone();
        let resp = client
            .campaign(election_path, candidate_id, self.session.lease_id)
            .await
            .map_err(storage_err)?;
        let leader_key = resp.leader().cloned().ok_or_else(|| {
            CoordinationError::Unknown("campaign returned without a leader key".to_string())
        })?;
        let key = String::from_utf8_lossy(leader_key.key()).to_string();
        info!(candidate = %candidate_id, leader_key = %key, "won etcd election");

        let (watcher, mut stream) = client
            .watch(
                key.as_str(),
                Some(WatchOptions::new().with_start_revision(leader_key.rev() + 1)),
            )
            .await
            .map_err(storage_err)?;

        let (leadership, signal) = Leadership::new(candidate_id);
        let session = self.session.state.clone();
        tokio::spawn(async move {
            let mut watcher = watcher;
            loop {
                tokio::select! {
                    _ = session.expired() => {
                        signal.revoke();
                        break;
                    }
                    _ = signal.released() => {
                        let options = ResignOptions::new().with_leader(leader_key.clone());
                        if let Err(e) = client.resign(Some(options)).await {
                            warn!(error = %e, "failed to resign etcd leadership");
                        }
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            let deleted = resp
                                .events()
                                .iter()
                                .any(|event| matches!(event.event_type(), EventType::Delete));
                            if deleted || resp.canceled() {
                                signal.revoke();
                                break;
                            }
                        }
                        Ok(None) | Err(_) => {
                            signal.revoke();
                            break;
                        }
                    }
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(leadership)
    }

    async fn close(&self) -> Result<()> {
        if !self.session.state.expire() {
            return Ok(());
        }
        if let Some(handle) = self.session.keep_alive.lock().await.take() {
            handle.abort();
        }
        let mut client = self.client.clone();
        client
            .lease_revoke(self.session.lease_id)
            .await
            .map_err(storage_err)?;
        info!(lease_id = self.session.lease_id, "coordination session closed");
        Ok(())
    }
}
