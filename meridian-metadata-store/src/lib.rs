mod providers;
pub use providers::etcd::EtcdStore;

pub use meridian_core::coordination::{
    ChildEvent, CoordinationError, CoordinationStore, CreateMode, Leadership, MemoryStore,
    NodeEvent, Result, SessionState, Versioned, WatchStream,
};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum CoordinationStorage {
    Etcd(EtcdStore),
    InMemory(MemoryStore), // InMemory is used for testing and single-process runs
}

impl CoordinationStorage {
    /// Liveness of the session this handle operates in.
    pub fn session(&self) -> &SessionState {
        match self {
            CoordinationStorage::Etcd(store) => store.session(),
            CoordinationStorage::InMemory(store) => store.session(),
        }
    }
}

#[async_trait]
impl CoordinationStore for CoordinationStorage {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => store.ensure_path(path).await,
            CoordinationStorage::InMemory(store) => store.ensure_path(path).await,
        }
    }

    async fn create(&self, path: &str, value: Value, mode: CreateMode) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => store.create(path, value, mode).await,
            CoordinationStorage::InMemory(store) => store.create(path, value, mode).await,
        }
    }

    async fn set_data(&self, path: &str, value: Value) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => store.set_data(path, value).await,
            CoordinationStorage::InMemory(store) => store.set_data(path, value).await,
        }
    }

    async fn set_data_versioned(
        &self,
        path: &str,
        value: Value,
        expected_version: i64,
    ) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => {
                store.set_data_versioned(path, value, expected_version).await
            }
            CoordinationStorage::InMemory(store) => {
                store.set_data_versioned(path, value, expected_version).await
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        match self {
            CoordinationStorage::Etcd(store) => store.get(path).await,
            CoordinationStorage::InMemory(store) => store.get(path).await,
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => store.delete(path).await,
            CoordinationStorage::InMemory(store) => store.delete(path).await,
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        match self {
            CoordinationStorage::Etcd(store) => store.get_children(path).await,
            CoordinationStorage::InMemory(store) => store.get_children(path).await,
        }
    }

    async fn watch_node(&self, path: &str) -> Result<WatchStream<NodeEvent>> {
        match self {
            CoordinationStorage::Etcd(store) => store.watch_node(path).await,
            CoordinationStorage::InMemory(store) => store.watch_node(path).await,
        }
    }

    async fn watch_children(
        &self,
        path: &str,
        fetch_payload: bool,
    ) -> Result<WatchStream<ChildEvent>> {
        match self {
            CoordinationStorage::Etcd(store) => store.watch_children(path, fetch_payload).await,
            CoordinationStorage::InMemory(store) => {
                store.watch_children(path, fetch_payload).await
            }
        }
    }

    async fn campaign(&self, election_path: &str, candidate_id: &str) -> Result<Leadership> {
        match self {
            CoordinationStorage::Etcd(store) => store.campaign(election_path, candidate_id).await,
            CoordinationStorage::InMemory(store) => {
                store.campaign(election_path, candidate_id).await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            CoordinationStorage::Etcd(store) => store.close().await,
            CoordinationStorage::InMemory(store) => store.close().await,
        }
    }
}
