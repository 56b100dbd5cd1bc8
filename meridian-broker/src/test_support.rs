use anyhow::Result;
use async_trait::async_trait;
use meridian_core::data_plane::{DataPlaneCommand, DataPlaneController};
use meridian_metadata_store::{CoordinationStorage, MemoryStore};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    data_plane::{CommandSink, QueuedController},
    resources::Resources,
    retry::RetryPolicy,
    service_configuration::{
        CoordinationPolicy, EdgeSettings, RetrySettings, RoutingSettings, ServiceConfiguration,
    },
};

pub(crate) async fn memory_store() -> MemoryStore {
    MemoryStore::new()
        .await
        .expect("Failed to create memory store")
}

pub(crate) fn resources_for(store: &MemoryStore) -> Resources {
    Resources::new(CoordinationStorage::InMemory(store.clone()))
}

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1, 5)
}

/// Configuration of a broker known as `host`, with default ports and policies.
pub(crate) fn broker_config(host: &str) -> ServiceConfiguration {
    ServiceConfiguration {
        cluster_name: "MY_CLUSTER".to_owned(),
        broker_host: host.to_owned(),
        meta_store_addr: "127.0.0.1:2379".to_owned(),
        edge: EdgeSettings::default(),
        routing: RoutingSettings::default(),
        policy: CoordinationPolicy {
            retry: RetrySettings {
                max_retries: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            ..Default::default()
        },
    }
}

/// Command sink remembering everything the data plane was asked to do.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    commands: Mutex<Vec<DataPlaneCommand>>,
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn apply(&self, command: &DataPlaneCommand) -> Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(())
    }
}

impl RecordingSink {
    pub(crate) fn commands(&self) -> Vec<DataPlaneCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, expected: &DataPlaneCommand) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| *command == expected)
            .count()
    }
}

/// Queued controller backed by a [`RecordingSink`].
pub(crate) fn recording_controller() -> (Arc<dyn DataPlaneController>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let (controller, _worker) = QueuedController::start(sink.clone(), fast_retry());
    (Arc::new(controller), sink)
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub(crate) async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// [`wait_until`] for checks that need no I/O.
pub(crate) async fn wait_for(what: &str, check: impl Fn() -> bool) {
    wait_until(what, || std::future::ready(check())).await
}
