use anyhow::Result;
use async_trait::async_trait;
use meridian_core::data_plane::{DataPlaneCommand, DataPlaneController};
use meridian_core::model::Role;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::retry::RetryPolicy;

/// Where queued data-plane commands are finally delivered.
#[async_trait]
pub(crate) trait CommandSink: Send + Sync + 'static {
    async fn apply(&self, command: &DataPlaneCommand) -> Result<()>;
}

/// Sink used when no data-plane admin endpoint is wired in: every command is
/// logged and considered applied.
#[derive(Debug, Default)]
pub(crate) struct LogSink;

#[async_trait]
impl CommandSink for LogSink {
    async fn apply(&self, command: &DataPlaneCommand) -> Result<()> {
        info!(command = %command, "data plane command");
        Ok(())
    }
}

/// Fire-and-forget controller: calls return immediately, a worker task
/// applies the commands in order.
#[derive(Debug, Clone)]
pub(crate) struct QueuedController {
    tx: mpsc::UnboundedSender<DataPlaneCommand>,
}

impl QueuedController {
    /// Spawn the worker. It stops once every controller clone is dropped.
    pub(crate) fn start(sink: Arc<dyn CommandSink>, retry: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(command_worker(rx, sink, retry));
        (QueuedController { tx }, handle)
    }

    fn enqueue(&self, command: DataPlaneCommand) {
        if let Err(e) = self.tx.send(command) {
            warn!(command = %e.0, "data plane worker stopped, command dropped");
        }
    }
}

async fn command_worker(
    mut rx: mpsc::UnboundedReceiver<DataPlaneCommand>,
    sink: Arc<dyn CommandSink>,
    retry: RetryPolicy,
) {
    while let Some(command) = rx.recv().await {
        let mut attempt = 0;
        loop {
            match sink.apply(&command).await {
                Ok(()) => break,
                Err(e) if attempt < retry.max_retries() => {
                    let backoff = retry.calculate_backoff(attempt);
                    warn!(
                        command = %command,
                        attempt = attempt + 1,
                        error = %e,
                        "data plane command failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(command = %command, error = %e, "data plane command abandoned");
                    break;
                }
            }
        }
    }
    info!("data plane command worker stopped");
}

impl DataPlaneController for QueuedController {
    fn create_local_session(&self, region: &str, topic_name: &str, type_name: &str, role: Role) {
        self.enqueue(DataPlaneCommand::CreateLocalSession {
            region: region.to_owned(),
            topic_name: topic_name.to_owned(),
            type_name: type_name.to_owned(),
            role,
        });
    }

    fn delete_local_session(&self, region: &str, topic_name: &str, type_name: &str, role: Role) {
        self.enqueue(DataPlaneCommand::DeleteLocalSession {
            region: region.to_owned(),
            topic_name: topic_name.to_owned(),
            type_name: type_name.to_owned(),
            role,
        });
    }

    fn create_cross_region_session(&self, broker: &str, topic_name: &str, type_name: &str) {
        self.enqueue(DataPlaneCommand::CreateCrossRegionSession {
            broker: broker.to_owned(),
            topic_name: topic_name.to_owned(),
            type_name: type_name.to_owned(),
        });
    }

    fn delete_cross_region_session(&self, broker: &str, topic_name: &str, type_name: &str) {
        self.enqueue(DataPlaneCommand::DeleteCrossRegionSession {
            broker: broker.to_owned(),
            topic_name: topic_name.to_owned(),
            type_name: type_name.to_owned(),
        });
    }

    fn add_peer(&self, scope: &str, locator: &str, primary: bool) {
        self.enqueue(DataPlaneCommand::AddPeer {
            scope: scope.to_owned(),
            locator: locator.to_owned(),
            primary,
        });
    }

    fn remove_peer(&self, scope: &str, locator: &str, primary: bool) {
        self.enqueue(DataPlaneCommand::RemovePeer {
            scope: scope.to_owned(),
            locator: locator.to_owned(),
            primary,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fails the first `failures` deliveries, records the rest.
    struct FlakySink {
        failures: Mutex<usize>,
        applied: Mutex<Vec<DataPlaneCommand>>,
    }

    #[async_trait]
    impl CommandSink for FlakySink {
        async fn apply(&self, command: &DataPlaneCommand) -> Result<()> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(anyhow::anyhow!("admin endpoint unavailable"));
                }
            }
            self.applied.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    /// Purpose: commands are delivered in call order even when the sink fails transiently
    /// Expected: both commands applied once, in order, after the worker retried
    #[tokio::test]
    async fn queued_commands_are_retried_in_order() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(2),
            applied: Mutex::new(Vec::new()),
        });
        let (controller, worker) =
            QueuedController::start(sink.clone(), RetryPolicy::new(3, 1, 2));

        controller.add_peer("EdgeBrokerDomainRoute@A", "tcpv4_wan://rb1:8500", false);
        controller.create_local_session("A", "orders", "Order", Role::Publisher);
        drop(controller);
        worker.await.unwrap();

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert!(matches!(applied[0], DataPlaneCommand::AddPeer { .. }));
        assert!(matches!(applied[1], DataPlaneCommand::CreateLocalSession { .. }));
    }

    /// Expected: a command that keeps failing is dropped and the worker moves on
    #[tokio::test]
    async fn exhausted_command_does_not_block_the_queue() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(2),
            applied: Mutex::new(Vec::new()),
        });
        let (controller, worker) =
            QueuedController::start(sink.clone(), RetryPolicy::new(1, 1, 2));

        controller.remove_peer("RoutingBrokerDomainRoute@rb1", "tcpv4_wan://A:8502", true);
        controller.delete_cross_region_session("rb1", "orders", "Order");
        drop(controller);
        worker.await.unwrap();

        let applied = sink.applied.lock().unwrap();
        assert_eq!(
            *applied,
            vec![DataPlaneCommand::DeleteCrossRegionSession {
                broker: "rb1".into(),
                topic_name: "orders".into(),
                type_name: "Order".into(),
            }]
        );
    }
}
