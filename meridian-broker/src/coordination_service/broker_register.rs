use anyhow::Result;
use meridian_core::coordination::CoordinationError;
use meridian_core::model::TopicSet;
use tracing::info;

use crate::resources::Resources;

/// Publish this routing broker's registration with an empty topic set.
///
/// A registration left by an earlier session of the same broker (its lease
/// not yet expired) is taken over: its topics are kept and the node is
/// rebound to the current session.
pub(crate) async fn register_routing_broker(resources: &Resources, broker_addr: &str) -> Result<()> {
    match resources
        .broker
        .create_registration(broker_addr, &TopicSet::new())
        .await
    {
        Ok(()) => {
            info!(broker = %broker_addr, "routing broker registered");
            Ok(())
        }
        Err(CoordinationError::NodeExists(_)) => {
            let topics = resources
                .broker
                .registration(broker_addr)
                .await?
                .map(|previous| previous.topics)
                .unwrap_or_default();
            resources.broker.delete_registration(broker_addr).await?;
            resources
                .broker
                .create_registration(broker_addr, &topics)
                .await?;
            info!(
                broker = %broker_addr,
                topics = topics.len(),
                "routing broker registration taken over from a previous session"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
