mod assignment_engine;
mod broker_register;
mod interest_tracker;
mod leader_election;
mod peer_graph;
mod routing_peer_manager;

pub(crate) use broker_register::register_routing_broker;
pub(crate) use interest_tracker::{InterestTracker, TrackerHandle, TrackerSettings};
pub(crate) use leader_election::{LeaderElection, LeaderElectionState};
pub(crate) use routing_peer_manager::{PeerManagerHandle, PeerManagerSettings, RoutingPeerManager};

use anyhow::Result;
use meridian_core::data_plane::DataPlaneController;
use meridian_core::model::Role;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    resources::{Resources, LEADER_ELECTION_PATH},
    retry::RetryPolicy,
    service_configuration::ServiceConfiguration,
};

// Coordination services of a Meridian broker
//
// Edge broker (one per region):
// Two Interest Trackers, one per role, turn local discovery events into
// reference-counted region interest under /topics and local forwarding
// sessions, and connect the region to the routing broker each topic is
// assigned to.
//
// Routing broker (a pool on the WAN):
// Registers under /routingBrokers, runs the Peer Graph Manager for the topics
// assigned to it, and stands for leader election. The leader runs the Topic
// Assignment Engine.

/// Background task forwarding store watch events into an actor.
/// Dropping it cancels the watch.
#[derive(Debug)]
pub(crate) struct WatchTask(JoinHandle<()>);

impl WatchTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        WatchTask(tokio::spawn(future))
    }
}

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Coordination plane of an edge broker.
pub(crate) struct EdgeBroker {
    publishers: TrackerHandle,
    subscribers: TrackerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl EdgeBroker {
    pub(crate) fn start(
        config: &ServiceConfiguration,
        resources: Resources,
        controller: Arc<dyn DataPlaneController>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.policy.retry);
        let (publishers, publisher_task) = InterestTracker::start(
            TrackerSettings::from_config(config, Role::Publisher),
            resources.clone(),
            Arc::clone(&controller),
            retry.clone(),
        );
        let (subscribers, subscriber_task) = InterestTracker::start(
            TrackerSettings::from_config(config, Role::Subscriber),
            resources,
            controller,
            retry,
        );
        info!(region = %config.broker_host, "edge broker coordination started");
        EdgeBroker {
            publishers,
            subscribers,
            tasks: vec![publisher_task, subscriber_task],
        }
    }

    pub(crate) fn tracker(&self, role: Role) -> &TrackerHandle {
        match role {
            Role::Publisher => &self.publishers,
            Role::Subscriber => &self.subscribers,
        }
    }

    pub(crate) async fn shutdown(self) {
        self.publishers.shutdown();
        self.subscribers.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "interest tracker ended abnormally");
            }
        }
    }
}

/// Coordination plane of a routing broker.
pub(crate) struct RoutingBroker {
    peer_manager: PeerManagerHandle,
    leader_election: LeaderElection,
    peer_task: JoinHandle<()>,
    election_task: JoinHandle<()>,
}

impl RoutingBroker {
    pub(crate) async fn start(
        config: &ServiceConfiguration,
        resources: Resources,
        controller: Arc<dyn DataPlaneController>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.policy.retry);

        register_routing_broker(&resources, &config.broker_host).await?;

        let (peer_manager, peer_task) = RoutingPeerManager::start(
            PeerManagerSettings::from_config(config),
            resources.clone(),
            controller,
            retry.clone(),
        );

        let leader_election = LeaderElection::new(
            resources.store().clone(),
            LEADER_ELECTION_PATH,
            &config.broker_host,
        );
        let election = leader_election.clone();
        let reassign = config.policy.reassign_orphaned_topics;
        let election_task =
            tokio::spawn(async move { election.start(resources, retry, reassign).await });

        info!(broker = %config.broker_host, "routing broker coordination started");
        Ok(RoutingBroker {
            peer_manager,
            leader_election,
            peer_task,
            election_task,
        })
    }

    pub(crate) async fn election_state(&self) -> LeaderElectionState {
        self.leader_election.get_state().await
    }

    pub(crate) async fn shutdown(self) {
        // aborting drops the leadership handle, which resigns
        self.election_task.abort();
        let _ = self.election_task.await;
        self.peer_manager.shutdown();
        if let Err(e) = self.peer_task.await {
            warn!(error = %e, "routing peer manager ended abnormally");
        }
    }
}
