//! End-to-end coordination tests
//!
//! Edge and routing brokers run against one in-memory coordination tree, each
//! with its own session, and record the data-plane commands they issue.

use meridian_core::coordination::CoordinationStore;
use meridian_core::data_plane::DataPlaneCommand;
use meridian_core::discovery::{ChannelFeed, EndpointEvent};
use meridian_core::model::Role;

use crate::{
    coordination_service::{EdgeBroker, LeaderElectionState, RoutingBroker},
    discovery_feed::pump_feed,
    test_support::{
        broker_config, memory_store, recording_controller, resources_for, wait_for, wait_until,
    },
};

fn local_session(create: bool, region: &str, role: Role) -> DataPlaneCommand {
    let (region, topic_name, type_name) = (region.to_owned(), "orders".to_owned(), "Order".to_owned());
    if create {
        DataPlaneCommand::CreateLocalSession {
            region,
            topic_name,
            type_name,
            role,
        }
    } else {
        DataPlaneCommand::DeleteLocalSession {
            region,
            topic_name,
            type_name,
            role,
        }
    }
}

fn cross_region_session(create: bool, broker: &str) -> DataPlaneCommand {
    let (broker, topic_name, type_name) = (broker.to_owned(), "orders".to_owned(), "Order".to_owned());
    if create {
        DataPlaneCommand::CreateCrossRegionSession {
            broker,
            topic_name,
            type_name,
        }
    } else {
        DataPlaneCommand::DeleteCrossRegionSession {
            broker,
            topic_name,
            type_name,
        }
    }
}

fn peer(add: bool, scope: &str, locator: &str, primary: bool) -> DataPlaneCommand {
    let (scope, locator) = (scope.to_owned(), locator.to_owned());
    if add {
        DataPlaneCommand::AddPeer {
            scope,
            locator,
            primary,
        }
    } else {
        DataPlaneCommand::RemovePeer {
            scope,
            locator,
            primary,
        }
    }
}

/// **Test:** Orders end to end
///
/// **Reason:** exercises every component together: interest tracking in two regions,
/// leader election and assignment, and the routing broker's peer graph.
///
/// **Expectation:** one local session per region, assignment to RB1, one
/// cross-region session, one peer per region; when region A's last publisher leaves,
/// its record, local session, the cross-region session and A's peer go away.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orders_flow_between_two_regions() {
    let store = memory_store().await;
    let store = &store;
    let rb1_store = store.connect("RB1");
    let a_store = store.connect("A");
    let b_store = store.connect("B");

    let (rb1_controller, rb1_sink) = recording_controller();
    let rb1 = RoutingBroker::start(&broker_config("RB1"), resources_for(&rb1_store), rb1_controller)
        .await
        .unwrap();
    let rb1_ref = &rb1;
    wait_until("RB1 to lead", || async move {
        rb1_ref.election_state().await == LeaderElectionState::Leading
    })
    .await;

    let (a_controller, a_sink) = recording_controller();
    let edge_a = EdgeBroker::start(&broker_config("A"), resources_for(&a_store), a_controller);
    let (b_controller, b_sink) = recording_controller();
    let edge_b = EdgeBroker::start(&broker_config("B"), resources_for(&b_store), b_controller);

    // region A: first publisher of "orders"
    assert!(edge_a
        .tracker(Role::Publisher)
        .endpoint(EndpointEvent::appeared(Role::Publisher, "a-pub-1", "orders", "Order", "")));

    wait_until("publisher record of A", || async move {
        store.get("/topics/orders/pub/A").await.unwrap().is_some()
    })
    .await;
    wait_for("local publisher session in A", || {
        a_sink.count(&local_session(true, "A", Role::Publisher)) == 1
    })
    .await;
    wait_until("orders assigned to RB1", || async move {
        store.get("/topics/orders").await.unwrap().map(|node| node.value)
            == Some(serde_json::json!("RB1"))
    })
    .await;
    let registration = store.get("/routingBrokers/RB1").await.unwrap().unwrap();
    assert_eq!(registration.value, serde_json::json!(["orders"]));
    wait_for("A peers with RB1 inbound", || {
        a_sink.count(&peer(true, "EdgeBrokerDomainRoute@A", "tcpv4_wan://RB1:8500", false)) == 1
    })
    .await;

    // region B: first subscriber of "orders"
    assert!(edge_b
        .tracker(Role::Subscriber)
        .endpoint(EndpointEvent::appeared(Role::Subscriber, "b-sub-1", "orders", "Order", "")));

    wait_until("subscriber record of B", || async move {
        store.get("/topics/orders/sub/B").await.unwrap().is_some()
    })
    .await;
    wait_for("cross-region session on RB1", || {
        rb1_sink.count(&cross_region_session(true, "RB1")) == 1
    })
    .await;
    wait_for("RB1 peers with both regions", || {
        rb1_sink.count(&peer(true, "RoutingBrokerDomainRoute@RB1", "tcpv4_wan://A:8502", true)) == 1
            && rb1_sink.count(&peer(true, "RoutingBrokerDomainRoute@RB1", "tcpv4_wan://B:8503", false))
                == 1
    })
    .await;
    wait_for("B peers with RB1 outbound", || {
        b_sink.count(&peer(true, "EdgeBrokerDomainRoute@B", "tcpv4_wan://RB1:8501", false)) == 1
    })
    .await;
    assert_eq!(b_sink.count(&local_session(true, "B", Role::Subscriber)), 1);

    // region A: last publisher departs
    assert!(edge_a
        .tracker(Role::Publisher)
        .endpoint(EndpointEvent::departed(Role::Publisher, "a-pub-1")));

    wait_until("publisher record of A removed", || async move {
        store.get("/topics/orders/pub/A").await.unwrap().is_none()
    })
    .await;
    wait_for("local publisher session in A deleted", || {
        a_sink.count(&local_session(false, "A", Role::Publisher)) == 1
    })
    .await;
    wait_for("cross-region session deleted", || {
        rb1_sink.count(&cross_region_session(false, "RB1")) == 1
    })
    .await;
    let a_peer = peer(false, "RoutingBrokerDomainRoute@RB1", "tcpv4_wan://A:8502", true);
    wait_for("RB1 drops A", || rb1_sink.count(&a_peer) == 1).await;
    wait_for("A drops RB1", || {
        a_sink.count(&peer(false, "EdgeBrokerDomainRoute@A", "tcpv4_wan://RB1:8500", false)) == 1
    })
    .await;

    let commands = rb1_sink.commands();
    let session_deleted = commands
        .iter()
        .position(|c| *c == cross_region_session(false, "RB1"))
        .unwrap();
    let peer_removed = commands.iter().position(|c| *c == a_peer).unwrap();
    assert!(session_deleted < peer_removed);
    assert_eq!(rb1_sink.count(&cross_region_session(true, "RB1")), 1);
    // B still subscribes, so RB1 keeps B as a peer
    assert_eq!(
        rb1_sink.count(&peer(false, "RoutingBrokerDomainRoute@RB1", "tcpv4_wan://B:8503", false)),
        0
    );
    // the assignment never moves
    assert_eq!(
        store.get("/topics/orders").await.unwrap().unwrap().value,
        serde_json::json!("RB1")
    );

    edge_a.shutdown().await;
    edge_b.shutdown().await;
    rb1.shutdown().await;
}

/// **Test:** Reference counting through the discovery feed
///
/// **Expectation:** the region interest record exists exactly while the local
/// count is positive, infrastructure endpoints never count, and the local
/// session is created and deleted once.
#[tokio::test]
async fn region_interest_follows_local_count() {
    let store = memory_store().await;
    let store = &store;
    let a_store = store.connect("A");
    let (controller, sink) = recording_controller();
    let edge = EdgeBroker::start(&broker_config("A"), resources_for(&a_store), controller);

    let (feed_tx, feed) = ChannelFeed::channel();
    let pump = tokio::spawn(pump_feed(
        feed,
        edge.tracker(Role::Publisher).clone(),
        edge.tracker(Role::Subscriber).clone(),
    ));
    let publishers = edge.tracker(Role::Publisher);

    feed_tx.send(EndpointEvent::appeared(Role::Publisher, "p-1", "orders", "Order", ""));
    feed_tx.send(EndpointEvent::appeared(Role::Publisher, "p-2", "orders", "Order", ""));
    feed_tx.send(EndpointEvent::appeared(Role::Publisher, "infra", "orders", "Order", "k"));
    feed_tx.end_batch();

    wait_until("two publishers counted", || async move {
        publishers.interest_count("orders").await == Some(2)
    })
    .await;
    assert!(store.get("/topics/orders/pub/A").await.unwrap().is_some());
    assert!(store.get("/topics/orders/sub").await.unwrap().is_some());

    feed_tx.send(EndpointEvent::departed(Role::Publisher, "p-1"));
    feed_tx.send(EndpointEvent::departed(Role::Publisher, "infra"));
    wait_until("one publisher left", || async move {
        publishers.interest_count("orders").await == Some(1)
    })
    .await;
    assert!(store.get("/topics/orders/pub/A").await.unwrap().is_some());

    feed_tx.send(EndpointEvent::departed(Role::Publisher, "p-2"));
    wait_until("record withdrawn", || async move {
        store.get("/topics/orders/pub/A").await.unwrap().is_none()
    })
    .await;
    wait_for("local session deleted", || {
        sink.count(&local_session(false, "A", Role::Publisher)) == 1
    })
    .await;
    assert_eq!(sink.count(&local_session(true, "A", Role::Publisher)), 1);
    assert_eq!(publishers.interest_count("orders").await, Some(0));

    drop(feed_tx);
    pump.await.unwrap();
    edge.shutdown().await;
}

/// **Test:** Leader failover
///
/// **Reason:** leadership is tied to the store session; a crashed leader must be
/// replaced and the replacement must keep assigning.
///
/// **Expectation:** RB2 follows while RB1 leads, takes over when RB1's session
/// closes, and assigns new topics to itself as the only live broker.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leadership_moves_when_leader_session_closes() {
    let store = memory_store().await;
    let store = &store;
    let rb1_store = store.connect("RB1");
    let rb2_store = store.connect("RB2");

    let (rb1_controller, _rb1_sink) = recording_controller();
    let rb1 = RoutingBroker::start(&broker_config("RB1"), resources_for(&rb1_store), rb1_controller)
        .await
        .unwrap();
    let rb1_ref = &rb1;
    wait_until("RB1 to lead", || async move {
        rb1_ref.election_state().await == LeaderElectionState::Leading
    })
    .await;

    let (rb2_controller, _rb2_sink) = recording_controller();
    let rb2 = RoutingBroker::start(&broker_config("RB2"), resources_for(&rb2_store), rb2_controller)
        .await
        .unwrap();
    let rb2_ref = &rb2;
    wait_until("RB2 to follow", || async move {
        rb2_ref.election_state().await == LeaderElectionState::Following
    })
    .await;

    rb1_store.close().await.unwrap();
    wait_until("RB2 to lead", || async move {
        rb2_ref.election_state().await == LeaderElectionState::Leading
    })
    .await;
    wait_until("RB1 to leave the election", || async move {
        rb1_ref.election_state().await == LeaderElectionState::NoLeader
    })
    .await;

    let resources = &resources_for(store);
    resources.topic.ensure_topic("trades").await.unwrap();
    wait_until("trades assigned to RB2", || async move {
        resources.topic.assignment("trades").await.unwrap() == Some("RB2".to_string())
    })
    .await;

    rb2.shutdown().await;
    rb1.shutdown().await;
}
