use super::*;
use crate::coordination_service::register_routing_broker;
use crate::test_support::{
    broker_config, fast_retry, memory_store, recording_controller, resources_for, wait_for,
};
use crate::utils::wan_locator;
use meridian_core::coordination::CoordinationStore;
use meridian_core::data_plane::DataPlaneCommand;
use meridian_core::model::TopicSet;

fn interest(region: &str, port: u16) -> RegionInterestRecord {
    RegionInterestRecord {
        topic_name: "orders".to_owned(),
        type_name: "Order".to_owned(),
        origin_tag: String::new(),
        region: region.to_owned(),
        locator: wan_locator(region, port),
    }
}

fn region_peer(add: bool, region: &str) -> DataPlaneCommand {
    let scope = routing_scope("RB1");
    // publishers reach the region on 8502, subscribers on 8503
    let (locator, primary) = if region == "A" {
        (wan_locator("A", 8502), true)
    } else {
        (wan_locator(region, 8503), false)
    };
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

fn bridge(create: bool) -> DataPlaneCommand {
    let (broker, topic_name, type_name) = ("RB1".to_owned(), "orders".to_owned(), "Order".to_owned());
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

async fn set_topics(resources: &Resources, topics: &[&str]) {
    let current = resources.broker.registration("RB1").await.unwrap().unwrap();
    let topics: TopicSet = topics.iter().map(|t| t.to_string()).collect();
    resources
        .broker
        .update_topics("RB1", &topics, current.version)
        .await
        .unwrap();
}

/// **Test:** Routing peers through region loss, resync and topic release
///
/// **Reason:** a departing region must take its session and peer with it, a resync
/// after a lagged watch must not replay what is already known, and a topic that
/// leaves this broker must release every peer it justified.
///
/// **Expectation:** the exact command sequence below; only the order of the two
/// initial AddPeer commands depends on which watch reports first.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routing_peers_follow_regions_and_assignment() {
    let store = memory_store().await;
    let rb1 = store.connect("RB1");
    let resources = &resources_for(&rb1);
    register_routing_broker(resources, "RB1").await.unwrap();

    let (controller, sink) = recording_controller();
    let (manager, task) = RoutingPeerManager::start(
        PeerManagerSettings::from_config(&broker_config("RB1")),
        resources.clone(),
        controller,
        fast_retry(),
    );

    let edge_a = resources_for(&store.connect("A"));
    edge_a.topic.ensure_topic("orders").await.unwrap();
    edge_a
        .topic
        .create_region_interest(Role::Publisher, &interest("A", 8502))
        .await
        .unwrap();
    let edge_b_session = store.connect("B");
    let edge_b = resources_for(&edge_b_session);
    edge_b
        .topic
        .create_region_interest(Role::Subscriber, &interest("B", 8503))
        .await
        .unwrap();

    set_topics(resources, &["orders"]).await;
    wait_for("cross-region session", || sink.count(&bridge(true)) == 1).await;

    // same state as the watches already reported; nothing to do
    manager.resync("orders", Role::Publisher);
    manager.resync("orders", Role::Subscriber);

    edge_b_session.close().await.unwrap();
    wait_for("B released", || sink.count(&region_peer(false, "B")) == 1).await;

    let edge_b = resources_for(&store.connect("B"));
    edge_b
        .topic
        .create_region_interest(Role::Subscriber, &interest("B", 8503))
        .await
        .unwrap();
    wait_for("session re-created", || sink.count(&bridge(true)) == 2).await;

    set_topics(resources, &[]).await;
    wait_for("topic released", || {
        sink.count(&region_peer(false, "A")) == 1 && sink.count(&region_peer(false, "B")) == 2
    })
    .await;

    let commands = sink.commands();
    assert_eq!(commands.len(), 10);
    let mut first_adds = commands[..2].to_vec();
    first_adds.sort_by_key(|command| command.to_string());
    assert_eq!(first_adds, vec![region_peer(true, "A"), region_peer(true, "B")]);
    assert_eq!(
        commands[2..].to_vec(),
        vec![
            bridge(true),
            bridge(false),
            region_peer(false, "B"),
            region_peer(true, "B"),
            bridge(true),
            bridge(false),
            region_peer(false, "A"),
            region_peer(false, "B"),
        ]
    );
    assert!(store.get("/topics/orders/sub/B").await.unwrap().is_some());

    manager.shutdown();
    task.await.unwrap();
}
