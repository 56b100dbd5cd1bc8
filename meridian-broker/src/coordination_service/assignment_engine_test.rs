use super::*;
use crate::test_support::{fast_retry, memory_store, resources_for};
use meridian_core::coordination::CoordinationStore;
use meridian_core::model::TopicSet;

fn registration(broker: &str, topics: &[&str]) -> Registration {
    Registration {
        broker: broker.to_owned(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        version: 0,
    }
}

async fn register(resources: &Resources, broker: &str, topics: &[&str]) {
    let topics: TopicSet = topics.iter().map(|t| t.to_string()).collect();
    resources
        .broker
        .create_registration(broker, &topics)
        .await
        .unwrap();
}

/// **Test:** Least-loaded selection with ties
///
/// **Reason:** load is approximate, so only the count of the chosen broker matters.
///
/// **Expectation:** with counts [3,1,1] the chosen broker has count 1, and it is the first of them.
#[test]
fn least_loaded_prefers_lowest_count_first_in_order() {
    let snapshot = vec![
        registration("rb1", &["a", "b", "c"]),
        registration("rb2", &["d"]),
        registration("rb3", &["e"]),
    ];
    let chosen = select_least_loaded(&snapshot).unwrap();
    assert_eq!(chosen.topics.len(), 1);
    assert_eq!(chosen.broker, "rb2");
    assert!(select_least_loaded(&[]).is_none());
}

/// **Test:** Assignment against the store with loads [3,1,1]
///
/// **Expectation:** the topic lands on a broker that had one topic, which now has two.
#[tokio::test]
async fn assigns_to_a_least_loaded_broker() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    register(&resources, "rb1", &["a", "b", "c"]).await;
    register(&resources, "rb2", &["d"]).await;
    register(&resources, "rb3", &["e"]).await;
    resources.topic.ensure_topic("orders").await.unwrap();

    let engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    let broker = match engine.assign("orders").await.unwrap() {
        AssignOutcome::Assigned(broker) => broker,
        other => panic!("unexpected outcome {:?}", other),
    };
    let registration = resources.broker.registration(&broker).await.unwrap().unwrap();
    assert_eq!(registration.topics.len(), 2);
    assert!(registration.topics.contains("orders"));
    assert_eq!(
        resources.topic.assignment("orders").await.unwrap(),
        Some(broker)
    );
}

/// **Test:** Single assignment
///
/// **Reason:** a topic observed again (new leader replay, watch resync) must not move.
///
/// **Expectation:** exactly one registration lists the topic, the assignment node is
/// written once and never changes.
#[tokio::test]
async fn topic_is_assigned_exactly_once() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    register(&resources, "rb1", &[]).await;
    register(&resources, "rb2", &[]).await;
    resources.topic.ensure_topic("orders").await.unwrap();

    let mut engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    assert_eq!(engine.state(), EngineState::Idle);
    engine.on_topic_added("orders").await;
    assert_eq!(engine.state(), EngineState::Assigning);

    let first = resources.topic.topic_node("orders").await.unwrap().unwrap();
    let broker = assigned_broker(&first.value).unwrap();

    engine.on_topic_added("orders").await;
    assert!(matches!(
        engine.assign("orders").await.unwrap(),
        AssignOutcome::AlreadyAssigned(ref b) if *b == broker
    ));
    let second = resources.topic.topic_node("orders").await.unwrap().unwrap();
    assert_eq!(first, second);

    let listing: Vec<_> = resources
        .broker
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.topics.contains("orders"))
        .collect();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].broker, broker);
}

/// Purpose: topics seen before any routing broker exists are not lost
/// Expected: pending until a broker registers, then assigned to it
#[tokio::test]
async fn pending_topics_are_assigned_when_a_broker_joins() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    resources.topic.ensure_topic("orders").await.unwrap();

    let mut engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    engine.on_topic_added("orders").await;
    assert_eq!(engine.pending().collect::<Vec<_>>(), vec!["orders"]);
    assert_eq!(resources.topic.assignment("orders").await.unwrap(), None);

    register(&resources, "rb1", &[]).await;
    engine.on_broker_added("rb1").await;
    assert_eq!(engine.pending().count(), 0);
    assert_eq!(
        resources.topic.assignment("orders").await.unwrap(),
        Some("rb1".to_string())
    );
}

/// **Test:** Recovery after a leader crash
///
/// **Reason:** the previous leader appended the topic to a registration but died
/// before writing the topic node.
///
/// **Expectation:** the listing broker is chosen even though another broker is emptier.
#[tokio::test]
async fn broker_already_listing_the_topic_wins() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    register(&resources, "rb1", &["orders"]).await;
    register(&resources, "rb2", &[]).await;
    resources.topic.ensure_topic("orders").await.unwrap();

    let engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    assert_eq!(
        engine.assign("orders").await.unwrap(),
        AssignOutcome::Assigned("rb1".into())
    );
    let rb1 = resources.broker.registration("rb1").await.unwrap().unwrap();
    assert_eq!(rb1.topics.len(), 1);
}

/// **Test:** Orphaned topics
///
/// **Expectation:** by default a topic stays bound to a departed broker; with
/// reassignment on it moves to a surviving one.
#[tokio::test]
async fn orphaned_topics_move_only_when_enabled() {
    let store = memory_store().await;
    let rb1_session = store.connect("rb1");
    let rb1_resources = resources_for(&rb1_session);
    let resources = resources_for(&store);
    register(&rb1_resources, "rb1", &[]).await;
    resources.topic.ensure_topic("orders").await.unwrap();

    let mut engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    engine.on_topic_added("orders").await;
    assert_eq!(
        resources.topic.assignment("orders").await.unwrap(),
        Some("rb1".to_string())
    );

    register(&resources, "rb2", &[]).await;
    rb1_session.close().await.unwrap();
    assert!(resources.broker.registration("rb1").await.unwrap().is_none());

    engine.on_broker_removed("rb1").await;
    assert_eq!(
        resources.topic.assignment("orders").await.unwrap(),
        Some("rb1".to_string())
    );

    let mut engine = AssignmentEngine::new(resources.clone(), fast_retry(), true);
    engine.on_broker_removed("rb1").await;
    assert_eq!(
        resources.topic.assignment("orders").await.unwrap(),
        Some("rb2".to_string())
    );
    let rb2 = resources.broker.registration("rb2").await.unwrap().unwrap();
    assert!(rb2.topics.contains("orders"));
}

/// Expected: a stale expected version is reported as a conflict, not applied
#[tokio::test]
async fn conflicting_registration_write_is_rejected() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    register(&resources, "rb1", &[]).await;
    let current = resources.broker.registration("rb1").await.unwrap().unwrap();

    let mut topics = current.topics.clone();
    topics.insert("orders");
    resources
        .broker
        .update_topics("rb1", &topics, current.version)
        .await
        .unwrap();
    let err = resources
        .broker
        .update_topics("rb1", &topics, current.version)
        .await
        .unwrap_err();
    assert!(is_conflict(&err));
    assert!(store.get("/routingBrokers/rb1").await.unwrap().is_some());
}

/// **Test:** Assignment of a topic whose name contains `/`
///
/// **Reason:** the leader learns topics from the children of `/topics`; a name such
/// as `rt/chatter` must come back whole rather than as a phantom `rt` topic.
///
/// **Expectation:** the replayed topic is `rt/chatter`, it is assigned, and the
/// registration lists exactly that name.
#[tokio::test]
async fn slashed_topic_is_assigned_under_its_full_name() {
    let store = memory_store().await;
    let resources = resources_for(&store);
    register(&resources, "rb1", &[]).await;
    resources.topic.ensure_topic("rt/chatter").await.unwrap();

    let mut engine = AssignmentEngine::new(resources.clone(), fast_retry(), false);
    for topic in resources.topic.all_topics().await.unwrap() {
        engine.on_topic_added(&topic).await;
    }

    assert_eq!(
        resources.topic.assignment("rt/chatter").await.unwrap(),
        Some("rb1".to_string())
    );
    let rb1 = resources.broker.registration("rb1").await.unwrap().unwrap();
    assert_eq!(rb1.topics.iter().collect::<Vec<_>>(), vec!["rt/chatter"]);
    assert!(store.get("/topics/rt").await.unwrap().is_none());
}
