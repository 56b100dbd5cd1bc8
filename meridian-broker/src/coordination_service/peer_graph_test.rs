use super::*;

fn record(topic: &str, region: &str, role: Role) -> RegionInterestRecord {
    let port = match role {
        Role::Publisher => 8502,
        Role::Subscriber => 8503,
    };
    RegionInterestRecord {
        topic_name: topic.to_owned(),
        type_name: "Order".to_owned(),
        origin_tag: String::new(),
        region: region.to_owned(),
        locator: format!("tcpv4_wan://{}:{}", region, port),
    }
}

/// **Test:** Peer refcount convergence
///
/// **Reason:** A peer shared by two topics must survive the departure of one of them.
///
/// **Expectation:** one Connect for T1+T2, nothing when T1 leaves, one Disconnect when T2 leaves.
#[test]
fn peer_is_connected_once_and_removed_with_last_topic() {
    let mut peers = PeerInterestSet::new(PeerTeardown::Remove);
    assert_eq!(peers.add("P", "T1"), PeerChange::Connect);
    assert_eq!(peers.add("P", "T2"), PeerChange::Unchanged);
    assert_eq!(peers.topics_of("P"), 2);

    assert_eq!(peers.remove("P", "T1"), PeerChange::Unchanged);
    assert!(peers.is_connected("P"));
    assert_eq!(peers.remove("P", "T2"), PeerChange::Disconnect);
    assert!(!peers.is_connected("P"));

    // a second removal is a no-op
    assert_eq!(peers.remove("P", "T2"), PeerChange::Unchanged);
}

/// **Test:** Retained peers
///
/// **Expectation:** with the retain policy the peer is never disconnected and
/// is not connected a second time when a new topic needs it.
#[test]
fn retained_peer_is_reused() {
    let mut peers = PeerInterestSet::new(PeerTeardown::Retain);
    assert_eq!(peers.add("P", "T1"), PeerChange::Connect);
    assert_eq!(peers.remove("P", "T1"), PeerChange::Unchanged);
    assert!(peers.is_connected("P"));
    assert_eq!(peers.add("P", "T2"), PeerChange::Unchanged);
}

/// Expected: duplicate adds for the same topic do not inflate the count
#[test]
fn duplicate_topic_for_peer_is_counted_once() {
    let mut peers = PeerInterestSet::new(PeerTeardown::Remove);
    assert_eq!(peers.add("P", "T1"), PeerChange::Connect);
    assert_eq!(peers.add("P", "T1"), PeerChange::Unchanged);
    assert_eq!(peers.remove("P", "T1"), PeerChange::Disconnect);
}

/// **Test:** Session creation guard
///
/// **Reason:** publisher and subscriber regions can be observed in either order,
/// and watch resyncs can replay regions already seen.
///
/// **Expectation:** exactly one Create regardless of order and duplicates.
#[test]
fn cross_region_session_created_once_in_any_order() {
    for publisher_first in [true, false] {
        let mut table = RouteTable::new(true);
        let publisher = record("orders", "A", Role::Publisher);
        let subscriber = record("orders", "B", Role::Subscriber);
        let events = if publisher_first {
            vec![
                (Role::Publisher, &publisher),
                (Role::Publisher, &publisher),
                (Role::Subscriber, &subscriber),
                (Role::Subscriber, &subscriber),
                (Role::Publisher, &publisher),
            ]
        } else {
            vec![
                (Role::Subscriber, &subscriber),
                (Role::Publisher, &publisher),
                (Role::Subscriber, &subscriber),
                (Role::Publisher, &publisher),
            ]
        };

        let creates = events
            .into_iter()
            .map(|(role, record)| table.region_added(role, record).session)
            .filter(|change| matches!(change, SessionChange::Create { .. }))
            .count();
        assert_eq!(creates, 1);
        assert!(table.session_created("orders"));
    }
}

/// Expected: the session goes away with the last publishing region and
/// comes back when a publisher reappears
#[test]
fn session_follows_both_sides() {
    let mut table = RouteTable::new(true);
    table.region_added(Role::Publisher, &record("orders", "A", Role::Publisher));
    table.region_added(Role::Subscriber, &record("orders", "B", Role::Subscriber));

    let update = table.region_removed("orders", Role::Publisher, "A");
    assert_eq!(update.region_locator.as_deref(), Some("tcpv4_wan://A:8502"));
    assert_eq!(
        update.session,
        SessionChange::Delete {
            type_name: "Order".into()
        }
    );
    assert!(!table.session_created("orders"));
    assert_eq!(table.regions("orders", Role::Subscriber), vec!["B".to_string()]);

    let update = table.region_added(Role::Publisher, &record("orders", "C", Role::Publisher));
    assert_eq!(
        update.session,
        SessionChange::Create {
            type_name: "Order".into()
        }
    );
}

/// **Test:** Region-aware sessions
///
/// **Expectation:** a region publishing and subscribing alone gets no WAN
/// session; with region awareness off it does.
#[test]
fn same_single_region_needs_no_session_when_region_aware() {
    let mut aware = RouteTable::new(true);
    aware.region_added(Role::Publisher, &record("orders", "A", Role::Publisher));
    let update = aware.region_added(Role::Subscriber, &record("orders", "A", Role::Subscriber));
    assert_eq!(update.session, SessionChange::Unchanged);

    // a second subscribing region makes the bridge worthwhile
    let update = aware.region_added(Role::Subscriber, &record("orders", "B", Role::Subscriber));
    assert!(matches!(update.session, SessionChange::Create { .. }));

    let mut unaware = RouteTable::new(false);
    unaware.region_added(Role::Publisher, &record("orders", "A", Role::Publisher));
    let update = unaware.region_added(Role::Subscriber, &record("orders", "A", Role::Subscriber));
    assert!(matches!(update.session, SessionChange::Create { .. }));
}

#[test]
fn removing_unknown_region_is_noop() {
    let mut table = RouteTable::new(true);
    let update = table.region_removed("orders", Role::Publisher, "A");
    assert_eq!(update.region_locator, None);
    assert_eq!(update.session, SessionChange::Unchanged);
}
