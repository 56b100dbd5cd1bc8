mod broker;
mod topic;

pub(crate) use broker::{BrokerResources, Registration};
pub(crate) use topic::{assigned_broker, TopicResources};

use meridian_metadata_store::CoordinationStorage;

// Coordination tree layout
//
// /topics/<topic>                      -> assigned routing broker address, null until assigned
// /topics/<topic>/pub/<region-addr>    -> RegionInterestRecord of a publishing region
// /topics/<topic>/sub/<region-addr>    -> RegionInterestRecord of a subscribing region
// /routingBrokers/<broker-addr>        -> topics assigned to the broker, ephemeral
// /leader                              -> leader election root
pub(crate) const BASE_TOPICS_PATH: &str = "/topics";
pub(crate) const BASE_ROUTING_BROKERS_PATH: &str = "/routingBrokers";
pub(crate) const LEADER_ELECTION_PATH: &str = "/leader";

#[derive(Debug, Clone)]
pub(crate) struct Resources {
    pub(crate) topic: TopicResources,
    pub(crate) broker: BrokerResources,
    store: CoordinationStorage,
}

impl Resources {
    pub(crate) fn new(store: CoordinationStorage) -> Self {
        Resources {
            topic: TopicResources::new(store.clone()),
            broker: BrokerResources::new(store.clone()),
            store,
        }
    }

    pub(crate) fn store(&self) -> &CoordinationStorage {
        &self.store
    }
}
