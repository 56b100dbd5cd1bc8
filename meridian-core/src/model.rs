use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a topic a local endpoint (or region) sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    /// Name of the child node under `/topics/<topic>` holding this role's regions.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Role::Publisher => "pub",
            Role::Subscriber => "sub",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Role> {
        match segment {
            "pub" => Some(Role::Publisher),
            "sub" => Some(Role::Subscriber),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Topic names are compared with all whitespace removed.
pub fn normalize_topic_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

/// A region's declared interest in one side of a topic, stored at
/// `/topics/<topic>/<pub|sub>/<region>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInterestRecord {
    pub topic_name: String,
    pub type_name: String,
    pub origin_tag: String,
    /// Address of the edge broker that owns the record.
    pub region: String,
    /// WAN locator routing brokers use to reach the region for this role.
    pub locator: String,
}

/// Topics assigned to one routing broker, stored at `/routingBrokers/<addr>`
/// as a JSON array. Insertion order is kept; entries are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicSet(Vec<String>);

impl TopicSet {
    pub fn new() -> Self {
        TopicSet(Vec::new())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.0.iter().any(|t| t == topic)
    }

    /// Returns false if the topic was already present.
    pub fn insert(&mut self, topic: &str) -> bool {
        if self.contains(topic) {
            return false;
        }
        self.0.push(topic.to_owned());
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl FromIterator<String> for TopicSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = TopicSet::new();
        for topic in iter {
            set.insert(&topic);
        }
        set
    }
}
