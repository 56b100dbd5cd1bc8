use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Meridian cluster name
    pub(crate) cluster_name: String,
    /// Broker identity configuration
    pub(crate) broker: BrokerConfig,
    /// Metadata store configuration
    pub(crate) meta_store: MetaStoreConfig,
    /// Edge broker settings (ports and infrastructure marker)
    #[serde(default)]
    pub(crate) edge: Option<EdgeConfig>,
    /// Routing broker settings (WAN ports)
    #[serde(default)]
    pub(crate) routing: Option<RoutingConfig>,
    /// Coordination policies shared by both broker kinds
    #[serde(default)]
    pub(crate) coordination: Option<CoordinationPolicy>,
}

/// configuration settings for a Meridian broker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServiceConfiguration {
    /// Meridian cluster name
    pub(crate) cluster_name: String,
    /// Address this broker is known by in the coordination tree and on the WAN
    pub(crate) broker_host: String,
    /// Metadata store (etcd) address
    pub(crate) meta_store_addr: String,
    pub(crate) edge: EdgeSettings,
    pub(crate) routing: RoutingSettings,
    pub(crate) policy: CoordinationPolicy,
}

/// Broker identity configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BrokerConfig {
    /// Hostname or IP address advertised by this broker
    pub(crate) host: String,
}

/// Metadata store configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MetaStoreConfig {
    /// Hostname or IP address of metadata store (etcd)
    pub(crate) host: String,
    /// Port for metadata store
    pub(crate) port: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EdgeConfig {
    pub(crate) ports: Option<EdgePorts>,
    /// Origin tag carried by endpoints the data plane creates itself
    pub(crate) infrastructure_marker: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EdgePorts {
    pub(crate) publisher: u16,
    pub(crate) subscriber: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RoutingConfig {
    pub(crate) ports: Option<RoutingPorts>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RoutingPorts {
    /// Port receiving traffic from publishing regions
    pub(crate) inbound: u16,
    /// Port sending traffic to subscribing regions
    pub(crate) outbound: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EdgeSettings {
    pub(crate) publisher_port: u16,
    pub(crate) subscriber_port: u16,
    pub(crate) infrastructure_marker: String,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        EdgeSettings {
            publisher_port: 8502,
            subscriber_port: 8503,
            infrastructure_marker: "k".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RoutingSettings {
    pub(crate) inbound_port: u16,
    pub(crate) outbound_port: u16,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        RoutingSettings {
            inbound_port: 8500,
            outbound_port: 8501,
        }
    }
}

/// What to do with a peer link once no topic needs it anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum PeerTeardown {
    /// Ask the data plane to drop the peer.
    #[default]
    Remove,
    /// Keep the peer connected for later reuse.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CoordinationPolicy {
    /// Session (lease) timeout of the coordination store, in seconds
    pub(crate) session_ttl_secs: u64,
    /// Skip the cross-region session when publishers and subscribers are the same single region
    pub(crate) region_aware_sessions: bool,
    pub(crate) peer_teardown: PeerTeardown,
    /// Move topics off routing brokers whose registration disappeared
    pub(crate) reassign_orphaned_topics: bool,
    pub(crate) retry: RetrySettings,
}

impl Default for CoordinationPolicy {
    fn default() -> Self {
        CoordinationPolicy {
            session_ttl_secs: 10,
            region_aware_sessions: true,
            peer_teardown: PeerTeardown::Remove,
            reassign_orphaned_topics: false,
            retry: RetrySettings::default(),
        }
    }
}

impl CoordinationPolicy {
    pub(crate) fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct RetrySettings {
    pub(crate) max_retries: usize,
    pub(crate) base_backoff_ms: u64,
    pub(crate) max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        if config.broker.host.trim().is_empty() || config.broker.host.contains('/') {
            return Err(anyhow!(
                "broker.host must be a non-empty address without '/': {:?}",
                config.broker.host
            ));
        }

        let meta_store_addr = format!("{}:{}", config.meta_store.host, config.meta_store.port);

        let mut edge = EdgeSettings::default();
        if let Some(edge_config) = config.edge {
            if let Some(ports) = edge_config.ports {
                edge.publisher_port = ports.publisher;
                edge.subscriber_port = ports.subscriber;
            }
            if let Some(marker) = edge_config.infrastructure_marker {
                edge.infrastructure_marker = marker;
            }
        }

        let mut routing = RoutingSettings::default();
        if let Some(ports) = config.routing.and_then(|r| r.ports) {
            routing.inbound_port = ports.inbound;
            routing.outbound_port = ports.outbound;
        }

        let policy = config.coordination.unwrap_or_default();
        if policy.session_ttl_secs == 0 {
            return Err(anyhow!("coordination.session_ttl_secs must be positive"));
        }

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            broker_host: config.broker.host,
            meta_store_addr,
            edge,
            routing,
            policy,
        })
    }
}
