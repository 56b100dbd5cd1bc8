mod args_parse;
mod coordination_service;
mod data_plane;
mod discovery_feed;
mod resources;
mod retry;
mod service_configuration;
mod utils;

#[cfg(test)]
mod coordination_test;
#[cfg(test)]
mod test_support;

use std::{fs::read_to_string, path::Path, sync::Arc};

use crate::{
    args_parse::{Args, BrokerKind},
    coordination_service::{EdgeBroker, RoutingBroker},
    data_plane::{LogSink, QueuedController},
    discovery_feed::{pump_feed, JsonLinesFeed},
    resources::Resources,
    retry::RetryPolicy,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use meridian_core::data_plane::DataPlaneController;
use meridian_core::model::Role;
use meridian_metadata_store::{CoordinationStorage, CoordinationStore, EtcdStore};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .with_context(|| format!("Failed to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `host` is provided via command-line args, override the value from the config file
    if let Some(host) = args.host {
        service_config.broker_host = host;
    }

    // If `meta_store_addr` is provided via command-line args, override the value from the config file
    if let Some(meta_store_addr) = args.meta_store_addr {
        service_config.meta_store_addr = meta_store_addr;
    }

    // initialize the coordination store; the session lives as long as this process
    info!(
        cluster = %service_config.cluster_name,
        addr = %service_config.meta_store_addr,
        "Initializing ETCD as coordination store"
    );
    let store = CoordinationStorage::Etcd(
        EtcdStore::new(
            service_config.meta_store_addr.clone(),
            service_config.policy.session_ttl(),
        )
        .await?,
    );
    let resources = Resources::new(store.clone());

    // data plane commands are logged until an admin endpoint is wired in
    let (controller, _command_worker) = QueuedController::start(
        Arc::new(LogSink),
        RetryPolicy::from(&service_config.policy.retry),
    );
    let controller: Arc<dyn DataPlaneController> = Arc::new(controller);

    let session_lost;
    match args.kind {
        BrokerKind::Edge => {
            let edge = EdgeBroker::start(&service_config, resources, controller);
            // discovery events arrive as JSON lines on stdin
            let feed = JsonLinesFeed::new(BufReader::new(tokio::io::stdin()));
            let pump = tokio::spawn(pump_feed(
                feed,
                edge.tracker(Role::Publisher).clone(),
                edge.tracker(Role::Subscriber).clone(),
            ));
            info!(
                cluster = %service_config.cluster_name,
                region = %service_config.broker_host,
                "Meridian edge broker has started successfully"
            );

            session_lost = wait_for_shutdown(&store).await?;
            info!("shutting down edge broker");
            pump.abort();
            edge.shutdown().await;
        }
        BrokerKind::Routing => {
            let routing = RoutingBroker::start(&service_config, resources, controller).await?;
            info!(
                cluster = %service_config.cluster_name,
                broker = %service_config.broker_host,
                "Meridian routing broker has started successfully"
            );

            session_lost = wait_for_shutdown(&store).await?;
            info!(election = ?routing.election_state().await, "shutting down routing broker");
            routing.shutdown().await;
        }
    }

    if session_lost {
        // records and registrations of this process are gone; let the supervisor restart it
        return Err(anyhow!("coordination session lost"));
    }

    // closing the session removes this broker's ephemeral nodes right away
    store.close().await?;
    info!("coordination session closed");

    Ok(())
}

/// Wait for Ctrl-C or for the coordination session to be lost.
/// Returns true in the latter case.
async fn wait_for_shutdown(store: &CoordinationStorage) -> Result<bool> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            Ok(false)
        }
        _ = store.session().expired() => {
            error!("coordination session expired, shutting down");
            Ok(true)
        }
    }
}
