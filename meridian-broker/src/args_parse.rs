use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "meridian-broker")]
#[command(about = "Coordination plane of a Meridian edge or routing broker")]
#[command(version)]
pub(crate) struct Args {
    /// Path to config file
    #[arg(long)]
    pub(crate) config_file: String,

    /// Address this broker advertises (overrides broker.host)
    #[arg(long)]
    pub(crate) host: Option<String>,

    /// Metadata store address as host:port (overrides meta_store)
    #[arg(long)]
    pub(crate) meta_store_addr: Option<String>,

    #[command(subcommand)]
    pub(crate) kind: BrokerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub(crate) enum BrokerKind {
    #[command(about = "Run the edge broker of a region, reading discovery events from stdin")]
    Edge,

    #[command(about = "Run a WAN routing broker and stand for leader election")]
    Routing,
}
