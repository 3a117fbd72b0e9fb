//! meshplaned: operator binary for the meshplane control plane.
//!
//! Drives the Global VPN service against the local state store. Objects are
//! handed to a logging dispatcher; every dispatch is emitted as a
//! structured event.
//!
//! # Usage
//!
//! ```text
//! meshplaned --config /etc/meshplane/meshplane.toml vpn create --account acme --vpn mesh
//! meshplaned cluster attach --account acme --vpn mesh --cluster eu-1 --endpoint eu-1.example.com
//! meshplaned device config --account acme --vpn mesh --name laptop > wg0.conf
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshplaned", about = "meshplane Global VPN control plane")]
struct Cli {
    /// Path to meshplane.toml; defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Account and Global VPN a command operates on.
#[derive(Args, Clone)]
pub(crate) struct VpnRef {
    #[arg(long, default_value = "default")]
    pub account: String,
    #[arg(long)]
    pub vpn: String,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage Global VPNs.
    Vpn {
        #[command(subcommand)]
        action: VpnCommand,
    },
    /// Manage cluster connections.
    Cluster {
        #[command(subcommand)]
        action: ClusterCommand,
    },
    /// Manage devices.
    Device {
        #[command(subcommand)]
        action: DeviceCommand,
    },
    /// Inspect or rebuild peer topology.
    Topology {
        #[command(subcommand)]
        action: TopologyCommand,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum VpnCommand {
    Create {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        cidr: Option<String>,
        /// Prefix length of each cluster CIDR.
        #[arg(long)]
        suffix: Option<u8>,
        /// Addresses at the start of the CIDR kept for devices.
        #[arg(long)]
        reserved: Option<u64>,
        #[arg(long)]
        dns_suffix: Option<String>,
        /// `host:port` of the gateway device.
        #[arg(long)]
        gateway_endpoint: Option<String>,
    },
    Get {
        #[command(flatten)]
        vpn: VpnRef,
    },
    List {
        #[arg(long, default_value = "default")]
        account: String,
    },
    Delete {
        #[command(flatten)]
        vpn: VpnRef,
    },
}

#[derive(Subcommand)]
pub(crate) enum ClusterCommand {
    Attach {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        cluster: String,
        /// Route this cluster through the gateway instead of peering directly.
        #[arg(long)]
        private: bool,
        /// Host under which the cluster's WireGuard port is reachable.
        #[arg(long)]
        endpoint: Option<String>,
    },
    Detach {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        cluster: String,
    },
    List {
        #[command(flatten)]
        vpn: VpnRef,
    },
}

#[derive(Subcommand)]
pub(crate) enum DeviceCommand {
    Create {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        name: String,
        /// `host:port` if the device is publicly reachable.
        #[arg(long)]
        endpoint: Option<String>,
    },
    Delete {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        name: String,
    },
    /// Print the device's WireGuard configuration.
    Config {
        #[command(flatten)]
        vpn: VpnRef,
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum TopologyCommand {
    /// Recompute peers and dispatch the lists that changed.
    Sync {
        #[command(flatten)]
        vpn: VpnRef,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshplane=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = meshplane_core::MeshConfig::load_or_default(cli.config.as_deref())?;
    commands::run(cli.command, config).await
}
