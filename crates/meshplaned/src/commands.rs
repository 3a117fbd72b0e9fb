//! Command handlers.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use meshplane_core::MeshConfig;
use meshplane_state::{StateStore, Visibility};
use meshplane_sync::LogDispatcher;
use meshplane_vpn::{AttachParams, CreateVpnParams, VpnService};

use crate::{ClusterCommand, Command, ConfigCommand, DeviceCommand, TopologyCommand, VpnCommand};

pub(crate) async fn run(command: Command, config: MeshConfig) -> anyhow::Result<()> {
    if let Command::Config {
        action: ConfigCommand::Show,
    } = command
    {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let service = open_service(config)?;
    match command {
        Command::Vpn { action } => vpn(&service, action).await,
        Command::Cluster { action } => cluster(&service, action).await,
        Command::Device { action } => device(&service, action).await,
        Command::Topology {
            action: TopologyCommand::Sync { vpn },
        } => {
            let report = service.sync_topology(&vpn.account, &vpn.vpn).await?;
            info!(
                updated = report.updated.len(),
                failed = report.failed.len(),
                "topology sync finished"
            );
            let targets: Vec<String> = report.updated.iter().map(|t| t.to_string()).collect();
            print_json(&targets)
        }
        Command::Config { .. } => Ok(()),
    }
}

fn open_service(config: MeshConfig) -> anyhow::Result<VpnService> {
    let path = config.store.path.clone();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    let store = StateStore::open(&path)
        .with_context(|| format!("opening state store {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(VpnService::new(store, Arc::new(LogDispatcher), config))
}

async fn vpn(service: &VpnService, action: VpnCommand) -> anyhow::Result<()> {
    match action {
        VpnCommand::Create {
            vpn,
            cidr,
            suffix,
            reserved,
            dns_suffix,
            gateway_endpoint,
        } => {
            let params = CreateVpnParams {
                cidr,
                allocatable_cidr_suffix: suffix,
                reserved_ips_for_non_cluster_use: reserved,
                dns_suffix,
                gateway_endpoint,
            };
            print_json(&service.create_global_vpn(&vpn.account, &vpn.vpn, params).await?)
        }
        VpnCommand::Get { vpn } => print_json(&service.get_global_vpn(&vpn.account, &vpn.vpn)?),
        VpnCommand::List { account } => print_json(&service.list_global_vpns(&account)?),
        VpnCommand::Delete { vpn } => {
            service.delete_global_vpn(&vpn.account, &vpn.vpn).await?;
            info!(account = %vpn.account, vpn = %vpn.vpn, "global vpn deleted");
            Ok(())
        }
    }
}

async fn cluster(service: &VpnService, action: ClusterCommand) -> anyhow::Result<()> {
    match action {
        ClusterCommand::Attach {
            vpn,
            cluster,
            private,
            endpoint,
        } => {
            let params = AttachParams {
                visibility: if private {
                    Visibility::Private
                } else {
                    Visibility::Public
                },
                public_endpoint: endpoint,
            };
            let conn = service
                .attach_cluster(&vpn.account, &vpn.vpn, &cluster, params)
                .await?;
            print_json(&conn)
        }
        ClusterCommand::Detach { vpn, cluster } => {
            print_json(&service.detach_cluster(&vpn.account, &vpn.vpn, &cluster).await?)
        }
        ClusterCommand::List { vpn } => {
            print_json(&service.list_connections(&vpn.account, &vpn.vpn)?)
        }
    }
}

async fn device(service: &VpnService, action: DeviceCommand) -> anyhow::Result<()> {
    match action {
        DeviceCommand::Create {
            vpn,
            name,
            endpoint,
        } => {
            let mut device = service
                .create_device(&vpn.account, &vpn.vpn, &name, endpoint)
                .await?;
            // Shown once through `device config`, never in listings.
            device.private_key = None;
            print_json(&device)
        }
        DeviceCommand::Delete { vpn, name } => {
            let mut device = service.delete_device(&vpn.account, &vpn.vpn, &name).await?;
            device.private_key = None;
            print_json(&device)
        }
        DeviceCommand::Config { vpn, name } => {
            print!("{}", service.device_wg_config(&vpn.account, &vpn.vpn, &name)?);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VpnRef;

    fn config_in(dir: &tempfile::TempDir) -> MeshConfig {
        let mut config = MeshConfig::default();
        config.store.path = dir.path().join("state").join("meshplane.redb");
        config.vpn_defaults.cidr = "10.0.0.0/16".to_string();
        config.vpn_defaults.reserved_ips_for_non_cluster_use = 256;
        config
    }

    #[tokio::test]
    async fn commands_share_one_store() {
        let dir = tempfile::tempdir().unwrap();
        let vpn = VpnRef {
            account: "acme".to_string(),
            vpn: "mesh".to_string(),
        };

        run(
            Command::Vpn {
                action: VpnCommand::Create {
                    vpn: vpn.clone(),
                    cidr: None,
                    suffix: None,
                    reserved: None,
                    dns_suffix: None,
                    gateway_endpoint: Some("gw.example.com:31820".to_string()),
                },
            },
            config_in(&dir),
        )
        .await
        .unwrap();

        run(
            Command::Device {
                action: DeviceCommand::Create {
                    vpn: vpn.clone(),
                    name: "laptop".to_string(),
                    endpoint: None,
                },
            },
            config_in(&dir),
        )
        .await
        .unwrap();

        let service = open_service(config_in(&dir)).unwrap();
        let device = service.get_device("acme", "mesh", "laptop").unwrap();
        assert_eq!(device.ip.to_string(), "10.0.0.3");
        let conf = service.device_wg_config("acme", "mesh", "laptop").unwrap();
        assert!(conf.starts_with("[Interface]\nAddress = 10.0.0.3/32\n"));
    }

    #[tokio::test]
    async fn missing_vpn_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(
            Command::Vpn {
                action: VpnCommand::Get {
                    vpn: VpnRef {
                        account: "acme".to_string(),
                        vpn: "nope".to_string(),
                    },
                },
            },
            config_in(&dir),
        )
        .await;
        assert!(result.is_err());
    }
}
