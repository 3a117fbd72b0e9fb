//! Peer topology builder.
//!
//! Rules, applied to every member that is not marked for deletion:
//!
//! - The gateway device peers with every other member directly.
//! - Two non-gateway members peer directly when at least one of them is
//!   public and neither is a private cluster connection.
//! - Everything a member cannot reach directly is routed through the
//!   gateway: the gateway peer's `AllowedIPs` is its own `/32` plus the
//!   routes of all routed members. A connection always routes its own
//!   cluster CIDR through the gateway as well.
//! - Members without a reported public key are left out entirely.
//!
//! A connection is public when its visibility is public and it has a
//! reachable endpoint (host plus the agent's reported node port); a public
//! connection still waiting for either is routed like a private device.
//! A device is public when it has a public endpoint.

use ipnet::Ipv4Net;
use tracing::debug;

use meshplane_state::{GlobalVpn, GlobalVpnConnection, GlobalVpnDevice, Peer, Visibility};

use crate::hash::{peer_order, peers_hash};

/// Snapshot of one Global VPN's membership.
#[derive(Debug, Clone, Copy)]
pub struct MeshView<'a> {
    pub vpn: &'a GlobalVpn,
    pub connections: &'a [GlobalVpnConnection],
    pub devices: &'a [GlobalVpnDevice],
}

/// The member a computed peer list belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerTarget {
    Connection(String),
    Device(String),
}

impl std::fmt::Display for PeerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerTarget::Connection(name) => write!(f, "connection/{name}"),
            PeerTarget::Device(name) => write!(f, "device/{name}"),
        }
    }
}

/// A peer list that differs from what the member currently stores.
#[derive(Debug, Clone)]
pub struct PeerChange {
    pub target: PeerTarget,
    pub peers: Vec<Peer>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy)]
enum Member<'a> {
    Connection(&'a GlobalVpnConnection),
    Device(&'a GlobalVpnDevice),
}

impl<'a> Member<'a> {
    fn target(&self) -> PeerTarget {
        match self {
            Member::Connection(c) => PeerTarget::Connection(c.cluster_name.clone()),
            Member::Device(d) => PeerTarget::Device(d.name.clone()),
        }
    }

    fn is(&self, other: &Member<'_>) -> bool {
        self.target() == other.target()
    }

    fn is_public(&self) -> bool {
        match self {
            Member::Connection(c) => c.visibility == Visibility::Public && c.endpoint().is_some(),
            Member::Device(d) => d.public_endpoint.is_some(),
        }
    }

    fn is_private_connection(&self) -> bool {
        matches!(self, Member::Connection(c) if c.visibility == Visibility::Private)
    }

    fn marked_for_deletion(&self) -> bool {
        match self {
            Member::Connection(c) => c.marked_for_deletion,
            Member::Device(d) => d.marked_for_deletion,
        }
    }

    fn stored_peers(&self) -> &'a [Peer] {
        match self {
            Member::Connection(c) => &c.peers,
            Member::Device(d) => &d.peers,
        }
    }

    fn routes(&self) -> Vec<Ipv4Net> {
        match self {
            Member::Connection(c) => vec![c.cluster_cidr],
            Member::Device(d) => vec![Ipv4Net::from(d.ip)],
        }
    }

    fn as_peer(&self, vpn: &GlobalVpn) -> Option<Peer> {
        match self {
            Member::Connection(c) => Some(Peer {
                ip: Some(c.gateway_ip),
                public_key: c.public_key()?.to_string(),
                endpoint: match c.visibility {
                    Visibility::Public => c.endpoint(),
                    Visibility::Private => None,
                },
                dns_suffix: Some(format!("{}.{}", c.cluster_name, vpn.dns_suffix)),
                allowed_ips: self.routes(),
            }),
            Member::Device(d) => Some(Peer {
                ip: Some(d.ip),
                public_key: d.public_key()?.to_string(),
                endpoint: d.public_endpoint.clone(),
                dns_suffix: None,
                allowed_ips: self.routes(),
            }),
        }
    }
}

fn direct(a: &Member<'_>, b: &Member<'_>) -> bool {
    !a.is_private_connection() && !b.is_private_connection() && (a.is_public() || b.is_public())
}

impl<'a> MeshView<'a> {
    fn members(&self) -> impl Iterator<Item = Member<'a>> + '_ {
        self.connections
            .iter()
            .map(Member::Connection)
            .chain(self.devices.iter().map(Member::Device))
            .filter(|m| !m.marked_for_deletion())
    }

    fn gateway(&self) -> Option<&'a GlobalVpnDevice> {
        self.devices
            .iter()
            .find(|d| d.name == self.vpn.gateway_device && !d.marked_for_deletion)
    }

    fn is_gateway(&self, member: &Member<'_>) -> bool {
        matches!(member, Member::Device(d) if d.name == self.vpn.gateway_device)
    }

    fn peers_of(&self, me: Member<'_>) -> Vec<Peer> {
        let mut peers: Vec<Peer> = Vec::new();

        if self.is_gateway(&me) {
            peers.extend(
                self.members()
                    .filter(|m| !m.is(&me))
                    .filter_map(|m| m.as_peer(self.vpn)),
            );
        } else {
            let mut routed: Vec<Ipv4Net> = Vec::new();
            for other in self.members().filter(|m| !self.is_gateway(m)) {
                if other.is(&me) {
                    if matches!(me, Member::Connection(_)) {
                        routed.extend(other.routes());
                    }
                    continue;
                }
                let Some(peer) = other.as_peer(self.vpn) else {
                    continue;
                };
                if direct(&me, &other) {
                    peers.push(peer);
                } else {
                    routed.extend(peer.allowed_ips);
                }
            }

            if let Some(gateway) = self.gateway().map(Member::Device) {
                if let Some(mut peer) = gateway.as_peer(self.vpn) {
                    peer.allowed_ips.extend(routed);
                    peer.allowed_ips.sort();
                    peer.allowed_ips.dedup();
                    peers.push(peer);
                }
            }
        }

        peers.sort_by(peer_order);
        peers
    }

    /// Peers a cluster connection must hold.
    pub fn connection_peers(&self, conn: &GlobalVpnConnection) -> Vec<Peer> {
        self.peers_of(Member::Connection(conn))
    }

    /// Peers a device must hold.
    pub fn device_peers(&self, device: &GlobalVpnDevice) -> Vec<Peer> {
        self.peers_of(Member::Device(device))
    }
}

/// Compute every member's peers and keep only the lists whose hash differs
/// from the stored one.
pub fn plan(view: &MeshView<'_>) -> Vec<PeerChange> {
    let mut changes = Vec::new();
    for member in view.members() {
        let peers = view.peers_of(member);
        let hash = peers_hash(&peers);
        if hash == peers_hash(member.stored_peers()) {
            continue;
        }
        debug!(
            vpn = %view.vpn.name,
            target = %member.target(),
            peers = peers.len(),
            %hash,
            "peer list changed"
        );
        changes.push(PeerChange {
            target: member.target(),
            peers,
            hash,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_state::{CreationMethod, ObjectMeta, ResourceStatus, SyncStatus, WgParams};

    fn vpn() -> GlobalVpn {
        GlobalVpn {
            account: "acc".to_string(),
            name: "mesh".to_string(),
            cidr: "10.0.0.0/8".parse().unwrap(),
            allocatable_cidr_suffix: 24,
            num_allocated_cluster_cidrs: 0,
            num_allocated_devices: 0,
            num_reserved_ips_for_non_cluster_use: 65536,
            gateway_device: "gateway".to_string(),
            cluster_local_device: "cluster-local".to_string(),
            dns_suffix: "mesh.internal".to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn conn(name: &str, cidr: &str, gw_ip: &str, visibility: Visibility) -> GlobalVpnConnection {
        GlobalVpnConnection {
            account: "acc".to_string(),
            vpn_name: "mesh".to_string(),
            cluster_name: name.to_string(),
            metadata: ObjectMeta::named(name),
            cluster_cidr: cidr.parse().unwrap(),
            gateway_ip: gw_ip.parse().unwrap(),
            public_endpoint: Some(format!("{name}.example.com")),
            visibility,
            wg: Some(WgParams {
                public_key: format!("key-{name}"),
                node_port: Some(31820),
            }),
            peers: Vec::new(),
            sync_status: SyncStatus::default(),
            status: ResourceStatus::default(),
            marked_for_deletion: false,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn device(name: &str, ip: &str, endpoint: Option<&str>) -> GlobalVpnDevice {
        GlobalVpnDevice {
            account: "acc".to_string(),
            vpn_name: "mesh".to_string(),
            name: name.to_string(),
            metadata: ObjectMeta::named(name),
            ip: ip.parse().unwrap(),
            private_key: Some(format!("priv-{name}")),
            public_key: Some(format!("key-{name}")),
            public_endpoint: endpoint.map(str::to_string),
            creation_method: CreationMethod::User,
            peers: Vec::new(),
            sync_status: SyncStatus::default(),
            status: ResourceStatus::default(),
            marked_for_deletion: false,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn keys(peers: &[Peer]) -> Vec<&str> {
        peers.iter().map(|p| p.public_key.as_str()).collect()
    }

    fn gateway() -> GlobalVpnDevice {
        let mut gw = device("gateway", "10.0.0.1", Some("gw.example.com:31820"));
        gw.creation_method = CreationMethod::System;
        gw
    }

    #[test]
    fn private_cluster_routes_everything_through_gateway() {
        let vpn = vpn();
        let conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Private),
        ];
        let devices = vec![gateway()];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        let a_peers = view.connection_peers(&conns[0]);
        assert!(!keys(&a_peers).contains(&"key-b"));

        let b_peers = view.connection_peers(&conns[1]);
        assert_eq!(keys(&b_peers), vec!["key-gateway"]);
        let allowed = &b_peers[0].allowed_ips;
        assert!(allowed.contains(&net("10.2.0.0/24")));
        assert!(allowed.contains(&net("10.1.0.0/24")));
        assert!(allowed.contains(&net("10.0.0.1/32")));
        assert_eq!(b_peers[0].endpoint.as_deref(), Some("gw.example.com:31820"));
    }

    #[test]
    fn public_clusters_form_a_full_mesh() {
        let vpn = vpn();
        let conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Public),
            conn("c", "10.3.0.0/24", "10.0.0.12", Visibility::Public),
        ];
        let devices = vec![gateway()];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        let peers = view.connection_peers(&conns[0]);
        assert_eq!(keys(&peers), vec!["key-gateway", "key-b", "key-c"]);

        let b = &peers[1];
        assert_eq!(b.allowed_ips, vec![net("10.2.0.0/24")]);
        assert_eq!(b.endpoint.as_deref(), Some("b.example.com:31820"));
        assert_eq!(b.dns_suffix.as_deref(), Some("b.mesh.internal"));
    }

    #[test]
    fn public_clusters_without_endpoint_meet_through_gateway() {
        let vpn = vpn();
        let mut no_host = conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Public);
        no_host.public_endpoint = None;
        let mut no_port = conn("c", "10.3.0.0/24", "10.0.0.12", Visibility::Public);
        no_port.wg = Some(WgParams {
            public_key: "key-c".to_string(),
            node_port: None,
        });
        let conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            no_host,
            no_port,
        ];
        let devices = vec![gateway()];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        // `a` is reachable, so both still peer with it directly.
        let b_peers = view.connection_peers(&conns[1]);
        assert_eq!(keys(&b_peers), vec!["key-gateway", "key-a"]);
        assert!(b_peers[0].allowed_ips.contains(&net("10.3.0.0/24")));

        let c_peers = view.connection_peers(&conns[2]);
        assert_eq!(keys(&c_peers), vec!["key-gateway", "key-a"]);
        assert!(c_peers[0].allowed_ips.contains(&net("10.2.0.0/24")));

        let a_peers = view.connection_peers(&conns[0]);
        assert_eq!(keys(&a_peers), vec!["key-gateway", "key-b", "key-c"]);
        assert!(a_peers.iter().skip(1).all(|p| p.endpoint.is_none()));
    }

    #[test]
    fn gateway_peers_with_every_member() {
        let vpn = vpn();
        let conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Private),
        ];
        let devices = vec![gateway(), device("laptop", "10.0.0.5", None)];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        let peers = view.device_peers(&devices[0]);
        assert_eq!(keys(&peers), vec!["key-laptop", "key-a", "key-b"]);
        let b = peers.iter().find(|p| p.public_key == "key-b").unwrap();
        assert!(b.endpoint.is_none());
    }

    #[test]
    fn private_devices_reach_each_other_through_gateway() {
        let vpn = vpn();
        let conns = vec![conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public)];
        let devices = vec![
            gateway(),
            device("laptop", "10.0.0.5", None),
            device("phone", "10.0.0.6", None),
            device("server", "10.0.0.7", Some("server.example.com:51820")),
        ];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        let laptop = view.device_peers(&devices[1]);
        assert_eq!(keys(&laptop), vec!["key-gateway", "key-server", "key-a"]);
        let via_gateway = &laptop[0].allowed_ips;
        assert!(via_gateway.contains(&net("10.0.0.6/32")));
        assert!(!via_gateway.contains(&net("10.0.0.5/32")));
        assert!(!via_gateway.contains(&net("10.0.0.7/32")));

        let server = view.device_peers(&devices[3]);
        assert_eq!(
            keys(&server),
            vec!["key-gateway", "key-laptop", "key-phone", "key-a"]
        );
    }

    #[test]
    fn members_without_keys_or_marked_for_deletion_are_skipped() {
        let vpn = vpn();
        let mut pending = conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Public);
        pending.wg = Some(WgParams {
            public_key: String::new(),
            node_port: None,
        });
        let mut leaving = conn("c", "10.3.0.0/24", "10.0.0.12", Visibility::Public);
        leaving.marked_for_deletion = true;
        let conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            pending,
            leaving,
        ];
        let devices = vec![gateway()];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        };

        let peers = view.connection_peers(&conns[0]);
        assert_eq!(keys(&peers), vec!["key-gateway"]);
        assert!(!peers[0].allowed_ips.contains(&net("10.3.0.0/24")));
    }

    #[test]
    fn missing_gateway_leaves_private_cluster_without_peers() {
        let vpn = vpn();
        let conns = vec![conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Private)];
        let view = MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &[],
        };
        assert!(view.connection_peers(&conns[0]).is_empty());
    }

    #[test]
    fn plan_skips_unchanged_members() {
        let vpn = vpn();
        let mut conns = vec![
            conn("a", "10.1.0.0/24", "10.0.0.10", Visibility::Public),
            conn("b", "10.2.0.0/24", "10.0.0.11", Visibility::Private),
        ];
        let mut devices = vec![gateway()];

        let first = plan(&MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        });
        assert_eq!(first.len(), 3);

        for change in first {
            match change.target {
                PeerTarget::Connection(name) => {
                    let c = conns.iter_mut().find(|c| c.cluster_name == name).unwrap();
                    c.peers = change.peers;
                }
                PeerTarget::Device(name) => {
                    let d = devices.iter_mut().find(|d| d.name == name).unwrap();
                    d.peers = change.peers;
                }
            }
        }

        let second = plan(&MeshView {
            vpn: &vpn,
            connections: &conns,
            devices: &devices,
        });
        assert!(second.is_empty());
    }

    #[test]
    fn target_display() {
        assert_eq!(PeerTarget::Connection("a".into()).to_string(), "connection/a");
        assert_eq!(PeerTarget::Device("gw".into()).to_string(), "device/gw");
    }
}
