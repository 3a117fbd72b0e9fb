//! Device `.conf` export in standard `wg-quick` syntax.

use std::fmt::Display;
use std::net::Ipv4Addr;

use meshplane_state::Peer;

/// The `[Interface]` section of a device configuration.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub address: Ipv4Addr,
    pub private_key: String,
    /// Name server for mesh DNS; the cluster-local device's IP.
    pub dns: Option<Ipv4Addr>,
}

/// Render a complete configuration document.
///
/// Peers with an endpoint are written first, then those without; each group
/// keeps the order of `peers`. Sections are separated by one blank line and
/// the document ends with a single newline.
pub fn render_wg_config(interface: &InterfaceConfig, peers: &[Peer]) -> String {
    let mut out = String::from("[Interface]\n");
    push_line(&mut out, "Address", format_args!("{}/32", interface.address));
    push_line(&mut out, "PrivateKey", &interface.private_key);
    if let Some(dns) = interface.dns {
        push_line(&mut out, "DNS", dns);
    }

    let (public, private): (Vec<&Peer>, Vec<&Peer>) =
        peers.iter().partition(|p| p.endpoint.is_some());
    for peer in public.into_iter().chain(private) {
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|net| net.to_string()).collect();
        out.push_str("\n[Peer]\n");
        push_line(&mut out, "PublicKey", &peer.public_key);
        push_line(&mut out, "AllowedIPs", allowed.join(", "));
        if let Some(endpoint) = &peer.endpoint {
            push_line(&mut out, "Endpoint", endpoint);
        }
    }
    out
}

fn push_line(out: &mut String, key: &str, value: impl Display) {
    out.push_str(&format!("{key} = {value}\n"));
}
