//! Order-independent content hash of a peer list.

use std::cmp::Ordering;

use meshplane_state::Peer;
use sha2::{Digest, Sha256};

/// Canonical peer order: mesh IP, then public key.
pub fn peer_order(a: &Peer, b: &Peer) -> Ordering {
    a.ip.cmp(&b.ip).then_with(|| a.public_key.cmp(&b.public_key))
}

/// SHA-256 (hex) over the sorted peers and their sorted allowed IPs.
///
/// Two lists holding the same peers hash equal regardless of order.
pub fn peers_hash(peers: &[Peer]) -> String {
    let mut sorted: Vec<&Peer> = peers.iter().collect();
    sorted.sort_by(|a, b| peer_order(a, b));

    let mut hasher = Sha256::new();
    for peer in sorted {
        let ip = peer.ip.map(|ip| ip.to_string()).unwrap_or_default();
        let mut allowed = peer.allowed_ips.clone();
        allowed.sort();
        allowed.dedup();
        let allowed: Vec<String> = allowed.iter().map(|net| net.to_string()).collect();
        let line = format!(
            "{ip}|{}|{}|{}|{}\n",
            peer.public_key,
            peer.endpoint.as_deref().unwrap_or_default(),
            peer.dns_suffix.as_deref().unwrap_or_default(),
            allowed.join(",")
        );
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}
