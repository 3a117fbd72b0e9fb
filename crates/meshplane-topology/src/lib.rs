//! meshplane-topology: who peers with whom in a Global VPN.
//!
//! Given a snapshot of one Global VPN (its connections and devices), the
//! builder computes the exact WireGuard peer list every member must hold.
//! Public members (with a reachable endpoint) peer directly; everything
//! else is routed through the system gateway device, whose `AllowedIPs`
//! is widened to cover the routed members.
//!
//! Peer lists are compared by content hash so unchanged memberships never
//! cause a re-dispatch.

pub mod builder;
pub mod error;
pub mod hash;
pub mod keys;
pub mod wgconf;

pub use builder::{MeshView, PeerChange, PeerTarget, plan};
pub use error::{TopologyError, TopologyResult};
pub use hash::peers_hash;
pub use keys::{KeyPair, generate_key_pair, public_key_for, validate_public_key};
pub use wgconf::{InterfaceConfig, render_wg_config};
