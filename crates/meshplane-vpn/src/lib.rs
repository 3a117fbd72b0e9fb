//! meshplane-vpn: the Global VPN domain service.
//!
//! Ties the allocator, the topology builder and the sync protocol together
//! behind [`VpnService`]:
//!
//! - Global VPN lifecycle (with the gateway and cluster-local system devices)
//! - cluster connections and user devices
//! - agent callbacks that drive the record-version state machine
//! - WireGuard `.conf` export for devices

mod callbacks;
mod connection;
mod device;
pub mod error;
mod names;
mod service;
mod vpn;

pub use callbacks::{ConnectionUpdate, DeleteOutcome};
pub use connection::{AttachParams, ConnectionPatch};
pub use device::DevicePatch;
pub use error::{VpnError, VpnResult};
pub use service::{TopologyReport, VpnService};
pub use vpn::CreateVpnParams;
