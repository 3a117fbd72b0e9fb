//! Error types for the Global VPN service.

use thiserror::Error;

use meshplane_alloc::AllocError;
use meshplane_state::StateError;
use meshplane_sync::SyncError;
use meshplane_topology::TopologyError;

pub type VpnResult<T> = Result<T, VpnError>;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("global vpn {name} is in use by {connections} connection(s) and {devices} device(s)")]
    InUse {
        name: String,
        connections: usize,
        devices: usize,
    },

    /// System devices live and die with their Global VPN.
    #[error("device {0} is managed by its global vpn")]
    SystemDevice(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Key(#[from] TopologyError),
}

impl VpnError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        VpnError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        VpnError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VpnError::NotFound { .. })
    }
}
