//! Message shapes of the agent callback surface.

use meshplane_state::WgParams;
use meshplane_sync::AgentUpdate;

/// A cluster agent's report on its Global VPN connection.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    pub vpn: String,
    pub update: AgentUpdate,
    /// WireGuard parameters once the agent has generated its key.
    pub wg: Option<WgParams>,
}

/// What a delete confirmation from an agent led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record was pending deletion and is now gone with its allocations.
    Removed,
    /// The record was not pending deletion; the apply was re-dispatched.
    Resynced,
    /// Nothing stored under that name.
    Missing,
}
