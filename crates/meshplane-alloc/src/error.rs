//! Allocator error types.

use ipnet::Ipv4Net;
use meshplane_state::{PoolKind, StateError};
use thiserror::Error;

/// Errors surfaced by the allocator.
///
/// Claim conflicts never appear here; they are retried inside the loop.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("address space exhausted: no {pool} left in {cidr}")]
    AddressSpaceExhausted { pool: PoolKind, cidr: Ipv4Net },

    #[error("allocation gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("global vpn not found: {0}")]
    VpnNotFound(String),

    #[error("invalid address layout: {0}")]
    InvalidLayout(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type AllocResult<T> = Result<T, AllocError>;
