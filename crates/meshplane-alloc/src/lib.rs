//! meshplane-alloc: conflict-safe address allocation for Global VPNs.
//!
//! Produces exactly one device IP or cluster CIDR per call without any
//! lock: the claim uniqueness index of the state store is the only
//! synchronization primitive.
//!
//! # Algorithm
//!
//! ```text
//! loop (bounded by RetryPolicy::max_attempts)
//!   ├── owner already holds a claim → return it
//!   ├── free unit not in the exclusion set?
//!   │     ├── claim ok       → return it
//!   │     └── claim conflict → exclude, jittered sleep, retry
//!   └── none → mint the next unit from the VPN counter
//!         ├── outside the pool → AddressSpaceExhausted
//!         └── insert as free, advance counter, retry
//! ```
//!
//! Released units go back to the free pool and are handed out again
//! before the range is extended.

pub mod allocator;
pub mod cidr;
pub mod error;
pub mod pool;

pub use allocator::{Allocator, RetryPolicy};
pub use error::{AllocError, AllocResult};
pub use pool::{AddressPool, StorePool};
