//! meshplane-state: embedded state store for meshplane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for Global VPNs, connections, devices and the free/claim ledgers
//! of the address allocator.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{account}/{vpn}`, `{account}/{vpn}/{name}`) enable
//! prefix scans for everything that belongs to one Global VPN.
//!
//! redb serializes write transactions, so every check-then-insert done
//! inside one write transaction is atomic. Claim uniqueness and counter
//! advancement rely on exactly that.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
