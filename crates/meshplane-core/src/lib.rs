//! meshplane-core: configuration shared by the meshplane crates.

pub mod config;

pub use config::{AllocatorConfig, MeshConfig, StoreConfig, SyncConfig, VpnDefaults};
