//! Host for statehub services.
//!
//! [`Host::start`] builds the registry, event bus, change detector,
//! validator, update queue, cache and sync manager from one [`HostConfig`],
//! wires them together and starts their background loops.

mod config;
mod error;
mod host;

pub use config::{HostConfig, StorageConfig};
pub use error::{HostError, HostResult};
pub use host::{load_seed, Host, SeedComponent};
