//! Core plumbing for the gpiowatch agents.
//!
//! - [`bus`]: broker abstraction (mailbox + stream delivery) and an in-process broker
//! - [`asset`]: asset notification protocol spoken by the asset-management service
//! - [`config`]: well-known addresses, defaults and the TOML configuration loader

pub mod asset;
pub mod bus;
pub mod config;

pub use asset::{AssetMessage, AssetOperation};
pub use bus::{BusClient, BusError, BusMessage, Delivery, MemoryBroker, MemoryBusClient};
pub use config::{AgentConfig, ConfigError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
