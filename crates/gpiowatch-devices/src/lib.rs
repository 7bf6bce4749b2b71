//! GPIO sensor agent.
//!
//! Tracks the GPIO sensors and outputs known to the asset-management service
//! and gives access to the pins behind them.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT bus transport |
//!
//! ## Architecture
//!
//! - **GpioPort**: sysfs pin access, real or simulated
//! - **SensorRegistry**: monitored records, behind a single lock
//! - **classify**: turns asset notifications into registry operations
//! - **AssetSyncClient**: bulk discovery against the asset service
//! - **AgentLoop**: the actor tying them to the bus

pub mod agent;
pub mod classifier;
pub mod gpio;
pub mod registry;
pub mod sync;
pub mod template;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use agent::{AgentHandle, AgentLoop, ControlCommand, ControlError};
pub use classifier::{classify, Classification, IgnoreReason};
pub use gpio::{Direction, GpioError, GpioPort, GpioState, HardwarePort};
pub use registry::{GpoStateCommand, RegistryError, RegistryOutcome, SensorRecord, SensorRegistry};
pub use sync::{AssetHandler, AssetSyncClient, SyncError, SyncPhase, SyncReport};
pub use template::{Template, TemplateError, TemplateLookup, TemplateStore};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
