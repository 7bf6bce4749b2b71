//! GPIO agent actor.
//!
//! [`AgentLoop`] owns the sensor registry, the template store and the bus
//! client. It waits on three sources at once:
//! - control commands, sent through an [`AgentHandle`]
//! - bus messages (asset notifications, replies, GPOSTATE commands)
//! - output resets raised by the registry, forwarded to the GPOSTATE channel
//!
//! and stops on `$TERM`, when every handle is dropped, on Ctrl-C or on SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use gpiowatch_core::config::{addresses, timeouts, AgentConfig};
use gpiowatch_core::{AssetMessage, BusClient, BusMessage};
use tokio::sync::mpsc;

use crate::classifier::{classify, Classification};
use crate::gpio::HardwarePort;
use crate::registry::{GpoStateCommand, RegistryError, RegistryOutcome, SensorRegistry};
use crate::sync::{AssetHandler, AssetSyncClient};
use crate::template::TemplateStore;

const CONTROL_CAPACITY: usize = 32;

/// Control command, decoded once from its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `CONNECT <endpoint>`
    Connect { endpoint: String },
    /// `PRODUCER <stream>`; also starts asset discovery.
    Producer { stream: String },
    /// `CONSUMER <stream> <pattern>`
    Consumer { stream: String, pattern: String },
    /// `TEST`
    Test,
    /// `TEMPLATE_DIR <path>`
    TemplateDir { path: PathBuf },
    /// `$TERM`
    Term,
    Unknown(String),
}

/// Control decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Empty control command")]
    Empty,

    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("Agent is not running")]
    Closed,
}

impl ControlCommand {
    pub fn from_frames(frames: &[String]) -> Result<Self, ControlError> {
        let (tag, args) = frames.split_first().ok_or(ControlError::Empty)?;
        let arg = |index: usize, command: &'static str, argument: &'static str| {
            args.get(index)
                .cloned()
                .ok_or(ControlError::MissingArgument { command, argument })
        };
        Ok(match tag.as_str() {
            "CONNECT" => Self::Connect {
                endpoint: arg(0, "CONNECT", "endpoint")?,
            },
            "PRODUCER" => Self::Producer {
                stream: arg(0, "PRODUCER", "stream")?,
            },
            "CONSUMER" => Self::Consumer {
                stream: arg(0, "CONSUMER", "stream")?,
                pattern: arg(1, "CONSUMER", "pattern")?,
            },
            "TEST" => Self::Test,
            "TEMPLATE_DIR" => Self::TemplateDir {
                path: PathBuf::from(arg(0, "TEMPLATE_DIR", "path")?),
            },
            "$TERM" => Self::Term,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Sender side of an agent's control channel.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Vec<String>>,
}

impl AgentHandle {
    /// Send a raw control command.
    pub async fn send(&self, frames: Vec<String>) -> Result<(), ControlError> {
        self.tx.send(frames).await.map_err(|_| ControlError::Closed)
    }

    /// Ask the agent to stop.
    pub async fn terminate(&self) -> Result<(), ControlError> {
        self.send(vec!["$TERM".to_string()]).await
    }
}

/// Applies classified assets to the registry.
struct AssetPipeline<'a> {
    registry: &'a SensorRegistry,
    templates: &'a TemplateStore,
    gpo_tx: &'a mpsc::UnboundedSender<GpoStateCommand>,
}

impl AssetPipeline<'_> {
    fn apply(&self, asset: &AssetMessage) {
        tracing::debug!(
            asset = %asset.name,
            operation = %asset.operation,
            status = asset.status(),
            "Asset notification"
        );

        match classify(asset, self.templates) {
            Classification::Delete { asset_name } => match self.registry.delete(&asset_name) {
                Ok(record) => {
                    tracing::info!(asset = %asset_name, gpx = record.gpx_number, "Sensor removed")
                }
                Err(RegistryError::NotFound(_)) => {
                    tracing::debug!(asset = %asset_name, "Not monitored, nothing to remove")
                }
                Err(e) => tracing::warn!(asset = %asset_name, "Remove failed: {}", e),
            },
            Classification::Upsert {
                record,
                operation,
                gpo_init,
            } => {
                let name = record.asset_name.clone();
                let (gpx, direction) = (record.gpx_number, record.direction);
                match self.registry.add_or_update(record, &operation) {
                    Ok(RegistryOutcome::AlreadyExists) => {
                        tracing::debug!(asset = %name, "Sensor already monitored")
                    }
                    Ok(outcome) => {
                        tracing::info!(asset = %name, gpx, %direction, ?outcome, "Sensor stored");
                        if let Some(command) = gpo_init {
                            let _ = self.gpo_tx.send(command);
                        }
                    }
                    Err(e) => tracing::warn!(asset = %name, "Cannot store sensor: {}", e),
                }
            }
            Classification::Ignore(reason) => {
                tracing::debug!(asset = %asset.name, "Asset ignored: {}", reason)
            }
        }
    }
}

impl AssetHandler for AssetPipeline<'_> {
    fn handle_asset(&mut self, asset: AssetMessage) {
        self.apply(&asset);
    }
}

/// SIGTERM listener. Never fires when the handler cannot be installed.
#[cfg(unix)]
struct TerminateSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl TerminateSignal {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        match self.0.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
struct TerminateSignal;

#[cfg(not(unix))]
impl TerminateSignal {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The GPIO agent actor.
pub struct AgentLoop {
    address: String,
    bus: Arc<dyn BusClient>,
    registry: Arc<SensorRegistry>,
    templates: TemplateStore,
    sync: AssetSyncClient,
    connected: bool,
    gpo_tx: mpsc::UnboundedSender<GpoStateCommand>,
    gpo_rx: mpsc::UnboundedReceiver<GpoStateCommand>,
    gpo_subscriber: Option<mpsc::UnboundedSender<GpoStateCommand>>,
    control_rx: mpsc::Receiver<Vec<String>>,
}

impl AgentLoop {
    /// Create an agent on `bus`. Nothing happens until it is run and
    /// receives a CONNECT command.
    pub fn new(bus: Arc<dyn BusClient>, config: &AgentConfig) -> (Self, AgentHandle) {
        let (gpo_tx, gpo_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let hardware = HardwarePort::from_config(&config.hardware, config.agent.test_mode);
        let registry = SensorRegistry::new(hardware).with_gpo_notifier(gpo_tx.clone());

        let agent = Self {
            address: config.bus.address.clone(),
            bus,
            registry: Arc::new(registry),
            templates: TemplateStore::default(),
            sync: AssetSyncClient::new(&config.bus.asset_agent, config.bus.request_timeout()),
            connected: false,
            gpo_tx,
            gpo_rx,
            gpo_subscriber: None,
            control_rx,
        };
        (agent, AgentHandle { tx: control_tx })
    }

    /// Shared view of the registry, for the polling loop.
    pub fn registry(&self) -> Arc<SensorRegistry> {
        self.registry.clone()
    }

    /// GPOSTATE commands received on this agent's mailbox.
    pub fn gpo_state_events(&mut self) -> mpsc::UnboundedReceiver<GpoStateCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.gpo_subscriber = Some(tx);
        rx
    }

    /// Run until terminated. The registry is purged on exit.
    pub async fn run(mut self) {
        let mut terminate = TerminateSignal::install();
        tracing::info!(address = %self.address, "GPIO agent started");

        loop {
            let bus = self.bus.clone();
            tokio::select! {
                frames = self.control_rx.recv() => {
                    let Some(frames) = frames else {
                        tracing::info!("Control channel closed");
                        break;
                    };
                    if let Flow::Stop = self.handle_control(&frames).await {
                        break;
                    }
                }
                message = bus.recv(), if self.connected => match message {
                    Some(message) => self.handle_bus_message(message),
                    None => {
                        tracing::warn!("Bus connection lost");
                        self.connected = false;
                    }
                },
                Some(command) = self.gpo_rx.recv() => self.forward_gpo_state(command).await,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    break;
                }
                _ = terminate.recv() => {
                    tracing::info!("Terminated");
                    break;
                }
            }
        }

        let purged = self.registry.purge();
        tracing::info!(purged, "GPIO agent ended");
    }

    async fn handle_control(&mut self, frames: &[String]) -> Flow {
        let command = match ControlCommand::from_frames(frames) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!("Invalid control command: {}", e);
                return Flow::Continue;
            }
        };
        tracing::debug!(?command, "Control command");

        match command {
            ControlCommand::Connect { endpoint } => {
                if self.connected {
                    tracing::warn!(endpoint = %endpoint, "Already connected, ignoring CONNECT");
                    return Flow::Continue;
                }
                match self
                    .bus
                    .connect(&endpoint, &self.address, timeouts::CONNECT)
                    .await
                {
                    Ok(()) => {
                        self.connected = true;
                        tracing::info!(endpoint = %endpoint, "Connected");
                    }
                    Err(e) => tracing::error!(endpoint = %endpoint, "Connect failed: {}", e),
                }
            }
            ControlCommand::Producer { stream } => {
                if let Err(e) = self.bus.set_producer(&stream).await {
                    tracing::error!(stream = %stream, "Set producer failed: {}", e);
                    return Flow::Continue;
                }
                self.discover_assets().await;
            }
            ControlCommand::Consumer { stream, pattern } => {
                if let Err(e) = self.bus.set_consumer(&stream, &pattern).await {
                    tracing::error!(stream = %stream, pattern = %pattern, "Set consumer failed: {}", e);
                }
            }
            ControlCommand::Test => {
                tracing::info!("Test mode enabled");
                self.registry.set_test_mode(true);
            }
            ControlCommand::TemplateDir { path } => {
                tracing::debug!(path = %path.display(), "Template directory set");
                self.templates.set_dir(path);
            }
            ControlCommand::Term => return Flow::Stop,
            ControlCommand::Unknown(tag) => {
                tracing::warn!(command = %tag, "Unknown control command ignored")
            }
        }
        Flow::Continue
    }

    async fn discover_assets(&mut self) {
        let mut pipeline = AssetPipeline {
            registry: &self.registry,
            templates: &self.templates,
            gpo_tx: &self.gpo_tx,
        };
        // Failures are logged by the sync client.
        let _ = self.sync.run(self.bus.as_ref(), &mut pipeline).await;

        for message in self.sync.take_deferred() {
            self.handle_bus_message(message);
        }
    }

    fn handle_bus_message(&mut self, message: BusMessage) {
        if message.is_mailbox() && message.subject == addresses::SUBJECT_GPOSTATE {
            self.dispatch_gpo_state(&message.frames);
            return;
        }

        let Some(asset) = AssetMessage::decode(&message.frames) else {
            tracing::trace!(subject = %message.subject, sender = %message.sender, "Dropping non-asset message");
            return;
        };
        if !asset.is_gpio_subtype() {
            return;
        }
        AssetPipeline {
            registry: &self.registry,
            templates: &self.templates,
            gpo_tx: &self.gpo_tx,
        }
        .apply(&asset);
    }

    fn dispatch_gpo_state(&mut self, frames: &[String]) {
        let Some(command) = GpoStateCommand::from_frames(frames) else {
            tracing::warn!(?frames, "Malformed GPOSTATE command");
            return;
        };
        tracing::debug!(asset = %command.asset_name, reset = command.is_reset(), "GPOSTATE");
        let delivered = match &self.gpo_subscriber {
            Some(subscriber) => subscriber.send(command).is_ok(),
            None => return,
        };
        if !delivered {
            self.gpo_subscriber = None;
        }
    }

    async fn forward_gpo_state(&self, command: GpoStateCommand) {
        if !self.connected {
            tracing::warn!(asset = %command.asset_name, "Not connected, GPOSTATE dropped");
            return;
        }
        if let Err(e) = self
            .bus
            .send_to(
                &self.address,
                addresses::SUBJECT_GPOSTATE,
                command.to_frames(),
                timeouts::GPOSTATE_SEND,
            )
            .await
        {
            tracing::warn!(asset = %command.asset_name, "GPOSTATE send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(
            ControlCommand::from_frames(&frames(&["CONNECT", "memory://x"])).unwrap(),
            ControlCommand::Connect {
                endpoint: "memory://x".into()
            }
        );
        assert_eq!(
            ControlCommand::from_frames(&frames(&["CONSUMER", "ASSETS", ".*"])).unwrap(),
            ControlCommand::Consumer {
                stream: "ASSETS".into(),
                pattern: ".*".into()
            }
        );
        assert_eq!(
            ControlCommand::from_frames(&frames(&["$TERM"])).unwrap(),
            ControlCommand::Term
        );
        assert_eq!(
            ControlCommand::from_frames(&frames(&["TEST", "extra"])).unwrap(),
            ControlCommand::Test
        );
        assert_eq!(
            ControlCommand::from_frames(&frames(&["REBOOT"])).unwrap(),
            ControlCommand::Unknown("REBOOT".into())
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(ControlCommand::from_frames(&[]), Err(ControlError::Empty));
        assert_eq!(
            ControlCommand::from_frames(&frames(&["CONSUMER", "ASSETS"])),
            Err(ControlError::MissingArgument {
                command: "CONSUMER",
                argument: "pattern"
            })
        );
        assert!(ControlCommand::from_frames(&frames(&["TEMPLATE_DIR"])).is_err());
    }

    #[test]
    fn test_config_commands_decode() {
        let config = AgentConfig::default();
        for command in config.control_commands() {
            let decoded = ControlCommand::from_frames(&command).unwrap();
            assert!(!matches!(decoded, ControlCommand::Unknown(_)));
        }
    }

    #[tokio::test]
    async fn test_term_stops_loop() {
        let broker = gpiowatch_core::MemoryBroker::new("agent-term");
        let (agent, handle) = AgentLoop::new(Arc::new(broker.client()), &AgentConfig::default());
        let task = tokio::spawn(agent.run());

        handle.send(frames(&["BOGUS"])).await.unwrap();
        handle.send(frames(&["CONNECT"])).await.unwrap();
        handle.terminate().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.terminate().await, Err(ControlError::Closed));
    }
}
