//! Command-line interface for the gpiowatch GPIO sensor agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gpiowatch_core::config::{env_vars, AgentConfig};
use gpiowatch_core::{BusClient, MemoryBroker};
use gpiowatch_devices::{
    AgentLoop, Direction, GpioPort, GpioState, GpoStateCommand, HardwarePort,
};
use tokio::sync::mpsc;

/// gpiowatch - keep GPIO sensors in step with the asset inventory.
#[derive(Parser, Debug)]
#[command(name = "gpiowatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated GPIO tree and skip pin capacity checks.
    #[arg(long, global = true)]
    test: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent.
    Run {
        /// Bus endpoint (mqtt://host:port or memory://name).
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Directory holding the sensor templates.
        #[arg(short, long)]
        template_dir: Option<PathBuf>,
    },

    /// Read one pin.
    Read {
        /// GPx number, starting at 1.
        #[arg(short, long)]
        pin: u32,

        #[arg(short, long, value_enum, default_value_t = PinDirection::Gpi)]
        direction: PinDirection,
    },

    /// Drive one output pin.
    Write {
        /// GPO number, starting at 1.
        #[arg(short, long)]
        pin: u32,

        #[arg(short, long, value_enum)]
        state: PinState,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PinDirection {
    Gpi,
    Gpo,
}

impl From<PinDirection> for Direction {
    fn from(direction: PinDirection) -> Self {
        match direction {
            PinDirection::Gpi => Direction::Input,
            PinDirection::Gpo => Direction::Output,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PinState {
    Opened,
    Closed,
}

impl From<PinState> for GpioState {
    fn from(state: PinState) -> Self {
        match state {
            PinState::Opened => GpioState::Opened,
            PinState::Closed => GpioState::Closed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = load_config(args.config.as_deref())?;
    if args.test {
        config.agent.test_mode = true;
    }

    match args.command {
        Command::Run {
            endpoint,
            template_dir,
        } => {
            if let Some(endpoint) = endpoint {
                config.bus.endpoint = endpoint;
            }
            if let Some(dir) = template_dir {
                config.agent.template_dir = dir;
            }
            run_agent(config).await
        }
        Command::Read { pin, direction } => {
            let state = gpio_port(&config).read(pin, direction.into())?;
            println!("{}", state);
            Ok(())
        }
        Command::Write { pin, state } => {
            gpio_port(&config).write(pin, state.into())?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose {
        "gpiowatch=debug"
    } else {
        "gpiowatch=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

fn gpio_port(config: &AgentConfig) -> GpioPort {
    GpioPort::new(HardwarePort::from_config(
        &config.hardware,
        config.agent.test_mode,
    ))
}

#[cfg(feature = "mqtt")]
fn mqtt_bus(endpoint: &str) -> Option<Arc<dyn BusClient>> {
    endpoint
        .starts_with(gpiowatch_devices::mqtt::SCHEME)
        .then(|| Arc::new(gpiowatch_devices::MqttBus::new()) as Arc<dyn BusClient>)
}

#[cfg(not(feature = "mqtt"))]
fn mqtt_bus(_endpoint: &str) -> Option<Arc<dyn BusClient>> {
    None
}

/// Bus client able to reach `endpoint`.
fn bus_for(endpoint: &str) -> Result<Arc<dyn BusClient>> {
    if let Some(name) = endpoint.strip_prefix("memory://") {
        return Ok(Arc::new(MemoryBroker::new(name).client()));
    }
    mqtt_bus(endpoint).with_context(|| format!("Unsupported bus endpoint: {}", endpoint))
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let bus = bus_for(&config.bus.endpoint)?;
    let (mut agent, handle) = AgentLoop::new(bus, &config);
    spawn_output_driver(gpio_port(&config), agent.gpo_state_events());

    let task = tokio::spawn(agent.run());
    for command in config.control_commands() {
        handle.send(command).await?;
    }
    task.await?;
    Ok(())
}

/// Apply GPOSTATE commands to the output pins.
fn spawn_output_driver(gpio: GpioPort, mut commands: mpsc::UnboundedReceiver<GpoStateCommand>) {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let (Some(pin), Some(state)) = (command.gpx_number, command.state) else {
                tracing::info!(asset = %command.asset_name, "Output released");
                continue;
            };
            let gpio = gpio.clone();
            match tokio::task::spawn_blocking(move || gpio.write(pin, state)).await {
                Ok(Ok(())) => {
                    tracing::info!(asset = %command.asset_name, pin, %state, "Output initialized")
                }
                Ok(Err(e)) => {
                    tracing::warn!(asset = %command.asset_name, "Cannot drive output: {}", e)
                }
                Err(e) => tracing::error!("Output driver task failed: {}", e),
            }
        }
    });
}
