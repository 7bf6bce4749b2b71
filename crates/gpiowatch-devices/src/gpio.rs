//! GPIO hardware access through the kernel sysfs interface.
//!
//! A logical GPx number (1-based, per direction) maps to the kernel pin
//! `base_address + direction_offset + gpx`. Pins are driven through
//! `sys/class/gpio/{export, gpioN/direction, gpioN/value}`.
//!
//! In test mode the same tree is rooted under a virtual directory instead of
//! `/`, and the kernel's side of `export` (creating `gpioN/`) is simulated, so
//! the read/write path is identical with or without hardware.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use gpiowatch_core::config::HardwareConfig;
use serde::{Deserialize, Serialize};

/// Sysfs value meaning "closed".
const VALUE_CLOSED: &str = "0";
/// Sysfs value meaning "opened".
const VALUE_OPENED: &str = "1";

/// Logical contact state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioState {
    Opened,
    Closed,
    Unknown,
}

impl GpioState {
    /// Parse a state name. Anything but `opened`/`closed` is `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "opened" => Self::Opened,
            "closed" => Self::Closed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Unknown => "unknown",
        }
    }

    fn from_sysfs(value: &str) -> Self {
        match value.trim() {
            VALUE_CLOSED => Self::Closed,
            VALUE_OPENED => Self::Opened,
            _ => Self::Unknown,
        }
    }

    fn to_sysfs(self) -> Option<&'static str> {
        match self {
            Self::Closed => Some(VALUE_CLOSED),
            Self::Opened => Some(VALUE_OPENED),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for GpioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Parse the `GPI`/`GPO` notation used by templates and assets.
    /// Only `GPO` selects an output.
    pub fn from_gpx(name: &str) -> Self {
        if name == "GPO" {
            Self::Output
        } else {
            Self::Input
        }
    }

    pub fn as_gpx(&self) -> &'static str {
        match self {
            Self::Input => "GPI",
            Self::Output => "GPO",
        }
    }

    fn as_sysfs(&self) -> &'static str {
        match self {
            Self::Input => "in",
            Self::Output => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_gpx())
    }
}

/// GPIO access errors.
#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("Invalid {direction} number {pin} (supported: 1..={count})")]
    InvalidPin {
        pin: u32,
        direction: Direction,
        count: u32,
    },

    #[error("Cannot write state '{0}'")]
    InvalidState(GpioState),

    #[error("GPIO hardware unavailable at {path}: {source}")]
    HardwareUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, GpioError>;

fn unavailable(path: &Path) -> impl FnOnce(io::Error) -> GpioError + '_ {
    move |source| GpioError::HardwareUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

/// GPIO register layout of a controller. Set once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwarePort {
    pub base_address: u32,
    pub gpi_offset: u32,
    pub gpo_offset: u32,
    pub gpi_count: u32,
    pub gpo_count: u32,
    pub test_mode: bool,
    /// Root of the simulated sysfs tree, used in test mode.
    pub virtual_root: Option<PathBuf>,
}

impl HardwarePort {
    pub fn from_config(config: &HardwareConfig, test_mode: bool) -> Self {
        Self {
            base_address: config.base_address,
            gpi_offset: config.gpi_offset,
            gpo_offset: config.gpo_offset,
            gpi_count: config.gpi_count,
            gpo_count: config.gpo_count,
            test_mode,
            virtual_root: config.virtual_root.clone(),
        }
    }

    /// Simulated port rooted at `root`.
    pub fn simulated(root: impl Into<PathBuf>, gpi_count: u32, gpo_count: u32) -> Self {
        Self {
            base_address: 0,
            gpi_offset: 0,
            gpo_offset: 0,
            gpi_count,
            gpo_count,
            test_mode: true,
            virtual_root: Some(root.into()),
        }
    }

    /// Number of pins available in `direction`.
    pub fn count(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.gpi_count,
            Direction::Output => self.gpo_count,
        }
    }

    fn offset(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.gpi_offset,
            Direction::Output => self.gpo_offset,
        }
    }

    /// Kernel pin number for a logical GPx number.
    pub fn pin_number(&self, pin: u32, direction: Direction) -> Result<u32> {
        let count = self.count(direction);
        if pin == 0 || pin > count {
            return Err(GpioError::InvalidPin {
                pin,
                direction,
                count,
            });
        }
        Ok(self.base_address + self.offset(direction) + pin)
    }

    /// Directory holding the `export` file and `gpioN` entries.
    pub fn class_dir(&self) -> PathBuf {
        let root = match (&self.virtual_root, self.test_mode) {
            (Some(root), true) => root.clone(),
            (None, true) => PathBuf::from("."),
            (_, false) => PathBuf::from("/"),
        };
        root.join("sys").join("class").join("gpio")
    }
}

/// Reads and drives GPIO pins of a [`HardwarePort`].
#[derive(Debug, Clone)]
pub struct GpioPort {
    port: HardwarePort,
}

impl GpioPort {
    pub fn new(port: HardwarePort) -> Self {
        Self { port }
    }

    /// Read the state of GPx `pin` configured as `direction`.
    pub fn read(&self, pin: u32, direction: Direction) -> Result<GpioState> {
        let number = self.port.pin_number(pin, direction)?;
        let pin_dir = self.export(number)?;
        self.set_direction(&pin_dir, direction)?;

        let value_path = pin_dir.join("value");
        let value = fs::read_to_string(&value_path).map_err(unavailable(&value_path))?;
        let state = GpioState::from_sysfs(&value);
        tracing::trace!(pin, %direction, kernel_pin = number, %state, "GPIO read");
        Ok(state)
    }

    /// Drive output GPx `pin` to `state`.
    pub fn write(&self, pin: u32, state: GpioState) -> Result<()> {
        let value = state.to_sysfs().ok_or(GpioError::InvalidState(state))?;
        let number = self.port.pin_number(pin, Direction::Output)?;
        let pin_dir = self.export(number)?;
        self.set_direction(&pin_dir, Direction::Output)?;

        let value_path = pin_dir.join("value");
        fs::write(&value_path, value).map_err(unavailable(&value_path))?;
        tracing::trace!(pin, kernel_pin = number, %state, "GPIO write");
        Ok(())
    }

    /// Export kernel pin `number` unless it already is. Returns its directory.
    fn export(&self, number: u32) -> Result<PathBuf> {
        let class_dir = self.port.class_dir();
        let pin_dir = class_dir.join(format!("gpio{}", number));
        if pin_dir.is_dir() {
            return Ok(pin_dir);
        }

        if self.port.test_mode {
            fs::create_dir_all(&class_dir).map_err(unavailable(&class_dir))?;
        }
        let export_path = class_dir.join("export");
        match fs::write(&export_path, number.to_string()) {
            Ok(()) => {}
            // The kernel answers EBUSY for a pin exported behind our back.
            Err(e) if e.kind() == io::ErrorKind::ResourceBusy => {}
            Err(e) => return Err(unavailable(&export_path)(e)),
        }
        if self.port.test_mode {
            fs::create_dir_all(&pin_dir).map_err(unavailable(&pin_dir))?;
        }
        tracing::debug!(kernel_pin = number, "GPIO exported");
        Ok(pin_dir)
    }

    fn set_direction(&self, pin_dir: &Path, direction: Direction) -> Result<()> {
        let path = pin_dir.join("direction");
        let wanted = direction.as_sysfs();
        if let Ok(current) = fs::read_to_string(&path) {
            if current.trim() == wanted {
                return Ok(());
            }
        }
        fs::write(&path, wanted).map_err(unavailable(&path))
    }
}
