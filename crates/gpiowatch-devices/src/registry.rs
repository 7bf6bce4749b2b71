//! Sensor Registry - the set of monitored GPIO sensors and outputs.
//!
//! One record per asset, keyed by asset name. Every operation runs under a
//! single lock covering the whole collection, so each call is atomic with
//! respect to the others. Callers get copies (or a borrow that ends with the
//! call), never a stored reference into the registry.
//!
//! The registry never touches the hardware. When an output is removed it asks
//! the output-state owner to release the pin through the GPOSTATE side
//! channel instead.

use std::collections::HashMap;

use gpiowatch_core::AssetOperation;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::gpio::{Direction, GpioState, HardwarePort};

/// One monitored GPIO asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorRecord {
    pub manufacturer: String,
    /// Unique key.
    pub asset_name: String,
    /// User-visible name.
    pub external_name: String,
    pub part_number: String,
    /// Sensor type (door-contact, ...).
    pub sensor_type: String,
    pub parent_asset: String,
    pub location: String,
    /// GPO powering this sensor, if any.
    pub power_source_asset: String,
    pub normal_state: GpioState,
    pub current_state: GpioState,
    /// GPx number, 1-based.
    pub gpx_number: u32,
    pub direction: Direction,
    pub alarm_message: String,
    pub alarm_severity: String,
}

impl SensorRecord {
    pub fn new(asset_name: impl Into<String>, gpx_number: u32, direction: Direction) -> Self {
        Self {
            manufacturer: String::new(),
            asset_name: asset_name.into(),
            external_name: String::new(),
            part_number: String::new(),
            sensor_type: String::new(),
            parent_asset: String::new(),
            location: String::new(),
            power_source_asset: String::new(),
            normal_state: GpioState::Unknown,
            current_state: GpioState::Unknown,
            gpx_number,
            direction,
            alarm_message: String::new(),
            alarm_severity: String::new(),
        }
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }
}

/// Output-state side-channel command, sent to the agent's own mailbox under
/// the GPOSTATE subject. No reply is expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpoStateCommand {
    pub asset_name: String,
    /// `None` releases the pin.
    pub gpx_number: Option<u32>,
    pub state: Option<GpioState>,
}

impl GpoStateCommand {
    /// Drive `gpx_number` to `state`.
    pub fn init(asset_name: impl Into<String>, gpx_number: u32, state: GpioState) -> Self {
        Self {
            asset_name: asset_name.into(),
            gpx_number: Some(gpx_number),
            state: Some(state),
        }
    }

    /// Release the output held by `asset_name`.
    pub fn reset(asset_name: impl Into<String>) -> Self {
        Self {
            asset_name: asset_name.into(),
            gpx_number: None,
            state: None,
        }
    }

    pub fn is_reset(&self) -> bool {
        self.gpx_number.is_none()
    }

    /// Wire frames: `[asset, number | "-1", state?]`.
    pub fn to_frames(&self) -> Vec<String> {
        let mut frames = vec![
            self.asset_name.clone(),
            self.gpx_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-1".to_string()),
        ];
        if let Some(state) = self.state {
            frames.push(state.to_string());
        }
        frames
    }

    /// Parse frames produced by [`GpoStateCommand::to_frames`].
    pub fn from_frames(frames: &[String]) -> Option<Self> {
        let asset_name = frames.first()?.clone();
        let number = frames.get(1)?;
        let gpx_number = if number == "-1" {
            None
        } else {
            Some(number.parse().ok()?)
        };
        let state = frames.get(2).map(|s| GpioState::parse(s));
        Some(Self {
            asset_name,
            gpx_number,
            state,
        })
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{direction} number {gpx_number} of '{asset}' exceeds the {capacity} supported")]
    PinOutOfRange {
        asset: String,
        gpx_number: u32,
        direction: Direction,
        capacity: u32,
    },

    #[error("Record for '{0}' vanished during update")]
    Conflict(String),

    #[error("Sensor not found: {0}")]
    NotFound(String),

    #[error("Cannot allocate record for '{0}'")]
    AllocationFailed(String),
}

/// Successful outcomes of [`SensorRegistry::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOutcome {
    /// New record stored.
    Inserted,
    /// Existing record replaced by an update.
    Replaced,
    /// Record already monitored and the operation is not an update; nothing changed.
    AlreadyExists,
}

struct RegistryState {
    records: HashMap<String, SensorRecord>,
    /// Asset names in insertion order.
    order: Vec<String>,
    hardware: HardwarePort,
    test_mode: bool,
}

impl RegistryState {
    fn insert(&mut self, record: SensorRecord) -> Result<(), RegistryError> {
        let name = record.asset_name.clone();
        self.records
            .try_reserve(1)
            .and_then(|_| self.order.try_reserve(1))
            .map_err(|_| RegistryError::AllocationFailed(name.clone()))?;
        self.order.push(name.clone());
        self.records.insert(name, record);
        Ok(())
    }

    fn remove(&mut self, asset_name: &str) -> Option<SensorRecord> {
        let record = self.records.remove(asset_name)?;
        self.order.retain(|n| n != asset_name);
        Some(record)
    }

    fn ordered(&self) -> impl Iterator<Item = &SensorRecord> {
        self.order.iter().filter_map(|n| self.records.get(n))
    }
}

/// Thread-safe collection of [`SensorRecord`]s.
pub struct SensorRegistry {
    state: Mutex<RegistryState>,
    gpo_notifier: Option<mpsc::UnboundedSender<GpoStateCommand>>,
}

impl SensorRegistry {
    /// Registry validating pin numbers against `hardware`.
    pub fn new(hardware: HardwarePort) -> Self {
        let test_mode = hardware.test_mode;
        Self {
            state: Mutex::new(RegistryState {
                records: HashMap::new(),
                order: Vec::new(),
                hardware,
                test_mode,
            }),
            gpo_notifier: None,
        }
    }

    /// Route output-reset commands to `notifier`.
    pub fn with_gpo_notifier(mut self, notifier: mpsc::UnboundedSender<GpoStateCommand>) -> Self {
        self.gpo_notifier = Some(notifier);
        self
    }

    /// In test mode pin numbers are not checked against the hardware.
    pub fn set_test_mode(&self, enabled: bool) {
        self.state.lock().test_mode = enabled;
    }

    pub fn test_mode(&self) -> bool {
        self.state.lock().test_mode
    }

    /// Store `record`.
    ///
    /// An existing record is replaced as a whole when `operation` is an
    /// update and left untouched otherwise.
    pub fn add_or_update(
        &self,
        record: SensorRecord,
        operation: &AssetOperation,
    ) -> Result<RegistryOutcome, RegistryError> {
        let mut state = self.state.lock();

        if !state.test_mode {
            let capacity = state.hardware.count(record.direction);
            if record.gpx_number > capacity {
                return Err(RegistryError::PinOutOfRange {
                    asset: record.asset_name,
                    gpx_number: record.gpx_number,
                    direction: record.direction,
                    capacity,
                });
            }
        }

        if !state.records.contains_key(&record.asset_name) {
            state.insert(record)?;
            return Ok(RegistryOutcome::Inserted);
        }

        if *operation != AssetOperation::Update {
            return Ok(RegistryOutcome::AlreadyExists);
        }

        if state.remove(&record.asset_name).is_none() {
            return Err(RegistryError::Conflict(record.asset_name));
        }
        state.insert(record)?;
        Ok(RegistryOutcome::Replaced)
    }

    /// Remove the record of `asset_name`.
    ///
    /// Removing an output first asks for its pin to be released.
    pub fn delete(&self, asset_name: &str) -> Result<SensorRecord, RegistryError> {
        let mut state = self.state.lock();
        let is_output = state
            .records
            .get(asset_name)
            .map(SensorRecord::is_output)
            .ok_or_else(|| RegistryError::NotFound(asset_name.to_string()))?;

        if is_output {
            self.notify_gpo(GpoStateCommand::reset(asset_name));
        }

        state
            .remove(asset_name)
            .ok_or_else(|| RegistryError::NotFound(asset_name.to_string()))
    }

    /// Copy of the record of `asset_name`.
    pub fn find(&self, asset_name: &str) -> Option<SensorRecord> {
        self.state.lock().records.get(asset_name).cloned()
    }

    pub fn contains(&self, asset_name: &str) -> bool {
        self.state.lock().records.contains_key(asset_name)
    }

    /// Snapshot of all records in insertion order.
    pub fn enumerate(&self) -> Vec<SensorRecord> {
        self.state.lock().ordered().cloned().collect()
    }

    /// Snapshot of all records sorted by asset name.
    pub fn sorted(&self) -> Vec<SensorRecord> {
        let mut records = self.enumerate();
        records.sort_by(|a, b| a.asset_name.cmp(&b.asset_name));
        records
    }

    /// Visit every record, in insertion order, under the registry lock.
    ///
    /// `f` must not block.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SensorRecord),
    {
        let state = self.state.lock();
        for record in state.ordered() {
            f(record);
        }
    }

    /// Record the last state read from the hardware.
    pub fn set_current_state(&self, asset_name: &str, current: GpioState) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(asset_name)
            .ok_or_else(|| RegistryError::NotFound(asset_name.to_string()))?;
        record.current_state = current;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.records.len();
        state.records.clear();
        state.order.clear();
        count
    }

    fn notify_gpo(&self, command: GpoStateCommand) {
        match &self.gpo_notifier {
            Some(tx) => {
                if tx.send(command).is_err() {
                    tracing::debug!("GPOSTATE channel closed, output reset dropped");
                }
            }
            None => tracing::debug!(asset = %command.asset_name, "No GPOSTATE channel, output reset dropped"),
        }
    }
}
