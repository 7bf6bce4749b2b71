//! Asset classification.
//!
//! Decides whether an asset notification describes a local GPIO sensor or
//! output, and if so resolves the full [`SensorRecord`] from the notification
//! and the model's template. User-supplied `ext` attributes win over template
//! values, which win over built-in defaults.
//!
//! Classification is pure: it reads the template store but never touches the
//! registry, the bus or the hardware.

use gpiowatch_core::asset::{aux, ext, subtype, STATUS_ACTIVE};
use gpiowatch_core::{AssetMessage, AssetOperation};

use crate::gpio::{Direction, GpioState};
use crate::registry::{GpoStateCommand, SensorRecord};
use crate::template::{keys, TemplateLookup, DEFAULT_ALARM_SEVERITY, DEFAULT_GPX_DIRECTION};

/// Parent name prefix of the local controller.
pub const LOCAL_PARENT_PREFIX: &str = "rackcontroller";

/// Normal state of an output the user did not configure.
const DEFAULT_GPO_NORMAL_STATE: &str = "closed";

/// Why a notification was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IgnoreReason {
    #[error("subtype '{0}' is not handled")]
    NotGpio(String),

    #[error("operation '{0}' is not handled")]
    UnsupportedOperation(String),

    #[error("no model declared")]
    MissingModel,

    #[error("no template for model '{0}'")]
    MissingTemplate(String),

    #[error("parent '{0}' is not the local controller")]
    NonLocalAsset(String),

    #[error("no normal state in template nor asset")]
    MissingNormalState,

    #[error("no port provided")]
    MissingPort,

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid normal state '{0}'")]
    InvalidNormalState(String),
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The asset is gone or inactive; drop any record for it.
    Delete { asset_name: String },
    /// Store `record` through the registry's add/update path.
    Upsert {
        record: SensorRecord,
        operation: AssetOperation,
        /// Initial level for a newly classified output.
        gpo_init: Option<GpoStateCommand>,
    },
    /// Not applicable to this agent.
    Ignore(IgnoreReason),
}

/// Classify one asset notification.
pub fn classify(message: &AssetMessage, templates: &dyn TemplateLookup) -> Classification {
    if message.operation == AssetOperation::Delete || message.status() != STATUS_ACTIVE {
        return Classification::Delete {
            asset_name: message.name.clone(),
        };
    }

    match message.operation {
        AssetOperation::Create | AssetOperation::Update | AssetOperation::Inventory => {}
        ref other => {
            return Classification::Ignore(IgnoreReason::UnsupportedOperation(
                other.to_string(),
            ))
        }
    }

    let resolved = match message.subtype() {
        subtype::SENSOR_GPIO => resolve_sensor(message, templates),
        subtype::GPO => resolve_output(message),
        other => Err(IgnoreReason::NotGpio(other.to_string())),
    };

    match resolved {
        Ok(record) => {
            let gpo_init = record.is_output().then(|| {
                GpoStateCommand::init(&record.asset_name, record.gpx_number, record.normal_state)
            });
            Classification::Upsert {
                record,
                operation: message.operation.clone(),
                gpo_init,
            }
        }
        Err(reason) => Classification::Ignore(reason),
    }
}

fn local_parent(message: &AssetMessage) -> Result<&str, IgnoreReason> {
    let parent = message.aux_or(aux::PARENT_NAME_1, "");
    if parent.starts_with(LOCAL_PARENT_PREFIX) {
        Ok(parent)
    } else {
        Err(IgnoreReason::NonLocalAsset(parent.to_string()))
    }
}

fn parse_port(port: &str) -> Result<u32, IgnoreReason> {
    if port.is_empty() {
        return Err(IgnoreReason::MissingPort);
    }
    match port.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(IgnoreReason::InvalidPort(port.to_string())),
    }
}

fn parse_normal_state(state: &str) -> Result<GpioState, IgnoreReason> {
    if state.is_empty() {
        return Err(IgnoreReason::MissingNormalState);
    }
    match GpioState::parse(state) {
        GpioState::Unknown => Err(IgnoreReason::InvalidNormalState(state.to_string())),
        known => Ok(known),
    }
}

fn resolve_sensor(
    message: &AssetMessage,
    templates: &dyn TemplateLookup,
) -> Result<SensorRecord, IgnoreReason> {
    let model = message.ext_or(ext::MODEL, "");
    if model.is_empty() {
        return Err(IgnoreReason::MissingModel);
    }
    let template = templates
        .lookup(model)
        .ok_or_else(|| IgnoreReason::MissingTemplate(model.to_string()))?;
    let parent = local_parent(message)?;

    let normal_state = message.ext_or(ext::NORMAL_STATE, template.get(keys::NORMAL_STATE));
    let direction = message.ext_or(
        ext::GPX_DIRECTION,
        template.get_or(keys::GPX_DIRECTION, DEFAULT_GPX_DIRECTION),
    );
    let severity = message.ext_or(
        ext::ALARM_SEVERITY,
        template.get_or(keys::ALARM_SEVERITY, DEFAULT_ALARM_SEVERITY),
    );

    let normal_state = parse_normal_state(normal_state)?;
    let gpx_number = parse_port(message.ext_or(ext::PORT, ""))?;

    let mut record = SensorRecord::new(&message.name, gpx_number, Direction::from_gpx(direction));
    record.manufacturer = template.get(keys::MANUFACTURER).to_string();
    record.external_name = message.ext_or(ext::NAME, "").to_string();
    record.part_number = model.to_string();
    record.sensor_type = template.get(keys::TYPE).to_string();
    record.parent_asset = parent.to_string();
    record.location = message.ext_or(ext::LOGICAL_ASSET, "").to_string();
    record.power_source_asset = message.ext_or(ext::GPO_POWERSOURCE, "").to_string();
    record.normal_state = normal_state;
    record.alarm_message = template.get(keys::ALARM_MESSAGE).to_string();
    record.alarm_severity = severity.to_string();
    Ok(record)
}

fn resolve_output(message: &AssetMessage) -> Result<SensorRecord, IgnoreReason> {
    let parent = local_parent(message)?;
    let normal_state =
        parse_normal_state(message.ext_or(ext::NORMAL_STATE, DEFAULT_GPO_NORMAL_STATE))?;
    let gpx_number = parse_port(message.ext_or(ext::PORT, ""))?;
    let direction = Direction::from_gpx(
        message.ext_or(ext::GPX_DIRECTION, Direction::Output.as_gpx()),
    );

    let mut record = SensorRecord::new(&message.name, gpx_number, direction);
    record.external_name = message.ext_or(ext::NAME, "").to_string();
    record.parent_asset = parent.to_string();
    record.normal_state = normal_state;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;
    use std::collections::HashMap;

    fn templates() -> HashMap<String, Template> {
        let mut map = HashMap::new();
        map.insert(
            "M1".to_string(),
            Template::default()
                .with(keys::MANUFACTURER, "Eaton")
                .with(keys::TYPE, "door-contact")
                .with(keys::ALARM_SEVERITY, "WARNING")
                .with(keys::ALARM_MESSAGE, "Door is $status"),
        );
        map.insert(
            "M2".to_string(),
            Template::default()
                .with(keys::TYPE, "water-leak")
                .with(keys::NORMAL_STATE, "opened"),
        );
        map
    }

    fn sensor(name: &str, operation: &str) -> AssetMessage {
        AssetMessage::new(name, operation)
            .with_aux(aux::STATUS, "active")
            .with_aux(aux::SUBTYPE, subtype::SENSOR_GPIO)
            .with_aux(aux::PARENT_NAME_1, "rackcontroller-1")
            .with_ext(ext::MODEL, "M1")
            .with_ext(ext::PORT, "3")
            .with_ext(ext::NORMAL_STATE, "closed")
    }

    fn gpo(name: &str) -> AssetMessage {
        AssetMessage::new(name, AssetOperation::Create)
            .with_aux(aux::SUBTYPE, subtype::GPO)
            .with_aux(aux::PARENT_NAME_1, "rackcontroller-0")
            .with_ext(ext::PORT, "2")
    }

    fn upserted(classification: Classification) -> (SensorRecord, Option<GpoStateCommand>) {
        match classification {
            Classification::Upsert {
                record, gpo_init, ..
            } => (record, gpo_init),
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn test_door_contact() {
        let (record, gpo_init) = upserted(classify(&sensor("sensor-1", "create"), &templates()));
        assert_eq!(record.asset_name, "sensor-1");
        assert_eq!(record.gpx_number, 3);
        assert_eq!(record.direction, Direction::Input);
        assert_eq!(record.normal_state, GpioState::Closed);
        assert_eq!(record.current_state, GpioState::Unknown);
        assert_eq!(record.manufacturer, "Eaton");
        assert_eq!(record.sensor_type, "door-contact");
        assert_eq!(record.alarm_severity, "WARNING");
        assert_eq!(record.alarm_message, "Door is $status");
        assert_eq!(record.part_number, "M1");
        assert_eq!(record.parent_asset, "rackcontroller-1");
        assert!(gpo_init.is_none());
    }

    #[test]
    fn test_user_overrides_template() {
        let msg = sensor("sensor-2", "update")
            .with_ext(ext::MODEL, "M2")
            .with_ext(ext::NORMAL_STATE, "closed")
            .with_ext(ext::ALARM_SEVERITY, "CRITICAL")
            .with_ext(ext::LOGICAL_ASSET, "room-1")
            .with_ext(ext::GPO_POWERSOURCE, "gpo-1")
            .with_ext(ext::NAME, "Leak detector");
        let (record, _) = upserted(classify(&msg, &templates()));
        assert_eq!(record.normal_state, GpioState::Closed);
        assert_eq!(record.alarm_severity, "CRITICAL");
        assert_eq!(record.location, "room-1");
        assert_eq!(record.power_source_asset, "gpo-1");
        assert_eq!(record.external_name, "Leak detector");
        assert_eq!(record.manufacturer, "");
    }

    #[test]
    fn test_template_fallbacks() {
        let mut msg = sensor("sensor-3", "inventory").with_ext(ext::MODEL, "M2");
        msg.ext.remove(ext::NORMAL_STATE);
        let (record, _) = upserted(classify(&msg, &templates()));
        assert_eq!(record.normal_state, GpioState::Opened);
        assert_eq!(record.alarm_severity, DEFAULT_ALARM_SEVERITY);
        assert_eq!(record.direction, Direction::Input);
    }

    #[test]
    fn test_delete_and_inactive() {
        let deleted = classify(&sensor("sensor-1", "delete"), &templates());
        assert_eq!(
            deleted,
            Classification::Delete {
                asset_name: "sensor-1".into()
            }
        );

        let retired = sensor("sensor-1", "update").with_aux(aux::STATUS, "nonactive");
        assert!(matches!(
            classify(&retired, &templates()),
            Classification::Delete { .. }
        ));
    }

    #[test]
    fn test_missing_port_is_ignored() {
        let mut msg = sensor("sensor-1", "create");
        msg.ext.remove(ext::PORT);
        assert_eq!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::MissingPort)
        );

        let msg = sensor("sensor-1", "create").with_ext(ext::PORT, "GPI3");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::InvalidPort(_))
        ));
        let msg = sensor("sensor-1", "create").with_ext(ext::PORT, "0");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::InvalidPort(_))
        ));
    }

    #[test]
    fn test_missing_normal_state_is_ignored() {
        let mut msg = sensor("sensor-1", "create");
        msg.ext.remove(ext::NORMAL_STATE);
        assert_eq!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::MissingNormalState)
        );

        let msg = sensor("sensor-1", "create").with_ext(ext::NORMAL_STATE, "ajar");
        assert_eq!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::InvalidNormalState("ajar".into()))
        );
    }

    #[test]
    fn test_unknown_models_and_remote_parents() {
        let msg = sensor("sensor-1", "create").with_ext(ext::MODEL, "M9");
        assert_eq!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::MissingTemplate("M9".into()))
        );

        let mut msg = sensor("sensor-1", "create");
        msg.ext.remove(ext::MODEL);
        assert_eq!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::MissingModel)
        );

        let msg = sensor("sensor-1", "create").with_aux(aux::PARENT_NAME_1, "ups-1");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::NonLocalAsset(_))
        ));
    }

    #[test]
    fn test_other_subtypes_and_operations() {
        let msg = sensor("sensor-1", "create").with_aux(aux::SUBTYPE, "rack");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::NotGpio(_))
        ));
        let msg = sensor("sensor-1", "retire");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_output_defaults() {
        let (record, gpo_init) = upserted(classify(&gpo("gpo-1"), &templates()));
        assert_eq!(record.direction, Direction::Output);
        assert_eq!(record.normal_state, GpioState::Closed);
        assert_eq!(record.gpx_number, 2);
        assert_eq!(record.manufacturer, "");
        assert_eq!(record.part_number, "");
        assert_eq!(record.alarm_severity, "");
        assert_eq!(
            gpo_init,
            Some(GpoStateCommand::init("gpo-1", 2, GpioState::Closed))
        );

        let msg = gpo("gpo-2").with_ext(ext::NORMAL_STATE, "opened");
        let (_, gpo_init) = upserted(classify(&msg, &templates()));
        assert_eq!(gpo_init.unwrap().to_frames(), vec!["gpo-2", "2", "opened"]);

        let msg = gpo("gpo-3").with_aux(aux::PARENT_NAME_1, "");
        assert!(matches!(
            classify(&msg, &templates()),
            Classification::Ignore(IgnoreReason::NonLocalAsset(_))
        ));
    }
}
