//! Asset notification protocol.
//!
//! The asset-management service describes each asset as a name, an operation
//! and two string maps: `aux` for the inventory attributes it owns (status,
//! subtype, parents) and `ext` for user-editable attributes. On the bus the
//! description travels as two frames: the [`ASSET_MARKER`] tag and a JSON body.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// First frame of an encoded asset description.
pub const ASSET_MARKER: &str = "ASSET";

/// Well-known `aux` keys.
pub mod aux {
    pub const STATUS: &str = "status";
    pub const SUBTYPE: &str = "subtype";
    pub const PARENT_NAME_1: &str = "parent_name.1";
}

/// Well-known `ext` keys.
pub mod ext {
    pub const MODEL: &str = "model";
    pub const PORT: &str = "port";
    pub const NAME: &str = "name";
    pub const NORMAL_STATE: &str = "normal_state";
    pub const GPX_DIRECTION: &str = "gpx_direction";
    pub const LOGICAL_ASSET: &str = "logical_asset";
    pub const ALARM_SEVERITY: &str = "alarm_severity";
    pub const GPO_POWERSOURCE: &str = "gpo_powersource";
}

/// Asset subtypes this agent cares about.
pub mod subtype {
    /// GPIO-attached sensor (door contact, dry contact...).
    pub const SENSOR_GPIO: &str = "sensorgpio";
    /// Plain general-purpose output.
    pub const GPO: &str = "gpo";
}

/// Status value of an asset in service.
pub const STATUS_ACTIVE: &str = "active";

/// Operation carried by an asset notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssetOperation {
    Create,
    Update,
    Delete,
    Inventory,
    Retire,
    Other(String),
}

impl AssetOperation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Inventory => "inventory",
            Self::Retire => "retire",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for AssetOperation {
    fn from(s: &str) -> Self {
        match s {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "inventory" => Self::Inventory,
            "retire" => Self::Retire,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AssetOperation {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<AssetOperation> for String {
    fn from(op: AssetOperation) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for AssetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asset description or change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMessage {
    /// Unique asset name (internal identifier).
    pub name: String,
    /// What happened to the asset.
    pub operation: AssetOperation,
    /// Inventory attributes.
    #[serde(default)]
    pub aux: HashMap<String, String>,
    /// User-editable attributes.
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

impl AssetMessage {
    pub fn new(name: impl Into<String>, operation: impl Into<AssetOperation>) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            aux: HashMap::new(),
            ext: HashMap::new(),
        }
    }

    /// Builder: set an `aux` attribute.
    pub fn with_aux(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.aux.insert(key.into(), value.into());
        self
    }

    /// Builder: set an `ext` attribute.
    pub fn with_ext(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext.insert(key.into(), value.into());
        self
    }

    /// `aux` attribute or `default` when absent.
    pub fn aux_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.aux.get(key).map(String::as_str).unwrap_or(default)
    }

    /// `ext` attribute or `default` when absent.
    pub fn ext_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.ext.get(key).map(String::as_str).unwrap_or(default)
    }

    /// Asset status; an asset without one is considered active.
    pub fn status(&self) -> &str {
        self.aux_or(aux::STATUS, STATUS_ACTIVE)
    }

    pub fn subtype(&self) -> &str {
        self.aux_or(aux::SUBTYPE, "")
    }

    /// True for the two subtypes handled by the GPIO agent.
    pub fn is_gpio_subtype(&self) -> bool {
        matches!(self.subtype(), subtype::SENSOR_GPIO | subtype::GPO)
    }

    /// Encode into bus frames.
    pub fn encode(&self) -> Result<Vec<String>, serde_json::Error> {
        Ok(vec![ASSET_MARKER.to_string(), serde_json::to_string(self)?])
    }

    /// Whether `frames` look like an encoded asset description.
    pub fn is(frames: &[String]) -> bool {
        frames.len() == 2 && frames[0] == ASSET_MARKER
    }

    /// Decode bus frames produced by [`AssetMessage::encode`].
    pub fn decode(frames: &[String]) -> Option<Self> {
        if !Self::is(frames) {
            return None;
        }
        serde_json::from_str(&frames[1]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_strings() {
        assert_eq!(AssetOperation::from("create"), AssetOperation::Create);
        assert_eq!(AssetOperation::from("inventory"), AssetOperation::Inventory);
        assert_eq!(
            AssetOperation::from("bogus"),
            AssetOperation::Other("bogus".into())
        );
        assert_eq!(AssetOperation::Delete.to_string(), "delete");
    }

    #[test]
    fn test_defaults() {
        let msg = AssetMessage::new("sensor-1", "create");
        assert_eq!(msg.status(), "active");
        assert_eq!(msg.subtype(), "");
        assert!(!msg.is_gpio_subtype());
        assert_eq!(msg.ext_or(ext::PORT, "none"), "none");
    }

    #[test]
    fn test_frames() {
        let msg = AssetMessage::new("gpo-2", AssetOperation::Update)
            .with_aux(aux::SUBTYPE, subtype::GPO)
            .with_ext(ext::PORT, "2");
        let frames = msg.encode().unwrap();
        assert_eq!(frames[0], ASSET_MARKER);
        assert!(frames[1].contains("\"operation\":\"update\""));
        assert_eq!(AssetMessage::decode(&frames), Some(msg));

        assert!(!AssetMessage::is(&["ERROR".into(), "nope".into()]));
        assert!(AssetMessage::decode(&[ASSET_MARKER.into(), "{".into()]).is_none());
    }
}
