//! Sensor templates.
//!
//! A template gives the static description of a sensor model. Templates are
//! files named `<model>.tpl` in the template directory:
//!
//! ```text
//! # Door contact
//! manufacturer = Eaton
//! type = door-contact
//! normal-state = closed
//! alarm-message = "Door is $status"
//! ```
//!
//! Nested blocks are indented by four spaces and their keys are joined with
//! `/` (`alarm/severity`). A missing key reads as an empty string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Template keys consumed by the classifier.
pub mod keys {
    pub const MANUFACTURER: &str = "manufacturer";
    pub const TYPE: &str = "type";
    pub const ALARM_MESSAGE: &str = "alarm-message";
    pub const NORMAL_STATE: &str = "normal-state";
    pub const GPX_DIRECTION: &str = "gpx-direction";
    pub const ALARM_SEVERITY: &str = "alarm-severity";
}

/// Direction assumed when a template does not name one.
pub const DEFAULT_GPX_DIRECTION: &str = "GPI";
/// Severity assumed when a template does not name one.
pub const DEFAULT_ALARM_SEVERITY: &str = "WARNING";

const INDENT: usize = 4;

/// Template loading errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template syntax error at line {line}: {reason}")]
    Syntax { line: usize, reason: String },
}

/// Key/value contents of one template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    fields: HashMap<String, String>,
}

impl Template {
    /// Builder used by tests and in-memory lookups.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Value of `key`, or an empty string.
    pub fn get(&self, key: &str) -> &str {
        self.get_or(key, "")
    }

    /// Value of `key`, or `default`.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.fields.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse template text.
    pub fn parse(content: &str) -> Result<Self, TemplateError> {
        let mut fields = HashMap::new();
        let mut path: Vec<String> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let indent = raw.len() - raw.trim_start_matches(' ').len();
            if indent % INDENT != 0 {
                return Err(TemplateError::Syntax {
                    line: line_no,
                    reason: format!("indentation of {} spaces", indent),
                });
            }
            let depth = indent / INDENT;
            if depth > path.len() {
                return Err(TemplateError::Syntax {
                    line: line_no,
                    reason: "indented past its parent".to_string(),
                });
            }
            path.truncate(depth);

            let (name, value) = match trimmed.split_once('=') {
                Some((name, value)) => (name.trim(), Some(unquote(value.trim()))),
                None => (trimmed, None),
            };
            if name.is_empty() {
                return Err(TemplateError::Syntax {
                    line: line_no,
                    reason: "missing key".to_string(),
                });
            }

            path.push(name.to_string());
            if let Some(value) = value {
                fields.insert(path.join("/"), value.to_string());
            }
        }

        Ok(Self { fields })
    }

    /// Load a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return &rest[..end];
            }
        }
    }
    // Unquoted values may carry a trailing comment.
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}

/// Source of templates, keyed by asset model.
pub trait TemplateLookup {
    fn lookup(&self, model: &str) -> Option<Template>;
}

impl TemplateLookup for HashMap<String, Template> {
    fn lookup(&self, model: &str) -> Option<Template> {
        self.get(model).cloned()
    }
}

/// Templates stored as files in a directory.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    dir: Option<PathBuf>,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn set_dir(&mut self, dir: impl Into<PathBuf>) {
        self.dir = Some(dir.into());
    }

    /// Path of the template for `model`, if a directory is configured.
    pub fn template_path(&self, model: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.tpl", model)))
    }
}

impl TemplateLookup for TemplateStore {
    fn lookup(&self, model: &str) -> Option<Template> {
        // Model names come from the bus; never let them escape the directory.
        if model.is_empty() || model.contains('/') || model.contains("..") {
            return None;
        }
        let path = self.template_path(model)?;
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "No template, not a GPIO sensor");
            return None;
        }
        match Template::load(&path) {
            Ok(template) => {
                tracing::debug!(path = %path.display(), "Template found");
                Some(template)
            }
            Err(e) => {
                tracing::error!("Can't load sensor template: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOOR_CONTACT: &str = r#"# Door contact sensor
manufacturer = Eaton
type = door-contact
normal-state = closed
alarm-message = "Door has been $status"
gpx-direction = GPI    # input
alarm
    severity = CRITICAL
"#;

    #[test]
    fn test_parse() {
        let template = Template::parse(DOOR_CONTACT).unwrap();
        assert_eq!(template.get(keys::MANUFACTURER), "Eaton");
        assert_eq!(template.get(keys::TYPE), "door-contact");
        assert_eq!(template.get(keys::ALARM_MESSAGE), "Door has been $status");
        assert_eq!(template.get(keys::GPX_DIRECTION), "GPI");
        assert_eq!(template.get("alarm/severity"), "CRITICAL");
        assert_eq!(template.get(keys::ALARM_SEVERITY), "");
        assert_eq!(
            template.get_or(keys::ALARM_SEVERITY, DEFAULT_ALARM_SEVERITY),
            "WARNING"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Template::parse("a = 1\n  b = 2\n"),
            Err(TemplateError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            Template::parse("    a = 1\n"),
            Err(TemplateError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            Template::parse(" = 1\n"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_store_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DCS001.tpl"), DOOR_CONTACT).unwrap();
        let store = TemplateStore::new(dir.path());

        let template = store.lookup("DCS001").unwrap();
        assert_eq!(template.get(keys::MANUFACTURER), "Eaton");
        assert!(store.lookup("unknown").is_none());
        assert!(store.lookup("").is_none());
        assert!(store.lookup("../DCS001").is_none());
        assert!(TemplateStore::default().lookup("DCS001").is_none());
    }

    #[test]
    fn test_map_lookup() {
        let mut map = HashMap::new();
        map.insert("M1".to_string(), Template::default().with(keys::TYPE, "x"));
        assert_eq!(map.lookup("M1").unwrap().get(keys::TYPE), "x");
        assert!(map.lookup("M2").is_none());
    }
}
