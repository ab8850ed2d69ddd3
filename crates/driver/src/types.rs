//! Driver value types
//!
//! This module defines the values exchanged with a driver context:
//! the configuration tree, primitive configuration values, the static
//! capability set and the binary capture payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DriverError;

/// Primitive value accepted by a configuration write
///
/// Serialized untagged so that a TOML or JSON literal maps directly onto
/// the matching variant (`true`, `400`, `"1/125"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean toggle value
    Bool(bool),
    /// Numeric value (ranges, datetimes, numeric menus)
    Number(f64),
    /// Text value (menus, radios, free text)
    Text(String),
}

impl ConfigValue {
    /// Check whether a read-back value reflects this written value
    ///
    /// Numbers and text are compared across variants when the text parses
    /// as the same number, since many cameras expose numeric settings such
    /// as ISO as text choices.
    pub fn matches(&self, read_back: &ConfigValue) -> bool {
        match (self, read_back) {
            (ConfigValue::Bool(a), ConfigValue::Bool(b)) => a == b,
            (ConfigValue::Number(a), ConfigValue::Number(b)) => a == b,
            (ConfigValue::Text(a), ConfigValue::Text(b)) => a == b,
            (ConfigValue::Number(n), ConfigValue::Text(t))
            | (ConfigValue::Text(t), ConfigValue::Number(n)) => {
                t.trim().parse::<f64>().map(|p| p == *n).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Parse a command-line literal into the most specific value
    pub fn parse_literal(input: &str) -> Self {
        match input {
            "true" => ConfigValue::Bool(true),
            "false" => ConfigValue::Bool(false),
            _ => match input.parse::<f64>() {
                Ok(n) if n.is_finite() => ConfigValue::Number(n),
                _ => ConfigValue::Text(input.to_string()),
            },
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Number(n) => write!(f, "{}", n),
            ConfigValue::Text(t) => write!(f, "{}", t),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Number(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Number(value as f64)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Number(f64::from(value))
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

/// One node of the camera configuration tree
///
/// The root returned by a driver context is always a `Window`; leaves are
/// the individual settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNode {
    /// Machine name used for writes (e.g. `iso`)
    pub name: String,
    /// Human readable label
    #[serde(default)]
    pub label: String,
    /// Description text
    #[serde(default)]
    pub info: String,
    /// Whether the setting rejects writes
    #[serde(default)]
    pub readonly: bool,
    /// Type-specific payload
    #[serde(flatten)]
    pub kind: ConfigKind,
}

/// Type-specific part of a configuration node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConfigKind {
    /// Numeric slider
    Range {
        value: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    /// Drop-down choice
    Menu { value: String, choices: Vec<String> },
    /// Radio button choice
    Radio { value: String, choices: Vec<String> },
    /// On/off switch
    Toggle { value: bool },
    /// Free text
    Text { value: String },
    /// Top-level container
    Window {
        #[serde(default)]
        children: BTreeMap<String, ConfigNode>,
    },
    /// Nested container
    Section {
        #[serde(default)]
        children: BTreeMap<String, ConfigNode>,
    },
    /// Unix timestamp in seconds
    #[serde(rename = "datetime")]
    DateTime { value: i64 },
}

impl ConfigNode {
    /// Create a container node
    pub fn window(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            info: String::new(),
            readonly: false,
            kind: ConfigKind::Window {
                children: BTreeMap::new(),
            },
        }
    }

    /// Create a section node
    pub fn section(name: &str, label: &str) -> Self {
        Self {
            kind: ConfigKind::Section {
                children: BTreeMap::new(),
            },
            ..Self::window(name, label)
        }
    }

    /// Create a leaf node
    pub fn leaf(name: &str, label: &str, kind: ConfigKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            info: String::new(),
            readonly: false,
            kind,
        }
    }

    /// Builder-style child insertion (ignored for leaves)
    pub fn with_child(mut self, child: ConfigNode) -> Self {
        if let Some(children) = self.children_mut() {
            children.insert(child.name.clone(), child);
        }
        self
    }

    /// Mark the node read-only
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Whether this node holds other nodes
    pub fn is_container(&self) -> bool {
        matches!(
            self.kind,
            ConfigKind::Window { .. } | ConfigKind::Section { .. }
        )
    }

    /// Child nodes of a window or section
    pub fn children(&self) -> Option<&BTreeMap<String, ConfigNode>> {
        match &self.kind {
            ConfigKind::Window { children } | ConfigKind::Section { children } => Some(children),
            _ => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut BTreeMap<String, ConfigNode>> {
        match &mut self.kind {
            ConfigKind::Window { children } | ConfigKind::Section { children } => Some(children),
            _ => None,
        }
    }

    /// Depth-first lookup of a node by machine name
    pub fn find(&self, name: &str) -> Option<&ConfigNode> {
        if self.name == name {
            return Some(self);
        }
        self.children()?
            .values()
            .find_map(|child| child.find(name))
    }

    /// Mutable depth-first lookup of a node by machine name
    pub fn find_mut(&mut self, name: &str) -> Option<&mut ConfigNode> {
        if self.name == name {
            return Some(self);
        }
        self.children_mut()?
            .values_mut()
            .find_map(|child| child.find_mut(name))
    }

    /// All leaf settings in depth-first order
    pub fn leaves(&self) -> Vec<&ConfigNode> {
        match self.children() {
            Some(children) => children.values().flat_map(|c| c.leaves()).collect(),
            None => vec![self],
        }
    }

    /// Current primitive value of a leaf (None for containers)
    pub fn value(&self) -> Option<ConfigValue> {
        match &self.kind {
            ConfigKind::Range { value, .. } => Some(ConfigValue::Number(*value)),
            ConfigKind::Menu { value, .. } | ConfigKind::Radio { value, .. } => {
                Some(ConfigValue::Text(value.clone()))
            }
            ConfigKind::Toggle { value } => Some(ConfigValue::Bool(*value)),
            ConfigKind::Text { value } => Some(ConfigValue::Text(value.clone())),
            ConfigKind::DateTime { value } => Some(ConfigValue::Number(*value as f64)),
            ConfigKind::Window { .. } | ConfigKind::Section { .. } => None,
        }
    }

    /// Store a written value into this leaf, coercing it to the leaf type
    ///
    /// Rejects writes to read-only nodes, containers, out-of-range numbers
    /// and choices that are not offered.
    pub fn apply(&mut self, value: &ConfigValue) -> Result<(), DriverError> {
        if self.readonly {
            return Err(DriverError::library(format!(
                "setting '{}' is read-only",
                self.name
            )));
        }

        let name = self.name.clone();
        let mismatch = || DriverError::library(format!("invalid value '{}' for '{}'", value, name));

        match (&mut self.kind, value) {
            (ConfigKind::Range { value: current, min, max, .. }, _) => {
                let number = as_number(value).ok_or_else(mismatch)?;
                if number < *min || number > *max {
                    return Err(DriverError::library(format!(
                        "value {} out of range [{}, {}] for '{}'",
                        number, min, max, name
                    )));
                }
                *current = number;
            }
            (ConfigKind::Menu { value: current, choices }, _)
            | (ConfigKind::Radio { value: current, choices }, _) => {
                let choice = choices
                    .iter()
                    .find(|c| value.matches(&ConfigValue::Text((*c).clone())))
                    .ok_or_else(mismatch)?;
                *current = choice.clone();
            }
            (ConfigKind::Toggle { value: current }, ConfigValue::Bool(b)) => *current = *b,
            (ConfigKind::Text { value: current }, ConfigValue::Text(t)) => *current = t.clone(),
            (ConfigKind::DateTime { value: current }, ConfigValue::Number(n)) => {
                *current = *n as i64;
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

fn as_number(value: &ConfigValue) -> Option<f64> {
    match value {
        ConfigValue::Number(n) => Some(*n),
        ConfigValue::Text(t) => t.trim().parse().ok(),
        ConfigValue::Bool(_) => None,
    }
}

/// Static capability set reported by a driver context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportedOps {
    pub capture_image: bool,
    pub capture_video: bool,
    pub capture_audio: bool,
    pub capture_preview: bool,
    pub config: bool,
    pub trigger_capture: bool,
}

/// Low-resolution live-view frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    /// Encoded image bytes
    pub data: Bytes,
    /// MIME type of `data` (usually `image/jpeg`)
    pub mime_type: String,
}

/// Full-resolution captured file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    /// File name as reported by the camera (e.g. `IMG_0001.JPG`)
    pub name: String,
    /// File contents
    pub data: Bytes,
    /// MIME type of `data`
    pub mime_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ConfigNode {
        ConfigNode::window("main", "Camera and Driver Configuration")
            .with_child(
                ConfigNode::section("imgsettings", "Image Settings").with_child(ConfigNode::leaf(
                    "iso",
                    "ISO Speed",
                    ConfigKind::Radio {
                        value: "100".to_string(),
                        choices: vec!["100".into(), "200".into(), "400".into()],
                    },
                )),
            )
            .with_child(ConfigNode::leaf(
                "zoom",
                "Zoom",
                ConfigKind::Range {
                    value: 0.0,
                    min: 0.0,
                    max: 10.0,
                    step: 1.0,
                },
            ))
    }

    #[test]
    fn test_find_nested_node() {
        let tree = sample_tree();
        let iso = tree.find("iso").unwrap();
        assert_eq!(iso.label, "ISO Speed");
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn test_leaves_skip_containers() {
        let tree = sample_tree();
        let names: Vec<_> = tree.leaves().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["iso", "zoom"]);
    }

    #[test]
    fn test_numeric_write_matches_text_choice() {
        assert!(ConfigValue::from(400).matches(&ConfigValue::from("400")));
        assert!(!ConfigValue::from(400).matches(&ConfigValue::from("200")));
        assert!(!ConfigValue::from(true).matches(&ConfigValue::from("true")));
    }

    #[test]
    fn test_apply_radio_choice() {
        let mut tree = sample_tree();
        let iso = tree.find_mut("iso").unwrap();
        iso.apply(&ConfigValue::from(400)).unwrap();
        assert_eq!(iso.value(), Some(ConfigValue::from("400")));
        assert!(iso.apply(&ConfigValue::from(3200)).is_err());
    }

    #[test]
    fn test_apply_rejects_out_of_range_and_read_only() {
        let mut tree = sample_tree();
        let zoom = tree.find_mut("zoom").unwrap();
        assert!(zoom.apply(&ConfigValue::from(11)).is_err());
        zoom.apply(&ConfigValue::from(5)).unwrap();
        assert_eq!(zoom.value(), Some(ConfigValue::Number(5.0)));

        let mut fixed = ConfigNode::leaf(
            "serial",
            "Serial Number",
            ConfigKind::Text {
                value: "123".to_string(),
            },
        )
        .read_only();
        assert!(fixed.apply(&ConfigValue::from("456")).is_err());
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(ConfigValue::parse_literal("true"), ConfigValue::Bool(true));
        assert_eq!(ConfigValue::parse_literal("400"), ConfigValue::Number(400.0));
        assert_eq!(
            ConfigValue::parse_literal("1/125"),
            ConfigValue::Text("1/125".to_string())
        );
    }

    #[test]
    fn test_tree_deserializes_from_toml() {
        let toml_str = r#"
name = "main"
label = "Camera"
type = "window"

[children.iso]
name = "iso"
label = "ISO Speed"
type = "menu"
value = "100"
choices = ["100", "200"]

[children.when]
name = "when"
type = "datetime"
value = 1700000000
"#;
        let tree: ConfigNode = toml::from_str(toml_str).unwrap();
        assert!(tree.is_container());
        assert_eq!(tree.find("iso").unwrap().value(), Some(ConfigValue::from("100")));
        assert_eq!(
            tree.find("when").unwrap().value(),
            Some(ConfigValue::Number(1_700_000_000.0))
        );
    }
}
