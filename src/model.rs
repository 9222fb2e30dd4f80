//! Device value model shared by every part of the bridge.
//!
//! A [`ValueId`] names one controllable or observable parameter of a Z-Wave
//! node; a [`ValueModel`] is the bridge's current view of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString, IntoStaticStr};

/// Z-Wave node identifier. Stable until the device is re-paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u8);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slug naming the class of a value (`switch`, `dimmer`, `meter_2`, ...).
///
/// Always a single, non-empty MQTT topic level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValueClass(String);

impl ValueClass {
    /// Validate a slug. Returns `None` for anything that is not a usable topic level.
    pub fn new(slug: impl Into<String>) -> Option<Self> {
        let slug = slug.into();
        let valid = !slug.is_empty()
            && !slug
                .chars()
                .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace());
        valid.then_some(Self(slug))
    }

    /// Map a Z-Wave command class (and value index) to its slug.
    ///
    /// Index 0 keeps the bare name; other indices get a numeric suffix so
    /// that multi-value classes such as meters stay distinct.
    pub fn from_command_class(command_class: u8, index: u8) -> Self {
        let base = match command_class {
            0x20 => "basic".to_string(),
            0x25 => "switch".to_string(),
            0x26 => "dimmer".to_string(),
            0x27 => "switch_all".to_string(),
            0x30 => "binary_sensor".to_string(),
            0x31 => "sensor".to_string(),
            0x32 => "meter".to_string(),
            0x40 => "thermostat_mode".to_string(),
            0x42 => "thermostat_state".to_string(),
            0x43 => "setpoint".to_string(),
            0x44 => "fan_mode".to_string(),
            0x62 => "lock".to_string(),
            0x70 => "configuration".to_string(),
            0x71 => "alarm".to_string(),
            0x80 => "battery".to_string(),
            0x84 => "wake_up".to_string(),
            other => format!("cc{}", other),
        };
        if index == 0 {
            Self(base)
        } else {
            Self(format!("{}_{}", base, index))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ValueClass {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.clone()).ok_or_else(|| format!("invalid value class '{}'", value))
    }
}

impl From<ValueClass> for String {
    fn from(class: ValueClass) -> Self {
        class.0
    }
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one value: (node, class, instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    pub node: NodeId,
    pub class: ValueClass,
    pub instance: u8,
}

impl ValueId {
    pub fn new(node: NodeId, class: ValueClass, instance: u8) -> Self {
        Self {
            node,
            class,
            instance,
        }
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.class, self.instance)
    }
}

/// Semantic type tag of a [`Value`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Numeric,
    Enumerated,
    String,
}

/// Closed set of value shapes the bridge understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Numeric(f64),
    /// Selected label of an enumerated value.
    Enumerated(String),
    String(String),
}

/// Tolerance used when matching an observed numeric against a requested one.
const NUMERIC_MATCH_EPSILON: f64 = 1e-6;

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Numeric(_) => ValueKind::Numeric,
            Value::Enumerated(_) => ValueKind::Enumerated,
            Value::String(_) => ValueKind::String,
        }
    }

    /// Whether an observed value fulfils a requested one.
    pub fn satisfies(&self, desired: &Value) -> bool {
        match (self, desired) {
            (Value::Numeric(a), Value::Numeric(b)) => (a - b).abs() <= NUMERIC_MATCH_EPSILON,
            (a, b) => a == b,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Numeric(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Enumerated(s) | Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Numeric(n) => write!(f, "{}", n),
            Value::Enumerated(s) | Value::String(s) => write!(f, "{}", s),
        }
    }
}

/// A candidate new state for one value, as reported by the mesh network.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub value: Value,
    pub units: Option<String>,
    pub choices: Vec<String>,
    pub read_only: bool,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

impl ValueUpdate {
    pub fn new(value: Value, generation: u64) -> Self {
        Self {
            value,
            units: None,
            choices: Vec::new(),
            read_only: false,
            generation,
            timestamp: Utc::now(),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.choices = choices;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Current state of one value as held by the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueModel {
    pub id: ValueId,
    pub value: Value,
    pub units: Option<String>,
    /// Allowed labels when the value is enumerated.
    pub choices: Vec<String>,
    pub read_only: bool,
    pub updated_at: DateTime<Utc>,
    pub generation: u64,
}

impl ValueModel {
    pub(crate) fn from_update(id: ValueId, update: ValueUpdate) -> Self {
        Self {
            id,
            value: update.value,
            units: update.units,
            choices: update.choices,
            read_only: update.read_only,
            updated_at: update.timestamp,
            generation: update.generation,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// True when `update` would not change anything a subscriber can see.
    pub(crate) fn same_content(&self, update: &ValueUpdate) -> bool {
        self.value == update.value
            && self.units == update.units
            && self.choices == update.choices
            && self.read_only == update.read_only
    }
}
