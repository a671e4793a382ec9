//! Item records: user-defined logical devices backed by broker topics.
//!
//! An item's numeric id is permanent once allocated and its name is unique
//! among live items. Kind-specific settings live in a tagged [`KindConfig`]
//! variant so each entity kind carries exactly the fields it uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod model;


pub use model::{Command, Effect, ItemModel, ItemSlots, RuntimeState};

/// When a relay applies local state on command issue instead of waiting for
/// the broker echo. `Auto` activates it only when no state topic is
/// configured, i.e. when there is no feedback path to wait for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimisticMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Temperature,
    Humidity,
}

/// Kind-specific configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindConfig {
    Relay {
        /// State marker meaning "on"; falls back to `on_command` when empty.
        #[serde(default)]
        on_state: String,
        /// State marker meaning "off"; falls back to `off_command` when empty.
        #[serde(default)]
        off_state: String,
        #[serde(default = "default_on_command")]
        on_command: String,
        #[serde(default = "default_off_command")]
        off_command: String,
        #[serde(default)]
        optimistic: OptimisticMode,
    },
    Contact {
        #[serde(default = "default_open_state")]
        open_state: String,
        #[serde(default = "default_closed_state")]
        closed_state: String,
    },
    Button {
        #[serde(default = "default_press_payload")]
        press_payload: String,
    },
    Event {
        /// Comma-separated allow-list of tokens; empty accepts everything.
        #[serde(default)]
        filter: String,
    },
    Variable,
    Sensor {
        measurement: Measurement,
        #[serde(default)]
        unit: TemperatureUnit,
    },
}

fn default_on_command() -> String {
    "ON".to_string()
}

fn default_off_command() -> String {
    "OFF".to_string()
}

fn default_open_state() -> String {
    "OPEN".to_string()
}

fn default_closed_state() -> String {
    "CLOSED".to_string()
}

fn default_press_payload() -> String {
    "PRESS".to_string()
}

impl KindConfig {
    pub fn label(&self) -> &'static str {
        match self {
            KindConfig::Relay { .. } => "relay",
            KindConfig::Contact { .. } => "contact",
            KindConfig::Button { .. } => "button",
            KindConfig::Event { .. } => "event",
            KindConfig::Variable => "variable",
            KindConfig::Sensor { .. } => "sensor",
        }
    }
}

/// User-facing item configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub name: String,
    #[serde(default)]
    pub state_topic: String,
    #[serde(default)]
    pub command_topic: String,
    /// Path expression applied to inbound payloads; empty passes the raw
    /// payload through unchanged.
    #[serde(default)]
    pub value_path: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(flatten)]
    pub kind: KindConfig,
}

/// Configuration errors; the offending operation is skipped, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    EmptyName,
    MissingStateTopic(&'static str),
    MissingCommandTopic(&'static str),
    MissingPressPayload,
    NoTopic(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyName => f.write_str("item name must not be empty"),
            ConfigError::MissingStateTopic(kind) => {
                write!(f, "{} items require a state topic", kind)
            }
            ConfigError::MissingCommandTopic(kind) => {
                write!(f, "{} items require a command topic", kind)
            }
            ConfigError::MissingPressPayload => {
                f.write_str("button items require a press payload")
            }
            ConfigError::NoTopic(kind) => {
                write!(f, "{} items require a state or command topic", kind)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ItemConfig {
    /// Checks the per-kind required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        let has_state = !self.state_topic.trim().is_empty();
        let has_command = !self.command_topic.trim().is_empty();
        match &self.kind {
            KindConfig::Contact { .. } | KindConfig::Event { .. } | KindConfig::Sensor { .. } => {
                if !has_state {
                    return Err(ConfigError::MissingStateTopic(self.kind.label()));
                }
            }
            KindConfig::Button { press_payload } => {
                if !has_command {
                    return Err(ConfigError::MissingCommandTopic("button"));
                }
                if press_payload.trim().is_empty() {
                    return Err(ConfigError::MissingPressPayload);
                }
            }
            KindConfig::Relay { .. } | KindConfig::Variable => {
                if !has_state && !has_command {
                    return Err(ConfigError::NoTopic(self.kind.label()));
                }
            }
        }
        Ok(())
    }
}

/// Persisted item record; `id` never changes after allocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: u32,
    pub created_at: DateTime<Utc>,
    pub config: ItemConfig,
}
