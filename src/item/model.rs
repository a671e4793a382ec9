//! Entity runtime: one model per live item.
//!
//! Every kind shares the same inbound pipeline — cache the raw payload,
//! extract a value by the configured path, hand the text to the kind
//! transition — and reports side effects as [`Effect`] values. The driver
//! applies effects to the multiplexer and the host platform; the model itself
//! touches neither, which keeps every transition synchronous and directly
//! testable.

use crate::host::Unit;
use crate::item::{ItemConfig, ItemRecord, KindConfig, Measurement, OptimisticMode, TemperatureUnit};
use crate::parser;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

/// Host-initiated item commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TurnOn,
    TurnOff,
    Press,
}

/// Side effects produced by an entity transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Publish {
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
    },
    SetBinary {
        endpoint: u32,
        on: bool,
    },
    SetCondition {
        condition: u32,
        value: bool,
    },
    Pulse {
        endpoint: u32,
    },
    FireTrigger {
        trigger: u32,
        token: String,
    },
    SetVariable {
        variable: u32,
        value: String,
    },
    PushMeasurement {
        endpoint: u32,
        value: f64,
        unit: Unit,
    },
}

/// Registry slot ids backing an item's host wiring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemSlots {
    pub endpoint: Option<u32>,
    pub condition: Option<u32>,
    pub trigger: Option<u32>,
    pub variable: Option<u32>,
}

/// Per-item runtime state. Unset until the first message, recomputed from
/// traffic, never persisted.
#[derive(Clone, Debug, Default)]
pub struct RuntimeState {
    pub last_payload: Option<String>,
    pub last_value: Option<String>,
    pub last_state: Option<bool>,
    pub last_number: Option<f64>,
    pub diagnostic: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub link_up: bool,
}

pub struct ItemModel {
    record: ItemRecord,
    slots: ItemSlots,
    state: RuntimeState,
}

impl ItemModel {
    pub fn new(record: ItemRecord, slots: ItemSlots) -> Self {
        Self {
            record,
            slots,
            state: RuntimeState::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.config.name
    }

    pub fn record(&self) -> &ItemRecord {
        &self.record
    }

    pub fn config(&self) -> &ItemConfig {
        &self.record.config
    }

    pub fn slots(&self) -> &ItemSlots {
        &self.slots
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.state
    }

    pub fn state_topic(&self) -> &str {
        self.record.config.state_topic.trim()
    }

    /// Connect/disconnect notification from the multiplexer.
    pub fn set_link(&mut self, up: bool) {
        self.state.link_up = up;
    }

    /// Replaces the configuration in place. Returns true when the state
    /// topic changed — the caller must rebind the subscription, and every
    /// cached raw/extracted/parsed value is discarded here because values
    /// from the old topic mean nothing on the new one.
    pub fn apply_config(&mut self, config: ItemConfig) -> bool {
        let rebind = config.state_topic.trim() != self.record.config.state_topic.trim();
        if rebind {
            let link_up = self.state.link_up;
            self.state = RuntimeState {
                link_up,
                ..RuntimeState::default()
            };
        }
        self.record.config = config;
        rebind
    }

    /// Shared inbound pipeline: cache the raw payload, extract the value,
    /// delegate to the kind transition. Extraction failure short-circuits
    /// with no effects and a diagnostic.
    pub fn on_message(&mut self, raw: &str) -> Vec<Effect> {
        self.state.last_payload = Some(raw.to_string());
        self.state.last_seen = Some(Utc::now());

        let path = self.record.config.value_path.trim();
        let value = if path.is_empty() {
            raw.to_string()
        } else {
            let doc: Value = match serde_json::from_str(raw) {
                Ok(doc) => doc,
                Err(_) => {
                    debug!(item = %self.record.config.name, "Payload is not a JSON document");
                    self.state.diagnostic = Some("invalid".to_string());
                    return Vec::new();
                }
            };
            match parser::extract_path(&doc, path) {
                Some(v) => parser::value_text(v),
                None => {
                    debug!(item = %self.record.config.name, path = %path, "Value not found in payload");
                    self.state.diagnostic = Some("not found".to_string());
                    return Vec::new();
                }
            }
        };

        let previous = self.state.last_value.replace(value.clone());
        self.transition(&value, previous)
    }

    fn transition(&mut self, value: &str, previous: Option<String>) -> Vec<Effect> {
        match &self.record.config.kind {
            KindConfig::Relay {
                on_state,
                off_state,
                on_command,
                off_command,
                ..
            } => {
                let on_marker = if on_state.is_empty() { on_command } else { on_state };
                let off_marker = if off_state.is_empty() { off_command } else { off_state };
                match parser::parse_state(value, on_marker, off_marker) {
                    Some(on) => {
                        self.state.diagnostic = None;
                        if self.state.last_state == Some(on) {
                            Vec::new()
                        } else {
                            self.state.last_state = Some(on);
                            binary_effects(&self.slots, on)
                        }
                    }
                    None => {
                        self.state.diagnostic = Some("invalid".to_string());
                        Vec::new()
                    }
                }
            }

            KindConfig::Contact {
                open_state,
                closed_state,
            } => match parser::parse_state(value, open_state, closed_state) {
                Some(open) => {
                    self.state.diagnostic = None;
                    if self.state.last_state == Some(open) {
                        Vec::new()
                    } else {
                        self.state.last_state = Some(open);
                        binary_effects(&self.slots, open)
                    }
                }
                None => {
                    self.state.diagnostic = Some("invalid".to_string());
                    Vec::new()
                }
            },

            // Buttons are write-only; inbound traffic is ignored
            KindConfig::Button { .. } => Vec::new(),

            KindConfig::Event { filter } => {
                if !filter.trim().is_empty() {
                    let allowed = filter.split(',').map(str::trim).any(|t| t == value);
                    if !allowed {
                        debug!(item = %self.record.config.name, token = %value, "Token filtered");
                        return Vec::new();
                    }
                }
                self.state.diagnostic = None;
                let mut effects = Vec::new();
                if let Some(trigger) = self.slots.trigger {
                    effects.push(Effect::FireTrigger {
                        trigger,
                        token: value.to_string(),
                    });
                }
                if let Some(endpoint) = self.slots.endpoint {
                    effects.push(Effect::Pulse { endpoint });
                }
                effects
            }

            KindConfig::Variable => {
                if previous.as_deref() == Some(value) {
                    return Vec::new();
                }
                self.state.diagnostic = None;
                match self.slots.variable {
                    Some(variable) => vec![Effect::SetVariable {
                        variable,
                        value: value.to_string(),
                    }],
                    None => Vec::new(),
                }
            }

            KindConfig::Sensor { measurement, unit } => {
                let reading: f64 = match value.trim().parse() {
                    Ok(v) => v,
                    Err(_) => {
                        debug!(item = %self.record.config.name, value = %value, "Not a decimal reading");
                        self.state.diagnostic = Some("invalid".to_string());
                        return Vec::new();
                    }
                };
                self.state.diagnostic = None;
                if self.state.last_number == Some(reading) {
                    return Vec::new();
                }
                self.state.last_number = Some(reading);

                let unit = match measurement {
                    Measurement::Temperature => match unit {
                        TemperatureUnit::Celsius => Unit::Celsius,
                        TemperatureUnit::Fahrenheit => Unit::Fahrenheit,
                    },
                    Measurement::Humidity => Unit::Percent,
                };
                let mut effects = Vec::new();
                if let Some(variable) = self.slots.variable {
                    effects.push(Effect::SetVariable {
                        variable,
                        value: value.trim().to_string(),
                    });
                }
                if let Some(endpoint) = self.slots.endpoint {
                    effects.push(Effect::PushMeasurement {
                        endpoint,
                        value: reading,
                        unit,
                    });
                }
                effects
            }
        }
    }

    /// Host-initiated command. Composes the outbound publish and, for
    /// optimistic relays, applies local state synchronously — no broker echo
    /// required when there is no feedback path.
    pub fn command(&mut self, command: Command) -> Vec<Effect> {
        let topic = self.record.config.command_topic.trim().to_string();
        let qos = self.record.config.qos;
        let retain = self.record.config.retain;

        match (&self.record.config.kind, command) {
            (
                KindConfig::Relay {
                    on_command,
                    off_command,
                    optimistic,
                    ..
                },
                Command::TurnOn | Command::TurnOff,
            ) => {
                if topic.is_empty() {
                    warn!(item = %self.record.config.name, "Command dropped: no command topic");
                    return Vec::new();
                }
                let target = command == Command::TurnOn;
                let payload = if target { on_command } else { off_command }.clone();
                let optimistic = match optimistic {
                    OptimisticMode::On => true,
                    OptimisticMode::Off => false,
                    OptimisticMode::Auto => self.record.config.state_topic.trim().is_empty(),
                };

                let mut effects = vec![Effect::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                }];
                if optimistic && self.state.last_state != Some(target) {
                    self.state.last_state = Some(target);
                    effects.extend(binary_effects(&self.slots, target));
                }
                effects
            }

            (KindConfig::Button { press_payload }, Command::Press) => {
                if topic.is_empty() {
                    warn!(item = %self.record.config.name, "Press dropped: no command topic");
                    return Vec::new();
                }
                vec![Effect::Publish {
                    topic,
                    payload: press_payload.clone(),
                    qos,
                    retain,
                }]
            }

            _ => {
                warn!(
                    item = %self.record.config.name,
                    kind = %self.record.config.kind.label(),
                    ?command,
                    "Command not supported by item kind"
                );
                Vec::new()
            }
        }
    }

    /// The host changed the observable variable backing this item: publish
    /// it outward unchanged. Bidirectional, no parsing.
    pub fn variable_changed(&mut self, value: &str) -> Vec<Effect> {
        if !matches!(self.record.config.kind, KindConfig::Variable) {
            warn!(item = %self.record.config.name, "Variable write to non-variable item ignored");
            return Vec::new();
        }
        let topic = self.record.config.command_topic.trim();
        if topic.is_empty() {
            warn!(item = %self.record.config.name, "Variable write dropped: no command topic");
            return Vec::new();
        }
        // Remember the value so the broker echo does not re-notify the host
        self.state.last_value = Some(value.to_string());
        vec![Effect::Publish {
            topic: topic.to_string(),
            payload: value.to_string(),
            qos: self.record.config.qos,
            retain: self.record.config.retain,
        }]
    }
}

fn binary_effects(slots: &ItemSlots, on: bool) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(endpoint) = slots.endpoint {
        effects.push(Effect::SetBinary { endpoint, on });
    }
    if let Some(condition) = slots.condition {
        effects.push(Effect::SetCondition {
            condition,
            value: on,
        });
    }
    effects
}
