//! Host platform seam.
//!
//! The host platform wires items into its automation layer through numbered
//! slots: connection points, fireable triggers, boolean test conditions and
//! observable variables. Automation rules reference slots by raw number, so
//! everything behind this trait treats slot ids as permanent once handed out.
//!
//! [`MemoryHost`] is the in-process implementation used by the standalone
//! binary and by tests; a platform integration supplies its own.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;


/// Kinds of numbered slot the host platform exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// Connection point wiring an item to other devices
    Endpoint,
    /// Fireable automation trigger
    Trigger,
    /// Boolean test condition
    Condition,
    /// Observable named value
    Variable,
}

impl SlotKind {
    pub const ALL: [SlotKind; 4] = [
        SlotKind::Endpoint,
        SlotKind::Trigger,
        SlotKind::Condition,
        SlotKind::Variable,
    ];

    /// Numeric id range this bridge manages for the kind. Host registrations
    /// outside the range belong to someone else and are never touched.
    pub fn range(self) -> RangeInclusive<u32> {
        match self {
            SlotKind::Endpoint => 1..=400,
            SlotKind::Trigger => 401..=600,
            SlotKind::Condition => 601..=800,
            SlotKind::Variable => 801..=1200,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SlotKind::Endpoint => "endpoint",
            SlotKind::Trigger => "trigger",
            SlotKind::Condition => "condition",
            SlotKind::Variable => "variable",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Measurement unit attached to values pushed through an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Percent,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Celsius => f.write_str("°C"),
            Unit::Fahrenheit => f.write_str("°F"),
            Unit::Percent => f.write_str("%"),
        }
    }
}

/// Narrow interface to the host platform's slot tables.
///
/// Registration calls are idempotent: registering an id that is already live
/// updates its name in place. The host performs its own change detection on
/// value writes, so delivering an unchanged value is harmless but the entity
/// layer still change-gates to keep automation quiet.
pub trait Host {
    /// Register (or refresh) a visible slot.
    fn register(&mut self, kind: SlotKind, id: u32, name: &str);

    /// Materialize an inert, hidden placeholder for a tombstoned slot id,
    /// preserving numbering without user visibility.
    fn register_placeholder(&mut self, kind: SlotKind, id: u32);

    /// Remove a registration entirely.
    fn unregister(&mut self, kind: SlotKind, id: u32);

    /// Ids currently registered for the kind, placeholders included.
    fn registered_ids(&self, kind: SlotKind) -> Vec<u32>;

    /// Set the binary state of a connection point.
    fn set_binary(&mut self, endpoint: u32, on: bool);

    /// Emit a momentary activation on a connection point.
    fn pulse(&mut self, endpoint: u32);

    /// Set a boolean test condition.
    fn set_condition(&mut self, condition: u32, value: bool);

    /// Fire a trigger, carrying the token that passed the filter.
    fn fire_trigger(&mut self, trigger: u32, token: &str);

    /// Set an observable variable.
    fn set_variable(&mut self, variable: u32, value: &str);

    /// Clear an observable variable's value.
    fn clear_variable(&mut self, variable: u32);

    /// Push a measurement with its unit through a connection point.
    fn push_measurement(&mut self, endpoint: u32, value: f64, unit: Unit);
}

#[derive(Clone, Debug, PartialEq)]
struct SlotEntry {
    name: String,
    placeholder: bool,
}

/// In-memory host: keeps slot tables and last-delivered values, and records
/// fired triggers, pulses, measurements and registrations in arrival order.
#[derive(Default)]
pub struct MemoryHost {
    slots: BTreeMap<(SlotKind, u32), SlotEntry>,
    binary: BTreeMap<u32, bool>,
    conditions: BTreeMap<u32, bool>,
    variables: BTreeMap<u32, String>,
    fired: Vec<(u32, String)>,
    pulses: Vec<u32>,
    measurements: Vec<(u32, f64, Unit)>,
    registration_log: Vec<(SlotKind, u32)>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_name(&self, kind: SlotKind, id: u32) -> Option<&str> {
        self.slots
            .get(&(kind, id))
            .filter(|e| !e.placeholder)
            .map(|e| e.name.as_str())
    }

    pub fn is_placeholder(&self, kind: SlotKind, id: u32) -> bool {
        self.slots
            .get(&(kind, id))
            .map(|e| e.placeholder)
            .unwrap_or(false)
    }

    pub fn binary_state(&self, endpoint: u32) -> Option<bool> {
        self.binary.get(&endpoint).copied()
    }

    pub fn condition_state(&self, condition: u32) -> Option<bool> {
        self.conditions.get(&condition).copied()
    }

    pub fn variable(&self, variable: u32) -> Option<&str> {
        self.variables.get(&variable).map(|s| s.as_str())
    }

    pub fn fired(&self) -> &[(u32, String)] {
        &self.fired
    }

    pub fn pulses(&self) -> &[u32] {
        &self.pulses
    }

    pub fn measurements(&self) -> &[(u32, f64, Unit)] {
        &self.measurements
    }

    /// Every register/placeholder call in arrival order.
    pub fn registration_log(&self) -> &[(SlotKind, u32)] {
        &self.registration_log
    }
}

impl Host for MemoryHost {
    fn register(&mut self, kind: SlotKind, id: u32, name: &str) {
        self.registration_log.push((kind, id));
        self.slots.insert(
            (kind, id),
            SlotEntry {
                name: name.to_string(),
                placeholder: false,
            },
        );
    }

    fn register_placeholder(&mut self, kind: SlotKind, id: u32) {
        self.registration_log.push((kind, id));
        self.slots.insert(
            (kind, id),
            SlotEntry {
                name: String::new(),
                placeholder: true,
            },
        );
        if kind == SlotKind::Variable {
            self.variables.remove(&id);
        }
    }

    fn unregister(&mut self, kind: SlotKind, id: u32) {
        self.slots.remove(&(kind, id));
        match kind {
            SlotKind::Endpoint => {
                self.binary.remove(&id);
            }
            SlotKind::Condition => {
                self.conditions.remove(&id);
            }
            SlotKind::Variable => {
                self.variables.remove(&id);
            }
            SlotKind::Trigger => {}
        }
    }

    fn registered_ids(&self, kind: SlotKind) -> Vec<u32> {
        self.slots
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect()
    }

    fn set_binary(&mut self, endpoint: u32, on: bool) {
        self.binary.insert(endpoint, on);
    }

    fn pulse(&mut self, endpoint: u32) {
        self.pulses.push(endpoint);
    }

    fn set_condition(&mut self, condition: u32, value: bool) {
        self.conditions.insert(condition, value);
    }

    fn fire_trigger(&mut self, trigger: u32, token: &str) {
        self.fired.push((trigger, token.to_string()));
    }

    fn set_variable(&mut self, variable: u32, value: &str) {
        self.variables.insert(variable, value.to_string());
    }

    fn clear_variable(&mut self, variable: u32) {
        self.variables.remove(&variable);
    }

    fn push_measurement(&mut self, endpoint: u32, value: f64, unit: Unit) {
        self.measurements.push((endpoint, value, unit));
    }
}
