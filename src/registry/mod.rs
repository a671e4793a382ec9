//! Stable id allocation for host platform slots.
//!
//! Four independent registries (connection points, triggers, conditions,
//! variables) map a `(namespace, key)` pair to a numeric id inside the kind's
//! managed range. Assignments are persisted, restored on boot and reconciled
//! against the host's live registrations. Automation rules reference these
//! ids by raw number, so an id is never reassigned to a different object
//! while a reference to it could still exist.
//!
//! Variable ids double as ordinal slot positions in the host's own restore
//! bookkeeping. Deleting a variable therefore leaves a tombstone instead of a
//! gap, and allocation for that kind is monotonic: a persisted high-water
//! mark guarantees trimmed trailing tombstones never re-expose their ids.

use crate::host::{Host, SlotKind};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// One persisted slot assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: u32,
    pub kind: SlotKind,
    pub name: String,
    #[serde(default)]
    pub tombstone: bool,
}

/// Registry failures surfaced to the operator.
#[derive(Debug)]
pub enum RegistryError {
    /// The kind's numeric range has no free id left.
    RangeExhausted(SlotKind),
    /// Persistence failed underneath the registry.
    Store(anyhow::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::RangeExhausted(kind) => {
                write!(f, "{} id range exhausted", kind)
            }
            RegistryError::Store(e) => write!(f, "registry store failure: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<anyhow::Error> for RegistryError {
    fn from(e: anyhow::Error) -> Self {
        RegistryError::Store(e)
    }
}

/// Counts reported by [`IdentityRegistry::restore`].
#[derive(Debug, Default, PartialEq)]
pub struct RestoreSummary {
    pub registered: usize,
    pub placeholders: usize,
    pub orphans_removed: usize,
}

const NEXT_VARIABLE_KEY: &str = "next_id/variable";

/// Persistent `(namespace, key)` → slot id map across all four kinds.
pub struct IdentityRegistry {
    store: Arc<Store>,
    slots: BTreeMap<(String, String), Slot>,
    next_variable_id: u32,
}

impl IdentityRegistry {
    /// Loads persisted slot assignments and the variable high-water mark.
    pub fn load(store: Arc<Store>) -> anyhow::Result<Self> {
        let mut slots = BTreeMap::new();
        for (storage_key, value) in store.load_prefix("slot/")? {
            let rest = &storage_key["slot/".len()..];
            let Some((namespace, key)) = rest.split_once('/') else {
                warn!(key = %storage_key, "Skipping malformed slot key");
                continue;
            };
            let slot: Slot = serde_json::from_value(value)?;
            slots.insert((namespace.to_string(), key.to_string()), slot);
        }

        let next_variable_id = store
            .get_record::<u32>(NEXT_VARIABLE_KEY)?
            .unwrap_or(*SlotKind::Variable.range().start());

        Ok(Self {
            store,
            slots,
            next_variable_id,
        })
    }

    /// Looks up an existing assignment.
    pub fn get(&self, namespace: &str, key: &str) -> Option<&Slot> {
        self.slots
            .get(&(namespace.to_string(), key.to_string()))
    }

    /// Returns the existing record unchanged if present, otherwise allocates
    /// an id in the kind's range, persists the assignment and registers it
    /// with the host.
    pub fn get_or_create(
        &mut self,
        host: &mut dyn Host,
        namespace: &str,
        key: &str,
        kind: SlotKind,
        name: &str,
    ) -> Result<Slot, RegistryError> {
        let map_key = (namespace.to_string(), key.to_string());

        if let Some(existing) = self.slots.get_mut(&map_key) {
            if existing.tombstone {
                // Keys embed permanent item ids, so a create against a
                // tombstoned key should be impossible. Revive in place to
                // keep the numbering intact rather than burning a fresh id.
                warn!(namespace, key, id = existing.id, "Reviving tombstoned slot");
                existing.tombstone = false;
                existing.name = name.to_string();
                let revived = existing.clone();
                self.persist_slot(namespace, key, &revived)?;
                host.register(revived.kind, revived.id, &revived.name);
                return Ok(revived);
            }
            return Ok(existing.clone());
        }

        let id = self.allocate(kind)?;
        let slot = Slot {
            id,
            kind,
            name: name.to_string(),
            tombstone: false,
        };
        self.persist_slot(namespace, key, &slot)?;
        if kind == SlotKind::Variable {
            self.next_variable_id = id + 1;
            self.store
                .put_record(NEXT_VARIABLE_KEY, &self.next_variable_id)
                .map_err(RegistryError::Store)?;
        }
        self.slots.insert(map_key, slot.clone());
        host.register(kind, id, name);
        debug!(namespace, key, kind = %kind, id, "Allocated slot");
        Ok(slot)
    }

    /// Removes the host registration and persisted record. Variable slots
    /// become tombstones to preserve ordinal position, unless they are the
    /// trailing allocation, in which case trailing tombstones are trimmed.
    pub fn delete(&mut self, host: &mut dyn Host, namespace: &str, key: &str) -> Result<(), RegistryError> {
        let map_key = (namespace.to_string(), key.to_string());
        let Some(slot) = self.slots.get(&map_key).cloned() else {
            debug!(namespace, key, "Delete of unknown slot ignored");
            return Ok(());
        };

        if slot.kind != SlotKind::Variable {
            host.unregister(slot.kind, slot.id);
            self.remove_slot(&map_key)?;
            return Ok(());
        }

        let trailing = !self
            .slots
            .values()
            .any(|s| s.kind == SlotKind::Variable && s.id > slot.id);

        if trailing {
            host.unregister(SlotKind::Variable, slot.id);
            self.remove_slot(&map_key)?;
            self.trim_trailing_tombstones(host)?;
        } else {
            host.register_placeholder(SlotKind::Variable, slot.id);
            if let Some(entry) = self.slots.get_mut(&map_key) {
                entry.tombstone = true;
                entry.name.clear();
                let tombstoned = entry.clone();
                self.persist_slot(namespace, key, &tombstoned)?;
            }
        }
        Ok(())
    }

    /// Renames a live slot, refreshing the host registration. The id is
    /// untouched; unknown or tombstoned slots are left alone.
    pub fn rename(
        &mut self,
        host: &mut dyn Host,
        namespace: &str,
        key: &str,
        name: &str,
    ) -> Result<(), RegistryError> {
        let map_key = (namespace.to_string(), key.to_string());
        let updated = match self.slots.get_mut(&map_key) {
            Some(slot) if !slot.tombstone && slot.name != name => {
                slot.name = name.to_string();
                slot.clone()
            }
            _ => return Ok(()),
        };
        self.persist_slot(namespace, key, &updated)?;
        host.register(updated.kind, updated.id, &updated.name);
        Ok(())
    }

    /// Re-registers every persisted record with the host in ascending id
    /// order, re-materializes tombstones as inert placeholders, and removes
    /// live host registrations inside a managed range that have no persisted
    /// record. Ascending order is required: the host restores variable slots
    /// positionally, and out-of-order re-registration corrupts that mapping.
    pub fn restore(&mut self, host: &mut dyn Host) -> Result<RestoreSummary, RegistryError> {
        let mut summary = RestoreSummary::default();

        let mut ordered: Vec<&Slot> = self.slots.values().collect();
        ordered.sort_by_key(|s| s.id);

        for slot in ordered {
            if slot.tombstone {
                host.register_placeholder(slot.kind, slot.id);
                summary.placeholders += 1;
            } else {
                host.register(slot.kind, slot.id, &slot.name);
                summary.registered += 1;
            }
        }

        for kind in SlotKind::ALL {
            let persisted: BTreeSet<u32> = self
                .slots
                .values()
                .filter(|s| s.kind == kind)
                .map(|s| s.id)
                .collect();
            for id in host.registered_ids(kind) {
                if kind.range().contains(&id) && !persisted.contains(&id) {
                    warn!(kind = %kind, id, "Removing orphaned host registration");
                    host.unregister(kind, id);
                    summary.orphans_removed += 1;
                }
            }
        }

        info!(
            registered = summary.registered,
            placeholders = summary.placeholders,
            orphans_removed = summary.orphans_removed,
            "Registry restored"
        );
        Ok(summary)
    }

    fn allocate(&self, kind: SlotKind) -> Result<u32, RegistryError> {
        let range = kind.range();
        if kind == SlotKind::Variable {
            // Monotonic: tombstones count as used and the persisted
            // high-water mark outlives trailing trims, so an id handed to
            // automation is never handed out again.
            let floor = self
                .slots
                .values()
                .filter(|s| s.kind == SlotKind::Variable)
                .map(|s| s.id + 1)
                .max()
                .unwrap_or(*range.start());
            let id = self.next_variable_id.max(floor);
            if !range.contains(&id) {
                return Err(RegistryError::RangeExhausted(kind));
            }
            return Ok(id);
        }

        let used: BTreeSet<u32> = self
            .slots
            .values()
            .filter(|s| s.kind == kind)
            .map(|s| s.id)
            .collect();
        range
            .clone()
            .find(|id| !used.contains(id))
            .ok_or(RegistryError::RangeExhausted(kind))
    }

    fn trim_trailing_tombstones(&mut self, host: &mut dyn Host) -> Result<(), RegistryError> {
        loop {
            let Some((map_key, slot)) = self
                .slots
                .iter()
                .filter(|(_, s)| s.kind == SlotKind::Variable)
                .max_by_key(|(_, s)| s.id)
                .map(|(k, s)| (k.clone(), s.clone()))
            else {
                return Ok(());
            };
            if !slot.tombstone {
                return Ok(());
            }
            host.unregister(SlotKind::Variable, slot.id);
            self.remove_slot(&map_key)?;
        }
    }

    fn persist_slot(&self, namespace: &str, key: &str, slot: &Slot) -> Result<(), RegistryError> {
        self.store
            .put_record(&storage_key(namespace, key), slot)
            .map_err(RegistryError::Store)
    }

    fn remove_slot(&mut self, map_key: &(String, String)) -> Result<(), RegistryError> {
        self.store
            .remove(&storage_key(&map_key.0, &map_key.1))
            .map_err(RegistryError::Store)?;
        self.slots.remove(map_key);
        Ok(())
    }
}

fn storage_key(namespace: &str, key: &str) -> String {
    format!("slot/{}/{}", namespace, key)
}
