//! Item lifecycle orchestration.
//!
//! The driver owns every mutable component — store, registry, multiplexer,
//! host seam, live item models — and runs them from a single task. Each
//! event (inbound message, host command, configuration change, link
//! transition) runs to completion before the next begins, which is what
//! makes the registry's read-modify-write persistence safe.
//!
//! Entity transitions return [`Effect`] values; the driver is the only place
//! they are applied, routing publishes to the multiplexer and everything
//! else to the host.

use crate::host::{Host, SlotKind};
use crate::item::{
    Command, ConfigError, Effect, ItemConfig, ItemModel, ItemRecord, ItemSlots, KindConfig,
};
use crate::mux::{BrokerLink, LinkState, TopicMultiplexer};
use crate::registry::{IdentityRegistry, RegistryError};
use crate::store::Store;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod shell;

pub use shell::run;

const NS_ENDPOINTS: &str = "endpoints";
const NS_TRIGGERS: &str = "triggers";
const NS_CONDITIONS: &str = "conditions";
const NS_VARIABLES: &str = "variables";

const NEXT_ITEM_KEY: &str = "next_item_id";

/// Item lifecycle failures.
#[derive(Debug)]
pub enum ItemError {
    Config(ConfigError),
    DuplicateName(String),
    KindChanged,
    UnknownItem(u32),
    Registry(RegistryError),
    Store(anyhow::Error),
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemError::Config(e) => write!(f, "{}", e),
            ItemError::DuplicateName(name) => {
                write!(f, "an item named '{}' already exists", name)
            }
            ItemError::KindChanged => f.write_str("item kind cannot be changed"),
            ItemError::UnknownItem(id) => write!(f, "no item with id {}", id),
            ItemError::Registry(e) => write!(f, "{}", e),
            ItemError::Store(e) => write!(f, "store failure: {}", e),
        }
    }
}

impl std::error::Error for ItemError {}

impl From<ConfigError> for ItemError {
    fn from(e: ConfigError) -> Self {
        ItemError::Config(e)
    }
}

impl From<RegistryError> for ItemError {
    fn from(e: RegistryError) -> Self {
        ItemError::Registry(e)
    }
}

pub struct Driver<L, H> {
    store: Arc<Store>,
    registry: IdentityRegistry,
    mux: TopicMultiplexer<L>,
    host: H,
    items: BTreeMap<u32, ItemModel>,
    next_item_id: u32,
    configured: bool,
}

impl<L: BrokerLink, H: Host> Driver<L, H> {
    pub fn new(store: Arc<Store>, link: L, host: H, configured: bool) -> anyhow::Result<Self> {
        let registry = IdentityRegistry::load(store.clone())?;
        Ok(Self {
            store,
            registry,
            mux: TopicMultiplexer::new(link),
            host,
            items: BTreeMap::new(),
            next_item_id: 1,
            configured,
        })
    }

    pub fn item(&self, id: u32) -> Option<&ItemModel> {
        self.items.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemModel> {
        self.items.values()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn mux(&self) -> &TopicMultiplexer<L> {
        &self.mux
    }

    /// Boot-time restore: reconcile the registry against the host, then
    /// re-materialize every persisted item in ascending id order and
    /// re-establish its subscription.
    pub fn restore(&mut self) -> anyhow::Result<()> {
        self.registry.restore(&mut self.host)?;

        self.next_item_id = self.store.get_record(NEXT_ITEM_KEY)?.unwrap_or(1);

        let mut records = Vec::new();
        for (key, value) in self.store.load_prefix("item/")? {
            match serde_json::from_value::<ItemRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt item record"),
            }
        }
        // Keys sort as strings; ids must drive the order
        records.sort_by_key(|r| r.id);

        for record in records {
            self.next_item_id = self.next_item_id.max(record.id + 1);
            let slots = match self.allocate_slots(record.id, &record.config) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(item = %record.config.name, error = %e, "Slot restore failed, item skipped");
                    continue;
                }
            };
            let mut model = ItemModel::new(record, slots);
            self.attach(&mut model);
            self.items.insert(model.id(), model);
        }

        info!(items = self.items.len(), "Items restored");
        Ok(())
    }

    /// Creates an item: validate, allocate registry slots, persist, attach.
    pub fn add_item(&mut self, config: ItemConfig) -> Result<u32, ItemError> {
        config.validate()?;
        self.ensure_unique_name(&config.name, None)?;

        let id = self.next_item_id;
        let slots = self.allocate_slots(id, &config)?;

        let record = ItemRecord {
            id,
            created_at: Utc::now(),
            config,
        };
        if let Err(e) = self.store.put_record(&item_key(id), &record) {
            // Roll the slots back so a failed create leaves nothing behind
            self.release_slots(id);
            return Err(ItemError::Store(e));
        }

        self.next_item_id = id + 1;
        if let Err(e) = self.store.put_record(NEXT_ITEM_KEY, &self.next_item_id) {
            warn!(error = %e, "Failed to persist item id high-water mark");
        }

        let mut model = ItemModel::new(record, slots);
        model.set_link(self.mux.state() == LinkState::Connected);
        self.attach(&mut model);

        info!(item = %model.name(), id, kind = %model.config().kind.label(), "Item added");
        self.items.insert(id, model);
        Ok(id)
    }

    /// Deletes an item, freeing its registry slots (tombstoning where the
    /// kind requires it) and its subscriptions.
    pub fn remove_item(&mut self, id: u32) -> Result<(), ItemError> {
        let Some(model) = self.items.remove(&id) else {
            return Err(ItemError::UnknownItem(id));
        };

        self.mux.remove_subscriber(id);
        self.release_slots(id);
        self.store
            .remove(&item_key(id))
            .map_err(ItemError::Store)?;

        info!(item = %model.name(), id, "Item removed");
        Ok(())
    }

    /// Mutates an item in place. The permanent id and its slot assignments
    /// are untouched; a changed state topic rebinds the subscription and
    /// discards runtime state.
    pub fn reconfigure_item(&mut self, id: u32, config: ItemConfig) -> Result<(), ItemError> {
        config.validate()?;
        self.ensure_unique_name(&config.name, Some(id))?;

        let Some(model) = self.items.get_mut(&id) else {
            return Err(ItemError::UnknownItem(id));
        };
        if model.config().kind.label() != config.kind.label() {
            return Err(ItemError::KindChanged);
        }

        let old_topic = model.state_topic().to_string();
        let renamed = model.name() != config.name;
        let rebind = model.apply_config(config);
        let record = model.record().clone();

        self.store
            .put_record(&item_key(id), &record)
            .map_err(ItemError::Store)?;

        if renamed {
            self.rename_slots(id, record.config.name.trim());
        }

        if rebind {
            if !old_topic.is_empty() {
                self.mux.unsubscribe(&old_topic, id);
            }
            let new_topic = record.config.state_topic.trim().to_string();
            if !new_topic.is_empty() {
                if let Some(cached) = self.mux.subscribe(&new_topic, id, record.config.qos) {
                    if let Some(model) = self.items.get_mut(&id) {
                        let effects = model.on_message(&cached.payload);
                        self.apply_effects(id, effects);
                    }
                }
            }
            debug!(item = id, old = %old_topic, new = %record.config.state_topic, "State topic rebound");
        }

        info!(item = %record.config.name, id, "Item reconfigured");
        Ok(())
    }

    /// Inbound message from the broker: cache, fan out by exact topic, run
    /// each target entity's pipeline and apply the resulting effects.
    pub fn handle_incoming(&mut self, topic: &str, payload: &str, qos: u8, retain: bool) {
        let targets = self.mux.handle_incoming(topic, payload, qos, retain);
        for id in targets {
            let effects = match self.items.get_mut(&id) {
                Some(model) => model.on_message(payload),
                None => continue,
            };
            self.apply_effects(id, effects);
        }
    }

    /// Host-initiated command against an item.
    pub fn command(&mut self, id: u32, command: Command) -> Result<(), ItemError> {
        let effects = match self.items.get_mut(&id) {
            Some(model) => model.command(command),
            None => return Err(ItemError::UnknownItem(id)),
        };
        self.apply_effects(id, effects);
        Ok(())
    }

    /// The host changed an observable variable; route it to the owning item
    /// for outbound publication.
    pub fn variable_changed(&mut self, variable: u32, value: &str) {
        let owner = self
            .items
            .values()
            .find(|m| {
                m.slots().variable == Some(variable)
                    && matches!(m.config().kind, KindConfig::Variable)
            })
            .map(|m| m.id());
        let Some(id) = owner else {
            debug!(variable, "Variable write without owning item");
            return;
        };
        let effects = match self.items.get_mut(&id) {
            Some(model) => model.variable_changed(value),
            None => return,
        };
        self.apply_effects(id, effects);
    }

    /// A connect attempt is underway.
    pub fn link_connecting(&mut self) {
        self.mux.link_connecting();
        info!("Connecting to broker");
    }

    /// Handshake completed: resubscribe, then notify every item.
    pub fn link_up(&mut self) {
        self.mux.link_up();
        for model in self.items.values_mut() {
            model.set_link(true);
        }
        info!("Broker connected");
    }

    /// Connection lost: notify every item before the socket goes away.
    /// Idempotent — repeated failures while already down stay quiet.
    pub fn link_down(&mut self) {
        if self.mux.state() == LinkState::Disconnected {
            return;
        }
        for model in self.items.values_mut() {
            model.set_link(false);
        }
        self.mux.link_down();
        info!("Broker disconnected");
    }

    /// User-visible connection status.
    pub fn status(&self) -> String {
        if !self.configured {
            return "Not configured".to_string();
        }
        match self.mux.state() {
            LinkState::Disconnected => "Disconnected".to_string(),
            LinkState::Connecting => "Connecting".to_string(),
            LinkState::Connected => match self.mux.degraded_topics().next() {
                Some(topic) => format!("Connected (degraded: missing topic {})", topic),
                None => "Connected".to_string(),
            },
        }
    }

    /// Subscribes the model's state topic; a cached message replays through
    /// the pipeline immediately.
    fn attach(&mut self, model: &mut ItemModel) {
        let topic = model.state_topic().to_string();
        if topic.is_empty() {
            return;
        }
        if let Some(cached) = self.mux.subscribe(&topic, model.id(), model.config().qos) {
            let effects = model.on_message(&cached.payload);
            self.apply_effects(model.id(), effects);
        }
    }

    fn apply_effects(&mut self, item: u32, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                } => {
                    if let Err(e) = self.mux.publish(&topic, &payload, qos, retain) {
                        warn!(item, topic = %topic, error = %e, "Publish dropped");
                    }
                }
                Effect::SetBinary { endpoint, on } => self.host.set_binary(endpoint, on),
                Effect::SetCondition { condition, value } => {
                    self.host.set_condition(condition, value)
                }
                Effect::Pulse { endpoint } => self.host.pulse(endpoint),
                Effect::FireTrigger { trigger, token } => {
                    self.host.fire_trigger(trigger, &token)
                }
                Effect::SetVariable { variable, value } => {
                    self.host.set_variable(variable, &value)
                }
                Effect::PushMeasurement {
                    endpoint,
                    value,
                    unit,
                } => self.host.push_measurement(endpoint, value, unit),
            }
        }
    }

    fn ensure_unique_name(&self, name: &str, exclude: Option<u32>) -> Result<(), ItemError> {
        let name = name.trim();
        for model in self.items.values() {
            if Some(model.id()) == exclude {
                continue;
            }
            if model.name().trim() == name {
                return Err(ItemError::DuplicateName(name.to_string()));
            }
        }
        Ok(())
    }

    /// Allocates (or re-resolves, on restore) the registry slots an item's
    /// kind requires. A partial failure rolls back what was allocated.
    fn allocate_slots(&mut self, id: u32, config: &ItemConfig) -> Result<ItemSlots, ItemError> {
        match self.try_allocate_slots(&item_key(id), config) {
            Ok(slots) => Ok(slots),
            Err(e) => {
                error!(item = %config.name, error = %e, "Slot allocation failed");
                self.release_slots(id);
                Err(e)
            }
        }
    }

    fn try_allocate_slots(&mut self, key: &str, config: &ItemConfig) -> Result<ItemSlots, ItemError> {
        let name = config.name.trim();
        let mut slots = ItemSlots::default();
        match &config.kind {
            KindConfig::Relay { .. } | KindConfig::Contact { .. } => {
                slots.endpoint = Some(self.slot(NS_ENDPOINTS, key, SlotKind::Endpoint, name)?);
                let condition_name = format!("{} state", name);
                slots.condition =
                    Some(self.slot(NS_CONDITIONS, key, SlotKind::Condition, &condition_name)?);
            }
            KindConfig::Button { .. } => {
                slots.endpoint = Some(self.slot(NS_ENDPOINTS, key, SlotKind::Endpoint, name)?);
            }
            KindConfig::Event { .. } => {
                slots.endpoint = Some(self.slot(NS_ENDPOINTS, key, SlotKind::Endpoint, name)?);
                slots.trigger = Some(self.slot(NS_TRIGGERS, key, SlotKind::Trigger, name)?);
            }
            KindConfig::Variable => {
                slots.variable = Some(self.slot(NS_VARIABLES, key, SlotKind::Variable, name)?);
            }
            KindConfig::Sensor { .. } => {
                slots.endpoint = Some(self.slot(NS_ENDPOINTS, key, SlotKind::Endpoint, name)?);
                slots.variable = Some(self.slot(NS_VARIABLES, key, SlotKind::Variable, name)?);
            }
        }
        Ok(slots)
    }

    fn slot(&mut self, namespace: &str, key: &str, kind: SlotKind, name: &str) -> Result<u32, ItemError> {
        Ok(self
            .registry
            .get_or_create(&mut self.host, namespace, key, kind, name)?
            .id)
    }

    fn rename_slots(&mut self, id: u32, name: &str) {
        let key = item_key(id);
        let renames = [
            (NS_ENDPOINTS, name.to_string()),
            (NS_TRIGGERS, name.to_string()),
            (NS_CONDITIONS, format!("{} state", name)),
            (NS_VARIABLES, name.to_string()),
        ];
        for (ns, slot_name) in renames {
            if let Err(e) = self.registry.rename(&mut self.host, ns, &key, &slot_name) {
                warn!(namespace = ns, key = %key, error = %e, "Slot rename failed");
            }
        }
    }

    fn release_slots(&mut self, id: u32) {
        let key = item_key(id);
        for ns in [NS_ENDPOINTS, NS_TRIGGERS, NS_CONDITIONS, NS_VARIABLES] {
            if let Err(e) = self.registry.delete(&mut self.host, ns, &key) {
                warn!(namespace = ns, key = %key, error = %e, "Slot release failed");
            }
        }
    }
}

fn item_key(id: u32) -> String {
    format!("item/{}", id)
}
