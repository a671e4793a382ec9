use super::*;
use crate::host::MemoryHost;

fn fresh() -> (Arc<Store>, IdentityRegistry, MemoryHost) {
    let store = Arc::new(Store::open(":memory:").unwrap());
    let registry = IdentityRegistry::load(store.clone()).unwrap();
    (store, registry, MemoryHost::new())
}

fn create_variable(
    registry: &mut IdentityRegistry,
    host: &mut MemoryHost,
    key: &str,
    name: &str,
) -> u32 {
    registry
        .get_or_create(host, "variables", key, SlotKind::Variable, name)
        .unwrap()
        .id
}

#[test]
fn test_get_or_create_returns_existing_unchanged() {
    let (_store, mut registry, mut host) = fresh();

    let first = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "lamp")
        .unwrap();
    let second = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "renamed")
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "lamp"); // existing record is not mutated
}

#[test]
fn test_endpoint_allocation_is_lowest_unused() {
    let (_store, mut registry, mut host) = fresh();
    let start = *SlotKind::Endpoint.range().start();

    let a = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "a")
        .unwrap();
    let b = registry
        .get_or_create(&mut host, "endpoints", "item/2", SlotKind::Endpoint, "b")
        .unwrap();
    assert_eq!(a.id, start);
    assert_eq!(b.id, start + 1);

    registry.delete(&mut host, "endpoints", "item/1").unwrap();
    let c = registry
        .get_or_create(&mut host, "endpoints", "item/3", SlotKind::Endpoint, "c")
        .unwrap();
    assert_eq!(c.id, start); // freed endpoint id is reallocated
}

#[test]
fn test_variable_ids_never_reused_after_trailing_delete() {
    let (_store, mut registry, mut host) = fresh();
    let start = *SlotKind::Variable.range().start();

    let a = create_variable(&mut registry, &mut host, "item/1", "a");
    assert_eq!(a, start);

    registry.delete(&mut host, "variables", "item/1").unwrap();
    // Trailing delete trims the record entirely
    assert!(registry.get("variables", "item/1").is_none());

    let b = create_variable(&mut registry, &mut host, "item/2", "b");
    assert_eq!(b, start + 1); // id is not reclaimed
}

#[test]
fn test_variable_sequence_never_shares_or_shifts_ids() {
    let (_store, mut registry, mut host) = fresh();
    let start = *SlotKind::Variable.range().start();

    let mut issued = Vec::new();
    for round in 0..5 {
        let key = format!("item/{}", round);
        let id = create_variable(&mut registry, &mut host, &key, "v");
        assert!(
            !issued.contains(&id),
            "id {} issued twice in round {}",
            id,
            round
        );
        issued.push(id);
        registry.delete(&mut host, "variables", &key).unwrap();
    }
    assert_eq!(issued, (start..start + 5).collect::<Vec<_>>());
}

#[test]
fn test_middle_delete_leaves_tombstone() {
    let (_store, mut registry, mut host) = fresh();

    let a = create_variable(&mut registry, &mut host, "item/1", "a");
    let b = create_variable(&mut registry, &mut host, "item/2", "b");
    let c = create_variable(&mut registry, &mut host, "item/3", "c");

    registry.delete(&mut host, "variables", "item/2").unwrap();

    let slot = registry.get("variables", "item/2").expect("tombstone kept");
    assert!(slot.tombstone);
    assert_eq!(slot.id, b);
    assert!(host.is_placeholder(SlotKind::Variable, b));

    // Earlier and later ids are untouched
    assert_eq!(registry.get("variables", "item/1").unwrap().id, a);
    assert_eq!(registry.get("variables", "item/3").unwrap().id, c);

    // Subsequent allocations stay strictly above everything ever issued
    let d = create_variable(&mut registry, &mut host, "item/4", "d");
    assert!(d > c);
}

#[test]
fn test_trailing_delete_trims_preceding_tombstones() {
    let (_store, mut registry, mut host) = fresh();

    create_variable(&mut registry, &mut host, "item/1", "a");
    create_variable(&mut registry, &mut host, "item/2", "b");
    let c = create_variable(&mut registry, &mut host, "item/3", "c");

    // Middle deletes leave tombstones behind the live tail
    registry.delete(&mut host, "variables", "item/2").unwrap();
    registry.delete(&mut host, "variables", "item/3").unwrap();

    // Deleting the tail made item/2's tombstone trailing too; both trim
    assert!(registry.get("variables", "item/2").is_none());
    assert!(registry.get("variables", "item/3").is_none());
    assert!(host.registered_ids(SlotKind::Variable).len() == 1);

    // Monotonicity survives the trim
    let d = create_variable(&mut registry, &mut host, "item/4", "d");
    assert!(d > c);
}

#[test]
fn test_high_water_mark_survives_reload() {
    let store = Arc::new(Store::open(":memory:").unwrap());
    let mut host = MemoryHost::new();

    let c;
    {
        let mut registry = IdentityRegistry::load(store.clone()).unwrap();
        create_variable(&mut registry, &mut host, "item/1", "a");
        create_variable(&mut registry, &mut host, "item/2", "b");
        c = create_variable(&mut registry, &mut host, "item/3", "c");
        registry.delete(&mut host, "variables", "item/3").unwrap();
    }

    let mut registry = IdentityRegistry::load(store).unwrap();
    let d = create_variable(&mut registry, &mut host, "item/4", "d");
    assert!(d > c);
}

#[test]
fn test_restore_reregisters_in_ascending_order_with_placeholders() {
    let store = Arc::new(Store::open(":memory:").unwrap());
    let mut host = MemoryHost::new();

    let (a, b, c);
    {
        let mut registry = IdentityRegistry::load(store.clone()).unwrap();
        a = create_variable(&mut registry, &mut host, "item/1", "a");
        b = create_variable(&mut registry, &mut host, "item/2", "b");
        c = create_variable(&mut registry, &mut host, "item/3", "c");
        registry.delete(&mut host, "variables", "item/2").unwrap();
    }

    // Boot: fresh host, fresh registry over the same store
    let mut registry = IdentityRegistry::load(store).unwrap();
    let mut host = MemoryHost::new();
    let summary = registry.restore(&mut host).unwrap();

    assert_eq!(summary.registered, 2);
    assert_eq!(summary.placeholders, 1);
    assert_eq!(summary.orphans_removed, 0);

    assert_eq!(host.slot_name(SlotKind::Variable, a), Some("a"));
    assert!(host.is_placeholder(SlotKind::Variable, b));
    assert_eq!(host.slot_name(SlotKind::Variable, c), Some("c"));

    // Re-registration happened strictly in ascending id order, tombstone
    // included — the host restores variable slots positionally
    let order: Vec<u32> = host.registration_log().iter().map(|(_, id)| *id).collect();
    assert_eq!(order, vec![a, b, c]);
}

#[test]
fn test_restore_removes_orphans_inside_managed_range_only() {
    let store = Arc::new(Store::open(":memory:").unwrap());
    let mut registry = IdentityRegistry::load(store).unwrap();
    let mut host = MemoryHost::new();

    let kept = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "kept")
        .unwrap()
        .id;

    // A leftover registration in the managed range with no persisted record,
    // and one outside the range that belongs to someone else
    let orphan = *SlotKind::Endpoint.range().end();
    let foreign = SlotKind::Endpoint.range().end() + 50;
    host.register(SlotKind::Endpoint, orphan, "stale");
    host.register(SlotKind::Endpoint, foreign, "someone else's");

    let summary = registry.restore(&mut host).unwrap();

    assert_eq!(summary.orphans_removed, 1);
    assert_eq!(host.slot_name(SlotKind::Endpoint, kept), Some("kept"));
    assert_eq!(host.slot_name(SlotKind::Endpoint, orphan), None);
    assert_eq!(
        host.slot_name(SlotKind::Endpoint, foreign),
        Some("someone else's")
    );
}

#[test]
fn test_range_exhaustion_fails_creation() {
    let (_store, mut registry, mut host) = fresh();
    let range = SlotKind::Trigger.range();

    for id in range.clone() {
        let key = format!("item/{}", id);
        registry
            .get_or_create(&mut host, "triggers", &key, SlotKind::Trigger, "t")
            .unwrap();
    }

    let overflow = registry.get_or_create(
        &mut host,
        "triggers",
        "item/overflow",
        SlotKind::Trigger,
        "t",
    );
    match overflow {
        Err(RegistryError::RangeExhausted(kind)) => assert_eq!(kind, SlotKind::Trigger),
        other => panic!("expected RangeExhausted, got {:?}", other.map(|s| s.id)),
    }
    // The failed creation left nothing behind
    assert!(registry.get("triggers", "item/overflow").is_none());
}

#[test]
fn test_kinds_allocate_independently() {
    let (_store, mut registry, mut host) = fresh();

    let endpoint = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "e")
        .unwrap();
    let condition = registry
        .get_or_create(&mut host, "conditions", "item/1", SlotKind::Condition, "c")
        .unwrap();
    let trigger = registry
        .get_or_create(&mut host, "triggers", "item/1", SlotKind::Trigger, "t")
        .unwrap();
    let variable = registry
        .get_or_create(&mut host, "variables", "item/1", SlotKind::Variable, "v")
        .unwrap();

    assert!(SlotKind::Endpoint.range().contains(&endpoint.id));
    assert!(SlotKind::Condition.range().contains(&condition.id));
    assert!(SlotKind::Trigger.range().contains(&trigger.id));
    assert!(SlotKind::Variable.range().contains(&variable.id));
}

#[test]
fn test_delete_unknown_slot_is_a_no_op() {
    let (_store, mut registry, mut host) = fresh();
    registry.delete(&mut host, "endpoints", "item/404").unwrap();
}

#[test]
fn test_rename_refreshes_host_registration() {
    let (_store, mut registry, mut host) = fresh();
    let slot = registry
        .get_or_create(&mut host, "endpoints", "item/1", SlotKind::Endpoint, "lamp")
        .unwrap();

    registry
        .rename(&mut host, "endpoints", "item/1", "ceiling lamp")
        .unwrap();

    assert_eq!(registry.get("endpoints", "item/1").unwrap().name, "ceiling lamp");
    assert_eq!(
        host.slot_name(SlotKind::Endpoint, slot.id),
        Some("ceiling lamp")
    );

    // Unknown keys are left alone
    registry
        .rename(&mut host, "endpoints", "item/404", "x")
        .unwrap();
}
