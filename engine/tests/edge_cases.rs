//! Edge case tests for stash-engine
//!
//! These tests cover boundary conditions and the outbox collapse laws.

use proptest::prelude::*;
use serde_json::json;
use stash_engine::{
    payload_from_value, AppendOutcome, EntityKey, LocalRecord, Mutation, MutationKind, Outbox,
    Payload, PersistedEntry,
};

fn fields(value: serde_json::Value) -> Payload {
    payload_from_value(value).unwrap()
}

// ============================================================================
// Collapse laws
// ============================================================================

#[test]
fn calendar_event_lifetime_before_flush_sends_nothing() {
    let mut outbox = Outbox::new();

    outbox.append(
        Mutation::insert("m-1", "events", "evt-1", fields(json!({"title": "Standup", "start": 900})), 1),
        false,
    );
    outbox.append(
        Mutation::update("m-2", "events", "evt-1", fields(json!({"start": 930})), 2),
        false,
    );
    outbox.append(
        Mutation::update("m-3", "events", "evt-1", fields(json!({"start": 1000})), 3),
        false,
    );
    let outcome = outbox.append(Mutation::delete("m-4", "events", "evt-1", 4), false);

    assert_eq!(outcome, AppendOutcome::Cancelled);
    assert!(outbox.is_empty());
    assert_eq!(outbox.list().count(), 0);
}

#[test]
fn three_writes_collapse_into_one_insert() {
    let mut outbox = Outbox::new();
    outbox.append(Mutation::insert("m-1", "events", "1", fields(json!({"title": "A"})), 1), false);
    outbox.append(Mutation::update("m-2", "events", "1", fields(json!({"title": "B"})), 2), false);
    outbox.append(Mutation::update("m-3", "events", "1", fields(json!({"color": "red"})), 3), false);

    let queued: Vec<_> = outbox.list().collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, MutationKind::Insert);
    assert_eq!(queued[0].payload, fields(json!({"title": "B", "color": "red"})));
}

#[test]
fn same_entity_id_in_different_tables_is_independent() {
    let mut outbox = Outbox::new();
    outbox.append(Mutation::insert("m-1", "events", "x", Payload::new(), 1), false);
    outbox.append(Mutation::insert("m-2", "calendars", "x", Payload::new(), 2), false);
    outbox.append(Mutation::delete("m-3", "events", "x", 3), false);

    assert_eq!(outbox.count(), 1);
    assert!(outbox.contains(&EntityKey::new("calendars", "x")));
}

// ============================================================================
// Payload edge cases
// ============================================================================

#[test]
fn unicode_and_nested_fields_survive_merge() {
    let mut outbox = Outbox::new();
    outbox.append(
        Mutation::insert("m-1", "events", "e", fields(json!({"title": "日本語テスト 🎉"})), 1),
        false,
    );
    outbox.append(
        Mutation::update(
            "m-2",
            "events",
            "e",
            fields(json!({"attendees": [{"name": "Ω"}], "meta": {"a": null}})),
            2,
        ),
        false,
    );

    let m = outbox.list().next().unwrap();
    assert_eq!(m.payload["title"], json!("日本語テスト 🎉"));
    assert_eq!(m.payload["attendees"][0]["name"], json!("Ω"));
    assert_eq!(m.payload["meta"], json!({"a": null}));
}

#[test]
fn null_overwrites_a_field() {
    let mut record = LocalRecord::new_local("events", "e", fields(json!({"location": "Room 1"})), 1);
    record.apply_local(&Mutation::update("m-2", "events", "e", fields(json!({"location": null})), 2));

    assert_eq!(record.fields["location"], serde_json::Value::Null);
}

#[test]
fn persisted_entries_restore_identically() {
    let mut outbox = Outbox::new();
    for i in 0..20 {
        outbox.append(
            Mutation::insert(format!("m-{i}"), "events", format!("e-{i}"), Payload::new(), i),
            false,
        );
    }

    let rows: Vec<_> = outbox
        .entries()
        .map(|e| PersistedEntry::new("alice", e.clone()).to_value().unwrap())
        .collect();
    let restored = Outbox::restore(
        rows.into_iter()
            .map(|v| PersistedEntry::from_value(v).unwrap().entry),
    )
    .unwrap();

    assert_eq!(restored.snapshot(), outbox.snapshot());
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Insert(u8, u8),
    Update(u8, u8),
    Delete(u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..4, any::<u8>()).prop_map(|(e, v)| Step::Insert(e, v)),
        (0u8..4, any::<u8>()).prop_map(|(e, v)| Step::Update(e, v)),
        (0u8..4).prop_map(Step::Delete),
    ]
}

fn to_mutation(i: usize, step: &Step) -> Mutation {
    let at = i as u64;
    match step {
        Step::Insert(e, v) => {
            Mutation::insert(format!("m-{i}"), "events", format!("e-{e}"), fields(json!({"v": v})), at)
        }
        Step::Update(e, v) => {
            Mutation::update(format!("m-{i}"), "events", format!("e-{e}"), fields(json!({"v": v})), at)
        }
        Step::Delete(e) => Mutation::delete(format!("m-{i}"), "events", format!("e-{e}"), at),
    }
}

proptest! {
    #[test]
    fn at_most_one_entry_per_entity(steps in prop::collection::vec(step(), 0..64)) {
        let mut outbox = Outbox::new();
        for (i, s) in steps.iter().enumerate() {
            outbox.append(to_mutation(i, s), i % 3 == 0);
        }

        let mut keys: Vec<_> = outbox.list().map(|m| m.key()).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(keys.len(), total);
        prop_assert_eq!(outbox.count(), total);
        prop_assert!(total <= 4);
    }

    #[test]
    fn lifetime_ending_in_delete_collapses_to_nothing(
        updates in prop::collection::vec(any::<u8>(), 0..16)
    ) {
        let mut outbox = Outbox::new();
        outbox.append(Mutation::insert("m-0", "events", "e", Payload::new(), 0), false);
        for (i, v) in updates.iter().enumerate() {
            outbox.append(
                Mutation::update(format!("m-{}", i + 1), "events", "e", fields(json!({"v": v})), i as u64 + 1),
                false,
            );
        }
        outbox.append(Mutation::delete("m-last", "events", "e", 100), false);

        prop_assert!(outbox.is_empty());
    }

    #[test]
    fn last_update_wins_per_field(values in prop::collection::vec(any::<u8>(), 1..16)) {
        let mut outbox = Outbox::new();
        for (i, v) in values.iter().enumerate() {
            outbox.append(
                Mutation::update(format!("m-{i}"), "events", "e", fields(json!({"v": v})), i as u64),
                true,
            );
        }

        let m = outbox.list().next().unwrap();
        prop_assert_eq!(&m.payload["v"], &json!(values[values.len() - 1]));
    }
}
