//! Integration tests for the shared-memory mirror table

#![allow(clippy::unwrap_used)]

use commlink::core::{tag, Value};
use commlink::error::Result;
use commlink::mirror::{FieldDef, FieldSchema, Mirrored, SharedMemory};

struct Telemetry;

impl Mirrored for Telemetry {
    fn schema() -> Result<FieldSchema> {
        FieldSchema::new(vec![
            FieldDef {
                index: 1,
                name: "Sequence",
                type_tag: tag::U64,
                default: || Value::U64(0),
            },
            FieldDef {
                index: 2,
                name: "Temperature",
                type_tag: tag::F64,
                default: || Value::F64(0.0),
            },
            FieldDef {
                index: 3,
                name: "Station",
                type_tag: tag::STR,
                default: || Value::Str(String::new()),
            },
            FieldDef {
                index: 4,
                name: "Alarms",
                type_tag: tag::LIST,
                default: || Value::List(vec![]),
            },
        ])
    }
}

#[test]
fn mirrored_type_builds_table() {
    let mirror = SharedMemory::for_type::<Telemetry>().unwrap();
    assert_eq!(mirror.schema().len(), 4);
    assert_eq!(
        mirror.return_fields(),
        "Sequence = 0|Temperature = 0|Station = |Alarms = []"
    );
}

#[test]
fn changed_fields_ascending_and_reset_once() {
    let mirror = SharedMemory::for_type::<Telemetry>().unwrap();
    mirror.set_field("Station", Value::Str("north".into())).unwrap();
    mirror.set_field("Sequence", Value::U64(1)).unwrap();

    assert_eq!(mirror.changed_fields(true), vec!["Sequence", "Station"]);
    assert!(mirror.changed_fields(true).is_empty());
}

#[test]
fn delta_transfer_converges_mirrors() {
    let local = SharedMemory::for_type::<Telemetry>().unwrap();
    let remote = SharedMemory::for_type::<Telemetry>().unwrap();

    local.set_field("Sequence", Value::U64(42)).unwrap();
    local.set_field("Temperature", Value::F64(21.5)).unwrap();
    local
        .set_field("Alarms", Value::List(vec![Value::Str("overtemp".into())]))
        .unwrap();

    for (index, value) in local.take_changed(true) {
        remote.apply_delta(index, value).unwrap();
    }

    assert_eq!(remote.return_fields(), local.return_fields());
    // applied deltas must not echo back from the remote side
    assert!(remote.take_changed(true).is_empty());
}

#[test]
fn object_snapshot_transfer_converges_mirrors() {
    let local = SharedMemory::for_type::<Telemetry>().unwrap();
    let remote = SharedMemory::for_type::<Telemetry>().unwrap();

    // a single dirty field carries the full table across
    local.set_field("Station", Value::Str("east".into())).unwrap();

    let snapshot = local.snapshot_if_changed().unwrap();
    assert_eq!(snapshot.len(), local.schema().len());
    remote.apply_object(snapshot).unwrap();

    assert_eq!(remote.return_fields(), local.return_fields());
    // applied snapshots must not echo back from the remote side
    assert!(remote.snapshot_if_changed().is_none());
    // and nothing dirty remains on the local side either
    assert!(local.snapshot_if_changed().is_none());
}

#[test]
fn last_write_wins_per_field() {
    let mirror = SharedMemory::for_type::<Telemetry>().unwrap();
    mirror.apply_delta(2, Value::F64(1.0)).unwrap();
    mirror.apply_delta(2, Value::F64(2.0)).unwrap();
    assert_eq!(mirror.get_field("Temperature").unwrap(), Value::F64(2.0));
}

#[test]
fn empty_all_resets_to_baseline() {
    let mirror = SharedMemory::for_type::<Telemetry>().unwrap();
    let baseline = mirror.return_fields();

    mirror.set_field("Sequence", Value::U64(7)).unwrap();
    mirror.set_field("Station", Value::Str("west".into())).unwrap();
    mirror.empty_all_fields();

    assert_eq!(mirror.return_fields(), baseline);
    assert!(mirror.changed_fields(true).is_empty());
}

#[test]
fn concurrent_writers_and_reader() {
    use std::sync::Arc;
    use std::thread;

    let mirror = Arc::new(SharedMemory::for_type::<Telemetry>().unwrap());
    let writers: Vec<_> = (0..4)
        .map(|t| {
            let mirror = mirror.clone();
            thread::spawn(move || {
                for i in 0..500u64 {
                    mirror.set_field("Sequence", Value::U64(t * 1000 + i)).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let mirror = mirror.clone();
        thread::spawn(move || {
            let mut observed = 0usize;
            for _ in 0..200 {
                observed += mirror.take_changed(true).len();
            }
            observed
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();

    // after the dust settles exactly one final drain sees the last write
    let rest = mirror.take_changed(true);
    assert!(rest.len() <= 1);
    assert!(mirror.take_changed(true).is_empty());
}
