//! # Shared Memory Mirror
//!
//! A locally writable field table kept eventually consistent with a
//! remote peer's copy via field deltas. Field indices come from an
//! explicit compile-time registry ([`FieldSchema`]) so index stability
//! across endpoints is guaranteed by construction rather than by any
//! runtime introspection order.
//!
//! ## Consistency model
//! Deltas apply last-write-wins with no ordering guarantee stronger
//! than the transport's own. Field-granular updates mean two mirrors
//! can transiently disagree on the interleaving of a multi-field
//! logical update. Bidirectional mirroring does not partition field
//! ownership between the directions; if both sides write the same
//! field concurrently the final value is non-deterministic. Callers
//! that need single-writer fields must enforce that convention
//! themselves.

pub mod sync;

pub use sync::MirrorSession;

use crate::core::Value;
use crate::error::{constants, CommError, Result};
use std::sync::Mutex;
use tracing::trace;

/// One registered field: stable 1-based index, name, wire type and the
/// default its slot resets to.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub index: u16,
    pub name: &'static str,
    pub type_tag: u8,
    pub default: fn() -> Value,
}

/// Ordered field registry for one mirrored type. Indices must be the
/// contiguous range `1..=N` and names unique; both communicating
/// endpoints must register the identical table.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    fields: Vec<FieldDef>,
}

impl FieldSchema {
    /// Build and validate a schema. Fields are sorted by index.
    pub fn new(mut fields: Vec<FieldDef>) -> Result<Self> {
        if fields.is_empty() {
            return Err(CommError::Config(
                "Field schema must register at least one field".to_string(),
            ));
        }

        fields.sort_by_key(|f| f.index);
        for (pos, field) in fields.iter().enumerate() {
            let expected = (pos + 1) as u16;
            if field.index != expected {
                return Err(CommError::Config(format!(
                    "Field indices must be contiguous from 1: expected {expected}, found {} ('{}')",
                    field.index, field.name
                )));
            }
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(CommError::Config(format!(
                    "Duplicate field name in schema: '{}'",
                    field.name
                )));
            }
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Table position for a field name
    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Implemented once per mirrored type; returns its field registry.
pub trait Mirrored {
    fn schema() -> Result<FieldSchema>;
}

#[derive(Debug)]
struct Slot {
    value: Value,
    dirty: bool,
}

/// The mirror table: one `(value, dirty)` slot per registered field,
/// guarded by a single lock so a read-then-clear-dirty sequence is
/// atomic with respect to concurrent writes.
#[derive(Debug)]
pub struct SharedMemory {
    schema: FieldSchema,
    slots: Mutex<Vec<Slot>>,
}

impl SharedMemory {
    /// Build a mirror with every slot at its registered default.
    pub fn from_schema(schema: FieldSchema) -> Self {
        let slots = schema
            .fields
            .iter()
            .map(|f| Slot {
                value: (f.default)(),
                dirty: false,
            })
            .collect();
        Self {
            schema,
            slots: Mutex::new(slots),
        }
    }

    /// Convenience constructor from a [`Mirrored`] type.
    pub fn for_type<T: Mirrored>() -> Result<Self> {
        Ok(Self::from_schema(T::schema()?))
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Update a field by name and mark it dirty. The value's wire tag
    /// must match the registered type; `Null` is accepted for any field.
    pub fn set_field(&self, name: &str, value: Value) -> Result<()> {
        let pos = self
            .schema
            .position(name)
            .ok_or_else(|| CommError::UnknownField(name.to_string()))?;
        self.check_type(pos, &value)?;

        let mut slots = self.lock();
        slots[pos].value = value;
        slots[pos].dirty = true;
        trace!(field = name, "Field updated");
        Ok(())
    }

    /// Current value of a field by name
    pub fn get_field(&self, name: &str) -> Result<Value> {
        let pos = self
            .schema
            .position(name)
            .ok_or_else(|| CommError::UnknownField(name.to_string()))?;
        Ok(self.lock()[pos].value.clone())
    }

    /// Dirty field names in ascending index order. With `reset_dirty`
    /// the flags are cleared atomically with the read, so no update is
    /// lost or reported twice.
    pub fn changed_fields(&self, reset_dirty: bool) -> Vec<String> {
        let mut slots = self.lock();
        let mut names = Vec::new();
        for (pos, slot) in slots.iter_mut().enumerate() {
            if slot.dirty {
                names.push(self.schema.fields[pos].name.to_string());
                if reset_dirty {
                    slot.dirty = false;
                }
            }
        }
        names
    }

    /// Snapshot of dirty `(index, value)` pairs in ascending index
    /// order, for the sync driver. Values are cloned, not removed; with
    /// `reset` the dirty flags clear atomically with the read.
    pub fn take_changed(&self, reset: bool) -> Vec<(u16, Value)> {
        let mut slots = self.lock();
        let mut deltas = Vec::new();
        for (pos, slot) in slots.iter_mut().enumerate() {
            if slot.dirty {
                deltas.push((self.schema.fields[pos].index, slot.value.clone()));
                if reset {
                    slot.dirty = false;
                }
            }
        }
        deltas
    }

    /// Full-table snapshot in ascending index order when any field is
    /// dirty, for whole-object synchronization. All dirty flags clear
    /// atomically with the read; `None` means nothing changed since the
    /// last pass.
    pub fn snapshot_if_changed(&self) -> Option<Vec<Value>> {
        let mut slots = self.lock();
        if !slots.iter().any(|s| s.dirty) {
            return None;
        }
        for slot in slots.iter_mut() {
            slot.dirty = false;
        }
        Some(slots.iter().map(|s| s.value.clone()).collect())
    }

    /// Apply a received whole-object snapshot positionally. The value
    /// count must match the registered field count and every value is
    /// type-checked before any slot is written. Like [`apply_delta`]
    /// this never marks fields dirty.
    ///
    /// [`apply_delta`]: SharedMemory::apply_delta
    pub fn apply_object(&self, values: Vec<Value>) -> Result<()> {
        if values.len() != self.schema.fields.len() {
            return Err(CommError::Marshal(format!(
                "{}: expected {}, got {}",
                constants::ERR_OBJECT_ARITY,
                self.schema.fields.len(),
                values.len()
            )));
        }
        for (pos, value) in values.iter().enumerate() {
            self.check_type(pos, value)?;
        }

        let mut slots = self.lock();
        for (slot, value) in slots.iter_mut().zip(values) {
            slot.value = value;
        }
        trace!("Object snapshot applied");
        Ok(())
    }

    /// Apply a received delta by index, last-write-wins. Does NOT mark
    /// the field dirty: a received update must not echo back to the
    /// peer.
    pub fn apply_delta(&self, index: u16, value: Value) -> Result<()> {
        let pos = self.position_of_index(index)?;
        self.check_type(pos, &value)?;

        let mut slots = self.lock();
        slots[pos].value = value;
        trace!(index, "Delta applied");
        Ok(())
    }

    /// Re-flag a field dirty so the sync driver retries it on the next
    /// pass (used when the outbound box is full).
    pub fn mark_dirty(&self, index: u16) -> Result<()> {
        let pos = self.position_of_index(index)?;
        self.lock()[pos].dirty = true;
        Ok(())
    }

    /// Re-flag every field dirty so the next whole-object pass resends
    /// the then-current table (used when the outbound box is full).
    pub fn mark_all_dirty(&self) {
        for slot in self.lock().iter_mut() {
            slot.dirty = true;
        }
    }

    /// Deterministic `"Name = Value|Name = Value|..."` dump in ascending
    /// index order; the canonical equality check between mirrors.
    pub fn return_fields(&self) -> String {
        let slots = self.lock();
        self.schema
            .fields
            .iter()
            .zip(slots.iter())
            .map(|(field, slot)| format!("{} = {}", field.name, slot.value.render()))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Reset every slot to its registered default and clear all dirty
    /// flags. Fields are never deleted, only reset.
    pub fn empty_all_fields(&self) {
        let mut slots = self.lock();
        for (pos, slot) in slots.iter_mut().enumerate() {
            slot.value = (self.schema.fields[pos].default)();
            slot.dirty = false;
        }
    }

    fn position_of_index(&self, index: u16) -> Result<usize> {
        if index == 0 || index as usize > self.schema.fields.len() {
            return Err(CommError::Marshal(format!(
                "{}: {index}",
                constants::ERR_DELTA_INDEX_RANGE
            )));
        }
        Ok(index as usize - 1)
    }

    fn check_type(&self, pos: usize, value: &Value) -> Result<()> {
        let expected = self.schema.fields[pos].type_tag;
        if value.type_tag() != expected && !matches!(value, Value::Null) {
            return Err(CommError::Marshal(format!(
                "{}: field '{}' expects tag {expected:#04x}, got {} ({:#04x})",
                constants::ERR_FIELD_TYPE_MISMATCH,
                self.schema.fields[pos].name,
                value.type_name(),
                value.type_tag()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::tag;

    fn sensor_schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldDef {
                index: 1,
                name: "Counter",
                type_tag: tag::U32,
                default: || Value::U32(0),
            },
            FieldDef {
                index: 2,
                name: "Label",
                type_tag: tag::STR,
                default: || Value::Str(String::new()),
            },
            FieldDef {
                index: 3,
                name: "Active",
                type_tag: tag::BOOL,
                default: || Value::Bool(false),
            },
            FieldDef {
                index: 4,
                name: "Samples",
                type_tag: tag::LIST,
                default: || Value::List(vec![]),
            },
        ])
        .unwrap()
    }

    #[test]
    fn schema_rejects_index_gap() {
        let result = FieldSchema::new(vec![
            FieldDef {
                index: 1,
                name: "A",
                type_tag: tag::U8,
                default: || Value::U8(0),
            },
            FieldDef {
                index: 3,
                name: "B",
                type_tag: tag::U8,
                default: || Value::U8(0),
            },
        ]);
        assert!(matches!(result, Err(CommError::Config(_))));
    }

    #[test]
    fn schema_rejects_duplicate_name() {
        let result = FieldSchema::new(vec![
            FieldDef {
                index: 1,
                name: "A",
                type_tag: tag::U8,
                default: || Value::U8(0),
            },
            FieldDef {
                index: 2,
                name: "A",
                type_tag: tag::U8,
                default: || Value::U8(0),
            },
        ]);
        assert!(matches!(result, Err(CommError::Config(_))));
    }

    #[test]
    fn dirty_tracking_in_index_order() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        mirror.set_field("Active", Value::Bool(true)).unwrap();
        mirror.set_field("Counter", Value::U32(7)).unwrap();

        assert_eq!(mirror.changed_fields(true), vec!["Counter", "Active"]);
        assert!(mirror.changed_fields(true).is_empty());

        mirror.set_field("Label", Value::Str("x".into())).unwrap();
        assert_eq!(mirror.changed_fields(false), vec!["Label"]);
        assert_eq!(mirror.changed_fields(true), vec!["Label"]);
    }

    #[test]
    fn baseline_dump_uses_defaults() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        assert_eq!(
            mirror.return_fields(),
            "Counter = 0|Label = |Active = False|Samples = []"
        );
    }

    #[test]
    fn empty_all_restores_baseline() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        let baseline = mirror.return_fields();
        mirror.set_field("Counter", Value::U32(9)).unwrap();
        mirror
            .set_field("Samples", Value::List(vec![Value::Null, Value::U8(1)]))
            .unwrap();
        assert_ne!(mirror.return_fields(), baseline);

        mirror.empty_all_fields();
        assert_eq!(mirror.return_fields(), baseline);
        assert!(mirror.changed_fields(true).is_empty());
    }

    #[test]
    fn apply_delta_does_not_echo() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        mirror.apply_delta(1, Value::U32(42)).unwrap();
        assert_eq!(mirror.get_field("Counter").unwrap(), Value::U32(42));
        assert!(mirror.changed_fields(true).is_empty());
    }

    #[test]
    fn take_changed_clones_values() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        mirror.set_field("Counter", Value::U32(3)).unwrap();

        let deltas = mirror.take_changed(true);
        assert_eq!(deltas, vec![(1, Value::U32(3))]);
        // value stays in the slot after the snapshot
        assert_eq!(mirror.get_field("Counter").unwrap(), Value::U32(3));

        // re-marking makes the same value visible again
        mirror.mark_dirty(1).unwrap();
        assert_eq!(mirror.take_changed(true), vec![(1, Value::U32(3))]);
    }

    #[test]
    fn snapshot_covers_whole_table_and_resets_dirty() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        assert!(mirror.snapshot_if_changed().is_none());

        mirror.set_field("Counter", Value::U32(11)).unwrap();
        let snapshot = mirror.snapshot_if_changed().unwrap();
        assert_eq!(
            snapshot,
            vec![
                Value::U32(11),
                Value::Str(String::new()),
                Value::Bool(false),
                Value::List(vec![]),
            ]
        );
        assert!(mirror.snapshot_if_changed().is_none());

        // full-box retry path: the whole table resurfaces
        mirror.mark_all_dirty();
        assert_eq!(mirror.snapshot_if_changed().unwrap(), snapshot);
    }

    #[test]
    fn apply_object_converges_without_echo() {
        let local = SharedMemory::from_schema(sensor_schema());
        let remote = SharedMemory::from_schema(sensor_schema());

        local.set_field("Counter", Value::U32(3)).unwrap();
        local.set_field("Active", Value::Bool(true)).unwrap();

        let snapshot = local.snapshot_if_changed().unwrap();
        remote.apply_object(snapshot).unwrap();

        assert_eq!(remote.return_fields(), local.return_fields());
        assert!(remote.snapshot_if_changed().is_none());
    }

    #[test]
    fn apply_object_rejects_arity_and_type_mismatch() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        assert!(matches!(
            mirror.apply_object(vec![Value::U32(1)]),
            Err(CommError::Marshal(_))
        ));

        let before = mirror.return_fields();
        let result = mirror.apply_object(vec![
            Value::U32(1),
            Value::U32(2), // Label expects Str
            Value::Bool(true),
            Value::List(vec![]),
        ]);
        assert!(matches!(result, Err(CommError::Marshal(_))));
        // nothing may be written on a rejected snapshot
        assert_eq!(mirror.return_fields(), before);
    }

    #[test]
    fn type_mismatch_and_unknown_field() {
        let mirror = SharedMemory::from_schema(sensor_schema());
        assert!(matches!(
            mirror.set_field("Counter", Value::Str("no".into())),
            Err(CommError::Marshal(_))
        ));
        assert!(matches!(
            mirror.set_field("Missing", Value::U32(1)),
            Err(CommError::UnknownField(_))
        ));
        assert!(matches!(
            mirror.apply_delta(9, Value::U32(1)),
            Err(CommError::Marshal(_))
        ));
        // Null is accepted for any registered field
        mirror.set_field("Label", Value::Null).unwrap();
        assert_eq!(mirror.get_field("Label").unwrap(), Value::Null);
    }
}
