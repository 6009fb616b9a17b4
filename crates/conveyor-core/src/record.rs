//! The record and batch value types shared by the coordinator, the workers,
//! and the plugin ABI.

use std::borrow::Cow;

/// Size of the fixed name field inside a [`Record`].
pub const RECORD_NAME_LEN: usize = 100;

/// One fixed-layout record.
///
/// The layout is part of the plugin ABI and of the batch wire format:
/// `id` (i32), `name` (100 bytes, NUL-terminated), `value` (f64),
/// `category` (i32) — 116 bytes on every target. `packed(4)` removes the
/// tail padding an 8-aligned struct would carry; every field still sits at
/// its naturally aligned offset.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct Record {
    pub id: i32,
    pub name: [u8; RECORD_NAME_LEN],
    pub value: f64,
    pub category: i32,
}

impl Record {
    /// Create a record. `name` is truncated to fit the fixed field and is
    /// always NUL-terminated.
    pub fn new(id: i32, name: &str, value: f64, category: i32) -> Self {
        let mut record = Record {
            id,
            name: [0u8; RECORD_NAME_LEN],
            value,
            category,
        };
        record.set_name(name);
        record
    }

    /// The name up to its NUL terminator.
    pub fn name(&self) -> Cow<'_, str> {
        let bytes = &self.name;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end])
    }

    /// Overwrite the name, truncating to 99 bytes so the terminator always
    /// fits.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; RECORD_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(RECORD_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }
}

impl Default for Record {
    fn default() -> Self {
        Record {
            id: 0,
            name: [0u8; RECORD_NAME_LEN],
            value: 0.0,
            category: 0,
        }
    }
}

// Manual impls: `value` is 8-aligned and may not be borrowed out of a
// packed(4) struct, so fields are copied out first.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        let (lv, rv) = (self.value, other.value);
        let (li, ri) = (self.id, other.id);
        let (lc, rc) = (self.category, other.category);
        li == ri && lc == rc && lv == rv && self.name == other.name
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = self.value;
        let id = self.id;
        let category = self.category;
        f.debug_struct("Record")
            .field("id", &id)
            .field("name", &self.name())
            .field("value", &value)
            .field("category", &category)
            .finish()
    }
}

/// A bounded, mutable array of records with a stable identifier.
///
/// The capacity is fixed at construction; stages may mutate records in place
/// and may change `count` only within `[0, capacity]`.
pub struct Batch {
    records: Box<[Record]>,
    count: usize,
    batch_id: i32,
}

impl Batch {
    /// Allocate an empty batch with the given fixed capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Batch {
            records: vec![Record::default(); capacity].into_boxed_slice(),
            count: 0,
            batch_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.records.len()
    }

    pub fn batch_id(&self) -> i32 {
        self.batch_id
    }

    pub fn set_batch_id(&mut self, batch_id: i32) {
        self.batch_id = batch_id;
    }

    /// Append a record. Returns `false` when the batch is full.
    pub fn push(&mut self, record: Record) -> bool {
        if self.count == self.records.len() {
            return false;
        }
        self.records[self.count] = record;
        self.count += 1;
        true
    }

    /// Set the live record count. Returns `false` when `count` exceeds the
    /// capacity; the batch is left unchanged in that case.
    pub fn set_count(&mut self, count: usize) -> bool {
        if count > self.records.len() {
            return false;
        }
        self.count = count;
        true
    }

    /// The live records.
    pub fn records(&self) -> &[Record] {
        &self.records[..self.count]
    }

    /// The live records, mutable.
    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records[..self.count]
    }

    /// The full backing storage, independent of `count`. Used when decoding
    /// a frame in place and when handing the buffer across the plugin ABI.
    pub fn storage_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.batch_id = 0;
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("batch_id", &self.batch_id)
            .field("count", &self.count)
            .field("capacity", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_exactly_116_bytes() {
        assert_eq!(std::mem::size_of::<Record>(), 116);
    }

    #[test]
    fn record_name_is_always_terminated() {
        let long = "x".repeat(200);
        let record = Record::new(1, &long, 0.0, 1);
        assert!(record.name.contains(&0));
        assert_eq!(record.name().len(), RECORD_NAME_LEN - 1);
    }

    #[test]
    fn batch_push_respects_capacity() {
        let mut batch = Batch::with_capacity(2);
        assert!(batch.push(Record::new(1, "a", 1.0, 1)));
        assert!(batch.push(Record::new(2, "b", 2.0, 2)));
        assert!(!batch.push(Record::new(3, "c", 3.0, 3)));
        assert_eq!(batch.count(), 2);
        assert!(batch.is_full());
    }

    #[test]
    fn batch_set_count_rejects_overflow() {
        let mut batch = Batch::with_capacity(4);
        assert!(batch.set_count(4));
        assert!(!batch.set_count(5));
        assert_eq!(batch.count(), 4);
    }
}
