//! Framed, checksummed binary encoding of a record batch.
//!
//! The same frame is written into the per-worker shared-memory region on
//! both sides of a call and reused verbatim for cross-node forwarding.
//! Layout (little-endian):
//!
//! ```text
//! offset  size   field
//! 0       8      count     (u64)
//! 8       8      capacity  (u64)
//! 16      4      batch_id  (i32)
//! 20      4      checksum  (u32) = count ^ capacity ^ batch_id (as u32)
//! 24      N*116  records   (N = count)
//! ```
//!
//! Fixed-layout records make the body zero-parse; the header checksum is a
//! cheap corruption sentinel for shared-memory transport where sender and
//! receiver may race during a crash.

use crate::error::{Error, Result};
use crate::record::{Batch, Record, RECORD_NAME_LEN};

/// Size of the batch frame header.
pub const BATCH_HEADER_LEN: usize = 24;

/// Wire size of one record.
pub const RECORD_WIRE_LEN: usize = 116;

/// Total frame size for a batch holding `count` records.
pub fn encoded_len(count: usize) -> usize {
    BATCH_HEADER_LEN + count * RECORD_WIRE_LEN
}

// The high halves are folded in so corruption of any header bit is caught.
// For every frame with count and capacity below 2^32 this equals the plain
// low-word XOR of the three fields.
fn header_checksum(count: u64, capacity: u64, batch_id: i32) -> u32 {
    let fold = |x: u64| (x as u32) ^ ((x >> 32) as u32);
    fold(count) ^ fold(capacity) ^ (batch_id as u32)
}

/// Encode `batch` into `buf`. Returns the number of bytes written.
///
/// Fails with [`Error::Codec`] when `buf` is too small for the frame.
pub fn encode(batch: &Batch, buf: &mut [u8]) -> Result<usize> {
    let needed = encoded_len(batch.count());
    if buf.len() < needed {
        return Err(Error::Codec(format!(
            "buffer too small for batch frame: need {needed}, have {}",
            buf.len()
        )));
    }

    let count = batch.count() as u64;
    let capacity = batch.capacity() as u64;
    let batch_id = batch.batch_id();

    buf[0..8].copy_from_slice(&count.to_le_bytes());
    buf[8..16].copy_from_slice(&capacity.to_le_bytes());
    buf[16..20].copy_from_slice(&batch_id.to_le_bytes());
    buf[20..24].copy_from_slice(&header_checksum(count, capacity, batch_id).to_le_bytes());

    let mut offset = BATCH_HEADER_LEN;
    for record in batch.records() {
        write_record(record, &mut buf[offset..offset + RECORD_WIRE_LEN]);
        offset += RECORD_WIRE_LEN;
    }

    Ok(needed)
}

/// Decode a batch frame from `buf` into `out`.
///
/// Verifies the header checksum, rejects `count > capacity` and frames that
/// do not fit in `out`, then overwrites `out`'s records, count, and batch id.
/// `out`'s capacity is never mutated.
pub fn decode(buf: &[u8], out: &mut Batch) -> Result<()> {
    if buf.len() < BATCH_HEADER_LEN {
        return Err(Error::Codec(format!(
            "frame too short for header: {} bytes",
            buf.len()
        )));
    }

    let count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let capacity = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let batch_id = i32::from_le_bytes(buf[16..20].try_into().unwrap());
    let checksum = u32::from_le_bytes(buf[20..24].try_into().unwrap());

    if checksum != header_checksum(count, capacity, batch_id) {
        return Err(Error::Codec("header checksum mismatch".to_string()));
    }
    if count > capacity {
        return Err(Error::Codec(format!(
            "corrupt header: count {count} exceeds capacity {capacity}"
        )));
    }
    let count = count as usize;
    if count > out.capacity() {
        return Err(Error::Codec(format!(
            "batch of {count} records does not fit in capacity {}",
            out.capacity()
        )));
    }
    if buf.len() < encoded_len(count) {
        return Err(Error::Codec(format!(
            "frame too short for {count} records: {} bytes",
            buf.len()
        )));
    }

    let mut offset = BATCH_HEADER_LEN;
    let storage = out.storage_mut();
    for slot in storage[..count].iter_mut() {
        *slot = read_record(&buf[offset..offset + RECORD_WIRE_LEN]);
        offset += RECORD_WIRE_LEN;
    }
    out.set_count(count);
    out.set_batch_id(batch_id);

    Ok(())
}

fn write_record(record: &Record, buf: &mut [u8]) {
    let id = record.id;
    let value = record.value;
    let category = record.category;
    buf[0..4].copy_from_slice(&id.to_le_bytes());
    buf[4..4 + RECORD_NAME_LEN].copy_from_slice(&record.name);
    buf[104..112].copy_from_slice(&value.to_le_bytes());
    buf[112..116].copy_from_slice(&category.to_le_bytes());
}

fn read_record(buf: &[u8]) -> Record {
    let mut name = [0u8; RECORD_NAME_LEN];
    name.copy_from_slice(&buf[4..4 + RECORD_NAME_LEN]);
    // A frame must not be able to break the name-terminator invariant.
    name[RECORD_NAME_LEN - 1] = 0;
    Record {
        id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
        name,
        value: f64::from_le_bytes(buf[104..112].try_into().unwrap()),
        category: i32::from_le_bytes(buf[112..116].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> Batch {
        let mut batch = Batch::with_capacity(8);
        batch.set_batch_id(42);
        batch.push(Record::new(1, "R1", 10.0, 1));
        batch.push(Record::new(2, "R2", 20.0, 2));
        batch.push(Record::new(3, "R3", 30.0, 3));
        batch
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let batch = sample_batch();
        let mut buf = vec![0u8; encoded_len(batch.count())];
        let written = encode(&batch, &mut buf).unwrap();
        assert_eq!(written, encoded_len(3));

        let mut out = Batch::with_capacity(8);
        decode(&buf, &mut out).unwrap();

        assert_eq!(out.batch_id(), 42);
        assert_eq!(out.count(), 3);
        assert_eq!(out.records(), batch.records());
    }

    #[test]
    fn encode_rejects_short_buffer() {
        let batch = sample_batch();
        let mut buf = vec![0u8; encoded_len(batch.count()) - 1];
        assert!(matches!(encode(&batch, &mut buf), Err(Error::Codec(_))));
    }

    #[test]
    fn any_header_bit_flip_fails_decode() {
        let batch = sample_batch();
        let mut buf = vec![0u8; encoded_len(batch.count())];
        encode(&batch, &mut buf).unwrap();

        for byte in 0..BATCH_HEADER_LEN {
            for bit in 0..8 {
                let mut corrupted = buf.clone();
                corrupted[byte] ^= 1 << bit;
                let mut out = Batch::with_capacity(8);
                assert!(
                    decode(&corrupted, &mut out).is_err(),
                    "flip of byte {byte} bit {bit} was not detected"
                );
            }
        }
    }

    #[test]
    fn decode_rejects_count_above_capacity() {
        // Hand-build a frame claiming count > capacity with a valid checksum.
        let mut buf = vec![0u8; BATCH_HEADER_LEN];
        let (count, capacity, batch_id) = (5u64, 2u64, 7i32);
        buf[0..8].copy_from_slice(&count.to_le_bytes());
        buf[8..16].copy_from_slice(&capacity.to_le_bytes());
        buf[16..20].copy_from_slice(&batch_id.to_le_bytes());
        let checksum = (count as u32) ^ (capacity as u32) ^ (batch_id as u32);
        buf[20..24].copy_from_slice(&checksum.to_le_bytes());

        let mut out = Batch::with_capacity(8);
        assert!(matches!(decode(&buf, &mut out), Err(Error::Codec(_))));
    }

    #[test]
    fn decode_rejects_batch_larger_than_destination() {
        let batch = sample_batch();
        let mut buf = vec![0u8; encoded_len(batch.count())];
        encode(&batch, &mut buf).unwrap();

        let mut small = Batch::with_capacity(2);
        assert!(matches!(decode(&buf, &mut small), Err(Error::Codec(_))));
    }

    #[test]
    fn decode_does_not_mutate_destination_capacity() {
        let batch = sample_batch();
        let mut buf = vec![0u8; encoded_len(batch.count())];
        encode(&batch, &mut buf).unwrap();

        let mut out = Batch::with_capacity(16);
        decode(&buf, &mut out).unwrap();
        assert_eq!(out.capacity(), 16);
    }

    #[test]
    fn empty_batch_round_trips() {
        let mut batch = Batch::with_capacity(4);
        batch.set_batch_id(-9);
        let mut buf = vec![0u8; encoded_len(0)];
        encode(&batch, &mut buf).unwrap();

        let mut out = Batch::with_capacity(4);
        out.push(Record::new(99, "stale", 9.0, 9));
        decode(&buf, &mut out).unwrap();
        assert_eq!(out.count(), 0);
        assert_eq!(out.batch_id(), -9);
    }
}
