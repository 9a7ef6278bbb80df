//! Gather-list assembly: turns a `PayloadDescriptor` plus live counter/clock state into
//! the concrete bytes of one wire packet, without copying the static portion.

use std::io::IoSlice;
use std::ops::Range;
use std::time::SystemTime;

use crate::payload::counter::PayloadCounter;
use crate::payload::descriptor::{Endian, PacketOperation, PayloadDescriptor, TimeUnit};

/// A gather-list entry: either a view into the payload's static bytes, or a view into
/// `PreparedPayload::temps`. Kept as offsets rather than raw pointers (see DESIGN.md for
/// why) — the same "reserve before any slice is recorded" invariant is what makes either
/// representation stable during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slice {
    Static(Range<usize>),
    Temp(Range<usize>),
}

/// One concrete emission of a payload: a scratch buffer for dynamic bytes plus the
/// gather list referencing it and the static template.
#[derive(Debug, Default)]
pub struct PreparedPayload {
    temps: Vec<u8>,
    slices: Vec<Slice>,
}

impl PreparedPayload {
    pub fn new() -> Self {
        PreparedPayload::default()
    }

    pub fn clear(&mut self) {
        self.temps.clear();
        self.slices.clear();
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn temps(&self) -> &[u8] {
        &self.temps
    }

    /// Total byte length across the whole gather list.
    pub fn len(&self) -> usize {
        self.slices
            .iter()
            .map(|slice| match slice {
                Slice::Static(r) | Slice::Temp(r) => r.end - r.start,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Resolves the gather list into borrowed `IoSlice`s suitable for a vectored write.
    /// Borrows both the descriptor's static bytes and our own `temps`, so the returned
    /// slices cannot outlive either.
    pub fn io_slices<'a>(&'a self, packet_bytes: &'a [u8]) -> Vec<IoSlice<'a>> {
        self.slices
            .iter()
            .map(|slice| match slice {
                Slice::Static(r) => IoSlice::new(&packet_bytes[r.clone()]),
                Slice::Temp(r) => IoSlice::new(&self.temps[r.clone()]),
            })
            .collect()
    }
}

/// Writes the low `length` bytes of `value` into `out` starting at `out.len()`.
/// `length` in {4, 8} uses a native store plus a byteswap on big-endian; other lengths
/// (1, 2, 3, 5, 6, 7) are written byte-by-byte with a shift loop.
fn write_numeric(out: &mut Vec<u8>, value: u64, length: u8, endian: Endian) {
    match length {
        8 => {
            let v = match endian {
                Endian::Little => value.to_le(),
                Endian::Big => value.to_be(),
            };
            out.extend_from_slice(&v.to_ne_bytes());
        }
        4 => {
            let v32 = value as u32;
            let v = match endian {
                Endian::Little => v32.to_le(),
                Endian::Big => v32.to_be(),
            };
            out.extend_from_slice(&v.to_ne_bytes());
        }
        _ => {
            let len = length as usize;
            match endian {
                Endian::Little => {
                    for i in 0..len {
                        out.push(((value >> (8 * i)) & 0xff) as u8);
                    }
                }
                Endian::Big => {
                    for i in (0..len).rev() {
                        out.push(((value >> (8 * i)) & 0xff) as u8);
                    }
                }
            }
        }
    }
}

fn timestamp_value(unit: TimeUnit) -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the unix epoch");
    match unit {
        TimeUnit::Seconds => elapsed.as_secs(),
        TimeUnit::Milliseconds => elapsed.as_millis() as u64,
        TimeUnit::Microseconds => elapsed.as_micros() as u64,
        TimeUnit::Nanoseconds => elapsed.as_nanos() as u64,
    }
}

/// Shared, immutable catalog of payload templates plus the live counters that back
/// their COUNTER ops. Indexed by payload id, addressed identically from every shard.
pub struct PayloadManager {
    descriptors: Vec<PayloadDescriptor>,
    /// `counters[payload_id][nth_counter_op]`.
    counters: Vec<Vec<PayloadCounter>>,
}

impl PayloadManager {
    /// `steps[i]` lists, in op order, the step of every COUNTER op in `descriptors[i]`.
    pub fn new(descriptors: Vec<PayloadDescriptor>, steps: Vec<Vec<u16>>) -> Self {
        assert_eq!(descriptors.len(), steps.len());
        let counters = steps
            .into_iter()
            .map(|per_payload| per_payload.into_iter().map(PayloadCounter::new).collect())
            .collect();
        PayloadManager { descriptors, counters }
    }

    pub fn payload_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn descriptor(&self, index: usize) -> Option<&PayloadDescriptor> {
        self.descriptors.get(index)
    }

    /// Assembles payload `index` into `out`, returning false if `index` is out of range.
    /// Clears `out` (keeping capacity), reserves `temps` to the exact dynamic byte count
    /// before writing a single byte, then walks the op list recording gather slices.
    pub fn fill(&self, index: usize, out: &mut PreparedPayload) -> bool {
        let descriptor = match self.descriptors.get(index) {
            Some(d) => d,
            None => return false,
        };

        out.clear();
        out.temps.reserve(descriptor.dynamic_bytes());

        let mut static_offset = 0usize;
        let mut counter_cursor = 0usize;
        let counters = &self.counters[index];

        for op in descriptor.ops() {
            let length = op.length();
            match *op {
                PacketOperation::Identity { .. } => {
                    let len = length as usize;
                    out.slices
                        .push(Slice::Static(static_offset..static_offset + len));
                    static_offset += len;
                }
                PacketOperation::Counter { endian, .. } => {
                    let counter = &counters[counter_cursor];
                    counter_cursor += 1;
                    let value = counter.fetch_next();
                    let start = out.temps.len();
                    write_numeric(&mut out.temps, value, length, endian);
                    out.slices.push(Slice::Temp(start..out.temps.len()));
                }
                PacketOperation::Timestamp { endian, unit, .. } => {
                    let value = timestamp_value(unit);
                    let start = out.temps.len();
                    write_numeric(&mut out.temps, value, length, endian);
                    out.slices.push(Slice::Temp(start..out.temps.len()));
                }
            }
        }

        debug_assert!(
            out.temps.capacity() >= descriptor.dynamic_bytes(),
            "fill must never reallocate temps after slices are recorded"
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_world_counter_descriptor() -> PayloadDescriptor {
        // "Hello world" (11 bytes): IDENTITY(3) + COUNTER(8, little) — scenario S2.
        PayloadDescriptor::new(
            b"Hello world".to_vec(),
            vec![
                PacketOperation::Identity { length: 3 },
                PacketOperation::Counter { length: 8, endian: Endian::Little },
            ],
        )
    }

    #[test]
    fn fill_out_of_range_returns_false() {
        let manager = PayloadManager::new(vec![], vec![]);
        let mut out = PreparedPayload::new();
        assert!(!manager.fill(0, &mut out));
    }

    #[test]
    fn s2_counter_insert_little_endian() {
        let descriptor = hello_world_counter_descriptor();
        let packet_bytes = descriptor.packet_bytes().to_vec();
        let manager = PayloadManager::new(vec![descriptor], vec![vec![5]]);

        let mut out = PreparedPayload::new();
        assert!(manager.fill(0, &mut out));
        let first: Vec<u8> = out
            .io_slices(&packet_bytes)
            .into_iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(&first[3..11], &[0, 0, 0, 0, 0, 0, 0, 0]);

        assert!(manager.fill(0, &mut out));
        let second: Vec<u8> = out
            .io_slices(&packet_bytes)
            .into_iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(&second[3..11], &[5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn s3_timestamp_insert_big_endian_seconds() {
        let descriptor = PayloadDescriptor::new(
            vec![0u8; 8],
            vec![PacketOperation::Timestamp {
                length: 8,
                endian: Endian::Big,
                unit: TimeUnit::Seconds,
            }],
        );
        let packet_bytes = descriptor.packet_bytes().to_vec();
        let manager = PayloadManager::new(vec![descriptor], vec![vec![]]);

        let before = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let mut out = PreparedPayload::new();
        assert!(manager.fill(0, &mut out));
        let bytes: Vec<u8> = out
            .io_slices(&packet_bytes)
            .into_iter()
            .flat_map(|s| s.to_vec())
            .collect();
        let decoded = u64::from_be_bytes(bytes[..8].try_into().unwrap());

        assert!(decoded >= before && decoded <= before + 1);
    }

    #[test]
    fn endian_round_trip_all_lengths() {
        for length in 1u8..=8 {
            for &endian in &[Endian::Little, Endian::Big] {
                let value: u64 = 0x0102_0304_0506_0708;
                let mut buf = Vec::new();
                write_numeric(&mut buf, value, length, endian);
                assert_eq!(buf.len(), length as usize);

                let mut padded = [0u8; 8];
                match endian {
                    Endian::Little => padded[..length as usize].copy_from_slice(&buf),
                    Endian::Big => {
                        padded[8 - length as usize..].copy_from_slice(&buf);
                    }
                }
                let decoded = match endian {
                    Endian::Little => u64::from_le_bytes(padded),
                    Endian::Big => u64::from_be_bytes(padded),
                };
                let mask = if length == 8 {
                    u64::MAX
                } else {
                    (1u64 << (8 * length as u32)) - 1
                };
                assert_eq!(decoded, value & mask);
            }
        }
    }

    #[test]
    fn counter_sequence_is_arithmetic_progression() {
        let descriptor = PayloadDescriptor::new(vec![0u8; 8], vec![
            PacketOperation::Counter { length: 8, endian: Endian::Little },
        ]);
        let manager = PayloadManager::new(vec![descriptor], vec![vec![3]]);
        let mut out = PreparedPayload::new();
        let mut seen = Vec::new();
        for _ in 0..10 {
            manager.fill(0, &mut out);
            let bytes: Vec<u8> = out.temps().to_vec();
            seen.push(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
        }
        for (i, v) in seen.iter().enumerate() {
            assert_eq!(*v, (i as u64) * 3);
        }
    }
}
