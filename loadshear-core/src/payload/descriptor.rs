//! Static payload shape: the packet bytes plus the ordered sequence of operations that
//! turn the static template into a concrete wire packet on each fill.

use std::sync::Arc;

/// Whether a dynamic field is written little- or big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// The unit a TIMESTAMP op truncates the wall clock to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

/// One step in assembling a payload. `length` is always `<= 8` (verifier rule 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOperation {
    /// Copy `length` bytes verbatim from the static template at the running offset.
    Identity { length: u8 },
    /// Fetch-add the payload's counter and write the result.
    Counter { length: u8, endian: Endian },
    /// Sample the wall clock and write it truncated to `unit`.
    Timestamp { length: u8, endian: Endian, unit: TimeUnit },
}

impl PacketOperation {
    pub fn length(self) -> u8 {
        match self {
            PacketOperation::Identity { length } => length,
            PacketOperation::Counter { length, .. } => length,
            PacketOperation::Timestamp { length, .. } => length,
        }
    }

    pub fn is_identity(self) -> bool {
        matches!(self, PacketOperation::Identity { .. })
    }
}

/// Immutable, shared template for one payload: the static bytes and the op sequence that
/// describes which byte ranges are dynamic. `ops`' lengths must sum to `packet_bytes.len()`
/// — enforced at construction, not re-checked on every fill.
#[derive(Debug, Clone)]
pub struct PayloadDescriptor {
    packet_bytes: Arc<[u8]>,
    ops: Arc<[PacketOperation]>,
}

impl PayloadDescriptor {
    pub fn new(packet_bytes: Vec<u8>, ops: Vec<PacketOperation>) -> Self {
        let total: usize = ops.iter().map(|op| op.length() as usize).sum();
        assert_eq!(
            total,
            packet_bytes.len(),
            "payload op lengths must sum to the packet size"
        );
        PayloadDescriptor {
            packet_bytes: Arc::from(packet_bytes.into_boxed_slice()),
            ops: Arc::from(ops.into_boxed_slice()),
        }
    }

    pub fn packet_bytes(&self) -> &[u8] {
        &self.packet_bytes
    }

    pub fn ops(&self) -> &[PacketOperation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.packet_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet_bytes.is_empty()
    }

    /// Total bytes contributed by non-IDENTITY ops — what `temps` must be reserved to.
    pub fn dynamic_bytes(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !op.is_identity())
            .map(|op| op.length() as usize)
            .sum()
    }
}
