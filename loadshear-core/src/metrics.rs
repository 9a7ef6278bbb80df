//! Per-shard live counters (§3 ShardMetrics), the snapshots taken from them, and the
//! cross-shard aggregation the orchestrator drives off a periodic sample (§4.7 step 3,
//! `original_source/src/metrics/orchestrator-metrics.h`).

use std::cell::Cell;
use std::time::Duration;

pub const BUCKET_COUNT: usize = 16;

/// Maps a recorded latency (in microseconds) onto one of 16 log2 buckets: bucket 0 is
/// `< 64 us`, bucket i covers `[2^(6+i-1), 2^(6+i))`, bucket 15 is the overflow bucket
/// for everything `>= ~1s` (§6.5, §8 property 6).
#[inline]
pub fn latency_bucket(latency_us: u64) -> usize {
    if latency_us < 64 {
        return 0;
    }
    let bits = 64 - latency_us.leading_zeros();
    let index = (bits as i64) - 6;
    index.clamp(0, (BUCKET_COUNT - 1) as i64) as usize
}

/// A point-in-time copy of a shard's counters, cheap to move between threads since it
/// holds no atomics — only the live `ShardMetrics` is mutated in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_read: u64,
    pub connection_attempts: u64,
    pub failed_connections: u64,
    pub finished_connections: u64,
    pub connected_sessions: u64,
    pub connection_latency_buckets: [u64; BUCKET_COUNT],
    pub send_latency_buckets: [u64; BUCKET_COUNT],
    pub read_latency_buckets: [u64; BUCKET_COUNT],
}

impl MetricsSnapshot {
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_read += other.bytes_read;
        self.connection_attempts += other.connection_attempts;
        self.failed_connections += other.failed_connections;
        self.finished_connections += other.finished_connections;
        self.connected_sessions += other.connected_sessions;
        for i in 0..BUCKET_COUNT {
            self.connection_latency_buckets[i] += other.connection_latency_buckets[i];
            self.send_latency_buckets[i] += other.send_latency_buckets[i];
            self.read_latency_buckets[i] += other.read_latency_buckets[i];
        }
    }
}

/// Signed, field-by-field difference between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsDelta {
    pub bytes_sent: i64,
    pub bytes_read: i64,
    pub connection_attempts: i64,
    pub failed_connections: i64,
    pub finished_connections: i64,
    pub connected_sessions: i64,
    pub connection_latency_buckets: [i64; BUCKET_COUNT],
    pub send_latency_buckets: [i64; BUCKET_COUNT],
    pub read_latency_buckets: [i64; BUCKET_COUNT],
}

impl MetricsDelta {
    pub fn compute_difference(current: &MetricsSnapshot, previous: &MetricsSnapshot) -> Self {
        let mut delta = MetricsDelta {
            bytes_sent: current.bytes_sent as i64 - previous.bytes_sent as i64,
            bytes_read: current.bytes_read as i64 - previous.bytes_read as i64,
            connection_attempts: current.connection_attempts as i64
                - previous.connection_attempts as i64,
            failed_connections: current.failed_connections as i64
                - previous.failed_connections as i64,
            finished_connections: current.finished_connections as i64
                - previous.finished_connections as i64,
            connected_sessions: current.connected_sessions as i64
                - previous.connected_sessions as i64,
            ..Default::default()
        };
        for i in 0..BUCKET_COUNT {
            delta.connection_latency_buckets[i] = current.connection_latency_buckets[i] as i64
                - previous.connection_latency_buckets[i] as i64;
            delta.send_latency_buckets[i] =
                current.send_latency_buckets[i] as i64 - previous.send_latency_buckets[i] as i64;
            delta.read_latency_buckets[i] =
                current.read_latency_buckets[i] as i64 - previous.read_latency_buckets[i] as i64;
        }
        delta
    }
}

/// Live, shard-owned counters. Aligned to a full cache line (destructive-interference
/// size on every mainstream target) so the orchestrator thread's read of a neighboring
/// shard's metrics never bounces this shard's writer cache line. Only the owning shard
/// thread ever mutates these — hence plain `Cell`s, not atomics.
#[repr(align(64))]
pub struct ShardMetrics {
    bytes_sent: Cell<u64>,
    bytes_read: Cell<u64>,
    connection_attempts: Cell<u64>,
    failed_connections: Cell<u64>,
    finished_connections: Cell<u64>,
    connection_latency_buckets: [Cell<u64>; BUCKET_COUNT],
    send_latency_buckets: [Cell<u64>; BUCKET_COUNT],
    read_latency_buckets: [Cell<u64>; BUCKET_COUNT],
}

impl Default for ShardMetrics {
    fn default() -> Self {
        ShardMetrics {
            bytes_sent: Cell::new(0),
            bytes_read: Cell::new(0),
            connection_attempts: Cell::new(0),
            failed_connections: Cell::new(0),
            finished_connections: Cell::new(0),
            connection_latency_buckets: Default::default(),
            send_latency_buckets: Default::default(),
            read_latency_buckets: Default::default(),
        }
    }
}

impl ShardMetrics {
    pub fn new() -> Self {
        ShardMetrics::default()
    }

    pub fn record_bytes_sent(&self, n: u64) {
        self.bytes_sent.set(self.bytes_sent.get() + n);
    }

    pub fn record_bytes_read(&self, n: u64) {
        self.bytes_read.set(self.bytes_read.get() + n);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.set(self.connection_attempts.get() + 1);
    }

    pub fn record_failed_connection(&self) {
        self.failed_connections.set(self.failed_connections.get() + 1);
    }

    pub fn record_finished_connection(&self) {
        self.finished_connections.set(self.finished_connections.get() + 1);
    }

    pub fn record_connection_latency(&self, elapsed: Duration) {
        let bucket = latency_bucket(elapsed.as_micros() as u64);
        let cell = &self.connection_latency_buckets[bucket];
        cell.set(cell.get() + 1);
    }

    pub fn record_send_latency(&self, elapsed: Duration) {
        let bucket = latency_bucket(elapsed.as_micros() as u64);
        let cell = &self.send_latency_buckets[bucket];
        cell.set(cell.get() + 1);
    }

    pub fn record_read_latency(&self, elapsed: Duration) {
        let bucket = latency_bucket(elapsed.as_micros() as u64);
        let cell = &self.read_latency_buckets[bucket];
        cell.set(cell.get() + 1);
    }

    /// Copies the live counters plus the pool-reported `connected_sessions` into a
    /// snapshot. `connected_sessions` lives on the pool, not here, since this struct has
    /// no pool visibility of its own (mirrors `Shard::record_metrics` in the source).
    pub fn fetch_snapshot(&self, connected_sessions: u64) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            bytes_sent: self.bytes_sent.get(),
            bytes_read: self.bytes_read.get(),
            connection_attempts: self.connection_attempts.get(),
            failed_connections: self.failed_connections.get(),
            finished_connections: self.finished_connections.get(),
            connected_sessions,
            ..Default::default()
        };
        for i in 0..BUCKET_COUNT {
            snapshot.connection_latency_buckets[i] = self.connection_latency_buckets[i].get();
            snapshot.send_latency_buckets[i] = self.send_latency_buckets[i].get();
            snapshot.read_latency_buckets[i] = self.read_latency_buckets[i].get();
        }
        snapshot
    }
}

/// Append-only history of snapshots for one shard, sampled periodically by the
/// orchestrator.
#[derive(Debug, Default)]
pub struct SnapshotList {
    snapshots: Vec<MetricsSnapshot>,
}

impl SnapshotList {
    pub fn new() -> Self {
        SnapshotList::default()
    }

    pub fn push(&mut self, snapshot: MetricsSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.snapshots.last()
    }

    pub fn previous(&self) -> Option<&MetricsSnapshot> {
        if self.snapshots.len() >= 2 {
            self.snapshots.get(self.snapshots.len() - 2)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// One published point for the metrics-output collaborator (§6.5): the summed current
/// state across all shards, the change since the previous sample, and how long since
/// orchestrator start this sample was taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsAggregate {
    pub current: MetricsSnapshot,
    pub delta: MetricsDelta,
    pub offset: Duration,
}

/// Owns one `SnapshotList` per shard and folds them into `MetricsAggregate`s.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    shard_histories: Vec<SnapshotList>,
}

impl OrchestratorMetrics {
    pub fn with_shard_count(shard_count: usize) -> Self {
        let mut histories = Vec::with_capacity(shard_count);
        histories.resize_with(shard_count, SnapshotList::new);
        OrchestratorMetrics { shard_histories: histories }
    }

    pub fn history_mut(&mut self, shard: usize) -> &mut SnapshotList {
        &mut self.shard_histories[shard]
    }

    /// Sums every shard's latest snapshot into `current` and every shard's
    /// second-to-latest (where one exists) into `previous`, then diffs the two sums.
    /// Summing happens before diffing, matching the original's order of operations —
    /// diffing per-shard first and summing second would give a different answer when
    /// shards drift non-uniformly.
    pub fn get_aggregate_delta(&self, offset: Duration) -> MetricsAggregate {
        let mut current = MetricsSnapshot::default();
        let mut previous = MetricsSnapshot::default();

        for history in &self.shard_histories {
            if let Some(latest) = history.latest() {
                current.merge(latest);
            }
            if let Some(prev) = history.previous() {
                previous.merge(prev);
            }
        }

        MetricsAggregate {
            delta: MetricsDelta::compute_difference(&current, &previous),
            current,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(latency_bucket(0), 0);
        assert_eq!(latency_bucket(63), 0);
        assert_eq!(latency_bucket(64), 1);
        assert_eq!(latency_bucket(127), 1);
        assert_eq!(latency_bucket(128), 2);
        assert_eq!(latency_bucket(1_000_000_000), 15);
    }

    #[test]
    fn shard_metrics_fetch_snapshot_roundtrip() {
        let metrics = ShardMetrics::new();
        metrics.record_bytes_sent(11);
        metrics.record_connection_attempt();
        metrics.record_connection_latency(Duration::from_micros(10));

        let snapshot = metrics.fetch_snapshot(3);
        assert_eq!(snapshot.bytes_sent, 11);
        assert_eq!(snapshot.connection_attempts, 1);
        assert_eq!(snapshot.connected_sessions, 3);
        assert_eq!(snapshot.connection_latency_buckets[0], 1);
    }

    #[test]
    fn aggregate_sums_before_diffing() {
        let mut orchestrator = OrchestratorMetrics::with_shard_count(2);

        let mut a = MetricsSnapshot::default();
        a.bytes_sent = 10;
        orchestrator.history_mut(0).push(a);
        let mut b = MetricsSnapshot::default();
        b.bytes_sent = 100;
        orchestrator.history_mut(1).push(b);

        let agg1 = orchestrator.get_aggregate_delta(Duration::from_secs(1));
        assert_eq!(agg1.current.bytes_sent, 110);
        assert_eq!(agg1.delta.bytes_sent, 110);

        let mut a2 = MetricsSnapshot::default();
        a2.bytes_sent = 15;
        orchestrator.history_mut(0).push(a2);
        let mut b2 = MetricsSnapshot::default();
        b2.bytes_sent = 140;
        orchestrator.history_mut(1).push(b2);

        let agg2 = orchestrator.get_aggregate_delta(Duration::from_secs(2));
        assert_eq!(agg2.current.bytes_sent, 155);
        assert_eq!(agg2.delta.bytes_sent, 45);
    }
}
