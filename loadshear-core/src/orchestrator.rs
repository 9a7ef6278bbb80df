//! Supervisor thread driving a timeline of actions across every shard (§4.6/§5,
//! `original_source/src/orchestrator/orchestrator.h`,
//! `original_source/src/orchestrator/orchestrator-config.h`).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flux::logging::{info, o, warn, Logger};

use crate::action::ActionDescriptor;
use crate::handler::HandlerFactory;
use crate::metrics::{MetricsAggregate, OrchestratorMetrics};
use crate::net::{HostInfo, SessionConfig, SessionOps};
use crate::payload::{PayloadDescriptor, PayloadManager};
use crate::shard::Shard;

/// Constructor bundle for an `Orchestrator`, mirroring the original's
/// `OrchestratorConfig<Session>` (session config + host info + handler factory + shard
/// count), minus the C++ type's embedded `MessageHandlerFactory` closure type — here
/// that is just a trait object.
pub struct OrchestratorConfig<S: SessionOps> {
    pub session_config: SessionConfig,
    pub host_info: HostInfo<S::Endpoint>,
    pub handler_factory: Arc<dyn HandlerFactory>,
    pub shard_count: usize,
    /// How often `run` samples every shard's metrics and yields a `MetricsAggregate`.
    /// Not in the original (which leaves the cadence to its UI collaborator); a
    /// concrete default keeps `run` self-contained.
    pub metrics_sample_interval: Duration,
}

/// Owns every shard and the action timeline, and is the only thing that ever calls
/// `submit_work` — shards never talk to each other directly (§5 "the orchestrator
/// broadcasts the same action to every shard").
pub struct Orchestrator<S: SessionOps> {
    shards: Vec<Shard>,
    actions: Vec<ActionDescriptor>,
    metrics: OrchestratorMetrics,
    log: Logger,
    _marker: std::marker::PhantomData<S>,
}

impl<S> Orchestrator<S>
where
    S: SessionOps + 'static,
    S::Endpoint: Send + Sync + 'static,
{
    /// Builds the shared payload manager, spins up every shard's worker thread, and
    /// stores the (already offset-sorted) action list. Shard construction failures
    /// (e.g. a `mio::Poll` that cannot be created) are not modeled as recoverable here,
    /// matching the original's "failed to construct orchestrator, closing" early
    /// return: a poisoned shard thread is a process-fatal setup error.
    pub fn new(
        mut actions: Vec<ActionDescriptor>,
        payloads: Vec<PayloadDescriptor>,
        steps: Vec<Vec<u16>>,
        config: OrchestratorConfig<S>,
        log: Logger,
    ) -> Self {
        actions.sort_by_key(|a| a.offset);

        let payload_manager = Arc::new(PayloadManager::new(payloads, steps));
        let host_info = Arc::new(config.host_info);

        let mut shards = Vec::with_capacity(config.shard_count);
        for index in 0..config.shard_count {
            shards.push(Shard::start::<S>(
                index,
                config.session_config.clone(),
                payload_manager.clone(),
                host_info.clone(),
                config.handler_factory.clone(),
                log.new(o!()),
            ));
        }

        info!(log, "orchestrator ready"; "shards" => config.shard_count, "actions" => actions.len());

        Orchestrator {
            shards,
            actions,
            metrics: OrchestratorMetrics::with_shard_count(config.shard_count),
            log,
            _marker: std::marker::PhantomData,
        }
    }

    /// Drives the full timeline to completion: dispatches every action at its absolute
    /// offset (clamped to `max(now, target)`, so a shard that is already running late
    /// never schedules an action further back in time — §5's "independent drift"),
    /// samples metrics on the configured cadence in between, and returns the full
    /// sequence of aggregates once every action has been sent and the shards have
    /// drained.
    pub fn run(&mut self, sample_interval: Duration) -> Vec<MetricsAggregate> {
        let start = Instant::now();
        let mut aggregates = Vec::new();
        let mut next_sample = start + sample_interval;

        for action in self.actions.clone() {
            let target = start + Duration::from_millis(action.offset as u64);
            loop {
                let now = Instant::now();
                if now >= target {
                    break;
                }
                if next_sample <= target && next_sample > now {
                    thread::sleep(next_sample - now);
                    aggregates.push(self.sample(start));
                    next_sample += sample_interval;
                } else {
                    thread::sleep(target - now);
                }
            }
            if Instant::now() >= next_sample {
                aggregates.push(self.sample(start));
                next_sample = Instant::now() + sample_interval;
            }

            for shard in &self.shards {
                shard.submit_work(action);
            }
        }

        self.finish();
        aggregates.push(self.sample(start));
        aggregates
    }

    /// Pulls one snapshot per shard and folds it into `OrchestratorMetrics`'s running
    /// history, returning the current aggregate delta (§4.7 step 3). `offset` is how
    /// long since `run` started this sample was taken.
    fn sample(&mut self, start: Instant) -> MetricsAggregate {
        for (index, shard) in self.shards.iter().enumerate() {
            if let Some(snapshot) = shard.schedule_metrics_pull() {
                self.metrics.history_mut(index).push(snapshot);
            }
        }
        self.metrics.get_aggregate_delta(start.elapsed())
    }

    /// Stops and joins every shard. Idempotent: `Shard::stop` already is, and `Drop`
    /// calls it again harmlessly on a shard that already finished here.
    fn finish(&mut self) {
        for shard in &self.shards {
            shard.stop();
        }
        for shard in &mut self.shards {
            shard.join();
        }
        info!(self.log, "orchestrator finished, all shards joined");
    }
}

impl<S: SessionOps> Drop for Orchestrator<S> {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.stop();
        }
        for shard in &mut self.shards {
            shard.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_are_sorted_by_offset() {
        let actions = vec![
            ActionDescriptor::disconnect(0, 1, 300),
            ActionDescriptor::create(1, 0),
            ActionDescriptor::connect(0, 1, 100),
        ];
        let mut sorted = actions.clone();
        sorted.sort_by_key(|a| a.offset);
        assert_eq!(sorted[0].offset, 0);
        assert_eq!(sorted[1].offset, 100);
        assert_eq!(sorted[2].offset, 300);
    }
}
