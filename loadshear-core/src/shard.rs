//! A single worker thread plus an event loop (§4.6,
//! `original_source/src/orchestrator/shard.h`). Everything that must not cross threads
//! — the message handler, the session pool, the `mio::Poll` — is constructed lazily
//! inside the spawned thread, not in `Shard::start`'s caller.

use std::panic;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Poll};

use flux::logging::{info, o, warn, Logger};

use crate::action::{ActionDescriptor, ActionType};
use crate::handler::HandlerFactory;
use crate::metrics::{MetricsSnapshot, ShardMetrics};
use crate::net::pool::SessionPool;
use crate::net::{HostInfo, SessionConfig, SessionOps, SharedContext};
use crate::payload::PayloadManager;

/// A force-stop timeout applied if session teardown after `stop()` does not quiesce on
/// its own, matching the original's 30 s default.
const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

enum ShardCommand {
    Submit(ActionDescriptor),
    PullMetrics,
    Stop,
}

/// Handle to a running shard worker thread. Only the fields needed to talk to the
/// thread live here; everything else (pool, handler, poll, host info) lives on the
/// thread itself.
pub struct Shard {
    sender: Sender<ShardCommand>,
    metrics_rx: Receiver<MetricsSnapshot>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    log: Logger,
}

impl Shard {
    pub fn start<S>(
        shard_index: usize,
        config: SessionConfig,
        payloads: Arc<PayloadManager>,
        host_info: Arc<HostInfo<S::Endpoint>>,
        handler_factory: Arc<dyn HandlerFactory>,
        log: Logger,
    ) -> Self
    where
        S: SessionOps + 'static,
        S::Endpoint: Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel::<ShardCommand>();
        let (metrics_tx, metrics_rx) = mpsc::channel::<MetricsSnapshot>();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_log = log.new(o!("shard" => shard_index));

        let handle = thread::Builder::new()
            .name(format!("loadshear-shard-{}", shard_index))
            .spawn(move || {
                run_shard_thread::<S>(
                    receiver,
                    metrics_tx,
                    config,
                    payloads,
                    host_info,
                    handler_factory,
                    thread_running,
                    thread_log,
                )
            })
            .expect("failed to spawn shard worker thread");

        Shard { sender, metrics_rx, handle: Some(handle), running, log }
    }

    /// Posts one action for this shard's own copy of the session pool to execute. The
    /// caller (orchestrator) broadcasts the same descriptor to every shard.
    pub fn submit_work(&self, action: ActionDescriptor) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let _ = self.sender.send(ShardCommand::Submit(action));
    }

    /// Asks the shard thread to snapshot its metrics and send the result back. Blocks
    /// the caller until the snapshot arrives, since the orchestrator's sampling loop
    /// runs on its own thread and can afford to wait briefly.
    pub fn schedule_metrics_pull(&self) -> Option<MetricsSnapshot> {
        if self.sender.send(ShardCommand::PullMetrics).is_err() {
            return None;
        }
        self.metrics_rx.recv().ok()
    }

    /// Idempotent. Tells the thread to shut its pool down; the thread itself decides
    /// when to stop once the pool reports fully drained (or the force-stop timer
    /// fires).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(ShardCommand::Stop);
    }

    /// External-only: the orchestrator waits on every shard's thread after `stop()`.
    /// Calling this from inside the shard's own thread would deadlock.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(self.log, "shard worker thread panicked");
            }
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_shard_thread<S: SessionOps + 'static>(
    receiver: Receiver<ShardCommand>,
    metrics_tx: mpsc::Sender<MetricsSnapshot>,
    config: SessionConfig,
    payloads: Arc<PayloadManager>,
    host_info: Arc<HostInfo<S::Endpoint>>,
    handler_factory: Arc<dyn HandlerFactory>,
    running: Arc<AtomicBool>,
    log: Logger,
) {
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        // Built on this thread, not the caller's: the WASM store (if any) must never
        // cross a thread boundary, and neither does the pool built on top of it.
        let mut handler = handler_factory.build();
        let poll = Poll::new().expect("failed to create shard event loop");
        let metrics = Rc::new(ShardMetrics::new());
        let context = Rc::new(SharedContext {
            config,
            payloads,
            metrics: metrics.clone(),
        });
        let mut pool: SessionPool<S> = SessionPool::new(context, log.new(o!()));

        let mut events = Events::with_capacity(1024);
        let mut stopping = false;
        let mut force_stop_deadline: Option<Instant> = None;
        let mut next_endpoint = 0usize;

        loop {
            if poll.poll(&mut events, Some(Duration::from_millis(50))).is_ok() {
                for event in &events {
                    pool.dispatch_event(event.token(), event.readiness(), &poll, &mut handler);
                }
            }
            pool.tick(&poll);

            while let Ok(command) = receiver.try_recv() {
                match command {
                    ShardCommand::Submit(action) => {
                        if action.action_type == ActionType::Connect {
                            let count = (action.sessions_end - action.sessions_start) as usize;
                            for i in 0..count {
                                let start = action.sessions_start + i as u32;
                                let endpoint = &host_info.endpoints[next_endpoint % host_info.endpoints.len()];
                                next_endpoint += 1;
                                pool.start_range(start, start + 1, endpoint, &poll, &mut handler);
                            }
                        } else {
                            dispatch_action(&mut pool, &action, &poll, &mut handler);
                        }
                    }
                    ShardCommand::PullMetrics => {
                        let snapshot = metrics.fetch_snapshot(pool.active_sessions() as u64);
                        let _ = metrics_tx.send(snapshot);
                    }
                    ShardCommand::Stop => {
                        stopping = true;
                        pool.shutdown(&poll, &mut handler);
                        force_stop_deadline = Some(Instant::now() + FORCE_STOP_TIMEOUT);
                    }
                }
            }

            if stopping && pool.active_sessions() == 0 {
                break;
            }
            if let Some(deadline) = force_stop_deadline {
                if Instant::now() >= deadline {
                    warn!(log, "force-stopping shard after timeout"; "active_sessions" => pool.active_sessions());
                    break;
                }
            }
        }

        info!(log, "shard worker exiting");
    }));

    if outcome.is_err() {
        warn!(log, "shard worker thread panicked, exiting without a clean drain");
    }
}

fn dispatch_action<S: SessionOps>(
    pool: &mut SessionPool<S>,
    action: &ActionDescriptor,
    poll: &Poll,
    handler: &mut crate::handler::Handler,
) {
    match action.action_type {
        ActionType::Create => pool.create((action.sessions_end - action.sessions_start) as usize),
        ActionType::Connect => unreachable!("CONNECT is resolved to per-session endpoints by the caller"),
        ActionType::Send => pool.send_range(
            action.sessions_start,
            action.sessions_end,
            action.count,
            action.payload_index.expect("SEND action missing a payload index"),
            poll,
            handler,
        ),
        ActionType::Flood => pool.flood_range(action.sessions_start, action.sessions_end, poll, handler),
        ActionType::Drain => {
            pool.drain_range(action.sessions_start, action.sessions_end, action.count)
        }
        ActionType::Disconnect => {
            pool.stop_range(action.sessions_start, action.sessions_end, poll, handler)
        }
    }
}
