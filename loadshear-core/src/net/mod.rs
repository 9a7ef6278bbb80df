pub mod pool;
pub mod tcp;
pub mod udp;

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::Handler;
use crate::metrics::ShardMetrics;
use crate::payload::PayloadManager;

pub use flux::shared::{ErrorType, NetworkError, NetworkResult};

/// Config shared read-only by every session in a shard's pool (`session-config.h`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub header_size: usize,
    pub payload_size_limit: usize,
    pub read_enabled: bool,
    pub repeat: bool,
    /// Every Nth write/read records a latency sample; 1 means every one.
    pub packet_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            header_size: 0,
            payload_size_limit: 4096,
            read_enabled: false,
            repeat: false,
            packet_sample_rate: 16,
        }
    }
}

/// Bundles the resources every session needs a reference to but none of them own:
/// shared payload catalog, the shard's metrics sink, and the message handler instance.
/// One of these lives per shard and is threaded into every session call.
pub struct SharedContext {
    pub config: SessionConfig,
    /// Shared across every shard — this is where the cross-shard atomic counters
    /// actually live, so this must stay an `Arc`, never cloned into a per-shard copy.
    pub payloads: Arc<PayloadManager>,
    /// Local to one shard; `Rc` because every session on this shard's thread holds a
    /// clone of the surrounding `SharedContext`.
    pub metrics: Rc<ShardMetrics>,
}

/// Result of one session progressing: whether it just transitioned to CLOSED, which the
/// pool uses to fire `disconnect_callback` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    None,
    JustClosed,
}

/// The state machine shape shared by both TCP and UDP sessions (§4.3, §4.4). UDP skips
/// `Connecting` entirely (`start` both binds and transitions straight to `Live`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Live,
    Draining,
    Closed,
}

/// Host/endpoint information resolved ahead of time, keyed by protocol (§3 HostInfo).
#[derive(Debug, Clone)]
pub struct HostInfo<E> {
    pub endpoints: Vec<E>,
}

pub(crate) const SAMPLE_EVERY: u32 = 1;

/// Grace period, expressed as a `Duration`, a DRAIN action's millisecond timeout maps
/// to.
pub(crate) fn drain_deadline(timeout_ms: u32) -> Duration {
    Duration::from_millis(timeout_ms as u64)
}

/// Capability every session variant (TCP, UDP) must provide so `SessionPool<S>` and a
/// shard's worker thread can be generic over it (monomorphized generics standing in for
/// the source's `Shard<Session>` template). `token` identifies this session's
/// registration with the shard's single `mio::Poll`.
pub trait SessionOps {
    type Endpoint: Clone;

    fn new(index: usize, context: Rc<SharedContext>) -> Self;

    fn token(&self) -> mio::Token;

    fn start(&mut self, endpoint: &Self::Endpoint, poll: &mio::Poll, handler: &mut Handler);

    fn flood(&mut self, poll: &mio::Poll, handler: &mut Handler);

    /// Explicit SEND: queues `copies` writes of the one payload named by
    /// `payload_index`, unlike `flood` which cycles the session's own cursor through
    /// the whole catalog.
    fn send(&mut self, copies: u32, payload_index: u32, poll: &mio::Poll, handler: &mut Handler);

    fn drain(&mut self, timeout_ms: u32);

    fn stop(&mut self, poll: &mio::Poll, handler: &mut Handler) -> SessionEvent;

    fn is_connected(&self) -> bool;

    fn state(&self) -> ConnectionState;

    /// Reacts to one readiness notification for this session's token. Returns
    /// `JustClosed` the one time this call observes the transition into `Closed`, so
    /// the pool can fire its disconnect callback exactly once.
    fn handle_event(&mut self, readiness: mio::Ready, poll: &mio::Poll, handler: &mut Handler) -> SessionEvent;

    /// Checks drain/connect timers; called once per loop tick regardless of readiness.
    fn tick(&mut self, poll: &mio::Poll) -> SessionEvent;
}
