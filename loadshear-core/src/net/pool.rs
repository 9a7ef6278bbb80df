//! Per-shard owner of session descriptors and range dispatch (§4.5,
//! `original_source/src/orchestrator/session-pool.h`).

use std::rc::Rc;

use flux::logging::{warn, Logger};

use crate::handler::Handler;
use crate::net::{SessionEvent, SessionOps, SharedContext};

/// Owns every session for one shard and routes range operations to them. Not `Clone`,
/// not shareable across threads — exactly one pool per shard, touched only from the
/// shard's own worker thread.
pub struct SessionPool<S: SessionOps> {
    sessions: Vec<S>,
    active_sessions: usize,
    closed: bool,
    context: Rc<SharedContext>,
    log: Logger,
}

impl<S: SessionOps> SessionPool<S> {
    pub fn new(context: Rc<SharedContext>, log: Logger) -> Self {
        SessionPool {
            sessions: Vec::new(),
            active_sessions: 0,
            closed: false,
            context,
            log,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Maps a `mio::Token` back to the session that owns it, for the shard's event loop
    /// to dispatch a readiness notification.
    pub fn session_by_token(&mut self, token: mio::Token) -> Option<&mut S> {
        self.sessions.iter_mut().find(|s| s.token() == token)
    }

    /// Refuses if the pool already has sessions; the verifier guarantees exactly one
    /// CREATE per script and that it runs first, so this should never legitimately
    /// fire, but the pool itself does not trust the caller.
    pub fn create(&mut self, count: usize) {
        if !self.sessions.is_empty() {
            warn!(self.log, "ignoring CREATE on a non-empty pool"; "existing" => self.sessions.len());
            return;
        }
        self.sessions.reserve(count);
        for index in 0..count {
            self.sessions.push(S::new(index, self.context.clone()));
        }
    }

    /// Range bounds are verified by the script verifier before an `ActionDescriptor`
    /// ever reaches the pool; the pool does not re-check them (§4.5).
    pub fn start_range(
        &mut self,
        start: u32,
        end: u32,
        endpoint: &S::Endpoint,
        poll: &mio::Poll,
        handler: &mut Handler,
    ) {
        if self.closed {
            return;
        }
        self.active_sessions += (end - start) as usize;
        for session in &mut self.sessions[start as usize..end as usize] {
            session.start(endpoint, poll, handler);
        }
    }

    pub fn send_range(
        &mut self,
        start: u32,
        end: u32,
        copies: u32,
        payload_index: u32,
        poll: &mio::Poll,
        handler: &mut Handler,
    ) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions[start as usize..end as usize] {
            session.send(copies, payload_index, poll, handler);
        }
    }

    pub fn flood_range(&mut self, start: u32, end: u32, poll: &mio::Poll, handler: &mut Handler) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions[start as usize..end as usize] {
            session.flood(poll, handler);
        }
    }

    pub fn drain_range(&mut self, start: u32, end: u32, timeout_ms: u32) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions[start as usize..end as usize] {
            session.drain(timeout_ms);
        }
    }

    /// Stopping sessions here is the DISCONNECT path; each `stop` that actually
    /// transitions a session to CLOSED on this call drives `disconnect_callback` once.
    pub fn stop_range(&mut self, start: u32, end: u32, poll: &mio::Poll, handler: &mut Handler) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions[start as usize..end as usize] {
            if session.stop(poll, handler) == SessionEvent::JustClosed {
                self.disconnect_callback();
            }
        }
    }

    /// Dispatches one readiness notification to the session that owns `token`.
    pub fn dispatch_event(
        &mut self,
        token: mio::Token,
        readiness: mio::Ready,
        poll: &mio::Poll,
        handler: &mut Handler,
    ) {
        let closed = match self.session_by_token(token) {
            Some(session) => session.handle_event(readiness, poll, handler) == SessionEvent::JustClosed,
            None => false,
        };
        if closed {
            self.disconnect_callback();
        }
    }

    /// Checks timers (drain grace, connect timeout) for every session once per tick.
    pub fn tick(&mut self, poll: &mio::Poll) {
        let mut closed = 0;
        for session in &mut self.sessions {
            if session.tick(poll) == SessionEvent::JustClosed {
                closed += 1;
            }
        }
        for _ in 0..closed {
            self.disconnect_callback();
        }
    }

    /// Idempotent: a second call is a no-op because `closed` is already true. Issues
    /// stop to every still-live session.
    pub fn shutdown(&mut self, poll: &mio::Poll, handler: &mut Handler) {
        if self.closed {
            return;
        }
        self.closed = true;
        let len = self.sessions.len() as u32;
        self.stop_range(0, len, poll, handler);
    }

    fn disconnect_callback(&mut self) {
        assert!(self.active_sessions > 0, "active_sessions underflow");
        self.active_sessions -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::metrics::ShardMetrics;
    use crate::net::{ConnectionState, SessionConfig};
    use crate::payload::PayloadManager;
    use mio::Token;

    struct FakeSession {
        token: Token,
        state: ConnectionState,
    }

    impl SessionOps for FakeSession {
        type Endpoint = ();

        fn new(index: usize, _context: Rc<SharedContext>) -> Self {
            FakeSession { token: Token(index), state: ConnectionState::Idle }
        }

        fn token(&self) -> Token {
            self.token
        }

        fn start(&mut self, _endpoint: &(), _poll: &mio::Poll, _handler: &mut Handler) {
            self.state = ConnectionState::Live;
        }

        fn flood(&mut self, _poll: &mio::Poll, _handler: &mut Handler) {}

        fn send(&mut self, _copies: u32, _payload_index: u32, _poll: &mio::Poll, _handler: &mut Handler) {}

        fn drain(&mut self, _timeout_ms: u32) {
            self.state = ConnectionState::Draining;
        }

        fn stop(&mut self, _poll: &mio::Poll, _handler: &mut Handler) -> SessionEvent {
            let was_live = self.state != ConnectionState::Closed;
            self.state = ConnectionState::Closed;
            if was_live { SessionEvent::JustClosed } else { SessionEvent::None }
        }

        fn is_connected(&self) -> bool {
            self.state == ConnectionState::Live
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        fn handle_event(&mut self, _readiness: mio::Ready, _poll: &mio::Poll, _handler: &mut Handler) -> SessionEvent {
            SessionEvent::None
        }

        fn tick(&mut self, _poll: &mio::Poll) -> SessionEvent {
            SessionEvent::None
        }
    }

    fn context() -> Rc<SharedContext> {
        Rc::new(SharedContext {
            config: SessionConfig::default(),
            payloads: std::sync::Arc::new(PayloadManager::new(vec![], vec![])),
            metrics: Rc::new(ShardMetrics::new()),
        })
    }

    #[test]
    fn active_sessions_tracks_start_and_stop() {
        let poll = mio::Poll::new().unwrap();
        let mut pool: SessionPool<FakeSession> = SessionPool::new(context(), flux::logging::discard());
        let mut handler = Handler::Nop(crate::handler::nop::NopHandler::new());
        pool.create(4);
        pool.start_range(0, 4, &(), &poll, &mut handler);
        assert_eq!(pool.active_sessions(), 4);

        pool.stop_range(0, 2, &poll, &mut handler);
        assert_eq!(pool.active_sessions(), 2);

        pool.shutdown(&poll, &mut handler);
        assert_eq!(pool.active_sessions(), 0);
        assert!(pool.is_closed());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let poll = mio::Poll::new().unwrap();
        let mut pool: SessionPool<FakeSession> = SessionPool::new(context(), flux::logging::discard());
        let mut handler = Handler::Nop(crate::handler::nop::NopHandler::new());
        pool.create(2);
        pool.start_range(0, 2, &(), &poll, &mut handler);
        pool.shutdown(&poll, &mut handler);
        pool.shutdown(&poll, &mut handler);
        assert_eq!(pool.active_sessions(), 0);
    }

    #[test]
    fn range_ops_are_no_ops_once_closed() {
        let poll = mio::Poll::new().unwrap();
        let mut pool: SessionPool<FakeSession> = SessionPool::new(context(), flux::logging::discard());
        let mut handler = Handler::Nop(crate::handler::nop::NopHandler::new());
        pool.create(2);
        pool.shutdown(&poll, &mut handler);
        pool.start_range(0, 2, &(), &poll, &mut handler);
        assert_eq!(pool.active_sessions(), 0);
    }
}
