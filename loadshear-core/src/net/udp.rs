//! UDP client session state machine (§4.4,
//! `original_source/src/transports/udp-session.h`). Connection-less: `start` just binds
//! and associates the remote endpoint; there is no connect phase and no half-close.

use std::io::{self};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use mio::net::UdpSocket;
use mio::{Poll, PollOpt, Ready, Token};

use crate::handler::{Handler, HeaderStatus};
use crate::net::{ConnectionState, SessionEvent, SessionOps, SharedContext};
use crate::payload::PreparedPayload;

/// `65535 - 8`: largest UDP datagram over IPv4 after the UDP header. IPv6 is not
/// considered (§9 Open Questions); a future IPv6-aware build should cap at `65527 - 40`.
pub const MAX_DATAGRAM_SIZE: usize = 65535 - 8;

pub struct UdpSession {
    index: usize,
    token: Token,
    context: Rc<SharedContext>,

    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    state: ConnectionState,

    packet_buffer: Vec<u8>,

    write_buf: Vec<u8>,
    writing: bool,
    writes_queued: u32,
    send_target: Option<usize>,
    flooding: bool,
    next_payload_index: usize,
    current_payload: PreparedPayload,

    write_sample_counter: u32,
    read_sample_counter: u32,
    write_started_at: Option<Instant>,
    read_started_at: Option<Instant>,

    drain_deadline: Option<Instant>,
    disconnect_called: bool,
    reached_live: bool,
    interest: Ready,
}

impl UdpSession {
    fn datagram_limit(&self) -> usize {
        self.context
            .config
            .payload_size_limit
            .min(MAX_DATAGRAM_SIZE)
    }

    fn wants_write(&self) -> bool {
        self.writing || !self.write_buf.is_empty()
    }

    fn refresh_interest(&mut self, poll: &Poll) {
        if let Some(socket) = &self.socket {
            let mut interest = Ready::readable();
            if self.wants_write() {
                interest |= Ready::writable();
            }
            if interest != self.interest {
                self.interest = interest;
                let _ = poll.reregister(socket, self.token, interest, PollOpt::edge());
            }
        }
    }

    fn queue_prepared_payload(&mut self, index: usize) {
        let packet_bytes = self
            .context
            .payloads
            .descriptor(index)
            .map(|d| d.packet_bytes().to_vec())
            .unwrap_or_default();

        if !self.context.payloads.fill(index, &mut self.current_payload) {
            return;
        }

        self.write_buf.clear();
        for slice in self.current_payload.io_slices(&packet_bytes) {
            self.write_buf.extend_from_slice(&slice);
        }
    }

    /// Advances the FLOOD cursor to the next payload in the catalog. Wraps to the
    /// start if `repeat` is set; otherwise one pass through the whole catalog is all
    /// a FLOOD does, and this turns flooding off once that pass completes.
    fn advance_flood_cursor(&mut self) {
        let payload_count = self.context.payloads.payload_count();
        if payload_count == 0 {
            self.flooding = false;
            return;
        }
        self.next_payload_index += 1;
        if self.next_payload_index >= payload_count {
            if self.context.config.repeat {
                self.next_payload_index = 0;
            } else {
                self.flooding = false;
            }
        }
    }

    fn try_send_one(&mut self) {
        if self.writing {
            return;
        }
        if self.write_buf.is_empty() {
            if self.flooding {
                let index = self.next_payload_index;
                self.queue_prepared_payload(index);
                self.advance_flood_cursor();
            } else if self.writes_queued > 0 {
                self.writes_queued -= 1;
                if let Some(index) = self.send_target {
                    self.queue_prepared_payload(index);
                }
            }
        }
        if !self.write_buf.is_empty() {
            self.writing = true;
            self.write_started_at = Some(Instant::now());
        }
    }

    fn do_send(&mut self) {
        let (socket, remote) = match (&self.socket, self.remote) {
            (Some(s), Some(r)) => (s, r),
            _ => return,
        };
        match socket.send_to(&self.write_buf, &remote) {
            Ok(n) => {
                self.context.metrics.record_bytes_sent(n as u64);
                self.write_buf.clear();
                self.writing = false;
                self.write_sample_counter += 1;
                if self.write_sample_counter >= self.context.config.packet_sample_rate {
                    self.write_sample_counter = 0;
                    if let Some(start) = self.write_started_at.take() {
                        self.context.metrics.record_send_latency(start.elapsed());
                    }
                }
                self.try_send_one();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.close_session(),
        }
    }

    fn do_receive(&mut self, handler: &mut Handler) {
        let limit = self.datagram_limit();
        if self.packet_buffer.len() != limit {
            self.packet_buffer.resize(limit, 0);
        }
        let socket = match &self.socket {
            Some(s) => s,
            None => return,
        };
        loop {
            match socket.recv(&mut self.packet_buffer) {
                Ok(n) => {
                    self.context.metrics.record_bytes_read(n as u64);
                    self.read_sample_counter += 1;
                    if self.read_sample_counter >= self.context.config.packet_sample_rate {
                        self.read_sample_counter = 0;
                        if let Some(start) = self.read_started_at.replace(Instant::now()) {
                            self.context.metrics.record_read_latency(start.elapsed());
                        }
                    }

                    let header_result = handler.parse_header(&self.packet_buffer[..n]);
                    if header_result.status == HeaderStatus::Error {
                        self.close_session();
                        return;
                    }
                    match handler.parse_message(&[], &self.packet_buffer[..n]) {
                        Ok(response) if !response.is_empty() => {
                            self.write_buf.extend_from_slice(&response);
                            self.try_send_one();
                        }
                        Ok(_) => {}
                        Err(_) => {
                            self.close_session();
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn close_session(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.socket = None;
    }

    /// Fires at most once per session: a close pre-`Live` counts as failed, anything
    /// that reached `Live` first counts as finished (§7). Call sites must only reach
    /// here once the session is actually `Closed`.
    fn record_closed(&mut self) -> SessionEvent {
        if self.disconnect_called {
            return SessionEvent::None;
        }
        self.disconnect_called = true;
        if self.reached_live {
            self.context.metrics.record_finished_connection();
        } else {
            self.context.metrics.record_failed_connection();
        }
        SessionEvent::JustClosed
    }
}

impl SessionOps for UdpSession {
    type Endpoint = SocketAddr;

    fn new(index: usize, context: Rc<SharedContext>) -> Self {
        UdpSession {
            index,
            token: Token(index),
            context,
            socket: None,
            remote: None,
            state: ConnectionState::Idle,
            packet_buffer: Vec::new(),
            write_buf: Vec::new(),
            writing: false,
            writes_queued: 0,
            send_target: None,
            flooding: false,
            next_payload_index: 0,
            current_payload: PreparedPayload::new(),
            write_sample_counter: 0,
            read_sample_counter: 0,
            write_started_at: None,
            read_started_at: None,
            drain_deadline: None,
            disconnect_called: false,
            reached_live: false,
            interest: Ready::empty(),
        }
    }

    fn token(&self) -> Token {
        self.token
    }

    fn start(&mut self, endpoint: &SocketAddr, poll: &Poll, _handler: &mut Handler) {
        if self.state != ConnectionState::Idle {
            return;
        }
        self.context.metrics.record_connection_attempt();
        let bind_addr: SocketAddr = if endpoint.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        match UdpSocket::bind(&bind_addr) {
            Ok(socket) => {
                let _ = poll.register(&socket, self.token, Ready::readable(), PollOpt::edge());
                self.interest = Ready::readable();
                self.socket = Some(socket);
                self.remote = Some(*endpoint);
                self.state = ConnectionState::Live;
                self.reached_live = true;
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
            }
        }
    }

    fn flood(&mut self, poll: &Poll, _handler: &mut Handler) {
        if self.state != ConnectionState::Live {
            return;
        }
        self.flooding = true;
        self.try_send_one();
        self.do_send();
        self.refresh_interest(poll);
    }

    fn send(&mut self, copies: u32, payload_index: u32, poll: &Poll, _handler: &mut Handler) {
        if self.state != ConnectionState::Live {
            return;
        }
        self.writes_queued += copies;
        self.send_target = Some(payload_index as usize);
        self.try_send_one();
        self.do_send();
        self.refresh_interest(poll);
    }

    fn drain(&mut self, timeout_ms: u32) {
        if self.state != ConnectionState::Live {
            return;
        }
        self.flooding = false;
        self.state = ConnectionState::Draining;
        self.drain_deadline = Some(Instant::now() + crate::net::drain_deadline(timeout_ms));
    }

    fn stop(&mut self, _poll: &Poll, _handler: &mut Handler) -> SessionEvent {
        self.close_session();
        self.record_closed()
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Live || self.state == ConnectionState::Draining
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn handle_event(&mut self, readiness: Ready, poll: &Poll, handler: &mut Handler) -> SessionEvent {
        if readiness.is_readable() && self.context.config.read_enabled {
            self.do_receive(handler);
        }
        if self.state != ConnectionState::Closed && readiness.is_writable() {
            self.try_send_one();
            self.do_send();
        }
        self.refresh_interest(poll);

        if self.state == ConnectionState::Closed {
            self.record_closed()
        } else {
            SessionEvent::None
        }
    }

    fn tick(&mut self, _poll: &Poll) -> SessionEvent {
        if self.state == ConnectionState::Draining {
            let expired = self.drain_deadline.map(|d| Instant::now() >= d).unwrap_or(false);
            if expired || self.write_buf.is_empty() {
                self.close_session();
            }
        }
        if self.state == ConnectionState::Closed {
            self.record_closed()
        } else {
            SessionEvent::None
        }
    }
}
