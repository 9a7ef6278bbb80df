//! TCP client session state machine (§4.3,
//! `original_source/src/transports/tcp-session.h`).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};

use flux::logging::{warn, Logger};

use crate::handler::{Handler, HeaderStatus, ResponsePacket};
use crate::net::{ConnectionState, SessionEvent, SessionOps, SharedContext};
use crate::payload::PreparedPayload;

/// Body reads up to this size use the inline buffer; larger bodies grow `large_body`.
const INLINE_BODY_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Body { length: usize },
}

pub struct TcpSession {
    index: usize,
    token: Token,
    context: Rc<SharedContext>,
    log: Logger,

    stream: Option<TcpStream>,
    state: ConnectionState,
    read_state: ReadState,

    header_buf: Vec<u8>,
    header_filled: usize,
    body_inline: [u8; INLINE_BODY_SIZE],
    body_large: Vec<u8>,
    body_filled: usize,

    responses: VecDeque<ResponsePacket>,
    writing: bool,
    write_cursor: usize,
    write_buf: Vec<u8>,
    writes_queued: u32,
    send_target: Option<usize>,
    flooding: bool,
    next_payload_index: usize,
    current_payload: PreparedPayload,

    connect_started_at: Option<Instant>,
    write_started_at: Option<Instant>,
    read_started_at: Option<Instant>,
    write_sample_counter: u32,
    read_sample_counter: u32,
    drain_deadline: Option<Instant>,

    disconnect_called: bool,
    reached_live: bool,
    interest: Ready,
}

impl TcpSession {
    fn header_size(&self) -> usize {
        self.context.config.header_size
    }

    fn arm_header_read(&mut self) {
        self.read_state = ReadState::Header;
        self.header_filled = 0;
    }

    fn registered_interest(&mut self, poll: &Poll, interest: Ready) -> io::Result<()> {
        if let Some(stream) = &self.stream {
            if self.interest == interest {
                return Ok(());
            }
            self.interest = interest;
            poll.reregister(stream, self.token, interest, PollOpt::edge())?;
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        self.writing || !self.write_buf.is_empty() || self.write_cursor < self.write_buf.len()
    }

    fn refresh_interest(&mut self, poll: &Poll) {
        let mut interest = Ready::readable();
        if self.wants_write() {
            interest |= Ready::writable();
        }
        let _ = self.registered_interest(poll, interest);
    }

    /// Copies one payload's gather list into the flat write buffer. The gather-list
    /// slices stay zero-copy up to this point; `write_buf` is then drained linearly by
    /// `do_write`, with `write_cursor` tracking how much of it has gone out.
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

    fn queue_response(&mut self, response: ResponsePacket) {
        if !response.is_empty() {
            self.write_buf.extend_from_slice(&response);
        }
    }

    fn try_start_write(&mut self) {
        if self.writing || self.state != ConnectionState::Live && self.state != ConnectionState::Draining {
            return;
        }
        if self.write_cursor >= self.write_buf.len() {
            if !self.responses.is_empty() {
                if let Some(next) = self.responses.pop_front() {
                    self.queue_response(next);
                }
            } else if self.flooding {
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
        if self.write_cursor < self.write_buf.len() {
            self.writing = true;
            self.write_started_at = Some(Instant::now());
        }
    }

    fn do_write(&mut self) {
        let stream = match &mut self.stream {
            Some(s) => s,
            None => return,
        };
        loop {
            if self.write_cursor >= self.write_buf.len() {
                break;
            }
            match stream.write(&self.write_buf[self.write_cursor..]) {
                Ok(0) => {
                    self.close_session();
                    return;
                }
                Ok(n) => {
                    self.write_cursor += n;
                    self.context.metrics.record_bytes_sent(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.close_session();
                    return;
                }
            }
        }

        self.write_buf.clear();
        self.write_cursor = 0;
        self.writing = false;

        self.write_sample_counter += 1;
        if self.write_sample_counter >= self.context.config.packet_sample_rate {
            self.write_sample_counter = 0;
            if let Some(start) = self.write_started_at.take() {
                self.context.metrics.record_send_latency(start.elapsed());
            }
        }

        if self.state == ConnectionState::Draining && !self.wants_write() {
            self.close_session();
            return;
        }

        self.try_start_write();
    }

    fn do_read_header(&mut self) -> bool {
        let header_size = self.header_size();
        if header_size == 0 {
            return true;
        }
        if self.header_buf.len() != header_size {
            self.header_buf.resize(header_size, 0);
        }
        let stream = match &mut self.stream {
            Some(s) => s,
            None => return false,
        };
        loop {
            if self.header_filled >= header_size {
                return true;
            }
            match stream.read(&mut self.header_buf[self.header_filled..header_size]) {
                Ok(0) => {
                    self.close_session();
                    return false;
                }
                Ok(n) => self.header_filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.close_session();
                    return false;
                }
            }
        }
    }

    fn do_read_body(&mut self, length: usize) -> bool {
        let use_inline = length <= INLINE_BODY_SIZE;
        if !use_inline && self.body_large.len() != length {
            self.body_large.resize(length, 0);
        }
        let stream = match &mut self.stream {
            Some(s) => s,
            None => return false,
        };
        loop {
            if self.body_filled >= length {
                return true;
            }
            let result = if use_inline {
                stream.read(&mut self.body_inline[self.body_filled..length])
            } else {
                stream.read(&mut self.body_large[self.body_filled..length])
            };
            match result {
                Ok(0) => {
                    self.close_session();
                    return false;
                }
                Ok(n) => self.body_filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.close_session();
                    return false;
                }
            }
        }
    }

    fn handle_message(&mut self, handler: &mut Handler) {
        let body: &[u8] = if self.body_filled <= INLINE_BODY_SIZE {
            &self.body_inline[..self.body_filled]
        } else {
            &self.body_large[..self.body_filled]
        };
        self.context.metrics.record_bytes_read(body.len() as u64);

        self.read_sample_counter += 1;
        if self.read_sample_counter >= self.context.config.packet_sample_rate {
            self.read_sample_counter = 0;
            if let Some(start) = self.read_started_at.take() {
                self.context.metrics.record_read_latency(start.elapsed());
            }
        }

        match handler.parse_message(&self.header_buf[..], body) {
            Ok(response) if !response.is_empty() => self.responses.push_back(response),
            Ok(_) => {}
            Err(_) => {
                self.close_session();
                return;
            }
        }
        self.arm_header_read();
    }

    fn pump_reads(&mut self, handler: &mut Handler) {
        loop {
            match self.read_state {
                ReadState::Header => {
                    if !self.do_read_header() {
                        return;
                    }
                    let result = handler.parse_header(&self.header_buf);
                    match result.status {
                        HeaderStatus::Ok => {
                            self.body_filled = 0;
                            self.read_started_at = Some(Instant::now());
                            self.read_state = ReadState::Body { length: result.length };
                            if result.length == 0 {
                                self.handle_message(handler);
                            }
                        }
                        HeaderStatus::Error | HeaderStatus::Timeout => {
                            self.close_session();
                            return;
                        }
                    }
                }
                ReadState::Body { length } => {
                    if !self.do_read_body(length) {
                        return;
                    }
                    self.handle_message(handler);
                }
            }
        }
    }

    fn close_session(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.stream = None;
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

impl SessionOps for TcpSession {
    type Endpoint = SocketAddr;

    fn new(index: usize, context: Rc<SharedContext>) -> Self {
        TcpSession {
            index,
            token: Token(index),
            context,
            log: flux::logging::discard(),
            stream: None,
            state: ConnectionState::Idle,
            read_state: ReadState::Header,
            header_buf: Vec::new(),
            header_filled: 0,
            body_inline: [0u8; INLINE_BODY_SIZE],
            body_large: Vec::new(),
            body_filled: 0,
            responses: VecDeque::new(),
            writing: false,
            write_cursor: 0,
            write_buf: Vec::new(),
            writes_queued: 0,
            send_target: None,
            flooding: false,
            next_payload_index: 0,
            current_payload: PreparedPayload::new(),
            connect_started_at: None,
            write_started_at: None,
            read_started_at: None,
            write_sample_counter: 0,
            read_sample_counter: 0,
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
            warn!(self.log, "start called on a non-idle session"; "index" => self.index);
            return;
        }
        self.context.metrics.record_connection_attempt();
        self.connect_started_at = Some(Instant::now());
        match TcpStream::connect(endpoint) {
            Ok(stream) => {
                let _ = poll.register(&stream, self.token, Ready::writable(), PollOpt::edge());
                self.interest = Ready::writable();
                self.stream = Some(stream);
                self.state = ConnectionState::Connecting;
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
        self.try_start_write();
        self.refresh_interest(poll);
    }

    fn send(&mut self, copies: u32, payload_index: u32, poll: &Poll, _handler: &mut Handler) {
        if self.state != ConnectionState::Live {
            return;
        }
        self.writes_queued += copies;
        self.send_target = Some(payload_index as usize);
        self.try_start_write();
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
        if self.state == ConnectionState::Connecting {
            let connected = self
                .stream
                .as_ref()
                .and_then(|s| s.take_error().ok())
                .flatten()
                .is_none();
            if connected {
                self.state = ConnectionState::Live;
                self.reached_live = true;
                if let Some(start) = self.connect_started_at.take() {
                    self.context.metrics.record_connection_latency(start.elapsed());
                }
                self.arm_header_read();
            } else {
                self.close_session();
            }
        } else {
            if readiness.is_readable() && self.context.config.read_enabled {
                self.pump_reads(handler);
            }
            if self.state != ConnectionState::Closed && readiness.is_writable() {
                self.try_start_write();
                self.do_write();
            }
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
