//! The message handler capability (§4.2): parses inbound header/body bytes and produces
//! an optional reply. Two variants exist, NOP and WASM; dispatch is a plain enum match
//! rather than a trait object, since a shard only ever owns one handler instance for its
//! whole lifetime and the set of variants is closed.

pub mod nop;
pub mod wasm;

use crate::error::ProtocolError;

/// Outcome of `parse_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderResult {
    pub length: usize,
    pub status: HeaderStatus,
}

impl HeaderResult {
    pub fn ok(length: usize) -> Self {
        HeaderResult { length, status: HeaderStatus::Ok }
    }

    pub fn error() -> Self {
        HeaderResult { length: 0, status: HeaderStatus::Error }
    }
}

/// A reply to write back, or nothing. An empty vec means "no reply" per §4.2.
pub type ResponsePacket = Vec<u8>;

/// Per-shard handler instance. Built once per shard worker thread (not in the shard's
/// constructor), since a WASM store cannot be shared across threads.
pub enum Handler {
    Nop(nop::NopHandler),
    Wasm(wasm::WasmHandler),
}

impl Handler {
    pub fn parse_header(&mut self, buf: &[u8]) -> HeaderResult {
        match self {
            Handler::Nop(h) => h.parse_header(buf),
            Handler::Wasm(h) => h.parse_header(buf),
        }
    }

    /// Returns the response bytes, or `Err(ProtocolError)` if the handler itself
    /// trapped/faulted while producing a reply (distinct from `parse_header` returning
    /// ERROR, which is a protocol-level rejection handled by the caller before this is
    /// ever invoked).
    pub fn parse_message(
        &mut self,
        header: &[u8],
        body: &[u8],
    ) -> Result<ResponsePacket, ProtocolError> {
        match self {
            Handler::Nop(h) => Ok(h.parse_message(header, body)),
            Handler::Wasm(h) => h.parse_message(header, body),
        }
    }
}

/// Builds a fresh `Handler` instance. Cloned into every shard and invoked on the shard's
/// own worker thread, so a WASM factory can lazily compile/share the module while still
/// handing each shard a private store.
pub trait HandlerFactory: Send + Sync {
    fn build(&self) -> Handler;
}

pub struct NopHandlerFactory;

impl HandlerFactory for NopHandlerFactory {
    fn build(&self) -> Handler {
        Handler::Nop(nop::NopHandler::new())
    }
}
