//! Error taxonomy for the engine, following the plain-enum-plus-`From`-impls idiom
//! used by `flux::shared::NetworkError` rather than a derive-macro error crate.

use std::fmt;
use std::io;

pub use flux::shared::{ErrorType, NetworkError, NetworkResult};

/// Failure parsing or verifying a script program (§7 ScriptError).
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptError {
    Empty(&'static str),
    InvalidProtocol(String),
    MissingBodyMax,
    TooFewShards,
    NoEndpoints,
    NoPackets,
    PacketUnresolved(String),
    InvalidHandler(String),
    SettingsMismatch { expected: String, found: String },
    NotFirstCreate,
    MultipleCreate,
    CreateCountTooSmall { count: u32, shards: u32 },
    RangeOutOfBounds { start: u32, end: u32, create_count: u32 },
    AlreadyConnected(u32),
    NotConnected(u32),
    AlreadyDisconnected(u32),
    SendCountZero,
    UnknownPacket(String),
    ModificationOutOfRange { start: u32, length: u32, packet_size: u32 },
    ModificationOverlap { a: (u32, u32), b: (u32, u32) },
    InvalidTimeUnit(String),
    InvalidCounterStep(u32),
    DrainTimeoutZero,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Empty(field) => write!(f, "{} must not be empty", field),
            ScriptError::InvalidProtocol(p) => write!(f, "unsupported protocol: {}", p),
            ScriptError::MissingBodyMax => write!(f, "body_max must be > 0 when read is enabled"),
            ScriptError::TooFewShards => write!(f, "shards must be >= 1"),
            ScriptError::NoEndpoints => write!(f, "at least one endpoint is required"),
            ScriptError::NoPackets => write!(f, "at least one packet is required"),
            ScriptError::PacketUnresolved(id) => write!(f, "packet '{}' does not resolve", id),
            ScriptError::InvalidHandler(h) => write!(f, "invalid handler: {}", h),
            ScriptError::SettingsMismatch { expected, found } => write!(
                f,
                "orchestrator settings_identifier '{}' does not match settings block '{}'",
                found, expected
            ),
            ScriptError::NotFirstCreate => write!(f, "CREATE must be the first action"),
            ScriptError::MultipleCreate => write!(f, "exactly one CREATE action is allowed"),
            ScriptError::CreateCountTooSmall { count, shards } => write!(
                f,
                "CREATE count {} is smaller than shard count {}",
                count, shards
            ),
            ScriptError::RangeOutOfBounds { start, end, create_count } => write!(
                f,
                "session range [{}, {}) falls outside [0, {})",
                start, end, create_count
            ),
            ScriptError::AlreadyConnected(i) => {
                write!(f, "session {} is already connected", i)
            }
            ScriptError::NotConnected(i) => {
                write!(f, "session {} is not connected", i)
            }
            ScriptError::AlreadyDisconnected(i) => {
                write!(f, "session {} is already disconnected", i)
            }
            ScriptError::SendCountZero => write!(f, "SEND count must be >= 1"),
            ScriptError::UnknownPacket(id) => write!(f, "unknown packet id: {}", id),
            ScriptError::ModificationOutOfRange { start, length, packet_size } => write!(
                f,
                "modification [{}, {}) falls outside packet of size {}",
                start,
                start + length,
                packet_size
            ),
            ScriptError::ModificationOverlap { a, b } => write!(
                f,
                "modification range [{}, {}) overlaps [{}, {})",
                a.0, a.1, b.0, b.1
            ),
            ScriptError::InvalidTimeUnit(u) => write!(f, "invalid time unit: {}", u),
            ScriptError::InvalidCounterStep(s) => write!(f, "invalid counter step: {}", s),
            ScriptError::DrainTimeoutZero => write!(f, "DRAIN timeout must be > 0"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// File/path resolution failure (§7 ResolveError).
#[derive(Debug)]
pub enum ResolveError {
    NotFound(String),
    Io(String, io::Error),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NotFound(path) => write!(f, "path does not resolve: {}", path),
            ResolveError::Io(path, err) => write!(f, "failed to read '{}': {}", path, err),
        }
    }
}

impl std::error::Error for ResolveError {}

/// WASM module compile/instantiation failure (§7 WasmError).
#[derive(Debug)]
pub enum WasmError {
    Compile(String),
    Instantiate(String),
    MissingExport(&'static str),
    Trap(String),
}

impl fmt::Display for WasmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmError::Compile(msg) => write!(f, "failed to compile wasm module: {}", msg),
            WasmError::Instantiate(msg) => write!(f, "failed to instantiate wasm module: {}", msg),
            WasmError::MissingExport(name) => write!(f, "wasm module is missing export '{}'", name),
            WasmError::Trap(msg) => write!(f, "wasm call trapped: {}", msg),
        }
    }
}

impl std::error::Error for WasmError {}

/// Protocol-level handler failure: `parse_header` returned ERROR (§7 ProtocolError).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError;

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler reported a protocol error")
    }
}

impl std::error::Error for ProtocolError {}

/// Top-level error surfaced to the CLI (§7: ScriptError/ResolveError/WasmError are fatal
/// at startup; NetworkError/ProtocolError never escape a session; Timeout is logged only).
#[derive(Debug)]
pub enum LoadshearError {
    Script(ScriptError),
    Resolve(ResolveError),
    Wasm(WasmError),
}

impl fmt::Display for LoadshearError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadshearError::Script(e) => write!(f, "{}", e),
            LoadshearError::Resolve(e) => write!(f, "{}", e),
            LoadshearError::Wasm(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoadshearError {}

impl From<ScriptError> for LoadshearError {
    fn from(e: ScriptError) -> Self {
        LoadshearError::Script(e)
    }
}

impl From<ResolveError> for LoadshearError {
    fn from(e: ResolveError) -> Self {
        LoadshearError::Resolve(e)
    }
}

impl From<WasmError> for LoadshearError {
    fn from(e: WasmError) -> Self {
        LoadshearError::Wasm(e)
    }
}
