//! Pre-lowering script data (§6.2 DSL shape, consumed here as its post-parse JSON
//! form; `original_source/src/interpreter/script-structs.h`). These are the types the
//! verifier checks; `lower` turns a verified `Program` into the flat
//! `Vec<ActionDescriptor>` plus `PayloadManager` inputs a `Shard` actually runs.

use std::path::Path;

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::action::ActionDescriptor;
use crate::error::ScriptError;
use crate::payload::{Endian as RuntimeEndian, PacketOperation, PayloadDescriptor, TimeUnit as RuntimeTimeUnit};
use crate::resolve::{self, ResolveOptions};

pub const VALID_PROTOCOLS: &[&str] = &["TCP"];
pub const VALID_MESSAGE_HANDLERS: &[&str] = &["NOP"];
pub const VALID_TIME_FORMATS: &[&str] = &["seconds", "milliseconds", "microseconds", "nanoseconds"];

fn default_sample_rate() -> u32 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsBlock {
    pub identifier: String,
    pub session_protocol: String,
    pub header_size: u32,
    pub body_max: u32,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub repeat: bool,
    pub shards: u32,
    pub handler_value: String,
    pub endpoints: Vec<String>,
    pub packet_identifiers: IndexMap<String, String>,
    #[serde(default = "default_sample_rate")]
    pub packet_sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawActionType {
    Create,
    Connect,
    Send,
    Flood,
    Drain,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTimestampModification {
    pub start: u32,
    pub length: u32,
    pub little_endian: bool,
    pub format_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CounterModification {
    pub start: u32,
    pub length: u32,
    pub little_endian: bool,
    pub counter_step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_type: RawActionType,
    #[serde(default)]
    pub count: u32,
    pub range_start: u32,
    pub range_end: u32,
    #[serde(default)]
    pub offset_ms: u32,
    #[serde(default)]
    pub packet_identifier: String,
    #[serde(default)]
    pub timestamp_mods: Vec<RawTimestampModification>,
    #[serde(default)]
    pub counter_mods: Vec<CounterModification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorBlock {
    pub settings_identifier: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub settings: SettingsBlock,
    pub orchestrator: OrchestratorBlock,
}

/// Everything a `loadshear-cli` run needs after a `Program` passes the verifier:
/// the lowered, shard-ready action timeline plus the compiled payload catalog.
pub struct LoweredProgram {
    pub actions: Vec<ActionDescriptor>,
    pub payloads: Vec<PayloadDescriptor>,
    /// `steps[i]` is payload `i`'s counter step list, in COUNTER-op order — the shape
    /// `PayloadManager::new` expects.
    pub steps: Vec<Vec<u16>>,
}

fn parse_time_unit(name: &str) -> RuntimeTimeUnit {
    match name {
        "seconds" => RuntimeTimeUnit::Seconds,
        "milliseconds" => RuntimeTimeUnit::Milliseconds,
        "microseconds" => RuntimeTimeUnit::Microseconds,
        _ => RuntimeTimeUnit::Nanoseconds,
    }
}

/// One absolute byte range carved out of a packet by a modification, used to build
/// the contiguous op sequence a `PayloadDescriptor` needs.
enum ModSpan {
    Counter { start: u32, length: u32, endian: RuntimeEndian, step: u32 },
    Timestamp { start: u32, length: u32, endian: RuntimeEndian, unit: RuntimeTimeUnit },
}

impl ModSpan {
    fn start(&self) -> u32 {
        match self {
            ModSpan::Counter { start, .. } => *start,
            ModSpan::Timestamp { start, .. } => *start,
        }
    }

    fn length(&self) -> u32 {
        match self {
            ModSpan::Counter { length, .. } => *length,
            ModSpan::Timestamp { length, .. } => *length,
        }
    }
}

/// Builds one packet's op sequence from its raw bytes and (already verifier-checked,
/// non-overlapping, in-bounds) modifications: sorts the spans by start offset and
/// fills the gaps between/after them with `Identity` ops, so `ops` ends up covering
/// `[0, packet_bytes.len())` exactly once each, as `PayloadDescriptor::new` requires.
fn build_descriptor(packet_bytes: Vec<u8>, action: &Action) -> (PayloadDescriptor, Vec<u16>) {
    let mut spans: Vec<ModSpan> = Vec::new();
    let mut steps = Vec::new();

    for m in &action.counter_mods {
        spans.push(ModSpan::Counter {
            start: m.start,
            length: m.length,
            endian: if m.little_endian { RuntimeEndian::Little } else { RuntimeEndian::Big },
            step: m.counter_step,
        });
        steps.push(m.counter_step.min(u16::MAX as u32) as u16);
    }
    for m in &action.timestamp_mods {
        spans.push(ModSpan::Timestamp {
            start: m.start,
            length: m.length,
            endian: if m.little_endian { RuntimeEndian::Little } else { RuntimeEndian::Big },
            unit: parse_time_unit(&m.format_name),
        });
    }
    spans.sort_by_key(|s| s.start());

    let mut ops = Vec::new();
    let mut cursor: u32 = 0;
    for span in &spans {
        if span.start() > cursor {
            ops.push(PacketOperation::Identity { length: (span.start() - cursor) as u8 });
        }
        let op = match span {
            ModSpan::Counter { length, endian, .. } => {
                PacketOperation::Counter { length: *length as u8, endian: *endian }
            }
            ModSpan::Timestamp { length, endian, unit, .. } => {
                PacketOperation::Timestamp { length: *length as u8, endian: *endian, unit: *unit }
            }
        };
        ops.push(op);
        cursor = span.start() + span.length();
    }
    let total = packet_bytes.len() as u32;
    if total > cursor {
        ops.push(PacketOperation::Identity { length: (total - cursor) as u8 });
    }

    (PayloadDescriptor::new(packet_bytes, ops), steps)
}

impl Program {
    /// Resolves every SEND action's packet file, verifies the script (§4.8), and lowers
    /// it into a shard-ready `LoweredProgram`. `base_dir` is the script file's own
    /// directory, since packet/handler paths are conventionally relative to it.
    pub fn lower(&self, base_dir: &Path, resolve_options: ResolveOptions) -> Result<LoweredProgram, ScriptError> {
        super::verifier::verify(self, base_dir, resolve_options)?;

        let mut actions = Vec::with_capacity(self.orchestrator.actions.len());
        let mut payloads = Vec::new();
        let mut steps = Vec::new();
        let mut offset = 0u32;

        for raw in &self.orchestrator.actions {
            offset = offset.saturating_add(raw.offset_ms);
            let descriptor = match raw.action_type {
                RawActionType::Create => ActionDescriptor::create(raw.count, offset),
                RawActionType::Connect => ActionDescriptor::connect(raw.range_start, raw.range_end, offset),
                RawActionType::Flood => ActionDescriptor::flood(raw.range_start, raw.range_end, offset),
                RawActionType::Drain => ActionDescriptor::drain(raw.range_start, raw.range_end, raw.count, offset),
                RawActionType::Disconnect => {
                    ActionDescriptor::disconnect(raw.range_start, raw.range_end, offset)
                }
                RawActionType::Send => {
                    let packet_path = self
                        .settings
                        .packet_identifiers
                        .get(&raw.packet_identifier)
                        .expect("verifier already confirmed this packet identifier exists");
                    let resolved = resolve::resolve_relative(packet_path, base_dir, resolve_options)
                        .map_err(|_| ScriptError::PacketUnresolved(raw.packet_identifier.clone()))?;
                    let packet_bytes = resolve::read_binary_file(&resolved)
                        .map_err(|_| ScriptError::PacketUnresolved(raw.packet_identifier.clone()))?;

                    let (descriptor, mod_steps) = build_descriptor(packet_bytes, raw);
                    let payload_index = payloads.len() as u32;
                    payloads.push(descriptor);
                    steps.push(mod_steps);
                    ActionDescriptor::send(raw.range_start, raw.range_end, raw.count, payload_index, offset)
                }
            };
            actions.push(descriptor);
        }

        Ok(LoweredProgram { actions, payloads, steps })
    }
}
