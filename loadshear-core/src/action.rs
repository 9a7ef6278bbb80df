//! Lowered action descriptors (§6.1). Shards never see the full script program; every
//! action they execute is one of these, self-contained.

/// What kind of range operation an `ActionDescriptor` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Create,
    Connect,
    Send,
    Flood,
    Drain,
    Disconnect,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Connect => "CONNECT",
            ActionType::Send => "SEND",
            ActionType::Flood => "FLOOD",
            ActionType::Drain => "DRAIN",
            ActionType::Disconnect => "DISCONNECT",
        }
    }
}

/// One scheduled step handed to a shard's `submit_work`. `count`'s meaning is
/// action-type-dependent: CREATE uses it as `end - start`, SEND as a copy count, DRAIN as
/// a timeout in milliseconds; CONNECT/FLOOD/DISCONNECT ignore it. `payload_index` is only
/// populated for SEND: the script's packet_id plus its modifications are compiled into a
/// single `PayloadDescriptor` at load time (see `script::program::lower`), and the action
/// just names which one to fetch from the shared `PayloadManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub action_type: ActionType,
    pub sessions_start: u32,
    pub sessions_end: u32,
    pub count: u32,
    /// Absolute offset in milliseconds from orchestrator start (cumulative sum of the
    /// script's per-action offsets), not the action's own relative offset.
    pub offset: u32,
    pub payload_index: Option<u32>,
}

impl ActionDescriptor {
    pub fn create(count: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Create,
            sessions_start: 0,
            sessions_end: count,
            count,
            offset,
            payload_index: None,
        }
    }

    pub fn connect(start: u32, end: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Connect,
            sessions_start: start,
            sessions_end: end,
            count: 0,
            offset,
            payload_index: None,
        }
    }

    pub fn send(start: u32, end: u32, copies: u32, payload_index: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Send,
            sessions_start: start,
            sessions_end: end,
            count: copies,
            offset,
            payload_index: Some(payload_index),
        }
    }

    /// FLOOD names no single packet: the DSL's `FLOOD a:b` has no packet id, so each
    /// session cycles through the full payload catalog via its own running cursor
    /// (wrapping when `repeat` is set), the way `loop_payloads` drives the original.
    pub fn flood(start: u32, end: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Flood,
            sessions_start: start,
            sessions_end: end,
            count: 0,
            offset,
            payload_index: None,
        }
    }

    pub fn drain(start: u32, end: u32, timeout_ms: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Drain,
            sessions_start: start,
            sessions_end: end,
            count: timeout_ms,
            offset,
            payload_index: None,
        }
    }

    pub fn disconnect(start: u32, end: u32, offset: u32) -> Self {
        ActionDescriptor {
            action_type: ActionType::Disconnect,
            sessions_start: start,
            sessions_end: end,
            count: 0,
            offset,
            payload_index: None,
        }
    }
}
