//! The 12 acceptance rules of §4.8, grounded on
//! `original_source/src/interpreter/interpreter.cpp`'s `verify_script`. Connection
//! tracking uses a plain `Vec<bool>` bitmap the way the original uses
//! `std::vector<uint8_t>` — one entry per session, sized by the single CREATE action.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ScriptError;
use crate::resolve::{self, ResolveOptions};
use crate::script::program::{
    Program, RawActionType, VALID_MESSAGE_HANDLERS, VALID_PROTOCOLS, VALID_TIME_FORMATS,
};

/// Records one modification's byte range into `ranges`, rejecting it if it overlaps
/// any range already recorded for this action (§4.8 rule 11's "do not overlap").
fn insert_mod_range(ranges: &mut BTreeMap<u32, u32>, start: u32, length: u32) -> Result<(), ScriptError> {
    let end = start + length;
    if let Some((&other_start, &other_end)) = ranges.range(..end).next_back() {
        if other_end > start {
            return Err(ScriptError::ModificationOverlap {
                a: (other_start, other_end),
                b: (start, end),
            });
        }
    }
    ranges.insert(start, end);
    Ok(())
}

/// Runs every §4.8 rule against `program`. Returns the first violation found, in the
/// same settings-then-action-by-action order the original checks them in. `base_dir`
/// and `options` are the same script-directory/`--expand-envs` pair `Program::lower`
/// resolves packet paths with, so a script that verifies here is guaranteed to lower.
pub fn verify(program: &Program, base_dir: &Path, options: ResolveOptions) -> Result<(), ScriptError> {
    let settings = &program.settings;

    if settings.identifier.is_empty() {
        return Err(ScriptError::Empty("SETTINGS identifier"));
    }

    // Rule 1: protocol gate.
    if !VALID_PROTOCOLS.contains(&settings.session_protocol.as_str()) {
        return Err(ScriptError::InvalidProtocol(settings.session_protocol.clone()));
    }

    if settings.read && settings.header_size == 0 {
        return Err(ScriptError::Empty("HEADERSIZE"));
    }
    if settings.read && settings.body_max == 0 {
        return Err(ScriptError::MissingBodyMax);
    }
    if settings.shards == 0 {
        return Err(ScriptError::TooFewShards);
    }

    // Rule 3: endpoints and packets.
    if settings.endpoints.is_empty() {
        return Err(ScriptError::NoEndpoints);
    }
    if settings.packet_identifiers.is_empty() {
        return Err(ScriptError::NoPackets);
    }
    for path in settings.packet_identifiers.values() {
        if resolve::resolve_relative(path, base_dir, options).is_err() {
            return Err(ScriptError::PacketUnresolved(path.clone()));
        }
    }

    // Rule 4: handler.
    if settings.read && !VALID_MESSAGE_HANDLERS.contains(&settings.handler_value.as_str()) {
        if settings.handler_value.ends_with(".wasm") {
            if resolve::resolve_relative(&settings.handler_value, base_dir, options).is_err() {
                return Err(ScriptError::InvalidHandler(settings.handler_value.clone()));
            }
        } else {
            return Err(ScriptError::InvalidHandler(settings.handler_value.clone()));
        }
    }

    // Rule 5: settings/orchestrator identifier match.
    if program.orchestrator.settings_identifier.is_empty() {
        return Err(ScriptError::Empty("ORCHESTRATOR settings identifier"));
    }
    if program.orchestrator.settings_identifier != settings.identifier {
        return Err(ScriptError::SettingsMismatch {
            expected: settings.identifier.clone(),
            found: program.orchestrator.settings_identifier.clone(),
        });
    }

    let mut pool_size: u32 = 0;
    let mut connected: Vec<bool> = Vec::new();
    let mut disconnect_called: Vec<bool> = Vec::new();

    for (index, action) in program.orchestrator.actions.iter().enumerate() {
        match action.action_type {
            RawActionType::Create => {
                // Rule 6: exactly one CREATE, and it must be first.
                if index != 0 {
                    return Err(ScriptError::NotFirstCreate);
                }
                if pool_size != 0 {
                    return Err(ScriptError::MultipleCreate);
                }
                if action.count < settings.shards {
                    return Err(ScriptError::CreateCountTooSmall { count: action.count, shards: settings.shards });
                }
                pool_size = action.count;
                connected = vec![false; pool_size as usize];
                disconnect_called = vec![false; pool_size as usize];
            }
            RawActionType::Connect => {
                check_range(action.range_start, action.range_end, pool_size)?;
                // Rule 8: no CONNECT on an already-connected index.
                for j in action.range_start..action.range_end {
                    if connected[j as usize] {
                        return Err(ScriptError::AlreadyConnected(j));
                    }
                    connected[j as usize] = true;
                }
            }
            RawActionType::Send => {
                // Rule 11: count, packet id, modification ranges.
                if action.count == 0 {
                    return Err(ScriptError::SendCountZero);
                }
                check_range(action.range_start, action.range_end, pool_size)?;

                let packet_path = settings
                    .packet_identifiers
                    .get(&action.packet_identifier)
                    .ok_or_else(|| ScriptError::UnknownPacket(action.packet_identifier.clone()))?;
                let resolved = resolve::resolve_relative(packet_path, base_dir, options)
                    .map_err(|_| ScriptError::PacketUnresolved(action.packet_identifier.clone()))?;
                let packet_size = resolve::file_size(&resolved) as u32;
                if packet_size == 0 {
                    return Err(ScriptError::PacketUnresolved(action.packet_identifier.clone()));
                }

                let mut mod_ranges = BTreeMap::new();
                for t in &action.timestamp_mods {
                    insert_mod_range(&mut mod_ranges, t.start, t.length)?;
                    if !VALID_TIME_FORMATS.contains(&t.format_name.as_str()) {
                        return Err(ScriptError::InvalidTimeUnit(t.format_name.clone()));
                    }
                    if t.length > 8 {
                        return Err(ScriptError::ModificationOutOfRange {
                            start: t.start,
                            length: t.length,
                            packet_size,
                        });
                    }
                    if t.start + t.length > packet_size {
                        return Err(ScriptError::ModificationOutOfRange {
                            start: t.start,
                            length: t.length,
                            packet_size,
                        });
                    }
                }
                for c in &action.counter_mods {
                    insert_mod_range(&mut mod_ranges, c.start, c.length)?;
                    if c.counter_step == 0 || c.counter_step > u16::MAX as u32 {
                        return Err(ScriptError::InvalidCounterStep(c.counter_step));
                    }
                    if c.length > 8 {
                        return Err(ScriptError::ModificationOutOfRange {
                            start: c.start,
                            length: c.length,
                            packet_size,
                        });
                    }
                    if c.start + c.length > packet_size {
                        return Err(ScriptError::ModificationOutOfRange {
                            start: c.start,
                            length: c.length,
                            packet_size,
                        });
                    }
                }

                // Rule 9: must already be connected.
                for j in action.range_start..action.range_end {
                    if !connected[j as usize] {
                        return Err(ScriptError::NotConnected(j));
                    }
                }
            }
            RawActionType::Flood => {
                check_range(action.range_start, action.range_end, pool_size)?;
                for j in action.range_start..action.range_end {
                    if !connected[j as usize] {
                        return Err(ScriptError::NotConnected(j));
                    }
                }
            }
            RawActionType::Drain => {
                // Rule 12: positive timeout.
                if action.count == 0 {
                    return Err(ScriptError::DrainTimeoutZero);
                }
                check_range(action.range_start, action.range_end, pool_size)?;
                for j in action.range_start..action.range_end {
                    if !connected[j as usize] {
                        return Err(ScriptError::NotConnected(j));
                    }
                    // DRAIN clears the connected bit (rule 10's note).
                    connected[j as usize] = false;
                }
            }
            RawActionType::Disconnect => {
                check_range(action.range_start, action.range_end, pool_size)?;
                // Rule 10: no DISCONNECT on an already-disconnected index.
                for j in action.range_start..action.range_end {
                    if disconnect_called[j as usize] {
                        return Err(ScriptError::AlreadyDisconnected(j));
                    }
                    disconnect_called[j as usize] = true;
                }
            }
        }
    }

    Ok(())
}

fn check_range(start: u32, end: u32, pool_size: u32) -> Result<(), ScriptError> {
    if pool_size == 0 || end > pool_size || start > end {
        return Err(ScriptError::RangeOutOfBounds { start, end, create_count: pool_size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::program::{Action, CounterModification, OrchestratorBlock, RawTimestampModification, SettingsBlock};
    use indexmap::IndexMap;
    use std::io::Write;

    fn temp_packet(bytes: &[u8]) -> String {
        let mut path = std::env::temp_dir();
        path.push(format!("loadshear-verifier-test-{}.bin", bytes.len()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn base_settings(packet_path: String) -> SettingsBlock {
        let mut packet_identifiers = IndexMap::new();
        packet_identifiers.insert("p1".to_string(), packet_path);
        SettingsBlock {
            identifier: "s1".to_string(),
            session_protocol: "TCP".to_string(),
            header_size: 0,
            body_max: 0,
            read: false,
            repeat: false,
            shards: 1,
            handler_value: "NOP".to_string(),
            endpoints: vec!["127.0.0.1:9000".to_string()],
            packet_identifiers,
            packet_sample_rate: 16,
        }
    }

    fn action(action_type: RawActionType, start: u32, end: u32, count: u32) -> Action {
        Action {
            action_type,
            count,
            range_start: start,
            range_end: end,
            offset_ms: 0,
            packet_identifier: String::new(),
            timestamp_mods: Vec::new(),
            counter_mods: Vec::new(),
        }
    }

    #[test]
    fn accepts_a_minimal_valid_program() {
        let packet = temp_packet(b"hello world!");
        let settings = base_settings(packet);
        let program = Program {
            settings: settings.clone(),
            orchestrator: OrchestratorBlock {
                settings_identifier: settings.identifier.clone(),
                actions: vec![
                    action(RawActionType::Create, 0, 0, 4),
                    action(RawActionType::Connect, 0, 4, 0),
                    action(RawActionType::Disconnect, 0, 4, 0),
                ],
            },
        };
        assert!(verify(&program, Path::new("."), ResolveOptions::default()).is_ok());
    }

    #[test]
    fn rejects_connect_on_already_connected_session() {
        let packet = temp_packet(b"hello world!");
        let settings = base_settings(packet);
        let program = Program {
            settings: settings.clone(),
            orchestrator: OrchestratorBlock {
                settings_identifier: settings.identifier.clone(),
                actions: vec![
                    action(RawActionType::Create, 0, 0, 4),
                    action(RawActionType::Connect, 0, 4, 0),
                    action(RawActionType::Connect, 0, 2, 0),
                ],
            },
        };
        assert_eq!(verify(&program, Path::new("."), ResolveOptions::default()), Err(ScriptError::AlreadyConnected(0)));
    }

    #[test]
    fn rejects_overlapping_send_modifications() {
        let packet = temp_packet(&[0u8; 16]);
        let settings = base_settings(packet);
        let mut send = action(RawActionType::Send, 0, 1, 1);
        send.packet_identifier = "p1".to_string();
        send.timestamp_mods.push(RawTimestampModification {
            start: 0,
            length: 8,
            little_endian: true,
            format_name: "seconds".to_string(),
        });
        send.counter_mods.push(CounterModification { start: 4, length: 8, little_endian: true, counter_step: 1 });

        let program = Program {
            settings: settings.clone(),
            orchestrator: OrchestratorBlock {
                settings_identifier: settings.identifier.clone(),
                actions: vec![
                    action(RawActionType::Create, 0, 0, 4),
                    action(RawActionType::Connect, 0, 4, 0),
                    send,
                ],
            },
        };
        match verify(&program, Path::new("."), ResolveOptions::default()) {
            Err(ScriptError::ModificationOverlap { .. }) => {}
            other => panic!("expected an overlap error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_send_before_connect() {
        let packet = temp_packet(b"hello world!");
        let settings = base_settings(packet);
        let mut send = action(RawActionType::Send, 0, 1, 1);
        send.packet_identifier = "p1".to_string();

        let program = Program {
            settings: settings.clone(),
            orchestrator: OrchestratorBlock {
                settings_identifier: settings.identifier.clone(),
                actions: vec![action(RawActionType::Create, 0, 0, 4), send],
            },
        };
        assert_eq!(verify(&program, Path::new("."), ResolveOptions::default()), Err(ScriptError::NotConnected(0)));
    }

    #[test]
    fn rejects_drain_with_zero_timeout() {
        let packet = temp_packet(b"hello world!");
        let settings = base_settings(packet);
        let program = Program {
            settings: settings.clone(),
            orchestrator: OrchestratorBlock {
                settings_identifier: settings.identifier.clone(),
                actions: vec![
                    action(RawActionType::Create, 0, 0, 4),
                    action(RawActionType::Connect, 0, 4, 0),
                    action(RawActionType::Drain, 0, 4, 0),
                ],
            },
        };
        assert_eq!(verify(&program, Path::new("."), ResolveOptions::default()), Err(ScriptError::DrainTimeoutZero));
    }
}
