//! Engine autohost channel codec.
//!
//! The dedicated engine talks to its controlling process over a local UDP
//! channel. Inbound datagrams are framed binary messages (first byte selects
//! the variant, integers little-endian); outbound messages are plain UTF-8
//! byte strings carrying either a chat line or a `/command`.
//!
//! Decoding is strict: every variant has an exact length or a self-describing
//! size field that must match the datagram, and enum-valued bytes are range
//! checked. A failed decode is never fatal to the caller — the runner logs
//! and drops the datagram.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Inbound message type bytes.
const SERVER_STARTED: u8 = 0;
const SERVER_QUIT: u8 = 1;
const SERVER_STARTPLAYING: u8 = 2;
const SERVER_GAMEOVER: u8 = 3;
const SERVER_MESSAGE: u8 = 4;
const SERVER_WARNING: u8 = 5;
const PLAYER_JOINED: u8 = 10;
const PLAYER_LEFT: u8 = 11;
const PLAYER_READY: u8 = 12;
const PLAYER_CHAT: u8 = 13;
const PLAYER_DEFEATED: u8 = 14;
const GAME_LUAMSG: u8 = 20;
const GAME_TEAMSTAT: u8 = 60;

// PLAYER_CHAT destination bytes above the direct player range.
const CHAT_DEST_ALLIES: u8 = 252;
const CHAT_DEST_SPECTATORS: u8 = 253;
const CHAT_DEST_ALL: u8 = 254;

// GAME_LUAMSG wraps a raw net message; its leading id byte is fixed.
const LUAMSG_MAGIC: u8 = 50;

const LUA_SCRIPT_UI: u16 = 2000;
const LUA_SCRIPT_GAIA: u16 = 300;
const LUA_SCRIPT_RULES: u16 = 100;

/// Longest chat message accepted by the engine.
pub const MAX_CHAT_MESSAGE_BYTES: usize = 127;

/// Why a player left the battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    Lost,
    Left,
    Kicked,
}

/// Which side of the engine a lua message originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LuaMsgScript {
    Ui,
    Gaia,
    Rules,
}

/// Audience of a UI-script lua message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LuaMsgUiMode {
    All,
    Allies,
    Spectators,
}

/// Where a chat line was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatDestination {
    /// Whispered to a single player number.
    Player(u8),
    Allies,
    Spectators,
    All,
}

/// Per-team statistics snapshot reported by the engine.
///
/// Decoded in full but deliberately projected to no lobby update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamStatistics {
    pub frame: i32,
    pub metal_used: f32,
    pub energy_used: f32,
    pub metal_produced: f32,
    pub energy_produced: f32,
    pub metal_excess: f32,
    pub energy_excess: f32,
    pub metal_received: f32,
    pub energy_received: f32,
    pub metal_sent: f32,
    pub energy_sent: f32,
    pub damage_dealt: f32,
    pub damage_received: f32,
    pub units_produced: i32,
    pub units_died: i32,
    pub units_received: i32,
    pub units_sent: i32,
    pub units_captured: i32,
    pub units_out_captured: i32,
    pub units_killed: i32,
}

/// One decoded autohost datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ServerStarted,
    ServerQuit,
    ServerStartPlaying {
        game_id: [u8; 16],
        demo_path: String,
    },
    ServerGameOver {
        player: u8,
        winning_ally_teams: Vec<u8>,
    },
    ServerMessage {
        message: String,
    },
    ServerWarning {
        message: String,
    },
    PlayerJoined {
        player: u8,
        name: String,
    },
    PlayerLeft {
        player: u8,
        reason: LeaveReason,
    },
    PlayerReady {
        player: u8,
        state: u8,
    },
    PlayerChat {
        from: u8,
        destination: ChatDestination,
        message: String,
    },
    PlayerDefeated {
        player: u8,
    },
    GameLuaMsg {
        player: u8,
        script: LuaMsgScript,
        ui_mode: Option<LuaMsgUiMode>,
        data: Vec<u8>,
    },
    GameTeamStat {
        team: u8,
        stats: TeamStatistics,
    },
}

/// Reasons a datagram failed to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{message}: bad datagram length {actual}")]
    BadLength { message: &'static str, actual: usize },
    #[error("{message}: size field {declared} does not match datagram length {actual}")]
    SizeMismatch {
        message: &'static str,
        declared: usize,
        actual: usize,
    },
    #[error("{message}: {field} out of range ({value})")]
    OutOfRange {
        message: &'static str,
        field: &'static str,
        value: u32,
    },
}

/// Violations raised when building an outbound message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializeError {
    #[error("chat message too long: {len} bytes (max {MAX_CHAT_MESSAGE_BYTES})")]
    MessageTooLong { len: usize },
    #[error("invalid command name {0:?}")]
    InvalidCommandName(String),
    #[error("invalid command argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: &'static str },
}

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn i32_at(data: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn f32_at(data: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

// Text fields are opaque passthrough; only structure is validated, so
// invalid UTF-8 is replaced rather than rejected.
fn text_at(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Decodes a single autohost datagram into an [`EngineEvent`].
pub fn decode_event(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    let len = data.len();
    if len == 0 {
        return Err(DecodeError::Empty);
    }
    match data[0] {
        SERVER_STARTED => {
            if len != 1 {
                return Err(DecodeError::BadLength {
                    message: "SERVER_STARTED",
                    actual: len,
                });
            }
            Ok(EngineEvent::ServerStarted)
        }
        SERVER_QUIT => {
            if len != 1 {
                return Err(DecodeError::BadLength {
                    message: "SERVER_QUIT",
                    actual: len,
                });
            }
            Ok(EngineEvent::ServerQuit)
        }
        SERVER_STARTPLAYING => {
            if len < 21 {
                return Err(DecodeError::BadLength {
                    message: "SERVER_STARTPLAYING",
                    actual: len,
                });
            }
            let declared = u32_at(data, 1) as usize;
            if declared != len {
                return Err(DecodeError::SizeMismatch {
                    message: "SERVER_STARTPLAYING",
                    declared,
                    actual: len,
                });
            }
            let mut game_id = [0u8; 16];
            game_id.copy_from_slice(&data[5..21]);
            Ok(EngineEvent::ServerStartPlaying {
                game_id,
                demo_path: text_at(&data[21..]),
            })
        }
        SERVER_GAMEOVER => {
            if len < 3 {
                return Err(DecodeError::BadLength {
                    message: "SERVER_GAMEOVER",
                    actual: len,
                });
            }
            let declared = data[1] as usize;
            if declared != len {
                return Err(DecodeError::SizeMismatch {
                    message: "SERVER_GAMEOVER",
                    declared,
                    actual: len,
                });
            }
            Ok(EngineEvent::ServerGameOver {
                player: data[2],
                winning_ally_teams: data[3..].to_vec(),
            })
        }
        SERVER_MESSAGE => Ok(EngineEvent::ServerMessage {
            message: text_at(&data[1..]),
        }),
        SERVER_WARNING => Ok(EngineEvent::ServerWarning {
            message: text_at(&data[1..]),
        }),
        PLAYER_JOINED => {
            if len < 3 {
                return Err(DecodeError::BadLength {
                    message: "PLAYER_JOINED",
                    actual: len,
                });
            }
            Ok(EngineEvent::PlayerJoined {
                player: data[1],
                name: text_at(&data[2..]),
            })
        }
        PLAYER_LEFT => {
            if len != 3 {
                return Err(DecodeError::BadLength {
                    message: "PLAYER_LEFT",
                    actual: len,
                });
            }
            let reason = match data[2] {
                0 => LeaveReason::Lost,
                1 => LeaveReason::Left,
                2 => LeaveReason::Kicked,
                other => {
                    return Err(DecodeError::OutOfRange {
                        message: "PLAYER_LEFT",
                        field: "reason",
                        value: other as u32,
                    })
                }
            };
            Ok(EngineEvent::PlayerLeft {
                player: data[1],
                reason,
            })
        }
        PLAYER_READY => {
            if len != 3 {
                return Err(DecodeError::BadLength {
                    message: "PLAYER_READY",
                    actual: len,
                });
            }
            if data[2] > 3 {
                return Err(DecodeError::OutOfRange {
                    message: "PLAYER_READY",
                    field: "state",
                    value: data[2] as u32,
                });
            }
            Ok(EngineEvent::PlayerReady {
                player: data[1],
                state: data[2],
            })
        }
        PLAYER_CHAT => {
            if len < 3 {
                return Err(DecodeError::BadLength {
                    message: "PLAYER_CHAT",
                    actual: len,
                });
            }
            let destination = match data[2] {
                CHAT_DEST_ALLIES => ChatDestination::Allies,
                CHAT_DEST_SPECTATORS => ChatDestination::Spectators,
                CHAT_DEST_ALL => ChatDestination::All,
                player if player <= 251 => ChatDestination::Player(player),
                other => {
                    return Err(DecodeError::OutOfRange {
                        message: "PLAYER_CHAT",
                        field: "destination",
                        value: other as u32,
                    })
                }
            };
            Ok(EngineEvent::PlayerChat {
                from: data[1],
                destination,
                message: text_at(&data[3..]),
            })
        }
        PLAYER_DEFEATED => {
            if len != 2 {
                return Err(DecodeError::BadLength {
                    message: "PLAYER_DEFEATED",
                    actual: len,
                });
            }
            Ok(EngineEvent::PlayerDefeated { player: data[1] })
        }
        GAME_LUAMSG => decode_luamsg(data),
        GAME_TEAMSTAT => decode_teamstat(data),
        other => Err(DecodeError::UnknownType(other)),
    }
}

fn decode_luamsg(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    let len = data.len();
    // type byte + wrapped net message header (id, u16 size, player, u16
    // script, mode) is 8 bytes minimum.
    if len < 8 {
        return Err(DecodeError::BadLength {
            message: "GAME_LUAMSG",
            actual: len,
        });
    }
    if data[1] != LUAMSG_MAGIC {
        return Err(DecodeError::OutOfRange {
            message: "GAME_LUAMSG",
            field: "magic",
            value: data[1] as u32,
        });
    }
    let declared = u16_at(data, 2) as usize;
    if declared != len - 1 {
        return Err(DecodeError::SizeMismatch {
            message: "GAME_LUAMSG",
            declared,
            actual: len - 1,
        });
    }
    let player = data[4];
    let script = match u16_at(data, 5) {
        LUA_SCRIPT_UI => LuaMsgScript::Ui,
        LUA_SCRIPT_GAIA => LuaMsgScript::Gaia,
        LUA_SCRIPT_RULES => LuaMsgScript::Rules,
        other => {
            return Err(DecodeError::OutOfRange {
                message: "GAME_LUAMSG",
                field: "script",
                value: other as u32,
            })
        }
    };
    let mode = data[7];
    let ui_mode = match script {
        LuaMsgScript::Ui => Some(match mode {
            0 => LuaMsgUiMode::All,
            b'a' => LuaMsgUiMode::Allies,
            b's' => LuaMsgUiMode::Spectators,
            other => {
                return Err(DecodeError::OutOfRange {
                    message: "GAME_LUAMSG",
                    field: "uiMode",
                    value: other as u32,
                })
            }
        }),
        _ if mode != 0 => {
            return Err(DecodeError::OutOfRange {
                message: "GAME_LUAMSG",
                field: "uiMode",
                value: mode as u32,
            })
        }
        _ => None,
    };
    Ok(EngineEvent::GameLuaMsg {
        player,
        script,
        ui_mode,
        data: data[8..].to_vec(),
    })
}

fn decode_teamstat(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    if data.len() != 82 {
        return Err(DecodeError::BadLength {
            message: "GAME_TEAMSTAT",
            actual: data.len(),
        });
    }
    let stats = TeamStatistics {
        frame: i32_at(data, 2),
        metal_used: f32_at(data, 6),
        energy_used: f32_at(data, 10),
        metal_produced: f32_at(data, 14),
        energy_produced: f32_at(data, 18),
        metal_excess: f32_at(data, 22),
        energy_excess: f32_at(data, 26),
        metal_received: f32_at(data, 30),
        energy_received: f32_at(data, 34),
        metal_sent: f32_at(data, 38),
        energy_sent: f32_at(data, 42),
        damage_dealt: f32_at(data, 46),
        damage_received: f32_at(data, 50),
        units_produced: i32_at(data, 54),
        units_died: i32_at(data, 58),
        units_received: i32_at(data, 62),
        units_sent: i32_at(data, 66),
        units_captured: i32_at(data, 70),
        units_out_captured: i32_at(data, 74),
        units_killed: i32_at(data, 78),
    };
    Ok(EngineEvent::GameTeamStat {
        team: data[1],
        stats,
    })
}

/// Builds an outbound chat line.
///
/// A leading `/` is doubled so the engine cannot mistake the text for a
/// command.
pub fn encode_chat_message(text: &str) -> Result<Vec<u8>, SerializeError> {
    if text.len() > MAX_CHAT_MESSAGE_BYTES {
        return Err(SerializeError::MessageTooLong { len: text.len() });
    }
    let mut out = Vec::with_capacity(text.len() + 1);
    if text.starts_with('/') {
        out.push(b'/');
    }
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}

fn valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// Builds an outbound `/command` line: `/name arg1 arg2 …`.
///
/// Arguments are joined with single spaces, so no argument may contain
/// whitespace, be empty, or contain `//`.
pub fn encode_command(name: &str, args: &[String]) -> Result<Vec<u8>, SerializeError> {
    if !valid_command_name(name) {
        return Err(SerializeError::InvalidCommandName(name.to_string()));
    }
    for (index, arg) in args.iter().enumerate() {
        if arg.is_empty() {
            return Err(SerializeError::InvalidArgument {
                index,
                reason: "must not be empty",
            });
        }
        if arg.contains("//") {
            return Err(SerializeError::InvalidArgument {
                index,
                reason: "must not contain \"//\"",
            });
        }
        if arg.contains(' ') || arg.contains('\t') {
            return Err(SerializeError::InvalidArgument {
                index,
                reason: "must not contain whitespace",
            });
        }
    }
    let mut line = String::with_capacity(name.len() + 1);
    line.push('/');
    line.push_str(name);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    Ok(line.into_bytes())
}
