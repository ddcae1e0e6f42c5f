//! Lobby-facing battle updates.
//!
//! These are the wire shapes carried by `autohost/update` events: the
//! lobby-flavoured projection of engine events, keyed by stable user ids
//! instead of engine-local player numbers.

use serde::{Deserialize, Serialize};

use crate::autohost::{LeaveReason, LuaMsgScript, LuaMsgUiMode};

/// Where a chat line was addressed, lobby-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTarget {
    /// Whispered to a single user; the update carries `toUserId`.
    Player,
    Allies,
    Spectators,
    All,
}

/// One battle update as published to the lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LobbyUpdate {
    /// The engine entered gameplay.
    Start { game_id: String, demo_path: String },
    /// The game concluded with at least one winning ally team.
    Finished {
        user_id: String,
        winning_ally_teams: Vec<u8>,
    },
    EngineMessage {
        message: String,
    },
    EngineWarning {
        message: String,
    },
    EngineQuit,
    EngineCrash {
        details: String,
    },
    PlayerJoined {
        user_id: String,
        player_number: u8,
    },
    PlayerLeft {
        user_id: String,
        reason: LeaveReason,
    },
    PlayerChat {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_user_id: Option<String>,
        destination: ChatTarget,
        message: String,
    },
    PlayerDefeated {
        user_id: String,
    },
    /// Opaque lua payload, base64-encoded for transport.
    #[serde(rename = "luamsg")]
    LuaMsg {
        user_id: String,
        script: LuaMsgScript,
        #[serde(skip_serializing_if = "Option::is_none")]
        ui_mode: Option<LuaMsgUiMode>,
        data: String,
    },
}

impl LobbyUpdate {
    /// Whether this update terminates the battle's update stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LobbyUpdate::EngineQuit | LobbyUpdate::EngineCrash { .. })
    }
}

/// A timestamped update as stored by the buffer and delivered to the lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedEvent {
    /// Microseconds since the unix epoch; strictly monotonic per process.
    pub time: u64,
    pub battle_id: String,
    pub update: LobbyUpdate,
}
