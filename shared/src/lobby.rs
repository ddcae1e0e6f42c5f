//! Lobby duplex-channel protocol: envelopes, command payloads and builders.
//!
//! Every frame on the lobby channel is a JSON object with a `type`
//! (`request`/`response`/`event`), a `messageId` and a `commandId`; anything
//! beyond that is validated per command. Responses echo the request's
//! `messageId`; events get a fresh one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CMD_START: &str = "autohost/start";
pub const CMD_KILL: &str = "autohost/kill";
pub const CMD_ADD_PLAYER: &str = "autohost/addPlayer";
pub const CMD_KICK_PLAYER: &str = "autohost/kickPlayer";
pub const CMD_MUTE_PLAYER: &str = "autohost/mutePlayer";
pub const CMD_SPEC_PLAYERS: &str = "autohost/specPlayers";
pub const CMD_SEND_COMMAND: &str = "autohost/sendCommand";
pub const CMD_SEND_MESSAGE: &str = "autohost/sendMessage";
pub const CMD_SUBSCRIBE_UPDATES: &str = "autohost/subscribeUpdates";
pub const CMD_INSTALL_ENGINE: &str = "autohost/installEngine";
pub const CMD_UPDATE: &str = "autohost/update";
pub const CMD_STATUS: &str = "autohost/status";

pub const REASON_INTERNAL_ERROR: &str = "internal_error";
pub const REASON_INVALID_REQUEST: &str = "invalid_request";
pub const REASON_COMMAND_UNIMPLEMENTED: &str = "command_unimplemented";
pub const REASON_BATTLE_ALREADY_EXISTS: &str = "battle_already_exists";

/// The three envelope kinds that may appear on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

/// A parsed envelope: validated header plus the untouched payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub message_id: String,
    pub command_id: String,
    pub data: Option<Value>,
    pub status: Option<String>,
}

/// Envelope-level parse failures; these close the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or non-string field {0:?}")]
    MissingField(&'static str),
    #[error("unknown envelope type {0:?}")]
    UnknownKind(String),
}

/// Validates the envelope shape of one inbound text frame.
pub fn parse_envelope(raw: &str) -> Result<Envelope, EnvelopeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| EnvelopeError::NotJson(e.to_string()))?;
    let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
    let kind = match object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("type"))?
    {
        "request" => EnvelopeKind::Request,
        "response" => EnvelopeKind::Response,
        "event" => EnvelopeKind::Event,
        other => return Err(EnvelopeError::UnknownKind(other.to_string())),
    };
    let message_id = object
        .get("messageId")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("messageId"))?
        .to_string();
    let command_id = object
        .get("commandId")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("commandId"))?
        .to_string();
    Ok(Envelope {
        kind,
        message_id,
        command_id,
        data: object.get("data").cloned(),
        status: object
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// A typed request failure: a `reason` from the command's allowed set plus
/// free-form details.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{reason}{}", .details.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct DomainError {
    pub reason: String,
    pub details: Option<String>,
}

impl DomainError {
    pub fn new(reason: &str, details: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            details: Some(details.into()),
        }
    }

    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(REASON_INVALID_REQUEST, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(REASON_INTERNAL_ERROR, details)
    }

    pub fn battle_already_exists(battle_id: &str) -> Self {
        Self::new(
            REASON_BATTLE_ALREADY_EXISTS,
            format!("battle {battle_id} was already started"),
        )
    }
}

/// Failure reasons each command may legitimately return; anything else is
/// folded to `internal_error` by the dispatcher.
pub fn allowed_reasons(command_id: &str) -> &'static [&'static str] {
    match command_id {
        CMD_START => &[
            REASON_INTERNAL_ERROR,
            REASON_INVALID_REQUEST,
            REASON_BATTLE_ALREADY_EXISTS,
        ],
        _ => &[REASON_INTERNAL_ERROR, REASON_INVALID_REQUEST],
    }
}

/// Builds a `response/success` envelope for a request.
pub fn success_response(command_id: &str, message_id: &str, data: Option<Value>) -> Value {
    let mut response = json!({
        "type": "response",
        "status": "success",
        "commandId": command_id,
        "messageId": message_id,
    });
    if let Some(data) = data {
        response["data"] = data;
    }
    response
}

/// Builds a `response/failed` envelope for a request.
pub fn failed_response(
    command_id: &str,
    message_id: &str,
    reason: &str,
    details: Option<&str>,
) -> Value {
    let mut response = json!({
        "type": "response",
        "status": "failed",
        "commandId": command_id,
        "messageId": message_id,
        "reason": reason,
    });
    if let Some(details) = details {
        response["details"] = Value::String(details.to_string());
    }
    response
}

/// Builds an event envelope with a fresh message id.
pub fn event_message(command_id: &str, data: Value) -> Value {
    json!({
        "type": "event",
        "commandId": command_id,
        "messageId": Uuid::new_v4().to_string(),
        "data": data,
    })
}

/// One participant in a start request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattlePlayer {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleTeam {
    pub players: Vec<BattlePlayer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleAllyTeam {
    pub teams: Vec<BattleTeam>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub battle_id: String,
    pub engine_version: String,
    pub game_name: String,
    pub map_name: String,
    pub ally_teams: Vec<BattleAllyTeam>,
    #[serde(default)]
    pub spectators: Vec<BattlePlayer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    pub battle_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPlayerRequest {
    pub battle_id: String,
    pub user_id: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPlayerRequest {
    pub battle_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutePlayerRequest {
    pub battle_id: String,
    pub user_id: String,
    pub chat: bool,
    pub draw: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecPlayersRequest {
    pub battle_id: String,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandRequest {
    pub battle_id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub battle_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeUpdatesRequest {
    /// Replay point: microseconds since the unix epoch.
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallEngineRequest {
    pub version: String,
}

/// Payload of a successful `autohost/start` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponseData {
    pub ips: Vec<String>,
    pub port: u16,
}

/// Controller status as published via `autohost/status` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub current_battles: usize,
    pub max_battles: usize,
    pub available_engines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_envelope() {
        let env = parse_envelope(
            r#"{"type":"request","messageId":"m1","commandId":"autohost/kill","data":{"battleId":"b"}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Request);
        assert_eq!(env.message_id, "m1");
        assert_eq!(env.command_id, "autohost/kill");
        assert_eq!(env.data.unwrap()["battleId"], "b");
    }

    #[test]
    fn parse_rejects_bad_frames() {
        assert!(matches!(
            parse_envelope("not json"),
            Err(EnvelopeError::NotJson(_))
        ));
        assert!(matches!(
            parse_envelope("[1,2]"),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(
            parse_envelope(r#"{"type":"request","commandId":"c"}"#),
            Err(EnvelopeError::MissingField("messageId"))
        ));
        assert!(matches!(
            parse_envelope(r#"{"type":"nope","messageId":"m","commandId":"c"}"#),
            Err(EnvelopeError::UnknownKind(_))
        ));
    }

    #[test]
    fn parse_tolerates_extra_fields() {
        let env = parse_envelope(
            r#"{"type":"event","messageId":"m","commandId":"c","data":1,"extra":true}"#,
        )
        .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Event);
        assert_eq!(env.data, Some(serde_json::json!(1)));
    }

    #[test]
    fn success_response_shape() {
        let resp = success_response("autohost/kill", "m1", None);
        assert_eq!(resp["type"], "response");
        assert_eq!(resp["status"], "success");
        assert_eq!(resp["messageId"], "m1");
        assert!(resp.get("data").is_none());

        let resp = success_response("autohost/start", "m2", Some(serde_json::json!({"port": 1})));
        assert_eq!(resp["data"]["port"], 1);
    }

    #[test]
    fn failed_response_shape() {
        let resp = failed_response("autohost/start", "m1", REASON_BATTLE_ALREADY_EXISTS, None);
        assert_eq!(resp["status"], "failed");
        assert_eq!(resp["reason"], "battle_already_exists");
        assert!(resp.get("details").is_none());

        let resp = failed_response("autohost/kill", "m2", REASON_INVALID_REQUEST, Some("why"));
        assert_eq!(resp["details"], "why");
    }

    #[test]
    fn events_get_fresh_message_ids() {
        let a = event_message(CMD_STATUS, serde_json::json!({}));
        let b = event_message(CMD_STATUS, serde_json::json!({}));
        assert_eq!(a["type"], "event");
        assert_ne!(a["messageId"], b["messageId"]);
    }

    #[test]
    fn start_reasons_include_battle_already_exists() {
        assert!(allowed_reasons(CMD_START).contains(&REASON_BATTLE_ALREADY_EXISTS));
        assert!(!allowed_reasons(CMD_KILL).contains(&REASON_BATTLE_ALREADY_EXISTS));
    }

    #[test]
    fn start_request_deserializes() {
        let req: StartRequest = serde_json::from_value(serde_json::json!({
            "battleId": "b-1",
            "engineVersion": "105.1.1",
            "gameName": "Game 1.0",
            "mapName": "Flats",
            "allyTeams": [
                {"teams": [{"players": [
                    {"userId": "u1", "name": "alice", "password": "pw"}
                ]}]}
            ],
        }))
        .unwrap();
        assert_eq!(req.ally_teams[0].teams[0].players[0].name, "alice");
        assert!(req.spectators.is_empty());
    }

    #[test]
    fn domain_error_display() {
        let err = DomainError::invalid_request("unknown battle");
        assert_eq!(err.to_string(), "invalid_request: unknown battle");
    }
}
