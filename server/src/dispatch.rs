//! Request dispatch against the fixed command registry.
//!
//! Unknown commands answer `failed/command_unimplemented`; a payload that
//! does not deserialize answers `failed/invalid_request` with the
//! deserializer's message; domain errors with a reason outside the
//! command's allowed set are folded to `internal_error` after logging.

use log::error;
use serde::de::DeserializeOwned;
use serde_json::Value;

use shared::lobby::{
    allowed_reasons, failed_response, success_response, AddPlayerRequest, DomainError, Envelope,
    InstallEngineRequest, KickPlayerRequest, KillRequest, MutePlayerRequest, SendCommandRequest,
    SendMessageRequest, SpecPlayersRequest, StartRequest, SubscribeUpdatesRequest,
    CMD_ADD_PLAYER, CMD_INSTALL_ENGINE, CMD_KICK_PLAYER, CMD_KILL, CMD_MUTE_PLAYER,
    CMD_SEND_COMMAND, CMD_SEND_MESSAGE, CMD_SPEC_PLAYERS, CMD_START, CMD_SUBSCRIBE_UPDATES,
    REASON_COMMAND_UNIMPLEMENTED, REASON_INTERNAL_ERROR,
};

use crate::adapter::{Adapter, Outcome};

const KNOWN_COMMANDS: [&str; 10] = [
    CMD_START,
    CMD_KILL,
    CMD_ADD_PLAYER,
    CMD_KICK_PLAYER,
    CMD_MUTE_PLAYER,
    CMD_SPEC_PLAYERS,
    CMD_SEND_COMMAND,
    CMD_SEND_MESSAGE,
    CMD_SUBSCRIBE_UPDATES,
    CMD_INSTALL_ENGINE,
];

/// Substitutes `internal_error` for any reason the command may not return.
pub fn fold_error(command_id: &str, err: DomainError) -> DomainError {
    if allowed_reasons(command_id).contains(&err.reason.as_str()) {
        return err;
    }
    error!("folding disallowed reason {:?} for {command_id}: {err}", err.reason);
    DomainError {
        reason: REASON_INTERNAL_ERROR.to_string(),
        details: None,
    }
}

/// Dispatches one request. Returns the response to send now, or `None`
/// when the handler deferred and will answer through the pending channel.
pub async fn dispatch_request(adapter: &mut Adapter, envelope: &Envelope) -> Option<Value> {
    if !KNOWN_COMMANDS.contains(&envelope.command_id.as_str()) {
        return Some(failed_response(
            &envelope.command_id,
            &envelope.message_id,
            REASON_COMMAND_UNIMPLEMENTED,
            None,
        ));
    }
    match route(adapter, envelope).await {
        Ok(Outcome::Reply(data)) => Some(success_response(
            &envelope.command_id,
            &envelope.message_id,
            data,
        )),
        Ok(Outcome::Deferred) => None,
        Err(err) => {
            let err = fold_error(&envelope.command_id, err);
            Some(failed_response(
                &envelope.command_id,
                &envelope.message_id,
                &err.reason,
                err.details.as_deref(),
            ))
        }
    }
}

fn parse<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, DomainError> {
    let data = envelope.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| DomainError::invalid_request(e.to_string()))
}

async fn route(adapter: &mut Adapter, envelope: &Envelope) -> Result<Outcome, DomainError> {
    match envelope.command_id.as_str() {
        CMD_START => {
            let request: StartRequest = parse(envelope)?;
            adapter.start(request, envelope).await
        }
        CMD_KILL => {
            let request: KillRequest = parse(envelope)?;
            adapter.kill(&request.battle_id).await
        }
        CMD_ADD_PLAYER => {
            let request: AddPlayerRequest = parse(envelope)?;
            adapter
                .add_player(
                    &request.battle_id,
                    &request.user_id,
                    &request.name,
                    &request.password,
                )
                .await
        }
        CMD_KICK_PLAYER => {
            let request: KickPlayerRequest = parse(envelope)?;
            adapter
                .kick_player(&request.battle_id, &request.user_id)
                .await
        }
        CMD_MUTE_PLAYER => {
            let request: MutePlayerRequest = parse(envelope)?;
            adapter
                .mute_player(
                    &request.battle_id,
                    &request.user_id,
                    request.chat,
                    request.draw,
                )
                .await
        }
        CMD_SPEC_PLAYERS => {
            let request: SpecPlayersRequest = parse(envelope)?;
            adapter
                .spec_players(&request.battle_id, &request.user_ids)
                .await
        }
        CMD_SEND_COMMAND => {
            let request: SendCommandRequest = parse(envelope)?;
            adapter
                .send_command(&request.battle_id, &request.command, &request.arguments)
                .await
        }
        CMD_SEND_MESSAGE => {
            let request: SendMessageRequest = parse(envelope)?;
            adapter
                .send_message(&request.battle_id, &request.message)
                .await
        }
        CMD_SUBSCRIBE_UPDATES => {
            let request: SubscribeUpdatesRequest = parse(envelope)?;
            adapter.subscribe_updates(request.since).await
        }
        CMD_INSTALL_ENGINE => {
            let request: InstallEngineRequest = parse(envelope)?;
            adapter.install_engine(&request.version, envelope)
        }
        other => Err(DomainError::new(
            REASON_COMMAND_UNIMPLEMENTED,
            format!("unknown command {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::lobby::REASON_INVALID_REQUEST;

    #[test]
    fn allowed_reasons_pass_through() {
        let err = DomainError::invalid_request("nope");
        let folded = fold_error(CMD_KILL, err.clone());
        assert_eq!(folded, err);
    }

    #[test]
    fn disallowed_reasons_fold_to_internal_error() {
        let err = DomainError::new("battle_already_exists", "x");
        let folded = fold_error(CMD_KILL, err);
        assert_eq!(folded.reason, REASON_INTERNAL_ERROR);
        assert_eq!(folded.details, None);

        // The same reason is legitimate for start.
        let err = DomainError::new("battle_already_exists", "x");
        assert_eq!(fold_error(CMD_START, err.clone()), err);
    }

    #[test]
    fn unexpected_reasons_fold_to_internal_error() {
        let err = DomainError::new("made_up_reason", "x");
        let folded = fold_error(CMD_SEND_MESSAGE, err);
        assert_eq!(folded.reason, REASON_INTERNAL_ERROR);
    }

    #[test]
    fn invalid_request_stays_for_every_command() {
        for command in KNOWN_COMMANDS {
            let err = DomainError::invalid_request("detail");
            assert_eq!(fold_error(command, err).reason, REASON_INVALID_REQUEST);
        }
    }
}
