//! Autohost adapter: glue between the lobby protocol and the pool.
//!
//! Translates lobby requests into pool actions, projects engine events into
//! lobby updates through each battle's identity index, aggregates status,
//! and guarantees that at most one terminal update (`engine_quit` or
//! `engine_crash`) is published per battle. The adapter owns the events
//! buffer and is mutated from a single task; every long-running request
//! (start, installEngine) completes through the pending channel so that
//! task never stalls.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use shared::autohost::{encode_chat_message, encode_command, ChatDestination, EngineEvent};
use shared::lobby::{
    event_message, DomainError, Envelope, EnvelopeKind, StartRequest, StartResponseData, Status,
    CMD_INSTALL_ENGINE, CMD_START, CMD_STATUS, CMD_UPDATE,
};
use shared::updates::{ChatTarget, LobbyUpdate};

use crate::config::Config;
use crate::dispatch;
use crate::engines::{RegistryEvent, RegistryHandle};
use crate::events_buffer::{EventsBuffer, UpdateSink};
use crate::games::{GameEvent, GamesHandle};
use crate::player_index::{PlayerIdentity, PlayerIndex};
use crate::start_script::player_order;

/// Highest assignable player number; the chat destination byte caps it.
const MAX_PLAYER_NUMBER: usize = 251;

/// Adapter-relevant slice of the configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub hosting_ip: String,
    pub max_battles: usize,
    pub max_updates_age: Duration,
}

impl AdapterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hosting_ip: config.hosting_ip.clone(),
            max_battles: config.max_battles,
            max_updates_age: config.max_updates_subscription_age(),
        }
    }
}

/// What a request handler produced: an immediate reply, or a promise that
/// a [`PendingResponse`] will arrive later.
pub enum Outcome {
    Reply(Option<Value>),
    Deferred,
}

/// Which deferred request a completion belongs to.
#[derive(Debug)]
pub enum PendingKind {
    Start { battle_id: String },
    InstallEngine,
}

/// Completion of a deferred request, delivered through the supervisor loop.
#[derive(Debug)]
pub struct PendingResponse {
    pub kind: PendingKind,
    pub command_id: String,
    pub message_id: String,
    pub result: Result<Option<Value>, DomainError>,
}

pub struct Adapter {
    config: AdapterConfig,
    games: GamesHandle,
    registry: RegistryHandle,
    buffer: EventsBuffer,
    players: HashMap<String, PlayerIndex>,
    finished_battles: HashSet<String>,
    status: Status,
    lobby_tx: Option<mpsc::Sender<Value>>,
    pending_tx: mpsc::UnboundedSender<PendingResponse>,
}

impl Adapter {
    pub fn new(
        config: AdapterConfig,
        games: GamesHandle,
        registry: RegistryHandle,
        pending_tx: mpsc::UnboundedSender<PendingResponse>,
    ) -> Self {
        let status = Status {
            current_battles: 0,
            max_battles: config.max_battles,
            available_engines: Vec::new(),
        };
        let buffer = EventsBuffer::new(config.max_updates_age);
        Self {
            config,
            games,
            registry,
            buffer,
            players: HashMap::new(),
            finished_battles: HashSet::new(),
            status,
            lobby_tx: None,
            pending_tx,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn current_battles(&self) -> usize {
        self.status.current_battles
    }

    /// Records a capacity cap change so subsequent status events carry it.
    pub fn note_max_battles(&mut self, max_battles: usize) {
        self.status.max_battles = max_battles;
    }

    /// A fresh lobby connection is live: remember the send path and
    /// publish the current status.
    pub async fn on_connected(&mut self, lobby_tx: mpsc::Sender<Value>) {
        self.lobby_tx = Some(lobby_tx);
        self.publish_status().await;
    }

    /// The lobby connection is gone: drop the send path and detach the
    /// updates subscription.
    pub fn on_disconnected(&mut self) {
        self.lobby_tx = None;
        self.buffer.unsubscribe();
    }

    /// Handles one inbound envelope; requests are dispatched, anything
    /// else is noise on this side of the protocol.
    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Request => {
                if let Some(response) = dispatch::dispatch_request(self, &envelope).await {
                    self.send_to_lobby(response).await;
                }
            }
            EnvelopeKind::Response | EnvelopeKind::Event => {
                debug!(
                    "ignoring {} envelope for {}",
                    match envelope.kind {
                        EnvelopeKind::Response => "response",
                        _ => "event",
                    },
                    envelope.command_id
                );
            }
        }
    }

    /// Applies one pool event: status accounting and the engine-to-lobby
    /// update projection.
    pub async fn handle_game_event(&mut self, event: GameEvent) {
        match event {
            GameEvent::BattleStarted { battle_id } => {
                info!("[{battle_id}] battle running");
            }
            GameEvent::Capacity { current_battles } => {
                self.status.current_battles = current_battles;
                self.publish_status().await;
            }
            GameEvent::Packet { battle_id, event } => {
                let Some(update) = project_event(&self.players, &battle_id, event) else {
                    return;
                };
                if update.is_terminal() && !self.mark_finished(&battle_id) {
                    return;
                }
                self.buffer.push(battle_id, update).await;
            }
            GameEvent::BattleError { battle_id, details } => {
                if self.mark_finished(&battle_id) {
                    self.buffer
                        .push(battle_id, LobbyUpdate::EngineCrash { details })
                        .await;
                }
            }
            GameEvent::BattleExited { battle_id } => {
                // A runner that exits without SERVER_QUIT still terminates
                // its update stream.
                if self.mark_finished(&battle_id) {
                    self.buffer
                        .push(battle_id.clone(), LobbyUpdate::EngineQuit)
                        .await;
                }
                self.players.remove(&battle_id);
            }
        }
    }

    pub async fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Versions(versions) => {
                self.status.available_engines = versions;
                self.publish_status().await;
            }
        }
    }

    /// Completes a deferred request: rolls back state where needed, folds
    /// the error and answers the lobby.
    pub async fn handle_pending(&mut self, pending: PendingResponse) {
        if let PendingKind::Start { battle_id } = &pending.kind {
            if pending.result.is_err() {
                self.players.remove(battle_id);
            }
        }
        let response = match pending.result {
            Ok(data) => {
                shared::lobby::success_response(&pending.command_id, &pending.message_id, data)
            }
            Err(err) => {
                let err = dispatch::fold_error(&pending.command_id, err);
                shared::lobby::failed_response(
                    &pending.command_id,
                    &pending.message_id,
                    &err.reason,
                    err.details.as_deref(),
                )
            }
        };
        self.send_to_lobby(response).await;
    }

    // Request surface ------------------------------------------------------

    pub async fn start(
        &mut self,
        request: StartRequest,
        envelope: &Envelope,
    ) -> Result<Outcome, DomainError> {
        let battle_id = request.battle_id.clone();
        if self.players.contains_key(&battle_id) {
            return Err(DomainError::battle_already_exists(&battle_id));
        }
        let order = player_order(&request);
        if order.len() > MAX_PLAYER_NUMBER + 1 {
            return Err(DomainError::invalid_request(format!(
                "too many participants ({})",
                order.len()
            )));
        }
        let mut index = PlayerIndex::new();
        for (number, player) in order.iter().enumerate() {
            index
                .insert(PlayerIdentity {
                    user_id: player.user_id.clone(),
                    name: player.name.clone(),
                    player_number: number as u8,
                })
                .map_err(|e| {
                    DomainError::invalid_request(format!(
                        "player identities are not unique: {e}"
                    ))
                })?;
        }
        // Indexed eagerly, in start-script order; rolled back by
        // handle_pending if the start fails.
        self.players.insert(battle_id.clone(), index);

        let games = self.games.clone();
        let pending_tx = self.pending_tx.clone();
        let hosting_ip = self.config.hosting_ip.clone();
        let message_id = envelope.message_id.clone();
        tokio::spawn(async move {
            let result = games.start(request).await.and_then(|data| {
                serde_json::to_value(StartResponseData {
                    ips: vec![hosting_ip],
                    port: data.port,
                })
                .map(Some)
                .map_err(|e| DomainError::internal(e.to_string()))
            });
            let _ = pending_tx.send(PendingResponse {
                kind: PendingKind::Start { battle_id },
                command_id: CMD_START.to_string(),
                message_id,
                result,
            });
        });
        Ok(Outcome::Deferred)
    }

    pub async fn kill(&mut self, battle_id: &str) -> Result<Outcome, DomainError> {
        self.games.kill(battle_id).await?;
        Ok(Outcome::Reply(None))
    }

    pub async fn add_player(
        &mut self,
        battle_id: &str,
        user_id: &str,
        name: &str,
        password: &str,
    ) -> Result<Outcome, DomainError> {
        let index = self
            .players
            .get(battle_id)
            .ok_or_else(|| DomainError::invalid_request(format!("unknown battle {battle_id}")))?;

        if let Some(existing) = index.by_user_id(user_id) {
            if existing.name != name {
                return Err(DomainError::invalid_request(format!(
                    "user {user_id} is already known as {:?}",
                    existing.name
                )));
            }
            // Known user: a password change only, no identity mutation.
            let packet = serialize_command("adduser", &[name, password])?;
            self.games.send_packet(battle_id, packet).await?;
            return Ok(Outcome::Reply(None));
        }
        if index.by_name(name).is_some() {
            return Err(DomainError::invalid_request(format!(
                "name {name:?} is taken by another user"
            )));
        }
        if index.len() > MAX_PLAYER_NUMBER {
            return Err(DomainError::invalid_request(
                "battle has no free player numbers",
            ));
        }
        let player_number = index.len() as u8;

        let packet = serialize_command("adduser", &[name, password, "1"])?;
        // The identity is recorded only once the engine accepted the
        // packet; a failed send leaves the index untouched.
        self.games.send_packet(battle_id, packet).await?;
        if let Some(index) = self.players.get_mut(battle_id) {
            let _ = index.insert(PlayerIdentity {
                user_id: user_id.to_string(),
                name: name.to_string(),
                player_number,
            });
        }
        Ok(Outcome::Reply(None))
    }

    pub async fn kick_player(
        &mut self,
        battle_id: &str,
        user_id: &str,
    ) -> Result<Outcome, DomainError> {
        let name = self.lookup_name(battle_id, user_id)?;
        let packet = serialize_command("kick", &[&name])?;
        self.games.send_packet(battle_id, packet).await?;
        Ok(Outcome::Reply(None))
    }

    pub async fn mute_player(
        &mut self,
        battle_id: &str,
        user_id: &str,
        chat: bool,
        draw: bool,
    ) -> Result<Outcome, DomainError> {
        let name = self.lookup_name(battle_id, user_id)?;
        let packet = serialize_command("mute", &[&name, bool_arg(chat), bool_arg(draw)])?;
        self.games.send_packet(battle_id, packet).await?;
        Ok(Outcome::Reply(None))
    }

    /// All-or-none: every user id must resolve before any packet is sent.
    pub async fn spec_players(
        &mut self,
        battle_id: &str,
        user_ids: &[String],
    ) -> Result<Outcome, DomainError> {
        let mut names = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            names.push(self.lookup_name(battle_id, user_id)?);
        }
        for name in names {
            let packet = serialize_command("spec", &[&name])?;
            self.games.send_packet(battle_id, packet).await?;
        }
        Ok(Outcome::Reply(None))
    }

    pub async fn send_command(
        &mut self,
        battle_id: &str,
        command: &str,
        arguments: &[String],
    ) -> Result<Outcome, DomainError> {
        let packet = encode_command(command, arguments)
            .map_err(|e| DomainError::invalid_request(e.to_string()))?;
        self.games.send_packet(battle_id, packet).await?;
        Ok(Outcome::Reply(None))
    }

    pub async fn send_message(
        &mut self,
        battle_id: &str,
        message: &str,
    ) -> Result<Outcome, DomainError> {
        let packet = encode_chat_message(message)
            .map_err(|e| DomainError::invalid_request(e.to_string()))?;
        self.games.send_packet(battle_id, packet).await?;
        Ok(Outcome::Reply(None))
    }

    pub async fn subscribe_updates(&mut self, since: u64) -> Result<Outcome, DomainError> {
        let Some(lobby_tx) = self.lobby_tx.clone() else {
            return Err(DomainError::internal("lobby connection is not available"));
        };
        let sink: UpdateSink = Box::new(move |event| {
            let lobby_tx = lobby_tx.clone();
            Box::pin(async move {
                let data = match serde_json::to_value(&event) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("failed to serialize update: {e}");
                        return;
                    }
                };
                if lobby_tx.send(event_message(CMD_UPDATE, data)).await.is_err() {
                    warn!("dropping update: lobby connection closed");
                }
            })
        });
        self.buffer
            .subscribe(since, sink)
            .await
            .map_err(|e| DomainError::invalid_request(e.to_string()))?;
        Ok(Outcome::Reply(None))
    }

    pub fn install_engine(
        &mut self,
        version: &str,
        envelope: &Envelope,
    ) -> Result<Outcome, DomainError> {
        let registry = self.registry.clone();
        let pending_tx = self.pending_tx.clone();
        let message_id = envelope.message_id.clone();
        let version = version.to_string();
        tokio::spawn(async move {
            let result = registry.install(&version).await.map(|_| None);
            let _ = pending_tx.send(PendingResponse {
                kind: PendingKind::InstallEngine,
                command_id: CMD_INSTALL_ENGINE.to_string(),
                message_id,
                result,
            });
        });
        Ok(Outcome::Deferred)
    }

    // Internals ------------------------------------------------------------

    fn lookup_name(&self, battle_id: &str, user_id: &str) -> Result<String, DomainError> {
        let index = self
            .players
            .get(battle_id)
            .ok_or_else(|| DomainError::invalid_request(format!("unknown battle {battle_id}")))?;
        index
            .by_user_id(user_id)
            .map(|identity| identity.name.clone())
            .ok_or_else(|| {
                DomainError::invalid_request(format!("unknown user {user_id} in battle {battle_id}"))
            })
    }

    /// Returns true when this is the battle's first terminal update.
    fn mark_finished(&mut self, battle_id: &str) -> bool {
        self.finished_battles.insert(battle_id.to_string())
    }

    async fn publish_status(&mut self) {
        let Some(lobby_tx) = &self.lobby_tx else {
            return;
        };
        let data = match serde_json::to_value(&self.status) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to serialize status: {e}");
                return;
            }
        };
        // Publication failures are swallowed; the next status change or
        // reconnect republishes.
        if lobby_tx.send(event_message(CMD_STATUS, data)).await.is_err() {
            warn!("status publication failed: lobby connection closed");
        }
    }

    async fn send_to_lobby(&mut self, frame: Value) {
        if let Some(lobby_tx) = &self.lobby_tx {
            if lobby_tx.send(frame).await.is_err() {
                warn!("dropping frame: lobby connection closed");
            }
        }
    }
}

fn bool_arg(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn serialize_command(name: &str, args: &[&str]) -> Result<Vec<u8>, DomainError> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    encode_command(name, &args).map_err(|e| DomainError::invalid_request(e.to_string()))
}

/// Projects one engine event to its lobby update, resolving player numbers
/// through the battle's index. Events that cannot be resolved are logged
/// and dropped; `ServerStarted`, `PlayerReady` and `GameTeamStat` map to
/// nothing by design.
fn project_event(
    players: &HashMap<String, PlayerIndex>,
    battle_id: &str,
    event: EngineEvent,
) -> Option<LobbyUpdate> {
    let resolve = |player: u8| -> Option<String> {
        match players
            .get(battle_id)
            .and_then(|index| index.by_number(player))
        {
            Some(identity) => Some(identity.user_id.clone()),
            None => {
                warn!("[{battle_id}] cannot resolve player number {player}, dropping event");
                None
            }
        }
    };
    match event {
        EngineEvent::ServerStarted
        | EngineEvent::PlayerReady { .. }
        | EngineEvent::GameTeamStat { .. } => None,
        EngineEvent::ServerQuit => Some(LobbyUpdate::EngineQuit),
        EngineEvent::ServerStartPlaying { game_id, demo_path } => Some(LobbyUpdate::Start {
            game_id: hex::encode(game_id),
            demo_path,
        }),
        EngineEvent::ServerGameOver {
            player,
            winning_ally_teams,
        } => {
            if winning_ally_teams.is_empty() {
                warn!("[{battle_id}] game over without winners, dropping event");
                return None;
            }
            Some(LobbyUpdate::Finished {
                user_id: resolve(player)?,
                winning_ally_teams,
            })
        }
        EngineEvent::ServerMessage { message } => Some(LobbyUpdate::EngineMessage { message }),
        EngineEvent::ServerWarning { message } => Some(LobbyUpdate::EngineWarning { message }),
        EngineEvent::PlayerJoined { player, name: _ } => Some(LobbyUpdate::PlayerJoined {
            user_id: resolve(player)?,
            player_number: player,
        }),
        EngineEvent::PlayerLeft { player, reason } => Some(LobbyUpdate::PlayerLeft {
            user_id: resolve(player)?,
            reason,
        }),
        EngineEvent::PlayerChat {
            from,
            destination,
            message,
        } => {
            let user_id = resolve(from)?;
            let (target, to_user_id) = match destination {
                ChatDestination::Player(to) => (ChatTarget::Player, Some(resolve(to)?)),
                ChatDestination::Allies => (ChatTarget::Allies, None),
                ChatDestination::Spectators => (ChatTarget::Spectators, None),
                ChatDestination::All => (ChatTarget::All, None),
            };
            Some(LobbyUpdate::PlayerChat {
                user_id,
                to_user_id,
                destination: target,
                message,
            })
        }
        EngineEvent::PlayerDefeated { player } => Some(LobbyUpdate::PlayerDefeated {
            user_id: resolve(player)?,
        }),
        EngineEvent::GameLuaMsg {
            player,
            script,
            ui_mode,
            data,
        } => Some(LobbyUpdate::LuaMsg {
            user_id: resolve(player)?,
            script,
            ui_mode,
            data: BASE64.encode(data),
        }),
    }
}
