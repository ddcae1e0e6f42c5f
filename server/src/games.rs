//! Games manager: the pool of engine runners.
//!
//! Owns battle-id bookkeeping, the rotating port allocator and capacity
//! accounting. All pool state is mutated inside the manager's own task;
//! callers go through a cloneable handle whose commands are answered over
//! oneshot channels, and per-battle runner events are funneled back into
//! the same task so ordering is preserved.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use shared::autohost::EngineEvent;
use shared::lobby::{DomainError, StartRequest};

use crate::config::{Config, ENGINES_DIR, INSTANCES_DIR};
use crate::runner::{RunnerEvent, RunnerFactory, RunnerHandle, RunnerOpts};
use crate::start_script;

/// How often the pool logs its occupancy.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Pool-relevant slice of the configuration.
#[derive(Debug, Clone)]
pub struct GamesConfig {
    pub max_battles: usize,
    pub engine_start_port: u16,
    pub engine_autohost_start_port: u16,
    pub max_ports_used: u16,
    pub max_game_duration: Duration,
    pub engine_bind_ip: String,
    pub engine_settings: std::collections::BTreeMap<String, String>,
    pub engines_dir: PathBuf,
    pub instances_dir: PathBuf,
}

impl GamesConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_battles: config.max_battles,
            engine_start_port: config.engine_start_port,
            engine_autohost_start_port: config.engine_autohost_start_port,
            max_ports_used: config.max_ports_used,
            max_game_duration: config.max_game_duration(),
            engine_bind_ip: config.engine_bind_ip.clone(),
            engine_settings: config.engine_settings.clone(),
            engines_dir: PathBuf::from(ENGINES_DIR),
            instances_dir: PathBuf::from(INSTANCES_DIR),
        }
    }
}

/// Successful start: the battle port clients should join.
#[derive(Debug, Clone, PartialEq)]
pub struct StartData {
    pub port: u16,
}

/// Events the pool publishes to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// The battle reached Running.
    BattleStarted { battle_id: String },
    /// One decoded engine packet from a running battle.
    Packet {
        battle_id: String,
        event: EngineEvent,
    },
    /// A running battle hit a fatal error.
    BattleError {
        battle_id: String,
        details: String,
    },
    /// The battle is fully gone; its ports are reusable.
    BattleExited { battle_id: String },
    /// Capacity accounting changed.
    Capacity { current_battles: usize },
}

enum Cmd {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<Result<StartData, DomainError>>,
    },
    Kill {
        battle_id: String,
        reply: oneshot::Sender<Result<(), DomainError>>,
    },
    SendPacket {
        battle_id: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), DomainError>>,
    },
    SetMaxBattles {
        max_battles: usize,
    },
    CloseAll,
    Occupancy {
        reply: oneshot::Sender<(usize, usize)>,
    },
}

enum Internal {
    RunnerEvent {
        battle_id: String,
        event: RunnerEvent,
    },
    MatchTimeout {
        battle_id: String,
    },
}

/// Cloneable handle to the pool task.
#[derive(Clone)]
pub struct GamesHandle {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl GamesHandle {
    pub async fn start(&self, request: StartRequest) -> Result<StartData, DomainError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Start { request, reply })
            .map_err(|_| DomainError::internal("games manager is gone"))?;
        rx.await
            .map_err(|_| DomainError::internal("games manager dropped the request"))?
    }

    pub async fn kill(&self, battle_id: &str) -> Result<(), DomainError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Kill {
                battle_id: battle_id.to_string(),
                reply,
            })
            .map_err(|_| DomainError::internal("games manager is gone"))?;
        rx.await
            .map_err(|_| DomainError::internal("games manager dropped the request"))?
    }

    pub async fn send_packet(&self, battle_id: &str, data: Vec<u8>) -> Result<(), DomainError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SendPacket {
                battle_id: battle_id.to_string(),
                data,
                reply,
            })
            .map_err(|_| DomainError::internal("games manager is gone"))?;
        rx.await
            .map_err(|_| DomainError::internal("games manager dropped the request"))?
    }

    /// Caps new starts; running battles are unaffected.
    pub fn set_max_battles(&self, max_battles: usize) {
        let _ = self.cmd_tx.send(Cmd::SetMaxBattles { max_battles });
    }

    /// Requests shutdown of every running battle.
    pub fn close_all(&self) {
        let _ = self.cmd_tx.send(Cmd::CloseAll);
    }

    pub async fn occupancy(&self) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Occupancy { reply }).is_err() {
            return (0, 0);
        }
        rx.await.unwrap_or((0, 0))
    }
}

struct Battle {
    runner: RunnerHandle,
    port_offset: u16,
    observed_start: bool,
    pending_reply: Option<oneshot::Sender<Result<StartData, DomainError>>>,
    timeout_task: Option<JoinHandle<()>>,
}

struct GamesManager {
    config: GamesConfig,
    factory: Arc<dyn RunnerFactory>,
    battles: HashMap<String, Battle>,
    used_battle_ids: HashSet<String>,
    used_port_offsets: HashSet<u16>,
    port_cursor: u16,
    current_battles: usize,
    max_battles: usize,
    events: mpsc::UnboundedSender<GameEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

/// Spawns the pool task.
pub fn spawn(
    config: GamesConfig,
    factory: Arc<dyn RunnerFactory>,
) -> (GamesHandle, mpsc::UnboundedReceiver<GameEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let manager = GamesManager {
        max_battles: config.max_battles,
        config,
        factory,
        battles: HashMap::new(),
        used_battle_ids: HashSet::new(),
        used_port_offsets: HashSet::new(),
        port_cursor: 0,
        current_battles: 0,
        events: event_tx,
        internal_tx,
    };
    tokio::spawn(run(manager, cmd_rx, internal_rx));
    (GamesHandle { cmd_tx }, event_rx)
}

async fn run(
    mut manager: GamesManager,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
) {
    let mut status_log = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_log.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cmd_open = true;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if cmd_open => match cmd {
                Some(cmd) => manager.handle_cmd(cmd),
                None => {
                    if manager.battles.is_empty() {
                        return;
                    }
                    cmd_open = false;
                }
            },
            internal = internal_rx.recv() => match internal {
                Some(internal) => {
                    manager.handle_internal(internal);
                    if !cmd_open && manager.battles.is_empty() {
                        return;
                    }
                }
                None => return,
            },
            _ = status_log.tick() => {
                if !manager.battles.is_empty() {
                    info!(
                        "pool: {}/{} battles running",
                        manager.current_battles, manager.max_battles
                    );
                }
            }
        }
    }
}

impl GamesManager {
    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Start { request, reply } => {
                if let Err(e) = self.start_battle(request, reply) {
                    // The reply sender was consumed by start_battle on the
                    // failure path already.
                    warn!("start rejected: {e}");
                }
            }
            Cmd::Kill { battle_id, reply } => {
                let result = match self.battles.get(&battle_id) {
                    Some(battle) => {
                        battle.runner.close();
                        Ok(())
                    }
                    None => Err(DomainError::invalid_request(format!(
                        "unknown battle {battle_id}"
                    ))),
                };
                let _ = reply.send(result);
            }
            Cmd::SendPacket {
                battle_id,
                data,
                reply,
            } => {
                let result = match self.battles.get(&battle_id) {
                    Some(battle) => battle
                        .runner
                        .send_packet(data)
                        .map_err(|_| DomainError::internal("battle is shutting down")),
                    None => Err(DomainError::invalid_request(format!(
                        "unknown battle {battle_id}"
                    ))),
                };
                let _ = reply.send(result);
            }
            Cmd::SetMaxBattles { max_battles } => {
                info!("maxBattles set to {max_battles}");
                self.max_battles = max_battles;
            }
            Cmd::CloseAll => {
                info!("closing all {} battles", self.battles.len());
                for battle in self.battles.values() {
                    battle.runner.close();
                }
            }
            Cmd::Occupancy { reply } => {
                let _ = reply.send((self.current_battles, self.max_battles));
            }
        }
    }

    fn start_battle(
        &mut self,
        request: StartRequest,
        reply: oneshot::Sender<Result<StartData, DomainError>>,
    ) -> Result<(), DomainError> {
        let battle_id = request.battle_id.clone();
        if let Err(e) = self.validate_start(&battle_id) {
            let _ = reply.send(Err(e.clone()));
            return Err(e);
        }
        let offset = match self.find_free_offset() {
            Ok(offset) => offset,
            Err(e) => {
                let _ = reply.send(Err(e.clone()));
                return Err(e);
            }
        };
        self.used_battle_ids.insert(battle_id.clone());
        let battle_port = self.config.engine_start_port + offset;
        let autohost_port = self.config.engine_autohost_start_port + offset;
        let script = start_script::render_start_script(
            &request,
            &self.config.engine_bind_ip,
            battle_port,
            autohost_port,
        );
        let opts = RunnerOpts {
            battle_id: battle_id.clone(),
            engine_version: request.engine_version.clone(),
            engines_dir: self.config.engines_dir.clone(),
            instances_dir: self.config.instances_dir.clone(),
            autohost_port,
            start_script: script,
            settings: start_script::merged_settings(&self.config.engine_settings),
        };
        info!("[{battle_id}] starting battle on port offset {offset} (port {battle_port})");
        let (runner, mut runner_events) = self.factory.launch(opts);
        self.battles.insert(
            battle_id.clone(),
            Battle {
                runner,
                port_offset: offset,
                observed_start: false,
                pending_reply: Some(reply),
                timeout_task: None,
            },
        );
        let internal_tx = self.internal_tx.clone();
        let forwarded_id = battle_id;
        tokio::spawn(async move {
            while let Some(event) = runner_events.recv().await {
                if internal_tx
                    .send(Internal::RunnerEvent {
                        battle_id: forwarded_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(())
    }

    fn validate_start(&self, battle_id: &str) -> Result<(), DomainError> {
        if battle_id.is_empty()
            || battle_id.contains('/')
            || battle_id.contains('\\')
            || battle_id.contains("..")
        {
            return Err(DomainError::invalid_request(format!(
                "battle id {battle_id:?} is not usable"
            )));
        }
        // Battle ids are never reusable, even after the battle ended.
        if self.used_battle_ids.contains(battle_id) {
            return Err(DomainError::battle_already_exists(battle_id));
        }
        if self.current_battles >= self.max_battles {
            return Err(DomainError::invalid_request(format!(
                "maximum number of battles reached ({})",
                self.max_battles
            )));
        }
        Ok(())
    }

    // Rotating cursor: advance first, then probe, so consecutive battles
    // spread across the range instead of piling onto freed offsets.
    fn find_free_offset(&mut self) -> Result<u16, DomainError> {
        let max = self.config.max_ports_used as u32;
        for step in 1..=max {
            let candidate = ((self.port_cursor as u32 + step) % max) as u16;
            if !self.used_port_offsets.contains(&candidate) {
                self.port_cursor = candidate;
                self.used_port_offsets.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(DomainError::internal("no free ports"))
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RunnerEvent { battle_id, event } => {
                self.handle_runner_event(battle_id, event)
            }
            Internal::MatchTimeout { battle_id } => {
                if let Some(battle) = self.battles.get(&battle_id) {
                    warn!("[{battle_id}] match exceeded maximum duration, closing");
                    battle.runner.close();
                }
            }
        }
    }

    fn handle_runner_event(&mut self, battle_id: String, event: RunnerEvent) {
        if matches!(event, RunnerEvent::Exit) {
            self.handle_battle_exit(battle_id);
            return;
        }
        let Some(battle) = self.battles.get_mut(&battle_id) else {
            return;
        };
        match event {
            RunnerEvent::Start { .. } => {
                battle.observed_start = true;
                self.current_battles += 1;
                let port = self.config.engine_start_port + battle.port_offset;
                if let Some(reply) = battle.pending_reply.take() {
                    let _ = reply.send(Ok(StartData { port }));
                }
                let internal_tx = self.internal_tx.clone();
                let timeout_id = battle_id.clone();
                let duration = self.config.max_game_duration;
                battle.timeout_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = internal_tx.send(Internal::MatchTimeout {
                        battle_id: timeout_id,
                    });
                }));
                let _ = self.events.send(GameEvent::BattleStarted {
                    battle_id: battle_id.clone(),
                });
                let _ = self.events.send(GameEvent::Capacity {
                    current_battles: self.current_battles,
                });
            }
            RunnerEvent::Packet(event) => {
                if battle.observed_start {
                    let _ = self.events.send(GameEvent::Packet { battle_id, event });
                }
            }
            RunnerEvent::Error(details) => {
                if let Some(reply) = battle.pending_reply.take() {
                    let _ = reply.send(Err(DomainError::internal(details)));
                } else if battle.observed_start {
                    let _ = self
                        .events
                        .send(GameEvent::BattleError { battle_id, details });
                }
            }
            RunnerEvent::Exit => unreachable!("handled above"),
        }
    }

    fn handle_battle_exit(&mut self, battle_id: String) {
        let Some(battle) = self.battles.remove(&battle_id) else {
            return;
        };
        if let Some(task) = battle.timeout_task {
            task.abort();
        }
        self.used_port_offsets.remove(&battle.port_offset);
        if let Some(reply) = battle.pending_reply {
            let _ = reply.send(Err(DomainError::internal(
                "engine exited before the battle started",
            )));
        }
        // Only observed starts count toward capacity, so only they
        // decrement it.
        if battle.observed_start {
            self.current_battles -= 1;
            let _ = self.events.send(GameEvent::BattleExited {
                battle_id: battle_id.clone(),
            });
            let _ = self.events.send(GameEvent::Capacity {
                current_battles: self.current_battles,
            });
        }
        info!("[{battle_id}] battle removed from pool");
    }
}
