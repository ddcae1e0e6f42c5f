//! Shared test harness: a synthetic runner factory plus an adapter wired
//! the way the supervisor wires it, with the lobby replaced by a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use server::adapter::{Adapter, AdapterConfig, PendingResponse};
use server::engines::{self, RegistryConfig, RegistryEvent};
use server::games::{self, GameEvent, GamesConfig, GamesHandle};
use server::runner::{RunnerCmd, RunnerEvent, RunnerFactory, RunnerHandle, RunnerOpts};
use shared::lobby::parse_envelope;

/// Synthetic runner: reports `Start` immediately, records outbound
/// packets, exits on `Close`. Tests can inject arbitrary runner events or
/// sever the command channel to simulate a dying runner.
pub struct FakeRunnerFactory {
    auto_start: bool,
    pub launched: Mutex<Vec<RunnerOpts>>,
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    events: Mutex<HashMap<String, mpsc::UnboundedSender<RunnerEvent>>>,
    severs: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeRunnerFactory {
    pub fn new(auto_start: bool) -> Self {
        Self {
            auto_start,
            launched: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(HashMap::new()),
            severs: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds a synthetic runner event into the battle's stream.
    pub fn inject(&self, battle_id: &str, event: RunnerEvent) {
        let events = self.events.lock().unwrap();
        events
            .get(battle_id)
            .expect("battle not launched")
            .send(event)
            .expect("runner event stream closed");
    }

    /// Drops the battle's command channel without emitting `Exit`, so
    /// subsequent sends fail like they would against a dying runner.
    pub fn sever(&self, battle_id: &str) {
        let severs = self.severs.lock().unwrap();
        severs
            .get(battle_id)
            .expect("battle not launched")
            .notify_one();
    }

    pub fn sent_packets(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(id, data)| (id.clone(), String::from_utf8_lossy(data).into_owned()))
            .collect()
    }
}

impl RunnerFactory for FakeRunnerFactory {
    fn launch(
        &self,
        opts: RunnerOpts,
    ) -> (RunnerHandle, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (handle, mut cmd_rx) = RunnerHandle::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let battle_id = opts.battle_id.clone();
        let sever = Arc::new(Notify::new());
        self.launched.lock().unwrap().push(opts);
        self.events
            .lock()
            .unwrap()
            .insert(battle_id.clone(), event_tx.clone());
        self.severs
            .lock()
            .unwrap()
            .insert(battle_id.clone(), Arc::clone(&sever));

        let auto_start = self.auto_start;
        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            if auto_start {
                let _ = event_tx.send(RunnerEvent::Start {
                    engine_addr: "127.0.0.1:9999".parse().unwrap(),
                });
            }
            loop {
                tokio::select! {
                    _ = sever.notified() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(RunnerCmd::SendPacket(data)) => {
                            sent.lock().unwrap().push((battle_id.clone(), data));
                        }
                        Some(RunnerCmd::Close) => {
                            let _ = event_tx.send(RunnerEvent::Exit);
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
        (handle, event_rx)
    }
}

pub const HOSTING_IP: &str = "203.0.113.7";

pub struct Harness {
    pub adapter: Adapter,
    pub games: GamesHandle,
    pub factory: Arc<FakeRunnerFactory>,
    pub game_events: mpsc::UnboundedReceiver<GameEvent>,
    pub registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    pub pending_rx: mpsc::UnboundedReceiver<PendingResponse>,
    pub lobby_rx: mpsc::Receiver<Value>,
    /// Non-response frames (events) observed while pumping.
    pub frames: Vec<Value>,
    next_message: usize,
    _tmp: tempfile::TempDir,
}

/// Microseconds since the unix epoch, the buffer's public time base.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_factory(Arc::new(FakeRunnerFactory::new(true))).await
    }

    pub async fn with_factory(factory: Arc<FakeRunnerFactory>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let games_config = GamesConfig {
            max_battles: 10,
            engine_start_port: 20000,
            engine_autohost_start_port: 22000,
            max_ports_used: 1000,
            max_game_duration: Duration::from_secs(3600),
            engine_bind_ip: "0.0.0.0".to_string(),
            engine_settings: Default::default(),
            engines_dir: tmp.path().join("engines"),
            instances_dir: tmp.path().join("instances"),
        };
        let (games, game_events) = games::spawn(games_config, factory.clone());

        let registry_config = RegistryConfig {
            engines_dir: tmp.path().join("engines"),
            cdn_base_url: "http://127.0.0.1:9".to_string(),
            install_timeout: Duration::from_millis(500),
            download_max_attempts: 1,
            download_retry_backoff_base: Duration::from_millis(10),
        };
        let (registry, registry_events) =
            engines::spawn(registry_config, reqwest::Client::new()).unwrap();

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let adapter_config = AdapterConfig {
            hosting_ip: HOSTING_IP.to_string(),
            max_battles: 10,
            max_updates_age: Duration::from_secs(600),
        };
        let mut adapter = Adapter::new(adapter_config, games.clone(), registry, pending_tx);

        let (lobby_tx, lobby_rx) = mpsc::channel(64);
        adapter.on_connected(lobby_tx).await;

        Self {
            adapter,
            games,
            factory,
            game_events,
            registry_events,
            pending_rx,
            lobby_rx,
            frames: Vec::new(),
            next_message: 0,
            _tmp: tmp,
        }
    }

    /// Sends one request and pumps everything until its response arrives.
    pub async fn request(&mut self, command_id: &str, data: Value) -> Value {
        self.next_message += 1;
        let message_id = format!("m-{}", self.next_message);
        let raw = json!({
            "type": "request",
            "messageId": message_id,
            "commandId": command_id,
            "data": data,
        });
        let envelope = parse_envelope(&raw.to_string()).unwrap();
        self.adapter.handle_envelope(envelope).await;
        self.pump_until_response(&message_id).await
    }

    async fn pump_until_response(&mut self, message_id: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    panic!("timed out waiting for response to {message_id}");
                }
                frame = self.lobby_rx.recv() => {
                    let frame = frame.expect("lobby channel closed");
                    if frame["type"] == "response" && frame["messageId"] == message_id {
                        return frame;
                    }
                    self.frames.push(frame);
                }
                pending = self.pending_rx.recv() => {
                    if let Some(pending) = pending {
                        self.adapter.handle_pending(pending).await;
                    }
                }
                event = self.game_events.recv() => {
                    if let Some(event) = event {
                        self.adapter.handle_game_event(event).await;
                    }
                }
                event = self.registry_events.recv() => {
                    if let Some(event) = event {
                        self.adapter.handle_registry_event(event).await;
                    }
                }
            }
        }
    }

    /// Pumps events for a fixed window, collecting lobby frames.
    pub async fn pump_for(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                frame = self.lobby_rx.recv() => {
                    if let Some(frame) = frame {
                        self.frames.push(frame);
                    }
                }
                pending = self.pending_rx.recv() => {
                    if let Some(pending) = pending {
                        self.adapter.handle_pending(pending).await;
                    }
                }
                event = self.game_events.recv() => {
                    if let Some(event) = event {
                        self.adapter.handle_game_event(event).await;
                    }
                }
                event = self.registry_events.recv() => {
                    if let Some(event) = event {
                        self.adapter.handle_registry_event(event).await;
                    }
                }
            }
        }
    }

    /// Simulates a lobby reconnect: drops the old channel, attaches a new
    /// one and lets the adapter republish its status.
    pub async fn reconnect(&mut self) {
        self.adapter.on_disconnected();
        let (lobby_tx, lobby_rx) = mpsc::channel(64);
        self.adapter.on_connected(lobby_tx).await;
        self.lobby_rx = lobby_rx;
    }

    /// Collected `autohost/update` event payloads.
    pub fn updates(&self) -> Vec<Value> {
        self.frames
            .iter()
            .filter(|f| f["type"] == "event" && f["commandId"] == "autohost/update")
            .map(|f| f["data"].clone())
            .collect()
    }

    /// Collected `autohost/status` event payloads.
    pub fn statuses(&self) -> Vec<Value> {
        self.frames
            .iter()
            .filter(|f| f["type"] == "event" && f["commandId"] == "autohost/status")
            .map(|f| f["data"].clone())
            .collect()
    }
}

/// A start request with one team player per (userId, name) pair plus
/// optional spectators.
pub fn start_request(battle_id: &str, players: &[(&str, &str)], spectators: &[(&str, &str)]) -> Value {
    let teams: Vec<Value> = players
        .iter()
        .map(|(user_id, name)| {
            json!({"players": [{"userId": user_id, "name": name, "password": "pw"}]})
        })
        .collect();
    json!({
        "battleId": battle_id,
        "engineVersion": "105.1.1",
        "gameName": "Game 1.0",
        "mapName": "Flats",
        "allyTeams": [{"teams": teams}],
        "spectators": spectators
            .iter()
            .map(|(user_id, name)| json!({"userId": user_id, "name": name, "password": "pw"}))
            .collect::<Vec<Value>>(),
    })
}
