//! Supervisor: wires the pool, registry, buffer and lobby client together
//! and owns the process lifecycle.
//!
//! One `select!` loop consumes pool events, registry events, deferred
//! request completions and lobby frames. The lobby connection is retried
//! forever with exponential backoff (reset on every successful connect);
//! pool and registry events keep flowing while disconnected so updates
//! accumulate in the buffer. The first shutdown signal drains (no new
//! battles, wait for running ones), the second force-closes everything.

use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::adapter::{Adapter, PendingResponse};
use crate::config::Config;
use crate::engines::RegistryEvent;
use crate::games::{GameEvent, GamesHandle};
use crate::lobby_client::{ClientEvent, ConnectError, LobbyClient};

/// First reconnect delay; doubles per failure up to the configured cap.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

#[cfg(unix)]
struct Shutdown {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Shutdown {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct Shutdown;

#[cfg(not(unix))]
impl Shutdown {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

fn spawn_connect(
    result_tx: mpsc::Sender<Result<LobbyClient, ConnectError>>,
    config: Config,
    http: reqwest::Client,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let result = LobbyClient::connect(&config, &http).await;
        let _ = result_tx.send(result).await;
    });
}

async fn next_frame(lobby: &mut Option<LobbyClient>) -> ClientEvent {
    match lobby {
        Some(client) => match client.events.recv().await {
            Some(event) => event,
            None => ClientEvent::Closed {
                reason: "connection task ended".to_string(),
            },
        },
        None => std::future::pending().await,
    }
}

/// Runs the controller until shutdown. Returns the process exit code.
pub async fn run(
    config: Config,
    mut adapter: Adapter,
    games: GamesHandle,
    mut game_events: mpsc::UnboundedReceiver<GameEvent>,
    mut registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    mut pending_rx: mpsc::UnboundedReceiver<PendingResponse>,
    http: reqwest::Client,
) -> i32 {
    let mut shutdown = match Shutdown::new() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            error!("cannot install signal handlers: {e}");
            return 1;
        }
    };

    let backoff_cap = config.max_reconnect_delay();
    let mut backoff = INITIAL_BACKOFF;
    let mut lobby: Option<LobbyClient> = None;
    let mut draining = false;

    let (connect_tx, mut connect_rx) = mpsc::channel(1);
    spawn_connect(
        connect_tx.clone(),
        config.clone(),
        http.clone(),
        Duration::ZERO,
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                if !draining {
                    draining = true;
                    info!("shutdown requested, draining battles");
                    games.set_max_battles(0);
                    adapter.note_max_battles(0);
                    if adapter.current_battles() == 0 {
                        info!("no battles running, exiting");
                        return 0;
                    }
                } else {
                    warn!("second shutdown signal, force closing all battles");
                    games.close_all();
                    return 0;
                }
            }

            event = game_events.recv() => match event {
                Some(event) => {
                    adapter.handle_game_event(event).await;
                    if draining && adapter.current_battles() == 0 {
                        info!("all battles drained, exiting");
                        return 0;
                    }
                }
                None => {
                    error!("games manager terminated unexpectedly");
                    return 1;
                }
            },

            event = registry_events.recv() => match event {
                Some(event) => adapter.handle_registry_event(event).await,
                None => {
                    error!("engine registry terminated unexpectedly");
                    return 1;
                }
            },

            pending = pending_rx.recv() => {
                if let Some(pending) = pending {
                    adapter.handle_pending(pending).await;
                }
            }

            result = connect_rx.recv() => match result {
                Some(Ok(client)) => {
                    info!("connected to lobby at {}", config.tachyon_server);
                    backoff = INITIAL_BACKOFF;
                    adapter.on_connected(client.sender.clone()).await;
                    lobby = Some(client);
                }
                Some(Err(e)) => {
                    warn!("lobby connection failed: {e}, retrying in {backoff:?}");
                    spawn_connect(connect_tx.clone(), config.clone(), http.clone(), backoff);
                    backoff = next_backoff(backoff, backoff_cap);
                }
                None => {
                    error!("connect channel closed unexpectedly");
                    return 1;
                }
            },

            event = next_frame(&mut lobby) => match event {
                ClientEvent::Frame(envelope) => adapter.handle_envelope(envelope).await,
                ClientEvent::Closed { reason } => {
                    warn!("lobby connection closed: {reason}, reconnecting in {backoff:?}");
                    adapter.on_disconnected();
                    lobby = None;
                    spawn_connect(connect_tx.clone(), config.clone(), http.clone(), backoff);
                    backoff = next_backoff(backoff, backoff_cap);
                }
            },
        }
    }
}
