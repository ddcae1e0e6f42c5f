//! Engine runner: owns exactly one battle.
//!
//! A runner renders the battle's instance directory, binds the autohost UDP
//! socket, spawns the engine process and drives the whole thing as a small
//! state machine: Starting until the first `SERVER_STARTED` datagram,
//! Running while the engine lives, Stopping once `Close` is requested or a
//! fatal error occurs, Stopped when both the process has exited and the
//! socket is closed. `Exit` is emitted exactly once, after both, so the
//! port is guaranteed reusable by the time the pool sees it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use shared::autohost::{decode_event, EngineEvent};

/// Platform-specific dedicated-server binary name.
pub const ENGINE_BINARY_NAME: &str = if cfg!(windows) {
    "spring-dedicated.exe"
} else {
    "spring-dedicated"
};

/// Grace period between SIGTERM and SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything a runner needs to bring up one battle.
#[derive(Debug, Clone)]
pub struct RunnerOpts {
    pub battle_id: String,
    pub engine_version: String,
    /// Root of the installed-engines tree.
    pub engines_dir: PathBuf,
    /// Root under which per-battle instance directories are created.
    pub instances_dir: PathBuf,
    /// Local port for the engine's autohost channel.
    pub autohost_port: u16,
    /// Rendered start script contents.
    pub start_script: String,
    /// Merged settings-file contents (already includes mandatory overrides).
    pub settings: BTreeMap<String, String>,
}

/// Events emitted by a runner, in order: `Start` precedes all `Packet`s,
/// `Exit` is last and happens exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Start { engine_addr: SocketAddr },
    Packet(EngineEvent),
    Error(String),
    Exit,
}

#[derive(Debug)]
pub enum RunnerCmd {
    SendPacket(Vec<u8>),
    Close,
}

/// Cheaply cloneable handle to a running battle.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    cmd_tx: mpsc::UnboundedSender<RunnerCmd>,
}

impl RunnerHandle {
    /// Builds a handle plus the command receiver; used by the process
    /// runner and by synthetic runners in tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunnerCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (Self { cmd_tx }, cmd_rx)
    }

    /// Queues one datagram for the engine. Fails when the runner is gone.
    pub fn send_packet(&self, data: Vec<u8>) -> Result<(), ()> {
        self.cmd_tx
            .send(RunnerCmd::SendPacket(data))
            .map_err(|_| ())
    }

    /// Requests shutdown. Idempotent; extra calls collapse.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(RunnerCmd::Close);
    }
}

/// Seam between the pool and the runner implementation, so tests can drive
/// the state machine synthetically.
pub trait RunnerFactory: Send + Sync + 'static {
    fn launch(&self, opts: RunnerOpts)
        -> (RunnerHandle, mpsc::UnboundedReceiver<RunnerEvent>);
}

/// The real factory: spawns an engine process per battle.
pub struct ProcessRunnerFactory;

impl RunnerFactory for ProcessRunnerFactory {
    fn launch(
        &self,
        opts: RunnerOpts,
    ) -> (RunnerHandle, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (handle, cmd_rx) = RunnerHandle::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_battle(opts, cmd_rx, event_tx));
        (handle, event_rx)
    }
}

/// Path of the engine binary for a given installed version.
pub fn engine_binary_path(engines_dir: &Path, version: &str) -> PathBuf {
    engines_dir.join(version).join(ENGINE_BINARY_NAME)
}

/// Creates the instance directory and renders `script.txt` and
/// `springsettings.cfg` into it. Returns the script path.
async fn prepare_instance_dir(opts: &RunnerOpts) -> Result<PathBuf, String> {
    let instance_dir = opts.instances_dir.join(&opts.battle_id);
    tokio::fs::create_dir_all(&instance_dir)
        .await
        .map_err(|e| format!("failed to create instance dir: {e}"))?;
    let script_path = instance_dir.join("script.txt");
    tokio::fs::write(&script_path, &opts.start_script)
        .await
        .map_err(|e| format!("failed to write start script: {e}"))?;
    let settings = crate::start_script::settings_file_contents(&opts.settings);
    tokio::fs::write(instance_dir.join("springsettings.cfg"), settings)
        .await
        .map_err(|e| format!("failed to write settings file: {e}"))?;
    Ok(script_path)
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No graceful signal available; the kill timer escalation handles the
    // rest immediately.
    let _ = child.start_kill();
}

async fn run_battle(
    opts: RunnerOpts,
    mut cmd_rx: mpsc::UnboundedReceiver<RunnerCmd>,
    events: mpsc::UnboundedSender<RunnerEvent>,
) {
    drive_battle(&opts, &mut cmd_rx, &events).await;
    // Both the process and the socket are gone here; give the scheduler one
    // tick before announcing the port reusable.
    tokio::task::yield_now().await;
    let _ = events.send(RunnerEvent::Exit);
    debug!("[{}] runner stopped", opts.battle_id);
}

async fn drive_battle(
    opts: &RunnerOpts,
    cmd_rx: &mut mpsc::UnboundedReceiver<RunnerCmd>,
    events: &mpsc::UnboundedSender<RunnerEvent>,
) {
    let battle_id = &opts.battle_id;

    let script_path = match prepare_instance_dir(opts).await {
        Ok(path) => path,
        Err(e) => {
            let _ = events.send(RunnerEvent::Error(e));
            return;
        }
    };
    let instance_dir = opts.instances_dir.join(battle_id);

    let socket = match UdpSocket::bind(("127.0.0.1", opts.autohost_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = events.send(RunnerEvent::Error(format!(
                "failed to bind autohost socket on port {}: {e}",
                opts.autohost_port
            )));
            return;
        }
    };

    let binary = engine_binary_path(&opts.engines_dir, &opts.engine_version);
    let mut child = match Command::new(&binary)
        .arg("-isolation")
        .arg(&script_path)
        .current_dir(&instance_dir)
        .env("SPRING_WRITEDIR", &instance_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = events.send(RunnerEvent::Error(format!(
                "failed to spawn engine {}: {e}",
                binary.display()
            )));
            return;
        }
    };
    info!(
        "[{battle_id}] spawned engine {} (pid {:?})",
        binary.display(),
        child.id()
    );

    let mut engine_addr: Option<SocketAddr> = None;
    let mut stopping = false;
    let mut kill_at: Option<Instant> = None;
    let mut cmd_open = true;
    let mut buf = [0u8; 8192];

    // A Close that raced the spawn is honored immediately.
    while let Ok(cmd) = cmd_rx.try_recv() {
        if matches!(cmd, RunnerCmd::Close) {
            stopping = true;
            terminate(&child);
            kill_at = Some(Instant::now() + KILL_TIMEOUT);
        }
    }

    let status = loop {
        let kill_timer = async move {
            match kill_at {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = child.wait() => break status,

            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("[{battle_id}] autohost socket error: {e}");
                        continue;
                    }
                };
                match engine_addr {
                    Some(addr) if src != addr => {
                        warn!("[{battle_id}] dropping datagram from unexpected source {src}");
                    }
                    Some(_) => match decode_event(&buf[..len]) {
                        Ok(event) => {
                            let _ = events.send(RunnerEvent::Packet(event));
                        }
                        Err(e) => warn!("[{battle_id}] dropping undecodable datagram: {e}"),
                    },
                    None => match decode_event(&buf[..len]) {
                        Ok(EngineEvent::ServerStarted) => {
                            engine_addr = Some(src);
                            if !stopping {
                                info!("[{battle_id}] engine ready on {src}");
                                let _ = events.send(RunnerEvent::Start { engine_addr: src });
                            }
                        }
                        Ok(other) => {
                            let _ = events.send(RunnerEvent::Error(format!(
                                "expected SERVER_STARTED as first packet, got {other:?}"
                            )));
                            // Remember the peer so later datagrams take the
                            // normal path instead of repeating this error.
                            engine_addr = Some(src);
                            if !stopping {
                                stopping = true;
                                terminate(&child);
                                kill_at = Some(Instant::now() + KILL_TIMEOUT);
                            }
                        }
                        Err(e) => warn!("[{battle_id}] dropping undecodable datagram: {e}"),
                    },
                }
            }

            cmd = cmd_rx.recv(), if cmd_open => {
                if cmd.is_none() {
                    cmd_open = false;
                }
                match cmd {
                    Some(RunnerCmd::SendPacket(data)) => match engine_addr {
                        Some(addr) if !stopping => {
                            if let Err(e) = socket.send_to(&data, addr).await {
                                warn!("[{battle_id}] failed to send packet to engine: {e}");
                            }
                        }
                        _ => warn!("[{battle_id}] dropping outbound packet: battle is not running"),
                    },
                    Some(RunnerCmd::Close) | None => {
                        if !stopping {
                            stopping = true;
                            info!("[{battle_id}] closing battle");
                            terminate(&child);
                            kill_at = Some(Instant::now() + KILL_TIMEOUT);
                        }
                    }
                }
            },

            _ = kill_timer => {
                warn!("[{battle_id}] engine did not exit within {KILL_TIMEOUT:?}, killing");
                let _ = child.start_kill();
                // One-shot: the timer must never fire at a reused pid.
                kill_at = None;
            }
        }
    };

    match status {
        Ok(status) if status.success() => {
            info!("[{battle_id}] engine exited cleanly");
        }
        Ok(status) => {
            let _ = events.send(RunnerEvent::Error(format!("engine exited with {status}")));
        }
        Err(e) => {
            let _ = events.send(RunnerEvent::Error(format!(
                "failed to wait for engine exit: {e}"
            )));
        }
    }
    // Socket drops here, closing the autohost port before Exit is emitted.
}
