//! Engine versions registry: local inventory plus on-demand install.
//!
//! The inventory is a depth-1 watch over the `engines/` directory: every
//! non-hidden subdirectory is an installed version. Installs download the
//! release archive from the CDN index, verify its MD5, extract with `7z`
//! and publish with an atomic rename, so a version either exists completely
//! or not at all. Hidden names (`.downloads`, `.tmp-install-*`) never show
//! up as versions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use log::{info, warn};
use md5::{Digest, Md5};
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use shared::lobby::DomainError;

use crate::config::{Config, ENGINES_DIR};
use crate::runner::ENGINE_BINARY_NAME;

/// Subdirectory of `engines/` holding transient downloads.
const DOWNLOADS_DIR: &str = ".downloads";

/// Registry-relevant slice of the configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub engines_dir: PathBuf,
    pub cdn_base_url: String,
    pub install_timeout: Duration,
    pub download_max_attempts: u32,
    pub download_retry_backoff_base: Duration,
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engines_dir: PathBuf::from(ENGINES_DIR),
            cdn_base_url: config.engine_cdn_base_url.clone(),
            install_timeout: config.engine_install_timeout(),
            download_max_attempts: config.engine_download_max_attempts,
            download_retry_backoff_base: config.engine_download_retry_backoff_base(),
        }
    }
}

/// Events published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// The set of installed versions, sorted; emitted once after the
    /// initial scan and on every change thereafter.
    Versions(Vec<String>),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("engine index request failed: {0}")]
    Index(reqwest::Error),
    #[error("engine index returned an invalid payload: {0}")]
    InvalidIndex(String),
    #[error("no release found for engine version {0:?}")]
    NoRelease(String),
    #[error("download failed: {0}")]
    Download(reqwest::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("archive does not contain {0}")]
    MissingBinary(String),
    #[error("{step} timed out")]
    TimedOut { step: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One release descriptor from the CDN index. Unknown fields are tolerated.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDescriptor {
    pub filename: String,
    pub md5: String,
    pub mirrors: Vec<String>,
}

enum Cmd {
    Install {
        version: String,
        reply: oneshot::Sender<Result<(), DomainError>>,
    },
    Versions {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl RegistryHandle {
    /// Installs an engine version; resolves when the install finished (or
    /// immediately when it is already installed or already in flight).
    pub async fn install(&self, version: &str) -> Result<(), DomainError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Install {
                version: version.to_string(),
                reply,
            })
            .map_err(|_| DomainError::internal("engine registry is gone"))?;
        rx.await
            .map_err(|_| DomainError::internal("engine registry dropped the request"))?
    }

    pub async fn versions(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Versions { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawns the registry: performs the initial scan, registers the directory
/// watch and starts the command loop. Failure to enumerate the engines
/// directory here is fatal to startup.
pub fn spawn(
    config: RegistryConfig,
    http: reqwest::Client,
) -> std::io::Result<(RegistryHandle, mpsc::UnboundedReceiver<RegistryEvent>)> {
    std::fs::create_dir_all(&config.engines_dir)?;
    let initial = scan_versions(&config.engines_dir)?;

    let (fs_tx, fs_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result| {
        let _ = fs_tx.send(result);
    })
    .map_err(|e| std::io::Error::other(format!("cannot watch engines directory: {e}")))?;
    watcher
        .watch(&config.engines_dir, RecursiveMode::NonRecursive)
        .map_err(|e| std::io::Error::other(format!("cannot watch engines directory: {e}")))?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(config, http, watcher, initial, cmd_rx, fs_rx, event_tx));
    Ok((RegistryHandle { cmd_tx }, event_rx))
}

async fn run(
    config: RegistryConfig,
    http: reqwest::Client,
    _watcher: notify::RecommendedWatcher,
    initial: Vec<String>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    mut fs_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
) {
    let mut known = initial;
    info!("installed engines: {known:?}");
    // The buffered initial scan: exactly one versions event once watching.
    let _ = events.send(RegistryEvent::Versions(known.clone()));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let mut in_flight: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Install { version, reply }) => {
                    let binary = crate::runner::engine_binary_path(&config.engines_dir, &version);
                    if binary.exists() {
                        info!("engine {version} is already installed");
                        let _ = reply.send(Ok(()));
                    } else if in_flight.contains(&version) {
                        info!("engine {version} install already in flight, ignoring");
                        let _ = reply.send(Ok(()));
                    } else {
                        in_flight.insert(version.clone());
                        let http = http.clone();
                        let config = config.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let result = install_version(&http, &config, &version).await;
                            match &result {
                                Ok(()) => info!("engine {version} installed"),
                                Err(e) => warn!("engine {version} install failed: {e}"),
                            }
                            let _ = reply.send(
                                result.map_err(|e| DomainError::internal(e.to_string())),
                            );
                            let _ = done_tx.send(version);
                        });
                    }
                }
                Some(Cmd::Versions { reply }) => {
                    let _ = reply.send(known.clone());
                }
                None => return,
            },
            finished = done_rx.recv() => {
                if let Some(version) = finished {
                    in_flight.remove(&version);
                }
            }
            event = fs_rx.recv() => {
                if event.is_none() {
                    return;
                }
                // Collapse bursts of filesystem events into one rescan.
                while fs_rx.try_recv().is_ok() {}
                match scan_versions(&config.engines_dir) {
                    Ok(versions) => {
                        if versions != known {
                            known = versions;
                            info!("installed engines changed: {known:?}");
                            let _ = events.send(RegistryEvent::Versions(known.clone()));
                        }
                    }
                    Err(e) => warn!("failed to rescan engines directory: {e}"),
                }
            }
        }
    }
}

/// Lists installed versions: non-hidden depth-1 subdirectories, sorted.
pub fn scan_versions(engines_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(engines_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') {
            continue;
        }
        versions.push(name);
    }
    versions.sort();
    Ok(versions)
}

/// Platform category used by the CDN index.
pub fn platform_category() -> &'static str {
    if cfg!(windows) {
        "engine_windows64"
    } else {
        "engine_linux64"
    }
}

fn validate_release(release: &ReleaseDescriptor) -> Result<(), InstallError> {
    if release.mirrors.is_empty() {
        return Err(InstallError::InvalidIndex(
            "release has no mirrors".to_string(),
        ));
    }
    if release.filename.is_empty()
        || release.filename.contains('/')
        || release.filename.contains('\\')
        || release.filename.starts_with('.')
    {
        return Err(InstallError::InvalidIndex(format!(
            "release filename {:?} is not usable",
            release.filename
        )));
    }
    Ok(())
}

async fn fetch_release(
    http: &reqwest::Client,
    config: &RegistryConfig,
    version: &str,
) -> Result<ReleaseDescriptor, InstallError> {
    let url = format!("{}/find", config.cdn_base_url.trim_end_matches('/'));
    let response = http
        .get(url)
        .query(&[("category", platform_category()), ("springname", version)])
        .send()
        .await
        .map_err(InstallError::Index)?
        .error_for_status()
        .map_err(InstallError::Index)?;
    let releases: Vec<ReleaseDescriptor> = response
        .json()
        .await
        .map_err(|e| InstallError::InvalidIndex(e.to_string()))?;
    let release = releases
        .into_iter()
        .next()
        .ok_or_else(|| InstallError::NoRelease(version.to_string()))?;
    validate_release(&release)?;
    Ok(release)
}

/// Streams a mirror download to disk, returning the archive's MD5 hex.
async fn download_to(
    http: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<String, InstallError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(InstallError::Download)?
        .error_for_status()
        .map_err(InstallError::Download)?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Md5::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(InstallError::Download)?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}

async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    tokio::fs::create_dir_all(dest).await?;
    let output = tokio::process::Command::new("7z")
        .arg("x")
        .arg("-y")
        .arg(format!("-o{}", dest.display()))
        .arg(archive)
        .output()
        .await
        .map_err(|e| InstallError::Extraction(format!("failed to run 7z: {e}")))?;
    if !output.status.success() {
        return Err(InstallError::Extraction(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

async fn install_version(
    http: &reqwest::Client,
    config: &RegistryConfig,
    version: &str,
) -> Result<(), InstallError> {
    let deadline = Instant::now() + config.install_timeout;

    let release = timeout_at(deadline, fetch_release(http, config, version))
        .await
        .map_err(|_| InstallError::TimedOut {
            step: "engine index lookup",
        })??;
    let mirror = &release.mirrors[0];

    let downloads_dir = config.engines_dir.join(DOWNLOADS_DIR);
    tokio::fs::create_dir_all(&downloads_dir).await?;
    let archive = downloads_dir.join(&release.filename);
    let tmp_dir = config
        .engines_dir
        .join(format!(".tmp-install-{version}-{}", Uuid::new_v4()));

    let outcome = install_steps(http, config, version, &release, mirror, &archive, &tmp_dir, deadline).await;

    // Transient artifacts are removed in all outcomes; after a successful
    // publish the temp dir is already gone and this is a no-op.
    let _ = tokio::fs::remove_file(&archive).await;
    let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn install_steps(
    http: &reqwest::Client,
    config: &RegistryConfig,
    version: &str,
    release: &ReleaseDescriptor,
    mirror: &str,
    archive: &Path,
    tmp_dir: &Path,
    deadline: Instant,
) -> Result<(), InstallError> {
    let mut last_error = None;
    let mut verified = false;
    for attempt in 1..=config.download_max_attempts {
        if attempt > 1 {
            let backoff = config.download_retry_backoff_base * 2u32.pow(attempt - 2);
            info!("retrying engine {version} download in {backoff:?} (attempt {attempt})");
            tokio::time::sleep(backoff).await;
        }
        match timeout_at(deadline, download_to(http, mirror, archive)).await {
            Err(_) => {
                return Err(InstallError::TimedOut { step: "download" });
            }
            Ok(Err(e)) => {
                warn!("engine {version} download attempt {attempt} failed: {e}");
                last_error = Some(e);
            }
            Ok(Ok(digest)) => {
                if digest.eq_ignore_ascii_case(&release.md5) {
                    verified = true;
                    break;
                }
                warn!(
                    "engine {version} archive checksum mismatch on attempt {attempt}: \
                     expected {}, got {digest}",
                    release.md5
                );
                last_error = Some(InstallError::ChecksumMismatch {
                    expected: release.md5.clone(),
                    actual: digest,
                });
            }
        }
    }
    if !verified {
        return Err(last_error.unwrap_or(InstallError::TimedOut { step: "download" }));
    }

    timeout_at(deadline, extract_archive(archive, tmp_dir))
        .await
        .map_err(|_| InstallError::TimedOut { step: "extraction" })??;

    let extracted_binary = tmp_dir.join(ENGINE_BINARY_NAME);
    if !extracted_binary.exists() {
        return Err(InstallError::MissingBinary(ENGINE_BINARY_NAME.to_string()));
    }

    let target = config.engines_dir.join(version);
    match tokio::fs::remove_dir_all(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(tmp_dir, &target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_config(dir: &Path) -> RegistryConfig {
        RegistryConfig {
            engines_dir: dir.to_path_buf(),
            cdn_base_url: "http://127.0.0.1:9".to_string(),
            install_timeout: Duration::from_millis(500),
            download_max_attempts: 2,
            download_retry_backoff_base: Duration::from_millis(10),
        }
    }

    #[test]
    fn scan_skips_hidden_names_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("105.1.1-2127 bar")).unwrap();
        std::fs::create_dir(dir.path().join("2025.01.5")).unwrap();
        std::fs::create_dir(dir.path().join(DOWNLOADS_DIR)).unwrap();
        std::fs::create_dir(dir.path().join(".tmp-install-x-123")).unwrap();
        std::fs::write(dir.path().join("README"), "not a version").unwrap();

        let versions = scan_versions(dir.path()).unwrap();
        assert_eq!(versions, vec!["105.1.1-2127 bar", "2025.01.5"]);
    }

    #[test]
    fn release_descriptor_tolerates_extra_fields() {
        let raw = r#"[{
            "filename": "engine.7z",
            "md5": "abc",
            "mirrors": ["https://mirror/engine.7z"],
            "category": "engine_linux64",
            "size": 12345
        }]"#;
        let releases: Vec<ReleaseDescriptor> = serde_json::from_str(raw).unwrap();
        assert_eq!(releases[0].filename, "engine.7z");
        assert_eq!(releases[0].mirrors.len(), 1);
    }

    #[test]
    fn release_validation_rejects_bad_descriptors() {
        let release = |filename: &str, mirrors: Vec<&str>| ReleaseDescriptor {
            filename: filename.to_string(),
            md5: "abc".to_string(),
            mirrors: mirrors.into_iter().map(String::from).collect(),
        };
        assert!(validate_release(&release("ok.7z", vec!["m"])).is_ok());
        assert!(validate_release(&release("ok.7z", vec![])).is_err());
        assert!(validate_release(&release("../up.7z", vec!["m"])).is_err());
        assert!(validate_release(&release(".hidden", vec!["m"])).is_err());
        assert!(validate_release(&release("", vec!["m"])).is_err());
    }

    #[tokio::test]
    async fn initial_scan_is_emitted_once_watching() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("105.1.1")).unwrap();
        let (_handle, mut events) =
            spawn(registry_config(dir.path()), reqwest::Client::new()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, RegistryEvent::Versions(vec!["105.1.1".to_string()]));
    }

    #[tokio::test]
    async fn directory_changes_emit_new_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (_handle, mut events) =
            spawn(registry_config(dir.path()), reqwest::Client::new()).unwrap();
        // Initial (empty) scan.
        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, RegistryEvent::Versions(vec![]));

        std::fs::create_dir(dir.path().join("new-version")).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("watcher should report the new directory")
            .unwrap();
        assert_eq!(
            second,
            RegistryEvent::Versions(vec!["new-version".to_string()])
        );
    }

    #[tokio::test]
    async fn hidden_directories_do_not_emit_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (_handle, mut events) =
            spawn(registry_config(dir.path()), reqwest::Client::new()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();

        std::fs::create_dir(dir.path().join(".tmp-install-v-1")).unwrap();
        // No event should arrive for a hidden directory.
        let outcome = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
        assert!(outcome.is_err(), "hidden directory must not change the set");
    }

    #[tokio::test]
    async fn installing_an_installed_version_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("105.1.1");
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join(ENGINE_BINARY_NAME), "bin").unwrap();

        // The CDN base points nowhere; a short-circuit must not touch it.
        let (handle, _events) =
            spawn(registry_config(dir.path()), reqwest::Client::new()).unwrap();
        handle.install("105.1.1").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_install_of_same_version_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        // A listener that never answers keeps the first install in flight
        // until its deadline.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = registry_config(dir.path());
        config.cdn_base_url = format!("http://{}", listener.local_addr().unwrap());

        let (handle, _events) = spawn(config, reqwest::Client::new()).unwrap();
        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.install("v1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second request is a no-op that resolves immediately.
        tokio::time::timeout(Duration::from_millis(100), handle.install("v1"))
            .await
            .expect("duplicate install must not wait for the first")
            .unwrap();

        // The original request eventually fails against the dead endpoint.
        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.reason, "internal_error");
    }
}
