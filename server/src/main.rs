use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::sync::mpsc;

use server::adapter::{Adapter, AdapterConfig};
use server::config::Config;
use server::engines::{self, RegistryConfig};
use server::games::{self, GamesConfig};
use server::runner::ProcessRunnerFactory;
use server::supervisor;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info autohost");
    }

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "starting autohost controller for lobby {} ({} battle slots)",
        config.tachyon_server, config.max_battles
    );

    // Shared HTTP client: OAuth, the CDN index and downloads. Connects are
    // bounded; whole-request deadlines belong to the individual callers
    // (engine downloads legitimately run for minutes).
    let http = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(http) => http,
        Err(e) => {
            eprintln!("fatal: cannot build http client: {e}");
            std::process::exit(1);
        }
    };

    let (registry, registry_events) =
        match engines::spawn(RegistryConfig::from_config(&config), http.clone()) {
            Ok(registry) => registry,
            Err(e) => {
                eprintln!("fatal: cannot initialize engine registry: {e}");
                std::process::exit(1);
            }
        };

    let (games, game_events) = games::spawn(
        GamesConfig::from_config(&config),
        Arc::new(ProcessRunnerFactory),
    );

    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let adapter = Adapter::new(
        AdapterConfig::from_config(&config),
        games.clone(),
        registry,
        pending_tx,
    );

    let code = supervisor::run(
        config,
        adapter,
        games,
        game_events,
        registry_events,
        pending_rx,
        http,
    )
    .await;
    std::process::exit(code);
}
