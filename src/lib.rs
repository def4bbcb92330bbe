pub mod analytics;
pub mod commands;
pub mod lot;
pub mod models;
pub mod notifier;
pub mod reconcile;
pub mod settings;
pub mod store;
mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::{execute, Command, HELP};
use reconcile::LotController;
use settings::{default_config_path, LotSettings, SettingsStore, StoreBackend};
use store::{MemoryStore, RemoteStore, SqliteStore};

pub fn open_store(backend: &StoreBackend) -> Result<Arc<dyn RemoteStore>> {
    match backend {
        StoreBackend::Memory => {
            let store: Arc<dyn RemoteStore> = MemoryStore::new();
            Ok(store)
        }
        StoreBackend::Sqlite { path } => {
            let store: Arc<dyn RemoteStore> = SqliteStore::open(path.clone())
                .with_context(|| format!("failed to open store at {}", path.display()))?;
            Ok(store)
        }
    }
}

pub fn run() -> Result<()> {
    // RUST_LOG wins; otherwise info.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("ParkGenius starting up...");

    let settings_store = SettingsStore::new(default_config_path())?;
    info!("Settings loaded from {}", settings_store.path().display());
    let settings = settings_store.lot();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve(settings))
}

async fn serve(settings: LotSettings) -> Result<()> {
    let store = open_store(&settings.store)?;
    let controller = LotController::new(store, settings);
    controller.start().await;

    let result = command_loop(&controller).await;

    // Subscriptions and the tick are released on every path out of the loop.
    controller.shutdown().await;
    result
}

async fn command_loop(controller: &LotController) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == Command::Quit {
            return Ok(());
        }

        match execute(controller, command).await {
            Ok(output) => println!("{output}"),
            Err(err) => {
                error!("{command:?} failed: {err:#}");
                println!("Could not reach the parking service, try again.");
            }
        }
    }
}
