//! Store-and-forward relay for sensor telemetry on an intermittently
//! connected edge device.
//!
//! Readings are queued durably in SQLite ([`db`]), the wireless uplink is
//! brought up on demand ([`network`]) and the [`sync`] engine drains the
//! queue to the collector, deleting each row only after it was sent.

pub mod db;
pub mod models;
pub mod network;
pub mod protocol;
pub mod settings;
pub mod sync;
mod utils;

use std::path::PathBuf;

use anyhow::Result;
use log::{info, warn};

use db::Database;
use network::{AlwaysConnected, ConnectivityManager, Link, WpaCli};
use settings::RelaySettings;
use sync::{SyncConfig, SyncController, SyncEngine};

/// Runs the relay until Ctrl-C or a fatal engine error.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let settings = RelaySettings::load(config_path.as_deref())?;
    let database = Database::open(&settings.store.path, settings.busy_timeout())?;

    let result = match &settings.wifi {
        Some(wifi) => {
            let tool = WpaCli::with_programs(
                wifi.wpa_cli.clone(),
                wifi.iwgetid.clone(),
                wifi.tool_timeout(),
            );
            let link = ConnectivityManager::new(
                tool,
                wifi.adapter.clone(),
                wifi.ssid.clone(),
                wifi.psk.clone(),
            )?;
            info!("Managing link {} on {}", wifi.ssid, wifi.adapter);
            relay(database.clone(), link, &settings).await
        }
        None => {
            info!("No wifi section configured, treating the link as always up");
            relay(database.clone(), AlwaysConnected, &settings).await
        }
    };

    database.shutdown().await;
    result
}

async fn relay<L: Link + 'static>(db: Database, link: L, settings: &RelaySettings) -> Result<()> {
    let engine = SyncEngine::new(db, link, SyncConfig::from_settings(settings));
    let mut controller = SyncController::new();
    controller.start(engine)?;

    let interrupted = tokio::select! {
        result = controller.join() => return result,
        signal = tokio::signal::ctrl_c() => signal,
    };

    match interrupted {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            controller.stop().await
        }
        Err(err) => {
            warn!("Could not listen for Ctrl-C, running until the engine stops: {err}");
            controller.join().await
        }
    }
}
