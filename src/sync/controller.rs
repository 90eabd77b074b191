use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::network::Link;

use super::loop_worker::{SyncEngine, SyncError};

/// Owns the task running a [`SyncEngine`] and its cancellation token.
#[derive(Default)]
pub struct SyncController {
    handle: Option<JoinHandle<Result<(), SyncError>>>,
    cancel_token: Option<CancellationToken>,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<L: Link + 'static>(&mut self, engine: SyncEngine<L>) -> Result<()> {
        if self.handle.is_some() {
            bail!("sync engine already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for the engine to exit on its own. An engine that stops with a
    /// fatal error surfaces here as an error. Safe to cancel and call again.
    pub async fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.handle = None;
        self.cancel_token = None;

        joined.context("sync engine task failed to join")??;
        Ok(())
    }

    /// Cancels the engine and waits for it to unwind.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            info!("Stopping sync engine");
            token.cancel();
        }
        self.join().await
    }
}
