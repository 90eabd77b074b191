use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{error, info};
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod helpers;
pub mod models;
mod repositories;
pub mod schema;

pub use models::PendingReading;
pub use repositories::PendingCursor;
pub use schema::{SchemaReport, TableFailure};

const IN_MEMORY: &str = ":memory:";

/// The store worker has shut down; no further statements can run.
#[derive(Debug, Error)]
#[error("store is closed")]
pub struct StoreClosed;

/// True when `err` was caused by a closed store rather than a failed statement.
pub fn is_closed(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<StoreClosed>())
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseInner {
    fn shutdown(&self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the durable store. The SQLite connection lives on a dedicated
/// thread for the lifetime of the handle; clones share that connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn open(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("relay-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(err).context("failed to open SQLite database")
                        ));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                let init_result = conn
                    .pragma_update(None, "foreign_keys", "ON")
                    .context("failed to enable foreign keys")
                    .and_then(|_| {
                        conn.busy_timeout(busy_timeout)
                            .context("failed to set busy timeout")
                    });
                let init_failed = init_result.is_err();
                if ready_tx.send(init_result).is_err() || init_failed {
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Store opened at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    /// Private in-memory store, mostly useful for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(IN_MEMORY, Duration::from_secs(5))
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Runs `task` on the store thread and awaits its result. Fails with
    /// [`StoreClosed`] once the store has been closed.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| anyhow::Error::new(StoreClosed))?;

        reply_rx
            .await
            .map_err(|_| anyhow::Error::new(StoreClosed))?
    }

    /// Stops the store thread for every clone of this handle. Statements
    /// already queued finish first.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// [`close`](Self::close) for async callers: the worker join runs on the
    /// blocking pool instead of a runtime thread.
    pub async fn shutdown(&self) {
        let db = self.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || db.close()).await {
            error!("Store shutdown task failed: {err}");
        }
    }

    /// Creates missing tables, isolating per-table failures.
    pub async fn ensure_schema(&self) -> Result<SchemaReport> {
        self.execute(|conn| Ok(schema::ensure_schema(conn))).await
    }

    pub async fn missing_tables(&self, required: Vec<&'static str>) -> Result<Vec<&'static str>> {
        self.execute(move |conn| {
            schema::missing_tables(conn, &required).context("failed to verify store structure")
        })
        .await
    }

    /// Drops every cached prepared statement.
    pub async fn release_statements(&self) -> Result<()> {
        self.execute(|conn| {
            conn.flush_prepared_statement_cache();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_store_rejects_work() {
        let db = Database::open_in_memory().unwrap();
        db.execute(|conn| Ok(conn.execute_batch("CREATE TABLE t (x INTEGER)")?))
            .await
            .unwrap();

        db.close();
        let err = db.execute(|_| Ok(())).await.unwrap_err();
        assert!(is_closed(&err));
    }

    #[tokio::test]
    async fn shutdown_closes_every_clone() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();

        db.shutdown().await;
        assert!(is_closed(&other.execute(|_| Ok(())).await.unwrap_err()));
        // A second shutdown finds nothing left to join.
        other.shutdown().await;
    }

    #[tokio::test]
    async fn clones_share_one_connection() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();
        db.execute(|conn| Ok(conn.execute_batch("CREATE TABLE t (x INTEGER)")?))
            .await
            .unwrap();

        let exists = other
            .execute(|conn| Ok(schema::table_exists(conn, "t")?))
            .await
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(db.path(), path.as_path());
        assert!(path.exists());
    }
}
