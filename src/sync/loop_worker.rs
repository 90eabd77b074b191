use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    db::{helpers::required_tables, Database},
    models::SensorKind,
    network::Link,
    settings::RelaySettings,
};

use super::transport::{Ack, CollectorSession};

// Set to false to silence this module without touching RUST_LOG
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Conditions that stop the engine for good. Everything else is retried.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store is missing required tables: {}", .missing.join(", "))]
    Schema { missing: Vec<&'static str> },
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub collector_host: String,
    pub collector_port: u16,
    pub connect_timeout: Duration,
    /// `None` skips waiting for the collector's reply line.
    pub ack_timeout: Option<Duration>,
    pub idle_delay: Duration,
    pub sensor: SensorKind,
}

impl SyncConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            collector_host: settings.collector.host.clone(),
            collector_port: settings.collector.port,
            connect_timeout: settings.connect_timeout(),
            ack_timeout: settings.ack_timeout(),
            idle_delay: settings.idle_delay(),
            sensor: settings.sync.sensor,
        }
    }
}

/// How a draining pass ended, with the number of rows delivered and deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Empty,
    Drained { delivered: usize },
    /// Transport or delete failure; remaining rows stay pending.
    Aborted { delivered: usize },
    Cancelled { delivered: usize },
}

/// Moves pending readings of one sensor queue to the collector.
///
/// Each iteration first waits for the link, then drains every row that was
/// pending when the pass started over one fresh connection, deleting a row
/// only after it was written. Transport and connectivity problems are retried
/// after the idle delay; storage failures end the engine.
pub struct SyncEngine<L: Link> {
    db: Database,
    link: L,
    config: SyncConfig,
}

impl<L: Link> SyncEngine<L> {
    pub fn new(db: Database, link: L, config: SyncConfig) -> Self {
        Self { db, link, config }
    }

    /// Runs until `cancel` fires (`Ok`) or the store becomes unusable
    /// (`Err`, after closing the store).
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SyncError> {
        let result = self.run_until_stopped(&cancel).await;
        if let Err(err) = &result {
            log_error!("Sync engine for {} stopped: {err}", self.config.sensor);
            self.db.shutdown().await;
        }
        result
    }

    async fn run_until_stopped(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.prepare_store().await?;
        log_info!(
            "Sync engine started for {} queue, collector {}:{}",
            self.config.sensor,
            self.config.collector_host,
            self.config.collector_port
        );

        loop {
            if cancel.is_cancelled() || !self.ensure_link(cancel).await {
                break;
            }

            match self.drain_pass(cancel).await? {
                PassOutcome::Cancelled { delivered } => {
                    log_info!("Draining pass cancelled after {delivered} rows");
                    break;
                }
                outcome => log_debug!("Draining pass finished: {outcome:?}"),
            }

            if !self.idle(cancel).await {
                break;
            }
        }

        log_info!("Sync engine for {} cancelled", self.config.sensor);
        Ok(())
    }

    /// Creates missing tables and checks that this queue's tables exist.
    /// Failures of unrelated tables are only logged.
    async fn prepare_store(&self) -> Result<(), SyncError> {
        let report = self.db.ensure_schema().await.map_err(SyncError::Storage)?;
        if !report.is_complete() {
            log_warn!(
                "Schema incomplete, {} table(s) could not be created",
                report.failures.len()
            );
        }

        let required = required_tables(self.config.sensor).to_vec();
        let missing = self
            .db
            .missing_tables(required)
            .await
            .map_err(SyncError::Storage)?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Schema { missing })
        }
    }

    /// Blocks until the link is up. Returns false when cancelled first.
    async fn ensure_link(&self, cancel: &CancellationToken) -> bool {
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return false,
                connected = self.link.is_connected() => connected,
            };
            if connected {
                return true;
            }

            let brought_up = tokio::select! {
                _ = cancel.cancelled() => return false,
                brought_up = self.link.ensure_connection() => brought_up,
            };
            if brought_up {
                log_info!("Link enabled, waiting for association");
            } else {
                log_warn!(
                    "Link unavailable, retrying in {:?}",
                    self.config.idle_delay
                );
            }

            if !self.idle(cancel).await {
                return false;
            }
        }
    }

    /// Sleeps for the idle delay. Returns false when cancelled first.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.idle_delay) => true,
        }
    }

    /// One pass over the queue. Only storage failures while reading the
    /// queue are returned as errors.
    pub async fn drain_pass(&self, cancel: &CancellationToken) -> Result<PassOutcome, SyncError> {
        let kind = self.config.sensor;
        let pending = self
            .db
            .count_pending(kind)
            .await
            .map_err(SyncError::Storage)?;
        if pending == 0 {
            return Ok(PassOutcome::Empty);
        }
        log_info!("{pending} {kind} readings pending");

        let mut session = match CollectorSession::connect(
            &self.config.collector_host,
            self.config.collector_port,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                log_warn!("Draining pass aborted: {err}");
                return Ok(PassOutcome::Aborted { delivered: 0 });
            }
        };

        let outcome = self.deliver(&mut session, cancel).await;

        let peer = session.peer();
        if let Err(err) = session.close().await {
            log_debug!("Closing connection to {peer} failed: {err}");
        }
        if let Err(err) = self.db.release_statements().await {
            log_warn!("Could not release cached statements: {err:#}");
        }

        if let Ok(PassOutcome::Drained { delivered }) = &outcome {
            log_info!("Delivered {delivered} {kind} readings to {peer}");
        }
        outcome
    }

    async fn deliver(
        &self,
        session: &mut CollectorSession,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, SyncError> {
        let kind = self.config.sensor;
        let mut cursor = self.db.pending(kind).await.map_err(SyncError::Storage)?;
        let mut delivered = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(PassOutcome::Cancelled { delivered });
            }
            let Some(row) = cursor.next().await.map_err(SyncError::Storage)? else {
                break;
            };

            let line = row.reading.encode();
            if let Err(err) = session.send_line(&line).await {
                log_warn!("Draining pass aborted at entry {}: {err}", row.entry_id);
                return Ok(PassOutcome::Aborted { delivered });
            }

            if let Some(timeout) = self.config.ack_timeout {
                match session.await_ack(timeout).await {
                    Ok(Ack::Received(reply)) => log_debug!("Entry {} acknowledged: {reply}", row.entry_id),
                    Ok(Ack::TimedOut) => log_warn!(
                        "No acknowledgment for entry {} within {timeout:?}, deleting anyway",
                        row.entry_id
                    ),
                    // The peer is gone, so the write may never have reached it.
                    // Keep the row for the next pass.
                    Ok(Ack::Closed) => {
                        log_warn!(
                            "Collector closed the connection at entry {}, aborting pass",
                            row.entry_id
                        );
                        return Ok(PassOutcome::Aborted { delivered });
                    }
                    Err(err) => {
                        log_warn!("Draining pass aborted at entry {}: {err}", row.entry_id);
                        return Ok(PassOutcome::Aborted { delivered });
                    }
                }
            }

            if let Err(err) = self.db.delete_delivered(kind, row.entry_id).await {
                log_error!(
                    "Could not delete delivered entry {}, leaving it pending: {err:#}",
                    row.entry_id
                );
                return Ok(PassOutcome::Aborted { delivered });
            }
            delivered += 1;
        }

        Ok(PassOutcome::Drained { delivered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::Reading, network::AlwaysConnected};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    fn config(port: u16) -> SyncConfig {
        SyncConfig {
            collector_host: "127.0.0.1".into(),
            collector_port: port,
            connect_timeout: Duration::from_secs(1),
            ack_timeout: Some(Duration::from_millis(200)),
            idle_delay: Duration::from_millis(20),
            sensor: SensorKind::Lux,
        }
    }

    async fn seeded_store(rows: i64) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.ensure_schema().await.unwrap();
        for seq in 1..=rows {
            db.insert_reading(&Reading::lux("A", seq, seq as f64, 1_700_000_000))
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn empty_queue_does_not_connect() {
        let db = seeded_store(0).await;
        // Nothing listens on port 9; a connection attempt would abort the pass.
        let engine = SyncEngine::new(db, AlwaysConnected, config(9));
        let outcome = engine.drain_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PassOutcome::Empty);
    }

    #[tokio::test]
    async fn drains_with_acknowledgments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let collector = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                write_half.write_all(b"ACK\n").await.unwrap();
                received.push(line);
            }
            received
        });

        let db = seeded_store(2).await;
        let engine = SyncEngine::new(db.clone(), AlwaysConnected, config(port));
        let outcome = engine.drain_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PassOutcome::Drained { delivered: 2 });
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 0);
        assert_eq!(collector.await.unwrap(), vec!["LUX A 1 1.0", "LUX A 2 2.0"]);
    }

    #[tokio::test]
    async fn cancelled_pass_sends_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let db = seeded_store(2).await;
        let engine = SyncEngine::new(db.clone(), AlwaysConnected, config(port));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine.drain_pass(&cancel).await.unwrap();

        assert_eq!(outcome, PassOutcome::Cancelled { delivered: 0 });
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 2);
        drop(listener);
    }

    #[tokio::test]
    async fn closed_store_counts_as_empty() {
        let db = seeded_store(1).await;
        let engine = SyncEngine::new(db.clone(), AlwaysConnected, config(9));
        db.close();
        let outcome = engine.drain_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PassOutcome::Empty);
    }

    #[tokio::test]
    async fn unreadable_queue_is_fatal() {
        let db = Database::open_in_memory().unwrap();
        let engine = SyncEngine::new(db, AlwaysConnected, config(9));
        let err = engine.drain_pass(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = RelaySettings::default();
        settings.collector.await_ack = false;
        let config = SyncConfig::from_settings(&settings);
        assert_eq!(config.collector_port, 65060);
        assert_eq!(config.ack_timeout, None);
        assert_eq!(config.idle_delay, Duration::from_secs(5));
    }
}
