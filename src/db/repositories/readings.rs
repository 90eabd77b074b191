use anyhow::{Context, Result};
use log::{debug, warn};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::db::{
    helpers::{now_secs, to_usize},
    is_closed,
    models::PendingReading,
    Database,
};
use crate::{
    models::{Payload, Reading, SensorKind},
    protocol,
};

/// Statements for one sensor queue. Every pending row is a sensor row joined
/// with its `entry` row on `id`.
struct QueueSql {
    insert: &'static str,
    count: &'static str,
    max_id: &'static str,
    next: &'static str,
    delete: &'static str,
}

const LUX_SQL: QueueSql = QueueSql {
    insert: "INSERT INTO lux (id, value) VALUES (?1, ?2)",
    count: "SELECT COUNT(*) FROM lux INNER JOIN entry ON lux.id = entry.id",
    max_id: "SELECT COALESCE(MAX(lux.id), 0) FROM lux",
    next: "SELECT entry.id, entry.dev_id, entry.seq, entry.real_date, lux.value
           FROM lux INNER JOIN entry ON lux.id = entry.id
           WHERE entry.id > ?1 AND entry.id <= ?2
           ORDER BY entry.id ASC
           LIMIT 1",
    delete: "DELETE FROM lux WHERE id = ?1",
};

fn queue_sql(kind: SensorKind) -> &'static QueueSql {
    match kind {
        SensorKind::Lux => &LUX_SQL,
    }
}

fn row_to_pending(kind: SensorKind, row: &Row) -> rusqlite::Result<PendingReading> {
    let entry_id: i64 = row.get(0)?;
    let device_id: String = row.get(1)?;
    let sequence: i64 = row.get(2)?;
    let timestamp: i64 = row.get(3)?;
    let payload = match kind {
        SensorKind::Lux => Payload::Lux(row.get(4)?),
    };

    Ok(PendingReading {
        entry_id,
        reading: Reading {
            device_id,
            sequence,
            timestamp,
            payload,
        },
    })
}

fn insert_rows(tx: &Transaction<'_>, reading: &Reading, entry_date: i64) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO dev (dev_id) VALUES (?1)",
        params![reading.device_id],
    )
    .context("failed to register device")?;

    tx.execute(
        "INSERT INTO entry (entry_date, real_date, dev_id, seq) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry_date,
            reading.timestamp,
            reading.device_id,
            reading.sequence
        ],
    )
    .context("failed to insert entry row")?;
    let entry_id = tx.last_insert_rowid();

    let sql = queue_sql(reading.kind());
    let inserted = match reading.payload {
        Payload::Lux(value) => tx.execute(sql.insert, params![entry_id, value]),
    };
    inserted.with_context(|| format!("failed to insert {} row", reading.kind()))?;

    Ok(entry_id)
}

impl Database {
    /// Queues a reading. The device, entry and sensor rows commit together or
    /// not at all. Returns the new `entry.id`. A device id that cannot travel
    /// as one wire field is refused before anything is written.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<i64> {
        protocol::check_device_id(&reading.device_id)
            .context("refusing to queue reading")?;

        let record = reading.clone();
        let result = self
            .execute(move |conn| {
                let tx = conn
                    .transaction()
                    .context("failed to open insert transaction")?;
                let entry_id = insert_rows(&tx, &record, now_secs())?;
                tx.commit().context("failed to commit reading")?;
                Ok(entry_id)
            })
            .await;

        if let Err(err) = &result {
            warn!("Insert rolled back for device {}: {err:#}", reading.device_id);
        }
        result
    }

    /// Number of undelivered readings in the `kind` queue. A closed store
    /// reports an empty queue.
    pub async fn count_pending(&self, kind: SensorKind) -> Result<usize> {
        let result = self
            .execute(move |conn| {
                let count: i64 = conn
                    .prepare_cached(queue_sql(kind).count)?
                    .query_row([], |row| row.get(0))
                    .with_context(|| format!("failed to count pending {kind} rows"))?;
                to_usize(count, "pending count")
            })
            .await;

        match result {
            Err(err) if is_closed(&err) => {
                debug!("Store closed while counting {kind} queue; treating as empty");
                Ok(0)
            }
            other => other,
        }
    }

    /// Opens a forward-only cursor over the rows pending right now. Rows
    /// queued after this call are left for the next cursor.
    pub async fn pending(&self, kind: SensorKind) -> Result<PendingCursor> {
        let upto_id = self
            .execute(move |conn| {
                let max_id: i64 = conn
                    .prepare_cached(queue_sql(kind).max_id)?
                    .query_row([], |row| row.get(0))
                    .with_context(|| format!("failed to read newest {kind} row"))?;
                Ok(max_id)
            })
            .await?;

        Ok(PendingCursor {
            db: self.clone(),
            kind,
            last_id: 0,
            upto_id,
        })
    }

    /// The oldest pending row with `after_id < entry.id <= upto_id`.
    pub async fn next_pending(
        &self,
        kind: SensorKind,
        after_id: i64,
        upto_id: i64,
    ) -> Result<Option<PendingReading>> {
        self.execute(move |conn| {
            let pending = conn
                .prepare_cached(queue_sql(kind).next)?
                .query_row(params![after_id, upto_id], |row| row_to_pending(kind, row))
                .optional()
                .with_context(|| format!("failed to fetch pending {kind} row"))?;
            Ok(pending)
        })
        .await
    }

    /// Removes a delivered reading: the sensor row and its entry row go in one
    /// transaction. Returns false when nothing was left to delete.
    pub async fn delete_delivered(&self, kind: SensorKind, entry_id: i64) -> Result<bool> {
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open delete transaction")?;
            let sensor_rows = tx
                .prepare_cached(queue_sql(kind).delete)?
                .execute(params![entry_id])
                .with_context(|| format!("failed to delete {kind} row {entry_id}"))?;
            let entry_rows = tx
                .prepare_cached("DELETE FROM entry WHERE id = ?1")?
                .execute(params![entry_id])
                .with_context(|| format!("failed to delete entry row {entry_id}"))?;
            tx.commit().context("failed to commit delete")?;
            Ok(sensor_rows + entry_rows > 0)
        })
        .await
    }
}

/// Lazy, finite walk over one queue in insertion order. Holds at most one row.
pub struct PendingCursor {
    db: Database,
    kind: SensorKind,
    last_id: i64,
    upto_id: i64,
}

impl PendingCursor {
    pub async fn next(&mut self) -> Result<Option<PendingReading>> {
        if self.last_id >= self.upto_id {
            return Ok(None);
        }

        let next = self
            .db
            .next_pending(self.kind, self.last_id, self.upto_id)
            .await?;
        self.last_id = match &next {
            Some(pending) => pending.entry_id,
            None => self.upto_id,
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecError;

    async fn store() -> Database {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_schema().await.unwrap().is_complete());
        db
    }

    async fn row_count(db: &Database, table: &'static str) -> i64 {
        db.execute(move |conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        })
        .await
        .unwrap()
    }

    async fn drain_all(cursor: &mut PendingCursor) -> Vec<PendingReading> {
        let mut rows = Vec::new();
        while let Some(row) = cursor.next().await.unwrap() {
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn pending_rows_come_back_in_insertion_order() {
        let db = store().await;
        let readings = [
            Reading::lux("A", 1, 10.5, 1_700_000_001),
            Reading::lux("B", 7, 0.25, 1_700_000_002),
            Reading::lux("A", 2, 11.0, 1_700_000_003),
        ];
        for reading in &readings {
            db.insert_reading(reading).await.unwrap();
        }

        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 3);

        let mut cursor = db.pending(SensorKind::Lux).await.unwrap();
        let rows = drain_all(&mut cursor).await;
        let fetched: Vec<Reading> = rows.iter().map(|row| row.reading.clone()).collect();
        assert_eq!(fetched, readings.to_vec());
        assert!(rows.windows(2).all(|pair| pair[0].entry_id < pair[1].entry_id));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_stops_at_snapshot() {
        let db = store().await;
        db.insert_reading(&Reading::lux("A", 1, 1.0, 0)).await.unwrap();
        db.insert_reading(&Reading::lux("A", 2, 2.0, 0)).await.unwrap();

        let mut cursor = db.pending(SensorKind::Lux).await.unwrap();
        db.insert_reading(&Reading::lux("A", 3, 3.0, 0)).await.unwrap();

        let rows = drain_all(&mut cursor).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_queue_has_no_rows() {
        let db = store().await;
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 0);
        let mut cursor = db.pending(SensorKind::Lux).await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn device_id_that_breaks_framing_is_refused() {
        let db = store().await;
        for device_id in ["A\nLUX EVIL 9", "A B", ""] {
            let err = db
                .insert_reading(&Reading::lux(device_id, 1, 10.5, 0))
                .await
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CodecError>(),
                Some(CodecError::InvalidDeviceId { .. })
            ));
        }

        assert_eq!(row_count(&db, "entry").await, 0);
        assert_eq!(row_count(&db, "dev").await, 0);
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_sensor_and_entry_rows() {
        let db = store().await;
        let first = db.insert_reading(&Reading::lux("A", 1, 1.0, 0)).await.unwrap();
        db.insert_reading(&Reading::lux("A", 2, 2.0, 0)).await.unwrap();

        assert!(db.delete_delivered(SensorKind::Lux, first).await.unwrap());
        assert_eq!(row_count(&db, "lux").await, 1);
        assert_eq!(row_count(&db, "entry").await, 1);

        // Already delivered ids are not an error.
        assert!(!db.delete_delivered(SensorKind::Lux, first).await.unwrap());
    }

    #[tokio::test]
    async fn failed_sensor_insert_leaves_no_entry_row() {
        let db = store().await;
        db.insert_reading(&Reading::lux("A", 1, 1.0, 0)).await.unwrap();
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_lux BEFORE INSERT ON lux
                 BEGIN SELECT RAISE(ABORT, 'forced failure'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let entries_before = row_count(&db, "entry").await;
        assert!(db.insert_reading(&Reading::lux("Z", 2, 2.0, 0)).await.is_err());
        assert_eq!(row_count(&db, "entry").await, entries_before);
        assert_eq!(row_count(&db, "dev").await, 1);
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_entry_delete_keeps_sensor_row() {
        let db = store().await;
        let id = db.insert_reading(&Reading::lux("A", 1, 1.0, 0)).await.unwrap();
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER keep_entry BEFORE DELETE ON entry
                 BEGIN SELECT RAISE(ABORT, 'forced failure'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        assert!(db.delete_delivered(SensorKind::Lux, id).await.is_err());
        assert_eq!(row_count(&db, "lux").await, 1);
        assert_eq!(row_count(&db, "entry").await, 1);
        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_store_counts_as_empty() {
        let db = store().await;
        db.insert_reading(&Reading::lux("A", 1, 1.0, 0)).await.unwrap();
        db.close();

        assert_eq!(db.count_pending(SensorKind::Lux).await.unwrap(), 0);
        assert!(db.pending(SensorKind::Lux).await.is_err());
    }

    #[tokio::test]
    async fn count_fails_without_schema() {
        let db = Database::open_in_memory().unwrap();
        let err = db.count_pending(SensorKind::Lux).await.unwrap_err();
        assert!(!is_closed(&err));
    }
}
