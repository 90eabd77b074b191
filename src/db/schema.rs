use log::{error, info};
use rusqlite::{params, Connection};

struct TableDef {
    name: &'static str,
    create: &'static str,
}

/// Every table of the store, in dependency order.
const TABLES: &[TableDef] = &[
    TableDef {
        name: "user",
        create: "CREATE TABLE IF NOT EXISTS user (
                    user_id INTEGER PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL
                 )",
    },
    TableDef {
        name: "dev",
        create: "CREATE TABLE IF NOT EXISTS dev (
                    dev_id TEXT PRIMARY KEY NOT NULL,
                    user_id INTEGER REFERENCES user(user_id)
                 )",
    },
    TableDef {
        name: "entry",
        create: "CREATE TABLE IF NOT EXISTS entry (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entry_date INTEGER NOT NULL,
                    real_date INTEGER NOT NULL,
                    dev_id TEXT NOT NULL REFERENCES dev(dev_id),
                    seq INTEGER NOT NULL
                 )",
    },
    TableDef {
        name: "motion",
        create: "CREATE TABLE IF NOT EXISTS motion (
                    id INTEGER PRIMARY KEY NOT NULL REFERENCES entry(id),
                    gx REAL NOT NULL,
                    gy REAL NOT NULL,
                    gz REAL NOT NULL,
                    ax REAL NOT NULL,
                    ay REAL NOT NULL,
                    az REAL NOT NULL,
                    mx REAL NOT NULL,
                    my REAL NOT NULL,
                    mz REAL NOT NULL
                 )",
    },
    TableDef {
        name: "lux",
        create: "CREATE TABLE IF NOT EXISTS lux (
                    id INTEGER PRIMARY KEY NOT NULL REFERENCES entry(id),
                    value REAL NOT NULL
                 )",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: &'static str,
    pub error: String,
}

/// Outcome of [`ensure_schema`]. A failing table never prevents the remaining
/// tables from being created, so callers decide which failures matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub created: Vec<&'static str>,
    pub existing: Vec<&'static str>,
    pub failures: Vec<TableFailure>,
}

impl SchemaReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, table: &str) -> bool {
        self.failures.iter().any(|failure| failure.table == table)
    }
}

pub fn table_names() -> impl Iterator<Item = &'static str> {
    TABLES.iter().map(|table| table.name)
}

pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Creates every missing table. Each statement commits on its own; a failure
/// is logged, recorded and skipped.
pub fn ensure_schema(conn: &Connection) -> SchemaReport {
    let mut report = SchemaReport::default();

    for table in TABLES {
        match table_exists(conn, table.name) {
            Ok(true) => {
                report.existing.push(table.name);
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                error!("Could not inspect table {}: {err}", table.name);
                report.failures.push(TableFailure {
                    table: table.name,
                    error: err.to_string(),
                });
                continue;
            }
        }

        info!("Creating table {}", table.name);
        match conn.execute_batch(table.create) {
            Ok(()) => report.created.push(table.name),
            Err(err) => {
                error!("Could not create table {}: {err}", table.name);
                report.failures.push(TableFailure {
                    table: table.name,
                    error: err.to_string(),
                });
            }
        }
    }

    report
}

/// Names from `required` that are not present as tables.
pub fn missing_tables(
    conn: &Connection,
    required: &[&'static str],
) -> rusqlite::Result<Vec<&'static str>> {
    let mut missing = Vec::new();
    for &name in required {
        if !table_exists(conn, name)? {
            missing.push(name);
        }
    }
    Ok(missing)
}
