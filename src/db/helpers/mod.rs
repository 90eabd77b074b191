use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::models::SensorKind;

/// Current wall-clock time in whole seconds, used for `entry.entry_date`.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("{field} contains invalid count {value}"))
}

/// Tables that must exist before a queue for `kind` can be drained.
pub fn required_tables(kind: SensorKind) -> [&'static str; 4] {
    ["user", "dev", "entry", kind.as_str()]
}
