use serde::{Deserialize, Serialize};

use crate::models::Reading;

/// A queued reading together with the `entry.id` that identifies its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReading {
    pub entry_id: i64,
    pub reading: Reading,
}
