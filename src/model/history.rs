use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Id;

/// One time-bounded snapshot of an entity's tracked attributes.
///
/// For a given entity the intervals are contiguous and non-overlapping,
/// boundaries are always clock-quantized, and at most one row per live
/// entity is open (`valid_to` = the end-of-time sentinel). `valid_to` is the
/// only field ever updated after insert, to allow interval closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryInterval {
    pub id: Id,
    pub entity_id: Id,
    pub attrs: serde_json::Value,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl HistoryInterval {
    pub fn open(entity_id: Id, attrs: serde_json::Value, valid_from: DateTime<Utc>) -> Self {
        Self {
            id: crate::model::generate_id(),
            entity_id,
            attrs,
            valid_from,
            valid_to: crate::engine::clock::end_of_time(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to == crate::engine::clock::end_of_time()
    }
}
