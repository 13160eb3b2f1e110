use serde::{Deserialize, Serialize};

use crate::model::{Dependent, Entity};

/// Caller-facing result taxonomy. Expected business outcomes are values of
/// this enum, never errors; only storage-layer faults propagate as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOutcome {
    Ok,
    RecordAlreadyExists,
    RecordDidNotExist,
    SubRecordAlreadyExists,
    SubRecordDidNotExist,
    SubRecordInvalid,
    ConcurrencyKeyInvalid,
    RecordIsInUse,
    /// Transient coordination failure (lock contention). Retryable; never
    /// silently treated as success or as a deterministic business outcome.
    Unknown,
}

impl MutationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, MutationOutcome::Ok)
    }
}

/// Outcome plus the resulting entity snapshot (on success) and, for
/// `RecordIsInUse`, the blocking dependents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResult<F> {
    pub outcome: MutationOutcome,
    pub entity: Option<Entity<F>>,
    pub in_use: Option<Vec<Dependent>>,
}

impl<F> MutationResult<F> {
    pub fn ok(entity: Entity<F>) -> Self {
        Self {
            outcome: MutationOutcome::Ok,
            entity: Some(entity),
            in_use: None,
        }
    }

    pub fn aborted(outcome: MutationOutcome) -> Self {
        Self {
            outcome,
            entity: None,
            in_use: None,
        }
    }

    pub fn blocked(dependents: Vec<Dependent>) -> Self {
        Self {
            outcome: MutationOutcome::RecordIsInUse,
            entity: None,
            in_use: Some(dependents),
        }
    }
}
