use serde::{Deserialize, Serialize};

use crate::model::{Id, VersionToken};

/// Update payload: the full replacement field set plus the concurrency token
/// the caller last observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest<F> {
    pub id: Id,
    pub version: VersionToken,
    pub fields: F,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: Id,
    pub version: VersionToken,
}
