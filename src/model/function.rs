use crate::model::Id;
use serde::{Deserialize, Serialize};

/// A workplace function (e.g. desk zone, meeting area) inside a building.
/// Natural key: name, unique among the building's non-deleted functions.
/// Deletion is blocked while desks are still assigned to the function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionFields {
    pub organization_id: Id,
    /// Must reference a live building of the same organization.
    pub building_id: Id,
    pub name: String,
    pub capacity: Option<i32>,
}

impl FunctionFields {
    pub fn new(
        organization_id: impl Into<Id>,
        building_id: impl Into<Id>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            building_id: building_id.into(),
            name: name.into(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: i32) -> Self {
        self.capacity = Some(capacity);
        self
    }
}
