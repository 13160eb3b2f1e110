use crate::model::Id;
use serde::{Deserialize, Serialize};

/// A geographic region of an organization. Natural key: name, unique among
/// the organization's non-deleted regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFields {
    pub organization_id: Id,
    pub name: String,
    pub description: Option<String>,
}

impl RegionFields {
    pub fn new(organization_id: impl Into<Id>, name: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
