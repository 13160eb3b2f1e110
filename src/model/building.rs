use crate::model::Id;
use serde::{Deserialize, Serialize};

/// A building of an organization, optionally assigned to a region.
/// Natural key: name, unique among the organization's non-deleted buildings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingFields {
    pub organization_id: Id,
    pub name: String,
    /// Must reference a live region of the same organization when set.
    pub region_id: Option<Id>,
    pub address: Option<String>,
    /// IANA timezone name; a derived lookup cache keyed by building id is
    /// invalidated whenever the building mutates.
    pub timezone: Option<String>,
    pub map_image_id: Option<Id>,
}

impl BuildingFields {
    pub fn new(organization_id: impl Into<Id>, name: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            region_id: None,
            address: None,
            timezone: None,
            map_image_id: None,
        }
    }

    pub fn in_region(mut self, region_id: impl Into<Id>) -> Self {
        self.region_id = Some(region_id.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_map_image(mut self, image_id: impl Into<Id>) -> Self {
        self.map_image_id = Some(image_id.into());
        self
    }
}
