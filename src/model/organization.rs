use crate::model::Id;
use serde::{Deserialize, Serialize};

/// Mutable attributes of an organization, the top-level tenant entity.
/// The name is the natural key, unique globally among non-deleted rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationFields {
    pub name: String,
    pub description: Option<String>,
    /// Email domains owned by this organization, mirrored as child rows.
    #[serde(default)]
    pub email_domains: Vec<String>,
    pub logo_image_id: Option<Id>,
    pub feature_image_id: Option<Id>,
}

impl OrganizationFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            email_domains: Vec::new(),
            logo_image_id: None,
            feature_image_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.email_domains = domains;
        self
    }

    pub fn with_logo(mut self, image_id: impl Into<Id>) -> Self {
        self.logo_image_id = Some(image_id.into());
        self
    }

    pub fn with_feature_image(mut self, image_id: impl Into<Id>) -> Self {
        self.feature_image_id = Some(image_id.into());
        self
    }
}
