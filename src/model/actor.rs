use crate::model::Id;
use serde::{Deserialize, Serialize};

/// Who performed a mutation. All fields are optional so system-initiated
/// actions (migrations, cascades) can be recorded without a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<Id>,
    pub display_name: Option<String>,
    pub address: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<Id>, display_name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            display_name: Some(display_name.into()),
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}
