use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// The entity kinds the engine manages. Every kind maps to one entity table,
/// one audit table, and (except domains) one history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Organization,
    Region,
    Building,
    Function,
    Domain,
}

impl EntityKind {
    /// Human-readable label used in audit descriptions and cascade linkage.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Organization => "Organization",
            EntityKind::Region => "Region",
            EntityKind::Building => "Building",
            EntityKind::Function => "Function",
            EntityKind::Domain => "Domain",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizations",
            EntityKind::Region => "regions",
            EntityKind::Building => "buildings",
            EntityKind::Function => "functions",
            EntityKind::Domain => "organization_domains",
        }
    }

    pub fn history_table(&self) -> Option<&'static str> {
        match self {
            EntityKind::Organization => Some("organization_history"),
            EntityKind::Region => Some("region_history"),
            EntityKind::Building => Some("building_history"),
            EntityKind::Function => Some("function_history"),
            EntityKind::Domain => None,
        }
    }

    pub fn audit_table(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization_audit",
            EntityKind::Region => "region_audit",
            EntityKind::Building => "building_audit",
            EntityKind::Function => "function_audit",
            EntityKind::Domain => "domain_audit",
        }
    }

    /// JSON keys inside the attribute document that reference stored images.
    /// Used to collect orphaned image ids for post-commit cleanup.
    pub fn image_keys(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Organization => &["logo_image_id", "feature_image_id"],
            EntityKind::Building => &["map_image_id"],
            _ => &[],
        }
    }
}

/// The uniqueness scope of a natural key: global for organizations,
/// per-organization for regions and buildings, per-building for functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub organization_id: Option<Id>,
    pub parent_id: Option<Id>,
}

impl Scope {
    pub fn global() -> Self {
        Self {
            organization_id: None,
            parent_id: None,
        }
    }

    pub fn organization(organization_id: Id) -> Self {
        Self {
            organization_id: Some(organization_id),
            parent_id: None,
        }
    }

    pub fn parent(organization_id: Id, parent_id: Id) -> Self {
        Self {
            organization_id: Some(organization_id),
            parent_id: Some(parent_id),
        }
    }

    /// Stable textual form used inside lock keys.
    pub fn lock_part(&self) -> String {
        format!(
            "{}/{}",
            self.organization_id.as_deref().unwrap_or("-"),
            self.parent_id.as_deref().unwrap_or("-")
        )
    }
}

/// Opaque optimistic-concurrency token, regenerated by the store on every
/// successful write. Compared byte-exact; callers supply it back on
/// update/delete to detect lost updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// A fresh, unpredictable token (8 random bytes, hex-encoded).
    pub fn fresh() -> Self {
        Self(hex::encode(&Uuid::new_v4().as_bytes()[..8]))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &VersionToken) -> bool {
        self.0 == other.0
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-fold a natural key for scope-local uniqueness comparison.
pub fn fold_natural_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A record blocking a delete (e.g. a desk still assigned to a function),
/// returned so callers can present actionable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependent {
    pub id: Id,
    pub display_name: String,
}
