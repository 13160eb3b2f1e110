use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::{fold_natural_key, EntityKind, Id, Scope, VersionToken};

/// One row of an entity table, kind-agnostic. Domain-specific attributes
/// live in the JSON document; the columns the engine itself needs (scope,
/// folded natural key, version token, soft-delete state) are first-class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: Id,
    pub kind: EntityKind,
    pub organization_id: Option<Id>,
    pub parent_id: Option<Id>,
    pub name: String,
    pub name_folded: String,
    pub attrs: serde_json::Value,
    pub version: VersionToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EntityRow {
    pub fn scope(&self) -> Scope {
        Scope {
            organization_id: self.organization_id.clone(),
            parent_id: self.parent_id.clone(),
        }
    }

    /// Image ids currently referenced by this row's attributes.
    pub fn image_ids(&self) -> Vec<Id> {
        self.kind
            .image_keys()
            .iter()
            .filter_map(|key| self.attrs.get(key))
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect()
    }
}

/// A typed view over an [`EntityRow`], carrying the caller-facing snapshot
/// returned from every successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<F> {
    pub id: Id,
    pub fields: F,
    pub version: VersionToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl<F: DeserializeOwned> Entity<F> {
    pub fn from_row(row: &EntityRow) -> Result<Self> {
        let fields: F = serde_json::from_value(row.attrs.clone())
            .with_context(|| format!("Failed to deserialize {} attributes", row.kind.label()))?;
        Ok(Self {
            id: row.id.clone(),
            fields,
            version: row.version.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted: row.deleted,
            deleted_at: row.deleted_at,
        })
    }
}

/// Build a fresh entity row from typed fields. The store regenerates the
/// version token on every later write; this is the initial one.
pub fn new_entity_row<F: Serialize>(
    kind: EntityKind,
    name: &str,
    scope: Scope,
    fields: &F,
    now: DateTime<Utc>,
) -> Result<EntityRow> {
    let attrs = serde_json::to_value(fields)
        .with_context(|| format!("Failed to serialize {} attributes", kind.label()))?;
    Ok(EntityRow {
        id: crate::model::generate_id(),
        kind,
        organization_id: scope.organization_id,
        parent_id: scope.parent_id,
        name: name.to_string(),
        name_folded: fold_natural_key(name),
        attrs,
        version: VersionToken::fresh(),
        created_at: now,
        updated_at: now,
        deleted: false,
        deleted_at: None,
    })
}

/// An email domain owned by an organization. Domains are plain child rows:
/// audited on insert/removal but carrying no history or version token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRow {
    pub id: Id,
    pub organization_id: Id,
    pub domain: String,
}

impl DomainRow {
    pub fn new(organization_id: Id, domain: impl Into<String>) -> Self {
        Self {
            id: crate::model::generate_id(),
            organization_id,
            domain: domain.into(),
        }
    }
}
