use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Actor, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "Insert",
            AuditAction::Update => "Update",
            AuditAction::Delete => "Delete",
        }
    }
}

/// Links a cascaded audit entry to the top-level operation that caused it.
/// The root log id is generated once per logical operation and threaded
/// through every nested write via [`OperationContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeLink {
    pub parent_kind: String,
    pub root_log_id: Id,
}

/// Immutable audit record: actor, timestamp, action, full before/after
/// snapshots, the deleted-flag transition, and optional cascade provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: Id,
    pub logged_at: DateTime<Utc>,
    pub actor_id: Option<Id>,
    pub actor_name: Option<String>,
    pub actor_address: Option<String>,
    pub description: String,
    pub entity_id: Id,
    pub action: AuditAction,
    pub old_attrs: Option<serde_json::Value>,
    pub new_attrs: Option<serde_json::Value>,
    pub old_deleted: Option<bool>,
    pub new_deleted: Option<bool>,
    pub cascade: Option<CascadeLink>,
}

impl AuditEntry {
    pub fn new(
        log_id: Id,
        logged_at: DateTime<Utc>,
        actor: &Actor,
        description: impl Into<String>,
        entity_id: Id,
        action: AuditAction,
    ) -> Self {
        Self {
            log_id,
            logged_at,
            actor_id: actor.id.clone(),
            actor_name: actor.display_name.clone(),
            actor_address: actor.address.clone(),
            description: description.into(),
            entity_id,
            action,
            old_attrs: None,
            new_attrs: None,
            old_deleted: None,
            new_deleted: None,
            cascade: None,
        }
    }

    pub fn with_snapshots(
        mut self,
        old_attrs: Option<serde_json::Value>,
        new_attrs: Option<serde_json::Value>,
    ) -> Self {
        self.old_attrs = old_attrs;
        self.new_attrs = new_attrs;
        self
    }

    pub fn with_deleted_transition(mut self, old: Option<bool>, new: Option<bool>) -> Self {
        self.old_deleted = old;
        self.new_deleted = new;
        self
    }

    pub fn with_cascade(mut self, link: CascadeLink) -> Self {
        self.cascade = Some(link);
        self
    }
}

/// Carries the cascade root through one logical operation. Created once at
/// the top level; every nested audit write derives its linkage from it
/// instead of regenerating ids along the way.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub root_log_id: Id,
    pub root_kind_label: &'static str,
}

impl OperationContext {
    pub fn new(root_kind_label: &'static str) -> Self {
        Self {
            root_log_id: crate::model::generate_id(),
            root_kind_label,
        }
    }

    /// Linkage for an entry written on behalf of this operation's root.
    pub fn child_link(&self) -> CascadeLink {
        CascadeLink {
            parent_kind: self.root_kind_label.to_string(),
            root_log_id: self.root_log_id.clone(),
        }
    }
}
