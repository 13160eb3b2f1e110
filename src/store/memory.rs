use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::engine::clock::end_of_time;
use crate::model::{
    AuditEntry, Dependent, DomainRow, EntityKind, EntityRow, HistoryInterval, Id, Scope,
    VersionToken,
};
use crate::store::traits::{ChildFilter, EngineStore, EngineTxn};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    entities: HashMap<(EntityKind, Id), EntityRow>,
    history: HashMap<(EntityKind, Id), Vec<HistoryInterval>>,
    audit: HashMap<EntityKind, Vec<AuditEntry>>,
    domains: HashMap<Id, Vec<DomainRow>>,
}

/// In-process engine store. Transactions snapshot the state, mutate the
/// snapshot, and swap it back on commit; a write gate serializes open
/// transactions so the swap can never lose a concurrent commit. The keyed
/// lock table is shared outside the gate, so contention with an external
/// holder is still observable.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<Mutex<HashSet<String>>>,
    // Desks live outside the transactional snapshot: they belong to the
    // desk-management subsystem and may change while a transaction is open.
    dependents: Arc<Mutex<HashMap<Id, Vec<Dependent>>>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a desk blocking deletion of a function. Test/seeding hook
    /// standing in for the desk-management subsystem.
    pub fn add_desk(&self, function_id: &Id, desk_id: impl Into<Id>, name: impl Into<String>) {
        self.dependents
            .lock()
            .entry(function_id.clone())
            .or_default()
            .push(Dependent {
                id: desk_id.into(),
                display_name: name.into(),
            });
    }

    pub fn clear_desks(&self, function_id: &Id) {
        self.dependents.lock().remove(function_id);
    }

    /// Hold a lock key from outside any transaction, to exercise the
    /// zero-wait contention path. Released when the guard drops.
    pub fn hold_lock(&self, key: impl Into<String>) -> Option<MemoryLockGuard> {
        let key = key.into();
        if self.locks.lock().insert(key.clone()) {
            Some(MemoryLockGuard {
                locks: Arc::clone(&self.locks),
                key,
            })
        } else {
            None
        }
    }

    /// Every audit entry caused by one logical operation, across all entity
    /// kinds, linked by the shared cascade root id (the root entry itself
    /// carries the id as its log id).
    pub fn list_cascade(&self, root_log_id: &Id) -> Vec<(EntityKind, AuditEntry)> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (kind, entries) in &state.audit {
            for entry in entries {
                let is_root = &entry.log_id == root_log_id;
                let is_child = entry
                    .cascade
                    .as_ref()
                    .map(|link| &link.root_log_id == root_log_id)
                    .unwrap_or(false);
                if is_root || is_child {
                    out.push((*kind, entry.clone()));
                }
            }
        }
        out.sort_by(|a, b| a.1.logged_at.cmp(&b.1.logged_at));
        out
    }
}

pub struct MemoryLockGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

pub struct MemoryTxn {
    // Held for the whole transaction; serializes writers.
    _gate: tokio::sync::OwnedMutexGuard<()>,
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<Mutex<HashSet<String>>>,
    dependents: Arc<Mutex<HashMap<Id, Vec<Dependent>>>>,
    held: Vec<String>,
    work: MemoryState,
}

impl MemoryTxn {
    fn release_locks(&mut self) {
        let mut locks = self.locks.lock();
        for key in self.held.drain(..) {
            locks.remove(&key);
        }
    }

    fn scope_matches(row: &EntityRow, scope: &Scope) -> bool {
        row.organization_id == scope.organization_id && row.parent_id == scope.parent_id
    }

    fn natural_key_taken(&self, row: &EntityRow) -> bool {
        self.work.entities.values().any(|other| {
            other.kind == row.kind
                && other.id != row.id
                && !other.deleted
                && other.name_folded == row.name_folded
                && other.organization_id == row.organization_id
                && other.parent_id == row.parent_id
        })
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[async_trait::async_trait]
impl EngineTxn for MemoryTxn {
    async fn try_acquire_lock(&mut self, key: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        if locks.insert(key.to_string()) {
            self.held.push(key.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn find_active_by_natural_key(
        &mut self,
        kind: EntityKind,
        scope: &Scope,
        name_folded: &str,
    ) -> Result<Option<EntityRow>> {
        Ok(self
            .work
            .entities
            .values()
            .find(|row| {
                row.kind == kind
                    && !row.deleted
                    && row.name_folded == name_folded
                    && Self::scope_matches(row, scope)
            })
            .cloned())
    }

    async fn get_entity(&mut self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>> {
        Ok(self.work.entities.get(&(kind, id.clone())).cloned())
    }

    async fn insert_entity(&mut self, row: &EntityRow) -> Result<()> {
        self.work
            .entities
            .insert((row.kind, row.id.clone()), row.clone());
        Ok(())
    }

    async fn update_entity_guarded(
        &mut self,
        row: &EntityRow,
        expected: &VersionToken,
    ) -> Result<Option<VersionToken>> {
        if self.natural_key_taken(row) {
            return Ok(None);
        }
        let Some(current) = self.work.entities.get_mut(&(row.kind, row.id.clone())) else {
            return Ok(None);
        };
        if current.deleted || !current.version.matches(expected) {
            return Ok(None);
        }
        let fresh = VersionToken::fresh();
        current.name = row.name.clone();
        current.name_folded = row.name_folded.clone();
        current.attrs = row.attrs.clone();
        current.organization_id = row.organization_id.clone();
        current.parent_id = row.parent_id.clone();
        current.updated_at = row.updated_at;
        current.version = fresh.clone();
        Ok(Some(fresh))
    }

    async fn soft_delete_guarded(
        &mut self,
        kind: EntityKind,
        id: &Id,
        expected: &VersionToken,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionToken>> {
        let Some(current) = self.work.entities.get_mut(&(kind, id.clone())) else {
            return Ok(None);
        };
        if current.deleted || !current.version.matches(expected) {
            return Ok(None);
        }
        let fresh = VersionToken::fresh();
        current.deleted = true;
        current.deleted_at = Some(at);
        current.updated_at = at;
        current.version = fresh.clone();
        Ok(Some(fresh))
    }

    async fn soft_delete_cascade(
        &mut self,
        kind: EntityKind,
        id: &Id,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(current) = self.work.entities.get_mut(&(kind, id.clone())) else {
            return Ok(false);
        };
        if current.deleted {
            return Ok(false);
        }
        current.deleted = true;
        current.deleted_at = Some(at);
        current.updated_at = at;
        current.version = VersionToken::fresh();
        Ok(true)
    }

    async fn close_open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let sentinel = end_of_time();
        let Some(intervals) = self.work.history.get_mut(&(kind, id.clone())) else {
            return Ok(0);
        };
        for interval in intervals.iter_mut() {
            if interval.valid_to == sentinel && interval.valid_from < end {
                interval.valid_to = end;
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn force_close_open_interval(&mut self, kind: EntityKind, id: &Id) -> Result<u64> {
        let sentinel = end_of_time();
        let Some(intervals) = self.work.history.get_mut(&(kind, id.clone())) else {
            return Ok(0);
        };
        for interval in intervals.iter_mut() {
            if interval.valid_to == sentinel {
                interval.valid_to = interval.valid_from;
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        attrs: &serde_json::Value,
        start: DateTime<Utc>,
    ) -> Result<()> {
        let sentinel = end_of_time();
        let intervals = self.work.history.entry((kind, id.clone())).or_default();
        // Same-bucket collapse: replace the attributes of an open interval
        // that already starts at this boundary.
        for interval in intervals.iter_mut() {
            if interval.valid_to == sentinel && interval.valid_from == start {
                interval.attrs = attrs.clone();
                return Ok(());
            }
        }
        intervals.push(HistoryInterval::open(id.clone(), attrs.clone(), start));
        Ok(())
    }

    async fn append_audit(&mut self, kind: EntityKind, entry: &AuditEntry) -> Result<()> {
        self.work
            .audit
            .entry(kind)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_children(
        &mut self,
        kind: EntityKind,
        filter: &ChildFilter,
    ) -> Result<Vec<EntityRow>> {
        let mut rows: Vec<EntityRow> = self
            .work
            .entities
            .values()
            .filter(|row| row.kind == kind && !row.deleted)
            .filter(|row| match filter {
                ChildFilter::Organization(org) => row.organization_id.as_ref() == Some(org),
                ChildFilter::Parent(parent) => row.parent_id.as_ref() == Some(parent),
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert_domain(&mut self, row: &DomainRow) -> Result<()> {
        self.work
            .domains
            .entry(row.organization_id.clone())
            .or_default()
            .push(row.clone());
        Ok(())
    }

    async fn list_domains(&mut self, organization_id: &Id) -> Result<Vec<DomainRow>> {
        Ok(self
            .work
            .domains
            .get(organization_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_domains(&mut self, organization_id: &Id) -> Result<u64> {
        Ok(self
            .work
            .domains
            .remove(organization_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn list_dependents(&mut self, id: &Id) -> Result<Vec<Dependent>> {
        Ok(self.dependents.lock().get(id).cloned().unwrap_or_default())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        *self.state.lock() = std::mem::take(&mut self.work);
        // Locks release in Drop.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl EngineStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn EngineTxn>> {
        let gate = Arc::clone(&self.write_gate).lock_owned().await;
        let work = self.state.lock().clone();
        Ok(Box::new(MemoryTxn {
            _gate: gate,
            state: Arc::clone(&self.state),
            locks: Arc::clone(&self.locks),
            dependents: Arc::clone(&self.dependents),
            held: Vec::new(),
            work,
        }))
    }

    async fn get_entity(&self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>> {
        Ok(self.state.lock().entities.get(&(kind, id.clone())).cloned())
    }

    async fn list_entities(&self, kind: EntityKind, scope: &Scope) -> Result<Vec<EntityRow>> {
        let state = self.state.lock();
        let mut rows: Vec<EntityRow> = state
            .entities
            .values()
            .filter(|row| row.kind == kind && !row.deleted && MemoryTxn::scope_matches(row, scope))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_history(&self, kind: EntityKind, id: &Id) -> Result<Vec<HistoryInterval>> {
        let mut intervals = self
            .state
            .lock()
            .history
            .get(&(kind, id.clone()))
            .cloned()
            .unwrap_or_default();
        intervals.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        Ok(intervals)
    }

    async fn list_audit(&self, kind: EntityKind, id: &Id) -> Result<Vec<AuditEntry>> {
        Ok(self
            .state
            .lock()
            .audit
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| &e.entity_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_domains(&self, organization_id: &Id) -> Result<Vec<DomainRow>> {
        Ok(self
            .state
            .lock()
            .domains
            .get(organization_id)
            .cloned()
            .unwrap_or_default())
    }
}
