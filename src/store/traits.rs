use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{
    AuditEntry, Dependent, DomainRow, EntityKind, EntityRow, HistoryInterval, Id, Scope,
    VersionToken,
};

/// Which children a cascade enumerates: everything owned by an organization,
/// or everything directly under a parent entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildFilter {
    Organization(Id),
    Parent(Id),
}

/// One transaction of the engine store. Implementations pair every open
/// transaction with the exclusive lock primitive: locks acquired through
/// [`EngineTxn::try_acquire_lock`] are released at commit/rollback.
///
/// The guarded mutations re-check their full precondition predicate in a
/// single conditional write, so a concurrent change between validation and
/// application yields zero rows affected rather than a corrupted row.
#[async_trait::async_trait]
pub trait EngineTxn: Send {
    /// Zero-wait exclusive lock acquisition. `false` means contended; the
    /// orchestrator aborts immediately instead of queuing.
    async fn try_acquire_lock(&mut self, key: &str) -> Result<bool>;

    /// Find the non-deleted entity holding a case-folded natural key within
    /// a scope.
    async fn find_active_by_natural_key(
        &mut self,
        kind: EntityKind,
        scope: &Scope,
        name_folded: &str,
    ) -> Result<Option<EntityRow>>;

    /// Fetch an entity regardless of its soft-delete state (used to
    /// disambiguate zero-rows-affected results).
    async fn get_entity(&mut self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>>;

    async fn insert_entity(&mut self, row: &EntityRow) -> Result<()>;

    /// Guarded single-statement update: applies only while the row is live,
    /// the supplied token matches, and no other live row in the same scope
    /// holds the new natural key. Returns the regenerated token, or `None`
    /// when zero rows were affected.
    async fn update_entity_guarded(
        &mut self,
        row: &EntityRow,
        expected: &VersionToken,
    ) -> Result<Option<VersionToken>>;

    /// Guarded soft delete; same zero-rows contract as
    /// [`EngineTxn::update_entity_guarded`].
    async fn soft_delete_guarded(
        &mut self,
        kind: EntityKind,
        id: &Id,
        expected: &VersionToken,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionToken>>;

    /// Token-free soft delete used only under a cascade root, where the
    /// parent's lock and token already serialize the operation.
    async fn soft_delete_cascade(
        &mut self,
        kind: EntityKind,
        id: &Id,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Close the open history interval at `end`, only when the interval
    /// started strictly before `end`. Returns rows affected; 0 means the
    /// mutation recurred within the interval's own quantization bucket.
    async fn close_open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    /// Close the open interval at its own start (zero-length). Used on
    /// delete when the plain closure was skipped, so a deleted entity never
    /// retains an open interval.
    async fn force_close_open_interval(&mut self, kind: EntityKind, id: &Id) -> Result<u64>;

    /// Open an interval at `start` with the given tracked-attribute
    /// snapshot. When an open interval already starts at the same boundary
    /// its attributes are replaced instead (same-bucket collapse).
    async fn open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        attrs: &serde_json::Value,
        start: DateTime<Utc>,
    ) -> Result<()>;

    /// Append-only audit insert. Never fails for business reasons; storage
    /// faults propagate as fatal.
    async fn append_audit(&mut self, kind: EntityKind, entry: &AuditEntry) -> Result<()>;

    /// Live children of one kind for cascade enumeration.
    async fn list_children(
        &mut self,
        kind: EntityKind,
        filter: &ChildFilter,
    ) -> Result<Vec<EntityRow>>;

    async fn insert_domain(&mut self, row: &DomainRow) -> Result<()>;
    async fn list_domains(&mut self, organization_id: &Id) -> Result<Vec<DomainRow>>;
    async fn delete_domains(&mut self, organization_id: &Id) -> Result<u64>;

    /// Records blocking a delete of the given entity (e.g. desks still
    /// assigned to a function).
    async fn list_dependents(&mut self, id: &Id) -> Result<Vec<Dependent>>;

    /// Commit releases every lock acquired in this transaction.
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage backend of the engine. Mutations run through [`EngineStore::begin`];
/// the read-side methods serve lookups, listings, and test assertions.
/// Dropping a read future is the cancellation signal.
#[async_trait::async_trait]
pub trait EngineStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn EngineTxn>>;

    async fn get_entity(&self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>>;
    async fn list_entities(&self, kind: EntityKind, scope: &Scope) -> Result<Vec<EntityRow>>;
    async fn list_history(&self, kind: EntityKind, id: &Id) -> Result<Vec<HistoryInterval>>;
    async fn list_audit(&self, kind: EntityKind, id: &Id) -> Result<Vec<AuditEntry>>;
    async fn list_domains(&self, organization_id: &Id) -> Result<Vec<DomainRow>>;
}
