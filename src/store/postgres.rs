use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::engine::clock::end_of_time;
use crate::model::{
    AuditAction, AuditEntry, CascadeLink, Dependent, DomainRow, EntityKind, EntityRow,
    HistoryInterval, Id, Scope, VersionToken,
};
use crate::store::traits::{ChildFilter, EngineStore, EngineTxn};

const ENTITY_COLS: &str = "id, organization_id, parent_id, name, name_folded, attrs, version, \
                           created_at, updated_at, deleted, deleted_at";

const AUDIT_COLS: &str = "log_id, logged_at, actor_id, actor_name, actor_address, description, \
                          entity_id, action, old_attrs, new_attrs, old_deleted, new_deleted, \
                          cascade_parent_kind, cascade_root_log_id";

fn entity_from_row(kind: EntityKind, row: &PgRow) -> EntityRow {
    EntityRow {
        id: row.get("id"),
        kind,
        organization_id: row.get("organization_id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        name_folded: row.get("name_folded"),
        attrs: row.get("attrs"),
        version: VersionToken::from_raw(row.get::<String, _>("version")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted: row.get("deleted"),
        deleted_at: row.get("deleted_at"),
    }
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
    let action = match row.get::<String, _>("action").as_str() {
        "Insert" => AuditAction::Insert,
        "Update" => AuditAction::Update,
        "Delete" => AuditAction::Delete,
        other => bail!("unknown audit action '{}'", other),
    };
    let cascade = match (
        row.get::<Option<String>, _>("cascade_parent_kind"),
        row.get::<Option<String>, _>("cascade_root_log_id"),
    ) {
        (Some(parent_kind), Some(root_log_id)) => Some(CascadeLink {
            parent_kind,
            root_log_id,
        }),
        _ => None,
    };
    Ok(AuditEntry {
        log_id: row.get("log_id"),
        logged_at: row.get("logged_at"),
        actor_id: row.get("actor_id"),
        actor_name: row.get("actor_name"),
        actor_address: row.get("actor_address"),
        description: row.get("description"),
        entity_id: row.get("entity_id"),
        action,
        old_attrs: row.get("old_attrs"),
        new_attrs: row.get("new_attrs"),
        old_deleted: row.get("old_deleted"),
        new_deleted: row.get("new_deleted"),
        cascade,
    })
}

fn history_table(kind: EntityKind) -> Result<&'static str> {
    kind.history_table()
        .with_context(|| format!("{} entities carry no history", kind.label()))
}

/// Postgres-backed engine store. Locks map to transaction-scoped advisory
/// locks (`pg_try_advisory_xact_lock`), so they are zero-wait and released
/// at commit/rollback, and correct across independent service instances.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Every audit entry of one logical operation across all entity kinds,
    /// linked by the shared cascade root id.
    pub async fn list_cascade(&self, root_log_id: &Id) -> Result<Vec<(EntityKind, AuditEntry)>> {
        let kinds = [
            EntityKind::Organization,
            EntityKind::Region,
            EntityKind::Building,
            EntityKind::Function,
            EntityKind::Domain,
        ];
        let mut out = Vec::new();
        for kind in kinds {
            let sql = format!(
                "SELECT {AUDIT_COLS} FROM {} WHERE log_id = $1 OR cascade_root_log_id = $1",
                kind.audit_table()
            );
            let rows = sqlx::query(&sql)
                .bind(root_log_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list cascade audit entries")?;
            for row in &rows {
                out.push((kind, audit_from_row(row)?));
            }
        }
        out.sort_by(|a, b| a.1.logged_at.cmp(&b.1.logged_at));
        Ok(out)
    }
}

pub struct PostgresTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl EngineTxn for PostgresTxn {
    async fn try_acquire_lock(&mut self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .fetch_one(&mut *self.txn)
            .await
            .context("Failed to acquire advisory lock")?;
        Ok(row.get::<bool, _>(0))
    }

    async fn find_active_by_natural_key(
        &mut self,
        kind: EntityKind,
        scope: &Scope,
        name_folded: &str,
    ) -> Result<Option<EntityRow>> {
        let sql = format!(
            "SELECT {ENTITY_COLS} FROM {} \
             WHERE deleted = FALSE AND name_folded = $1 \
               AND organization_id IS NOT DISTINCT FROM $2 \
               AND parent_id IS NOT DISTINCT FROM $3",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(name_folded)
            .bind(&scope.organization_id)
            .bind(&scope.parent_id)
            .fetch_optional(&mut *self.txn)
            .await
            .context("Failed to look up natural key")?;
        Ok(row.map(|r| entity_from_row(kind, &r)))
    }

    async fn get_entity(&mut self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>> {
        let sql = format!("SELECT {ENTITY_COLS} FROM {} WHERE id = $1", kind.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.txn)
            .await
            .context("Failed to fetch entity")?;
        Ok(row.map(|r| entity_from_row(kind, &r)))
    }

    async fn insert_entity(&mut self, row: &EntityRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({ENTITY_COLS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            row.kind.table()
        );
        sqlx::query(&sql)
            .bind(&row.id)
            .bind(&row.organization_id)
            .bind(&row.parent_id)
            .bind(&row.name)
            .bind(&row.name_folded)
            .bind(&row.attrs)
            .bind(row.version.as_str())
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.deleted)
            .bind(row.deleted_at)
            .execute(&mut *self.txn)
            .await
            .context("Failed to insert entity")?;
        Ok(())
    }

    async fn update_entity_guarded(
        &mut self,
        row: &EntityRow,
        expected: &VersionToken,
    ) -> Result<Option<VersionToken>> {
        let fresh = VersionToken::fresh();
        // The full precondition predicate travels with the write: live row,
        // matching token, and no other live row holding the natural key in
        // the same scope. Zero rows affected replaces a corrupt write.
        let sql = format!(
            "UPDATE {t} SET name = $3, name_folded = $4, attrs = $5, \
                    organization_id = $6, parent_id = $7, updated_at = $8, version = $9 \
             WHERE id = $1 AND version = $2 AND deleted = FALSE \
               AND NOT EXISTS (SELECT 1 FROM {t} other \
                    WHERE other.id <> $1 AND other.deleted = FALSE \
                      AND other.name_folded = $4 \
                      AND other.organization_id IS NOT DISTINCT FROM $6 \
                      AND other.parent_id IS NOT DISTINCT FROM $7)",
            t = row.kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(&row.id)
            .bind(expected.as_str())
            .bind(&row.name)
            .bind(&row.name_folded)
            .bind(&row.attrs)
            .bind(&row.organization_id)
            .bind(&row.parent_id)
            .bind(row.updated_at)
            .bind(fresh.as_str())
            .execute(&mut *self.txn)
            .await
            .context("Failed to update entity")?;
        Ok((result.rows_affected() > 0).then_some(fresh))
    }

    async fn soft_delete_guarded(
        &mut self,
        kind: EntityKind,
        id: &Id,
        expected: &VersionToken,
        at: DateTime<Utc>,
    ) -> Result<Option<VersionToken>> {
        let fresh = VersionToken::fresh();
        let sql = format!(
            "UPDATE {} SET deleted = TRUE, deleted_at = $3, updated_at = $3, version = $4 \
             WHERE id = $1 AND version = $2 AND deleted = FALSE",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(at)
            .bind(fresh.as_str())
            .execute(&mut *self.txn)
            .await
            .context("Failed to soft-delete entity")?;
        Ok((result.rows_affected() > 0).then_some(fresh))
    }

    async fn soft_delete_cascade(
        &mut self,
        kind: EntityKind,
        id: &Id,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET deleted = TRUE, deleted_at = $2, updated_at = $2, version = $3 \
             WHERE id = $1 AND deleted = FALSE",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(at)
            .bind(VersionToken::fresh().as_str())
            .execute(&mut *self.txn)
            .await
            .context("Failed to cascade soft-delete")?;
        Ok(result.rows_affected() > 0)
    }

    async fn close_open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET valid_to = $2 \
             WHERE entity_id = $1 AND valid_to = $3 AND valid_from < $2",
            history_table(kind)?
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(end)
            .bind(end_of_time())
            .execute(&mut *self.txn)
            .await
            .context("Failed to close history interval")?;
        Ok(result.rows_affected())
    }

    async fn force_close_open_interval(&mut self, kind: EntityKind, id: &Id) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET valid_to = valid_from WHERE entity_id = $1 AND valid_to = $2",
            history_table(kind)?
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(end_of_time())
            .execute(&mut *self.txn)
            .await
            .context("Failed to force-close history interval")?;
        Ok(result.rows_affected())
    }

    async fn open_interval(
        &mut self,
        kind: EntityKind,
        id: &Id,
        attrs: &serde_json::Value,
        start: DateTime<Utc>,
    ) -> Result<()> {
        let table = history_table(kind)?;
        // Same-bucket collapse: an open interval already starting at this
        // boundary just gets the latest attribute snapshot.
        let update = format!(
            "UPDATE {table} SET attrs = $2 \
             WHERE entity_id = $1 AND valid_to = $3 AND valid_from = $4"
        );
        let updated = sqlx::query(&update)
            .bind(id)
            .bind(attrs)
            .bind(end_of_time())
            .bind(start)
            .execute(&mut *self.txn)
            .await
            .context("Failed to refresh open history interval")?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO {table} (id, entity_id, attrs, valid_from, valid_to) \
             VALUES ($1, $2, $3, $4, $5)"
        );
        sqlx::query(&insert)
            .bind(crate::model::generate_id())
            .bind(id)
            .bind(attrs)
            .bind(start)
            .bind(end_of_time())
            .execute(&mut *self.txn)
            .await
            .context("Failed to open history interval")?;
        Ok(())
    }

    async fn append_audit(&mut self, kind: EntityKind, entry: &AuditEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({AUDIT_COLS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            kind.audit_table()
        );
        sqlx::query(&sql)
            .bind(&entry.log_id)
            .bind(entry.logged_at)
            .bind(&entry.actor_id)
            .bind(&entry.actor_name)
            .bind(&entry.actor_address)
            .bind(&entry.description)
            .bind(&entry.entity_id)
            .bind(entry.action.as_str())
            .bind(&entry.old_attrs)
            .bind(&entry.new_attrs)
            .bind(entry.old_deleted)
            .bind(entry.new_deleted)
            .bind(entry.cascade.as_ref().map(|c| c.parent_kind.clone()))
            .bind(entry.cascade.as_ref().map(|c| c.root_log_id.clone()))
            .execute(&mut *self.txn)
            .await
            .context("Failed to append audit entry")?;
        Ok(())
    }

    async fn list_children(
        &mut self,
        kind: EntityKind,
        filter: &ChildFilter,
    ) -> Result<Vec<EntityRow>> {
        let (column, id) = match filter {
            ChildFilter::Organization(id) => ("organization_id", id),
            ChildFilter::Parent(id) => ("parent_id", id),
        };
        let sql = format!(
            "SELECT {ENTITY_COLS} FROM {} \
             WHERE deleted = FALSE AND {column} = $1 ORDER BY created_at, id",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut *self.txn)
            .await
            .context("Failed to list child entities")?;
        Ok(rows.iter().map(|r| entity_from_row(kind, r)).collect())
    }

    async fn insert_domain(&mut self, row: &DomainRow) -> Result<()> {
        sqlx::query("INSERT INTO organization_domains (id, organization_id, domain) VALUES ($1, $2, $3)")
            .bind(&row.id)
            .bind(&row.organization_id)
            .bind(&row.domain)
            .execute(&mut *self.txn)
            .await
            .context("Failed to insert domain")?;
        Ok(())
    }

    async fn list_domains(&mut self, organization_id: &Id) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, domain FROM organization_domains \
             WHERE organization_id = $1 ORDER BY domain",
        )
        .bind(organization_id)
        .fetch_all(&mut *self.txn)
        .await
        .context("Failed to list domains")?;
        Ok(rows
            .iter()
            .map(|r| DomainRow {
                id: r.get("id"),
                organization_id: r.get("organization_id"),
                domain: r.get("domain"),
            })
            .collect())
    }

    async fn delete_domains(&mut self, organization_id: &Id) -> Result<u64> {
        let result = sqlx::query("DELETE FROM organization_domains WHERE organization_id = $1")
            .bind(organization_id)
            .execute(&mut *self.txn)
            .await
            .context("Failed to delete domains")?;
        Ok(result.rows_affected())
    }

    async fn list_dependents(&mut self, id: &Id) -> Result<Vec<Dependent>> {
        let rows = sqlx::query("SELECT id, name FROM desks WHERE function_id = $1 ORDER BY name")
            .bind(id)
            .fetch_all(&mut *self.txn)
            .await
            .context("Failed to list dependents")?;
        Ok(rows
            .iter()
            .map(|r| Dependent {
                id: r.get("id"),
                display_name: r.get("name"),
            })
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn
            .commit()
            .await
            .context("Failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.txn
            .rollback()
            .await
            .context("Failed to roll back transaction")
    }
}

#[async_trait::async_trait]
impl EngineStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn EngineTxn>> {
        let txn = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Box::new(PostgresTxn { txn }))
    }

    async fn get_entity(&self, kind: EntityKind, id: &Id) -> Result<Option<EntityRow>> {
        let sql = format!("SELECT {ENTITY_COLS} FROM {} WHERE id = $1", kind.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch entity")?;
        Ok(row.map(|r| entity_from_row(kind, &r)))
    }

    async fn list_entities(&self, kind: EntityKind, scope: &Scope) -> Result<Vec<EntityRow>> {
        let sql = format!(
            "SELECT {ENTITY_COLS} FROM {} \
             WHERE deleted = FALSE \
               AND organization_id IS NOT DISTINCT FROM $1 \
               AND parent_id IS NOT DISTINCT FROM $2 \
             ORDER BY created_at, id",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(&scope.organization_id)
            .bind(&scope.parent_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entities")?;
        Ok(rows.iter().map(|r| entity_from_row(kind, r)).collect())
    }

    async fn list_history(&self, kind: EntityKind, id: &Id) -> Result<Vec<HistoryInterval>> {
        let sql = format!(
            "SELECT id, entity_id, attrs, valid_from, valid_to FROM {} \
             WHERE entity_id = $1 ORDER BY valid_from",
            history_table(kind)?
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list history")?;
        Ok(rows
            .iter()
            .map(|r| HistoryInterval {
                id: r.get("id"),
                entity_id: r.get("entity_id"),
                attrs: r.get("attrs"),
                valid_from: r.get("valid_from"),
                valid_to: r.get("valid_to"),
            })
            .collect())
    }

    async fn list_audit(&self, kind: EntityKind, id: &Id) -> Result<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {AUDIT_COLS} FROM {} WHERE entity_id = $1 ORDER BY logged_at",
            kind.audit_table()
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list audit entries")?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn list_domains(&self, organization_id: &Id) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, domain FROM organization_domains \
             WHERE organization_id = $1 ORDER BY domain",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list domains")?;
        Ok(rows
            .iter()
            .map(|r| DomainRow {
                id: r.get("id"),
                organization_id: r.get("organization_id"),
                domain: r.get("domain"),
            })
            .collect())
    }
}
