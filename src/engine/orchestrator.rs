use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::engine::clock::{Clock, Quantizer, SystemClock};
use crate::engine::cleanup::{
    CacheInvalidator, CacheKey, CascadeContext, ImageService, PostCommit,
};
use crate::engine::descriptor::{
    BuildingEntity, EntityDescriptor, FunctionEntity, OrganizationEntity, RegionEntity,
};
use crate::engine::lock_key::build_lock_key;
use crate::model::{
    fold_natural_key, Actor, AuditAction, AuditEntry, DeleteRequest, Entity, EntityKind,
    EntityRow, HistoryInterval, Id, MutationOutcome, MutationResult, OperationContext, Scope,
    UpdateRequest, VersionToken,
};
use crate::store::traits::{EngineStore, EngineTxn};

/// Disambiguate a zero-rows-affected guarded mutation: the row vanished, the
/// supplied token went stale, or (for updates) another live row took the
/// natural key.
fn classify_zero_rows(current: Option<&EntityRow>, supplied: &VersionToken) -> MutationOutcome {
    match current {
        None => MutationOutcome::RecordDidNotExist,
        Some(row) if row.deleted => MutationOutcome::RecordDidNotExist,
        Some(row) if !row.version.matches(supplied) => MutationOutcome::ConcurrencyKeyInvalid,
        Some(_) => MutationOutcome::RecordAlreadyExists,
    }
}

/// Derived caches keyed by an entity of the given kind.
fn cache_keys_for(kind: EntityKind, id: &Id) -> Vec<CacheKey> {
    match kind {
        EntityKind::Building => vec![CacheKey::BuildingTimezone(id.clone())],
        _ => Vec::new(),
    }
}

/// The shared mutation engine. One instance serves every entity type; the
/// per-type behavior comes from [`EntityDescriptor`] strategies reached
/// through the typed accessors ([`MutationEngine::organizations`] etc.).
///
/// Every mutation runs the same protocol: acquire the zero-wait lock,
/// validate under it, apply the guarded write, splice history, write audit,
/// commit (which releases the lock), then run post-commit cleanup.
pub struct MutationEngine<S: EngineStore> {
    store: Arc<S>,
    quantizer: Quantizer,
    clock: Arc<dyn Clock>,
    images: Arc<dyn ImageService>,
    caches: Arc<dyn CacheInvalidator>,
}

impl<S: EngineStore> MutationEngine<S> {
    pub fn new(
        store: Arc<S>,
        images: Arc<dyn ImageService>,
        caches: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            quantizer: Quantizer::default(),
            clock: Arc::new(SystemClock),
            images,
            caches,
        }
    }

    pub fn with_quantizer(mut self, quantizer: Quantizer) -> Self {
        self.quantizer = quantizer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn organizations(&self) -> EntityOps<'_, S, OrganizationEntity> {
        EntityOps::new(self)
    }

    pub fn regions(&self) -> EntityOps<'_, S, RegionEntity> {
        EntityOps::new(self)
    }

    pub fn buildings(&self) -> EntityOps<'_, S, BuildingEntity> {
        EntityOps::new(self)
    }

    pub fn functions(&self) -> EntityOps<'_, S, FunctionEntity> {
        EntityOps::new(self)
    }

    async fn create<E: EntityDescriptor>(
        &self,
        fields: E::Fields,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        let now = self.clock.now();
        let name = E::name(&fields).to_string();
        let scope = E::scope(&fields);
        let lock_key = build_lock_key(E::KIND, &scope, &name);

        let mut txn = self.store.begin().await?;
        if !txn.try_acquire_lock(&lock_key).await? {
            log::warn!("lock contention creating {} '{}'", E::KIND.label(), name);
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::Unknown));
        }

        if txn
            .find_active_by_natural_key(E::KIND, &scope, &fold_natural_key(&name))
            .await?
            .is_some()
        {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::RecordAlreadyExists));
        }
        if let Some(outcome) = E::validate_sub_records(txn.as_mut(), &fields).await? {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(outcome));
        }

        let row = crate::model::new_entity_row(E::KIND, &name, scope, &fields, now)?;
        txn.insert_entity(&row).await?;
        txn.open_interval(
            E::KIND,
            &row.id,
            &E::tracked(&fields),
            self.quantizer.quantize(now),
        )
        .await?;

        let ctx = OperationContext::new(E::KIND.label());
        let entry = AuditEntry::new(
            ctx.root_log_id.clone(),
            now,
            actor,
            format!("Created {} '{}'", E::KIND.label(), name),
            row.id.clone(),
            AuditAction::Insert,
        )
        .with_snapshots(None, Some(row.attrs.clone()))
        .with_deleted_transition(None, Some(false));
        txn.append_audit(E::KIND, &entry).await?;

        E::after_create(txn.as_mut(), &ctx, &row, &fields, actor, now).await?;

        txn.commit().await.context("Failed to commit create")?;
        log::info!("created {} '{}' ({})", E::KIND.label(), name, row.id);
        Ok(MutationResult::ok(Entity::from_row(&row)?))
    }

    async fn update<E: EntityDescriptor>(
        &self,
        req: UpdateRequest<E::Fields>,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        let now = self.clock.now();
        let name = E::name(&req.fields).to_string();
        let scope = E::scope(&req.fields);
        // Locked on the requested name: that is the uniqueness target.
        // Concurrent writes to the same row under other names are closed by
        // the version token in the guarded statement.
        let lock_key = build_lock_key(E::KIND, &scope, &name);

        let mut txn = self.store.begin().await?;
        if !txn.try_acquire_lock(&lock_key).await? {
            log::warn!("lock contention updating {} '{}'", E::KIND.label(), name);
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::Unknown));
        }

        let current = txn.get_entity(E::KIND, &req.id).await?;
        let Some(current) = current.filter(|row| !row.deleted) else {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::RecordDidNotExist));
        };
        if let Some(holder) = txn
            .find_active_by_natural_key(E::KIND, &scope, &fold_natural_key(&name))
            .await?
        {
            if holder.id != req.id {
                txn.rollback().await?;
                return Ok(MutationResult::aborted(MutationOutcome::RecordAlreadyExists));
            }
        }
        if let Some(outcome) = E::validate_sub_records(txn.as_mut(), &req.fields).await? {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(outcome));
        }

        let old_fields: E::Fields = serde_json::from_value(current.attrs.clone())
            .with_context(|| format!("Failed to deserialize {} attributes", E::KIND.label()))?;

        let mut row = current.clone();
        row.name = name.clone();
        row.name_folded = fold_natural_key(&name);
        row.attrs = serde_json::to_value(&req.fields)
            .with_context(|| format!("Failed to serialize {} attributes", E::KIND.label()))?;
        row.organization_id = scope.organization_id.clone();
        row.parent_id = scope.parent_id.clone();
        row.updated_at = now;

        match txn.update_entity_guarded(&row, &req.version).await? {
            Some(fresh) => row.version = fresh,
            None => {
                let after = txn.get_entity(E::KIND, &req.id).await?;
                txn.rollback().await?;
                return Ok(MutationResult::aborted(classify_zero_rows(
                    after.as_ref(),
                    &req.version,
                )));
            }
        }

        let boundary = self.quantizer.quantize(now);
        txn.close_open_interval(E::KIND, &req.id, boundary).await?;
        txn.open_interval(E::KIND, &req.id, &E::tracked(&req.fields), boundary)
            .await?;

        let ctx = OperationContext::new(E::KIND.label());
        let description = if current.name != name {
            format!(
                "Renamed {} '{}' to '{}'",
                E::KIND.label(),
                current.name,
                name
            )
        } else {
            format!("Updated {} '{}'", E::KIND.label(), name)
        };
        let entry = AuditEntry::new(
            ctx.root_log_id.clone(),
            now,
            actor,
            description,
            req.id.clone(),
            AuditAction::Update,
        )
        .with_snapshots(Some(current.attrs.clone()), Some(row.attrs.clone()))
        .with_deleted_transition(Some(false), Some(false));
        txn.append_audit(E::KIND, &entry).await?;

        E::sync_on_update(txn.as_mut(), &row, &old_fields, &req.fields).await?;

        txn.commit().await.context("Failed to commit update")?;

        let old_images = current.image_ids();
        let new_images = row.image_ids();
        let effects = PostCommit {
            orphaned_images: old_images
                .into_iter()
                .filter(|id| !new_images.contains(id))
                .collect(),
            cache_keys: cache_keys_for(E::KIND, &req.id),
            cascade: CascadeContext {
                root_log_id: Some(ctx.root_log_id.clone()),
                parent_kind: Some(E::KIND.label().to_string()),
            },
        };
        effects
            .run(Arc::clone(&self.images), Arc::clone(&self.caches))
            .await;

        Ok(MutationResult::ok(Entity::from_row(&row)?))
    }

    async fn delete<E: EntityDescriptor>(
        &self,
        req: DeleteRequest,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        let now = self.clock.now();
        let mut txn = self.store.begin().await?;

        // The lock key derives from the stored name, so look first and
        // re-validate under the lock.
        let peek = txn.get_entity(E::KIND, &req.id).await?;
        let Some(peek) = peek.filter(|row| !row.deleted) else {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::RecordDidNotExist));
        };
        let lock_key = build_lock_key(E::KIND, &peek.scope(), &peek.name);
        if !txn.try_acquire_lock(&lock_key).await? {
            log::warn!("lock contention deleting {} '{}'", E::KIND.label(), peek.name);
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::Unknown));
        }
        let current = txn.get_entity(E::KIND, &req.id).await?;
        let Some(current) = current.filter(|row| !row.deleted) else {
            txn.rollback().await?;
            return Ok(MutationResult::aborted(MutationOutcome::RecordDidNotExist));
        };

        let dependents = E::blocking_dependents(txn.as_mut(), &req.id).await?;
        if !dependents.is_empty() {
            txn.rollback().await?;
            return Ok(MutationResult::blocked(dependents));
        }

        let fresh = match txn
            .soft_delete_guarded(E::KIND, &req.id, &req.version, now)
            .await?
        {
            Some(fresh) => fresh,
            None => {
                let after = txn.get_entity(E::KIND, &req.id).await?;
                txn.rollback().await?;
                return Ok(MutationResult::aborted(classify_zero_rows(
                    after.as_ref(),
                    &req.version,
                )));
            }
        };

        let boundary = self.quantizer.quantize(now);
        if txn.close_open_interval(E::KIND, &req.id, boundary).await? == 0 {
            // Created and deleted within one bucket: close at the interval's
            // own start so no deleted entity keeps an open interval.
            txn.force_close_open_interval(E::KIND, &req.id).await?;
        }

        let ctx = OperationContext::new(E::KIND.label());
        let entry = AuditEntry::new(
            ctx.root_log_id.clone(),
            now,
            actor,
            format!("Deleted {} '{}'", E::KIND.label(), current.name),
            req.id.clone(),
            AuditAction::Delete,
        )
        .with_snapshots(Some(current.attrs.clone()), Some(current.attrs.clone()))
        .with_deleted_transition(Some(false), Some(true));
        txn.append_audit(E::KIND, &entry).await?;

        let mut effects = PostCommit {
            orphaned_images: current.image_ids(),
            cache_keys: cache_keys_for(E::KIND, &req.id),
            cascade: CascadeContext {
                root_log_id: Some(ctx.root_log_id.clone()),
                parent_kind: Some(E::KIND.label().to_string()),
            },
        };

        E::cascade_extras(txn.as_mut(), &ctx, &current, actor, now).await?;
        self.cascade_children::<E>(txn.as_mut(), &ctx, &current, actor, now, &mut effects)
            .await?;

        txn.commit().await.context("Failed to commit delete")?;
        log::info!(
            "deleted {} '{}' ({})",
            E::KIND.label(),
            current.name,
            req.id
        );

        effects
            .run(Arc::clone(&self.images), Arc::clone(&self.caches))
            .await;

        let mut snapshot = current;
        snapshot.deleted = true;
        snapshot.deleted_at = Some(now);
        snapshot.updated_at = now;
        snapshot.version = fresh;
        Ok(MutationResult::ok(Entity::from_row(&snapshot)?))
    }

    /// Walk child kinds leaf-first, soft-deleting every live child, closing
    /// its history, and auditing it under the shared cascade root.
    async fn cascade_children<E: EntityDescriptor>(
        &self,
        txn: &mut dyn EngineTxn,
        ctx: &OperationContext,
        parent: &EntityRow,
        actor: &Actor,
        now: DateTime<Utc>,
        effects: &mut PostCommit,
    ) -> Result<()> {
        let boundary = self.quantizer.quantize(now);
        let filter = E::child_filter(&parent.id);
        for child_kind in E::CHILD_KINDS {
            let children = txn.list_children(*child_kind, &filter).await?;
            for child in children {
                if !txn.soft_delete_cascade(*child_kind, &child.id, now).await? {
                    continue;
                }
                if child_kind.history_table().is_some()
                    && txn.close_open_interval(*child_kind, &child.id, boundary).await? == 0
                {
                    txn.force_close_open_interval(*child_kind, &child.id).await?;
                }
                let entry = AuditEntry::new(
                    crate::model::generate_id(),
                    now,
                    actor,
                    format!(
                        "Deleted {} '{}' ({} '{}' was deleted)",
                        child_kind.label(),
                        child.name,
                        E::KIND.label(),
                        parent.name
                    ),
                    child.id.clone(),
                    AuditAction::Delete,
                )
                .with_snapshots(Some(child.attrs.clone()), Some(child.attrs.clone()))
                .with_deleted_transition(Some(false), Some(true))
                .with_cascade(ctx.child_link());
                txn.append_audit(*child_kind, &entry).await?;

                effects.orphaned_images.extend(child.image_ids());
                effects
                    .cache_keys
                    .extend(cache_keys_for(*child_kind, &child.id));
            }
        }
        Ok(())
    }
}

/// Typed per-entity operations over the shared engine.
pub struct EntityOps<'a, S: EngineStore, E: EntityDescriptor> {
    engine: &'a MutationEngine<S>,
    _marker: PhantomData<E>,
}

impl<'a, S: EngineStore, E: EntityDescriptor> EntityOps<'a, S, E> {
    fn new(engine: &'a MutationEngine<S>) -> Self {
        Self {
            engine,
            _marker: PhantomData,
        }
    }

    pub async fn create(
        &self,
        fields: E::Fields,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        self.engine.create::<E>(fields, actor).await
    }

    pub async fn update(
        &self,
        req: UpdateRequest<E::Fields>,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        self.engine.update::<E>(req, actor).await
    }

    pub async fn delete(
        &self,
        req: DeleteRequest,
        actor: &Actor,
    ) -> Result<MutationResult<E::Fields>> {
        self.engine.delete::<E>(req, actor).await
    }

    /// Fetch one entity, including soft-deleted rows.
    pub async fn get(&self, id: &Id) -> Result<Option<Entity<E::Fields>>> {
        match self.engine.store.get_entity(E::KIND, id).await? {
            Some(row) => Ok(Some(Entity::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// List live entities within a scope, ordered by creation time.
    pub async fn list(&self, scope: &Scope) -> Result<Vec<Entity<E::Fields>>> {
        let rows = self.engine.store.list_entities(E::KIND, scope).await?;
        rows.iter().map(Entity::from_row).collect()
    }

    pub async fn history(&self, id: &Id) -> Result<Vec<HistoryInterval>> {
        self.engine.store.list_history(E::KIND, id).await
    }

    pub async fn audit(&self, id: &Id) -> Result<Vec<AuditEntry>> {
        self.engine.store.list_audit(E::KIND, id).await
    }
}
