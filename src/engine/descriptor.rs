use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::model::{
    fold_natural_key, Actor, AuditAction, AuditEntry, BuildingFields, Dependent, DomainRow,
    EntityKind, EntityRow, FunctionFields, Id, MutationOutcome, OperationContext,
    OrganizationFields, RegionFields, Scope,
};
use crate::store::traits::{ChildFilter, EngineTxn};

/// Strategy parameterizing the generic mutation engine per entity type:
/// natural-key and scope extraction, tracked history attributes, sub-record
/// validation, in-use dependents, and cascade rules. The orchestration
/// protocol itself is shared; only these hooks differ between entity types.
#[async_trait::async_trait]
pub trait EntityDescriptor: Send + Sync + 'static {
    const KIND: EntityKind;

    /// Child kinds soft-deleted when this entity is deleted, leaf-first.
    const CHILD_KINDS: &'static [EntityKind] = &[];

    type Fields: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn name(fields: &Self::Fields) -> &str;

    fn scope(fields: &Self::Fields) -> Scope;

    /// The attribute snapshot recorded in history intervals.
    fn tracked(fields: &Self::Fields) -> serde_json::Value;

    fn child_filter(id: &Id) -> ChildFilter {
        ChildFilter::Parent(id.clone())
    }

    /// Referenced adjacent entities must exist, be live, and share the
    /// scope. Returns the abort outcome, or `None` when valid.
    async fn validate_sub_records(
        _txn: &mut dyn EngineTxn,
        _fields: &Self::Fields,
    ) -> Result<Option<MutationOutcome>> {
        Ok(None)
    }

    /// Records blocking deletion. Non-empty aborts with `RecordIsInUse`.
    async fn blocking_dependents(
        _txn: &mut dyn EngineTxn,
        _id: &Id,
    ) -> Result<Vec<Dependent>> {
        Ok(Vec::new())
    }

    /// Extra writes after the primary insert (still inside the transaction,
    /// audited under the same cascade root).
    async fn after_create(
        _txn: &mut dyn EngineTxn,
        _ctx: &OperationContext,
        _row: &EntityRow,
        _fields: &Self::Fields,
        _actor: &Actor,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    /// Keep derived child rows consistent after an update.
    async fn sync_on_update(
        _txn: &mut dyn EngineTxn,
        _row: &EntityRow,
        _old_fields: &Self::Fields,
        _new_fields: &Self::Fields,
    ) -> Result<()> {
        Ok(())
    }

    /// Extra cascade writes on delete, before child entities are walked.
    async fn cascade_extras(
        _txn: &mut dyn EngineTxn,
        _ctx: &OperationContext,
        _row: &EntityRow,
        _actor: &Actor,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }
}

async fn insert_domain_rows(
    txn: &mut dyn EngineTxn,
    ctx: &OperationContext,
    organization_id: &Id,
    organization_name: &str,
    domains: &[String],
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<()> {
    for domain in domains {
        let row = DomainRow::new(organization_id.clone(), domain.clone());
        txn.insert_domain(&row).await?;
        let entry = AuditEntry::new(
            crate::model::generate_id(),
            now,
            actor,
            format!(
                "Added domain '{}' to organization '{}'",
                domain, organization_name
            ),
            row.id.clone(),
            AuditAction::Insert,
        )
        .with_snapshots(None, Some(json!({ "domain": domain })))
        .with_cascade(ctx.child_link());
        txn.append_audit(EntityKind::Domain, &entry).await?;
    }
    Ok(())
}

pub struct OrganizationEntity;

#[async_trait::async_trait]
impl EntityDescriptor for OrganizationEntity {
    const KIND: EntityKind = EntityKind::Organization;
    // Leaf-first so functions close before the buildings they live in.
    const CHILD_KINDS: &'static [EntityKind] =
        &[EntityKind::Function, EntityKind::Building, EntityKind::Region];

    type Fields = OrganizationFields;

    fn name(fields: &Self::Fields) -> &str {
        &fields.name
    }

    fn scope(_fields: &Self::Fields) -> Scope {
        Scope::global()
    }

    fn tracked(fields: &Self::Fields) -> serde_json::Value {
        json!({
            "name": fields.name,
            "description": fields.description,
        })
    }

    fn child_filter(id: &Id) -> ChildFilter {
        ChildFilter::Organization(id.clone())
    }

    async fn validate_sub_records(
        _txn: &mut dyn EngineTxn,
        fields: &Self::Fields,
    ) -> Result<Option<MutationOutcome>> {
        let mut seen = std::collections::HashSet::new();
        for domain in &fields.email_domains {
            if !seen.insert(fold_natural_key(domain)) {
                return Ok(Some(MutationOutcome::SubRecordAlreadyExists));
            }
        }
        Ok(None)
    }

    async fn after_create(
        txn: &mut dyn EngineTxn,
        ctx: &OperationContext,
        row: &EntityRow,
        fields: &Self::Fields,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        insert_domain_rows(txn, ctx, &row.id, &fields.name, &fields.email_domains, actor, now)
            .await
    }

    async fn sync_on_update(
        txn: &mut dyn EngineTxn,
        row: &EntityRow,
        old_fields: &Self::Fields,
        new_fields: &Self::Fields,
    ) -> Result<()> {
        // Domain rows mirror the field list; the organization's Update audit
        // entry already captures the old and new lists.
        if old_fields.email_domains != new_fields.email_domains {
            txn.delete_domains(&row.id).await?;
            for domain in &new_fields.email_domains {
                txn.insert_domain(&DomainRow::new(row.id.clone(), domain.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cascade_extras(
        txn: &mut dyn EngineTxn,
        ctx: &OperationContext,
        row: &EntityRow,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let domains = txn.list_domains(&row.id).await?;
        txn.delete_domains(&row.id).await?;
        for domain in domains {
            let entry = AuditEntry::new(
                crate::model::generate_id(),
                now,
                actor,
                format!(
                    "Removed domain '{}' from organization '{}'",
                    domain.domain, row.name
                ),
                domain.id.clone(),
                AuditAction::Delete,
            )
            .with_snapshots(Some(json!({ "domain": domain.domain })), None)
            .with_cascade(ctx.child_link());
            txn.append_audit(EntityKind::Domain, &entry).await?;
        }
        Ok(())
    }
}

pub struct RegionEntity;

#[async_trait::async_trait]
impl EntityDescriptor for RegionEntity {
    const KIND: EntityKind = EntityKind::Region;

    type Fields = RegionFields;

    fn name(fields: &Self::Fields) -> &str {
        &fields.name
    }

    fn scope(fields: &Self::Fields) -> Scope {
        Scope::organization(fields.organization_id.clone())
    }

    fn tracked(fields: &Self::Fields) -> serde_json::Value {
        json!({ "name": fields.name })
    }

    async fn validate_sub_records(
        txn: &mut dyn EngineTxn,
        fields: &Self::Fields,
    ) -> Result<Option<MutationOutcome>> {
        let organization = txn
            .get_entity(EntityKind::Organization, &fields.organization_id)
            .await?;
        match organization {
            Some(org) if !org.deleted => Ok(None),
            _ => Ok(Some(MutationOutcome::SubRecordDidNotExist)),
        }
    }
}

pub struct BuildingEntity;

#[async_trait::async_trait]
impl EntityDescriptor for BuildingEntity {
    const KIND: EntityKind = EntityKind::Building;
    const CHILD_KINDS: &'static [EntityKind] = &[EntityKind::Function];

    type Fields = BuildingFields;

    fn name(fields: &Self::Fields) -> &str {
        &fields.name
    }

    fn scope(fields: &Self::Fields) -> Scope {
        Scope::organization(fields.organization_id.clone())
    }

    fn tracked(fields: &Self::Fields) -> serde_json::Value {
        json!({
            "name": fields.name,
            "region_id": fields.region_id,
            "timezone": fields.timezone,
        })
    }

    async fn validate_sub_records(
        txn: &mut dyn EngineTxn,
        fields: &Self::Fields,
    ) -> Result<Option<MutationOutcome>> {
        let organization = txn
            .get_entity(EntityKind::Organization, &fields.organization_id)
            .await?;
        if !matches!(organization, Some(ref org) if !org.deleted) {
            return Ok(Some(MutationOutcome::SubRecordDidNotExist));
        }
        if let Some(region_id) = &fields.region_id {
            let region = txn.get_entity(EntityKind::Region, region_id).await?;
            match region {
                None => return Ok(Some(MutationOutcome::SubRecordDidNotExist)),
                Some(region) if region.deleted => {
                    return Ok(Some(MutationOutcome::SubRecordDidNotExist))
                }
                Some(region)
                    if region.organization_id.as_ref() != Some(&fields.organization_id) =>
                {
                    return Ok(Some(MutationOutcome::SubRecordInvalid))
                }
                Some(_) => {}
            }
        }
        Ok(None)
    }
}

pub struct FunctionEntity;

#[async_trait::async_trait]
impl EntityDescriptor for FunctionEntity {
    const KIND: EntityKind = EntityKind::Function;

    type Fields = FunctionFields;

    fn name(fields: &Self::Fields) -> &str {
        &fields.name
    }

    fn scope(fields: &Self::Fields) -> Scope {
        Scope::parent(fields.organization_id.clone(), fields.building_id.clone())
    }

    fn tracked(fields: &Self::Fields) -> serde_json::Value {
        json!({
            "name": fields.name,
            "capacity": fields.capacity,
        })
    }

    async fn validate_sub_records(
        txn: &mut dyn EngineTxn,
        fields: &Self::Fields,
    ) -> Result<Option<MutationOutcome>> {
        let building = txn
            .get_entity(EntityKind::Building, &fields.building_id)
            .await?;
        match building {
            None => Ok(Some(MutationOutcome::SubRecordDidNotExist)),
            Some(building) if building.deleted => Ok(Some(MutationOutcome::SubRecordDidNotExist)),
            Some(building)
                if building.organization_id.as_ref() != Some(&fields.organization_id) =>
            {
                Ok(Some(MutationOutcome::SubRecordInvalid))
            }
            Some(_) => Ok(None),
        }
    }

    async fn blocking_dependents(txn: &mut dyn EngineTxn, id: &Id) -> Result<Vec<Dependent>> {
        txn.list_dependents(id).await
    }
}
