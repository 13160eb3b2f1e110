use std::sync::Arc;

use chrono::{TimeZone, Utc};

use workplace_db::engine::CascadeContext;
use workplace_db::{
    Actor, AuditAction, BuildingFields, CacheKey, DeleteRequest, EngineStore, EntityKind,
    FunctionFields, ImageService, ManualClock, MemoryCacheInvalidator, MemoryImageService,
    MemoryStore, MutationEngine, MutationOutcome, OrganizationFields, RegionFields, UpdateRequest,
};

struct Harness {
    store: Arc<MemoryStore>,
    images: Arc<MemoryImageService>,
    caches: Arc<MemoryCacheInvalidator>,
    engine: MutationEngine<MemoryStore>,
}

fn harness() -> Harness {
    workplace_db::init_logging();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 7, 0).unwrap(),
    ));
    let images = Arc::new(MemoryImageService::new());
    let caches = Arc::new(MemoryCacheInvalidator::new());
    let engine =
        MutationEngine::new(Arc::clone(&store), images.clone(), caches.clone()).with_clock(clock);
    Harness {
        store,
        images,
        caches,
        engine,
    }
}

fn actor() -> Actor {
    Actor::user("u1", "Test User").with_address("10.0.0.1")
}

/// Organization with one region, one building in that region, and one
/// function in that building.
async fn seed_tree(h: &Harness) -> (String, String, String, String) {
    let org = h
        .engine
        .organizations()
        .create(
            OrganizationFields::new("Acme")
                .with_domains(vec!["acme.com".to_string()])
                .with_logo("logo-1"),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    let region = h
        .engine
        .regions()
        .create(RegionFields::new(&org.id, "North"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();
    let building = h
        .engine
        .buildings()
        .create(
            BuildingFields::new(&org.id, "HQ")
                .in_region(&region.id)
                .with_timezone("Europe/Stockholm")
                .with_map_image("map-1"),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    let function = h
        .engine
        .functions()
        .create(
            FunctionFields::new(&org.id, &building.id, "Desk Zone"),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    (org.id, region.id, building.id, function.id)
}

async fn delete_org(h: &Harness, org_id: &str) {
    let org = h
        .engine
        .organizations()
        .get(&org_id.to_string())
        .await
        .unwrap()
        .unwrap();
    let result = h
        .engine
        .organizations()
        .delete(
            DeleteRequest {
                id: org.id,
                version: org.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
    assert!(result.entity.unwrap().deleted);
}

fn root_log_id(entries: &[workplace_db::AuditEntry]) -> String {
    entries
        .iter()
        .find(|e| e.action == AuditAction::Delete)
        .map(|e| e.log_id.clone())
        .unwrap()
}

#[tokio::test]
async fn organization_delete_cascades_through_the_whole_tree() {
    let h = harness();
    let (org_id, region_id, building_id, function_id) = seed_tree(&h).await;

    delete_org(&h, &org_id).await;

    let region = h.engine.regions().get(&region_id).await.unwrap().unwrap();
    assert!(region.deleted);
    let building = h.engine.buildings().get(&building_id).await.unwrap().unwrap();
    assert!(building.deleted);
    let function = h.engine.functions().get(&function_id).await.unwrap().unwrap();
    assert!(function.deleted);
    assert!(h.store.list_domains(&org_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cascade_audit_entries_share_one_root() {
    let h = harness();
    let (org_id, _, _, _) = seed_tree(&h).await;

    delete_org(&h, &org_id).await;

    let org_audit = h.engine.organizations().audit(&org_id).await.unwrap();
    let root = root_log_id(&org_audit);

    // Root plus one region, one building, one function, one email domain.
    let linked = h.store.list_cascade(&root);
    assert_eq!(linked.len(), 5);

    let count = |kind: EntityKind| linked.iter().filter(|(k, _)| *k == kind).count();
    assert_eq!(count(EntityKind::Organization), 1);
    assert_eq!(count(EntityKind::Region), 1);
    assert_eq!(count(EntityKind::Building), 1);
    assert_eq!(count(EntityKind::Function), 1);
    assert_eq!(count(EntityKind::Domain), 1);

    for (kind, entry) in &linked {
        assert_eq!(entry.action, AuditAction::Delete);
        if *kind == EntityKind::Organization {
            assert!(entry.cascade.is_none());
        } else {
            let link = entry.cascade.as_ref().unwrap();
            assert_eq!(link.root_log_id, root);
            assert_eq!(link.parent_kind, "Organization");
        }
    }
}

#[tokio::test]
async fn child_deletion_history_is_closed_by_the_cascade() {
    let h = harness();
    let (org_id, _, building_id, _) = seed_tree(&h).await;

    delete_org(&h, &org_id).await;

    let history = h.engine.buildings().history(&building_id).await.unwrap();
    assert_eq!(history.len(), 1);
    // Deleted inside its creation bucket, so the interval collapses.
    assert_eq!(history[0].valid_to, history[0].valid_from);
}

#[tokio::test]
async fn email_domains_are_created_and_audited_with_the_organization() {
    let h = harness();
    let org = h
        .engine
        .organizations()
        .create(
            OrganizationFields::new("Acme")
                .with_domains(vec!["acme.com".to_string(), "acme.se".to_string()]),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();

    let domains = h.store.list_domains(&org.id).await.unwrap();
    assert_eq!(domains.len(), 2);
    assert!(domains.iter().all(|d| d.organization_id == org.id));

    let org_audit = h.engine.organizations().audit(&org.id).await.unwrap();
    assert_eq!(org_audit.len(), 1);
    let root = org_audit[0].log_id.clone();

    let linked = h.store.list_cascade(&root);
    assert_eq!(linked.len(), 3);
    let domain_entries: Vec<_> = linked
        .iter()
        .filter(|(k, _)| *k == EntityKind::Domain)
        .collect();
    assert_eq!(domain_entries.len(), 2);
    for (_, entry) in &domain_entries {
        assert_eq!(entry.action, AuditAction::Insert);
        assert_eq!(entry.cascade.as_ref().unwrap().root_log_id, root);
    }
}

#[tokio::test]
async fn duplicate_email_domains_in_one_request_are_rejected() {
    let h = harness();
    let result = h
        .engine
        .organizations()
        .create(
            OrganizationFields::new("Acme")
                .with_domains(vec!["acme.com".to_string(), "ACME.COM".to_string()]),
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::SubRecordAlreadyExists);
    assert!(result.entity.is_none());

    // The same check guards updates.
    let org = h
        .engine
        .organizations()
        .create(
            OrganizationFields::new("Acme").with_domains(vec!["acme.com".to_string()]),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    let result = h
        .engine
        .organizations()
        .update(
            UpdateRequest {
                id: org.id.clone(),
                version: org.version,
                fields: OrganizationFields::new("Acme")
                    .with_domains(vec!["acme.io".to_string(), "acme.io".to_string()]),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::SubRecordAlreadyExists);
    let domains = h.store.list_domains(&org.id).await.unwrap();
    assert_eq!(domains.len(), 1);
    assert_eq!(domains[0].domain, "acme.com");
}

#[tokio::test]
async fn changing_email_domains_resyncs_rows_without_domain_audits() {
    let h = harness();
    let org = h
        .engine
        .organizations()
        .create(
            OrganizationFields::new("Acme").with_domains(vec!["acme.com".to_string()]),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();

    let result = h
        .engine
        .organizations()
        .update(
            UpdateRequest {
                id: org.id.clone(),
                version: org.version,
                fields: OrganizationFields::new("Acme")
                    .with_domains(vec!["acme.io".to_string()]),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);

    let domains = h.store.list_domains(&org.id).await.unwrap();
    assert_eq!(domains.len(), 1);
    assert_eq!(domains[0].domain, "acme.io");

    // The update itself is the only entry of its operation.
    let org_audit = h.engine.organizations().audit(&org.id).await.unwrap();
    let update_root = org_audit
        .iter()
        .find(|e| e.action == AuditAction::Update)
        .map(|e| e.log_id.clone())
        .unwrap();
    assert_eq!(h.store.list_cascade(&update_root).len(), 1);
}

#[tokio::test]
async fn cascade_is_confined_to_the_deleted_organization() {
    let h = harness();
    let (org_id, _, _, _) = seed_tree(&h).await;
    let other = h
        .engine
        .organizations()
        .create(OrganizationFields::new("Globex"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();
    let other_building = h
        .engine
        .buildings()
        .create(BuildingFields::new(&other.id, "HQ"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();

    delete_org(&h, &org_id).await;

    let fetched = h
        .engine
        .buildings()
        .get(&other_building.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!fetched.deleted);
}

#[tokio::test]
async fn desks_block_direct_deletion_only_never_the_cascade() {
    let h = harness();
    let (org_id, _, _, function_id) = seed_tree(&h).await;
    h.store.add_desk(&function_id, "d1", "Desk 1");

    delete_org(&h, &org_id).await;

    let function = h.engine.functions().get(&function_id).await.unwrap().unwrap();
    assert!(function.deleted);
}

#[tokio::test]
async fn cascade_cleans_orphaned_images_and_derived_caches() {
    let h = harness();
    h.images.store("logo-1");
    h.images.store("map-1");
    let (org_id, _, building_id, _) = seed_tree(&h).await;

    delete_org(&h, &org_id).await;

    let deleted = h.images.deletion_log();
    assert!(deleted.contains(&"logo-1".to_string()));
    assert!(deleted.contains(&"map-1".to_string()));
    assert!(h
        .caches
        .invalidated()
        .contains(&CacheKey::BuildingTimezone(building_id)));
}

#[tokio::test]
async fn deleting_an_already_orphaned_image_is_reported_not_failed() {
    let h = harness();
    h.images.store("map-1");
    let (org_id, _, _, _) = seed_tree(&h).await;

    // Something else already removed the file.
    let outcome = h
        .images
        .delete_image(&"map-1".to_string(), &CascadeContext::default())
        .await
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Ok);

    // The cascade requests the deletion again and the operation still
    // succeeds end to end.
    delete_org(&h, &org_id).await;
    let log = h.images.deletion_log();
    assert!(log.iter().filter(|id| id.as_str() == "map-1").count() >= 2);
}
