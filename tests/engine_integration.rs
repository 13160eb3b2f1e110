use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use workplace_db::engine::{build_lock_key, end_of_time};
use workplace_db::{
    Actor, BuildingFields, CacheKey, DeleteRequest, EntityKind, FunctionFields, ManualClock,
    MemoryCacheInvalidator, MemoryImageService, MemoryStore, MutationEngine, MutationOutcome,
    OrganizationFields, RegionFields, Scope, UpdateRequest,
};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    images: Arc<MemoryImageService>,
    caches: Arc<MemoryCacheInvalidator>,
    engine: MutationEngine<MemoryStore>,
}

fn base_time() -> chrono::DateTime<Utc> {
    // 10:07, inside the 10:00 quarter-hour bucket.
    Utc.with_ymd_and_hms(2026, 1, 5, 10, 7, 0).unwrap()
}

fn bucket(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).unwrap()
}

fn harness() -> Harness {
    workplace_db::init_logging();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(base_time()));
    let images = Arc::new(MemoryImageService::new());
    let caches = Arc::new(MemoryCacheInvalidator::new());
    let engine = MutationEngine::new(Arc::clone(&store), images.clone(), caches.clone())
        .with_clock(clock.clone());
    Harness {
        store,
        clock,
        images,
        caches,
        engine,
    }
}

fn actor() -> Actor {
    Actor::user("u1", "Test User")
}

async fn create_org(h: &Harness, name: &str) -> workplace_db::Entity<OrganizationFields> {
    let result = h
        .engine
        .organizations()
        .create(OrganizationFields::new(name), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
    result.entity.unwrap()
}

async fn create_building(
    h: &Harness,
    org_id: &str,
    name: &str,
) -> workplace_db::Entity<BuildingFields> {
    let result = h
        .engine
        .buildings()
        .create(BuildingFields::new(org_id, name), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
    result.entity.unwrap()
}

#[tokio::test]
async fn create_returns_snapshot_with_fresh_token() {
    let h = harness();
    let org = create_org(&h, "Acme").await;

    assert_eq!(org.fields.name, "Acme");
    assert!(!org.deleted);
    assert_eq!(org.version.as_str().len(), 16);

    let fetched = h.engine.organizations().get(&org.id).await.unwrap().unwrap();
    assert_eq!(fetched.version, org.version);
}

#[tokio::test]
async fn duplicate_name_in_same_scope_is_rejected_case_insensitively() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    create_building(&h, &org.id, "HQ").await;

    let result = h
        .engine
        .buildings()
        .create(BuildingFields::new(&org.id, "  hq "), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::RecordAlreadyExists);
    assert!(result.entity.is_none());

    // Same name under another organization is a different natural key.
    let other = create_org(&h, "Globex").await;
    let result = h
        .engine
        .buildings()
        .create(BuildingFields::new(&other.id, "HQ"), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
}

#[tokio::test]
async fn concurrent_creates_of_one_key_resolve_to_a_single_winner() {
    let h = harness();
    let org = create_org(&h, "Acme").await;

    let engine = Arc::new(h.engine);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let org_id = org.id.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .buildings()
                .create(BuildingFields::new(&org_id, "HQ"), &actor())
                .await
                .unwrap()
                .outcome
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for task in tasks {
        match task.await.unwrap() {
            MutationOutcome::Ok => winners += 1,
            MutationOutcome::RecordAlreadyExists => losers += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 7);

    let buildings = engine
        .buildings()
        .list(&Scope::organization(org.id.clone()))
        .await
        .unwrap();
    assert_eq!(buildings.len(), 1);
}

#[tokio::test]
async fn stale_version_token_loses_the_write() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let region = h
        .engine
        .regions()
        .create(RegionFields::new(&org.id, "North"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();
    let first_token = region.version.clone();

    let winner = h
        .engine
        .regions()
        .update(
            UpdateRequest {
                id: region.id.clone(),
                version: first_token.clone(),
                fields: RegionFields::new(&org.id, "North").with_description("first writer"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(winner.outcome, MutationOutcome::Ok);
    let winning_token = winner.entity.unwrap().version;
    assert_ne!(winning_token, first_token);

    // The loser still holds the original token.
    let loser = h
        .engine
        .regions()
        .update(
            UpdateRequest {
                id: region.id.clone(),
                version: first_token,
                fields: RegionFields::new(&org.id, "North").with_description("second writer"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(loser.outcome, MutationOutcome::ConcurrencyKeyInvalid);

    // Retrying with the winning token succeeds.
    let retry = h
        .engine
        .regions()
        .update(
            UpdateRequest {
                id: region.id.clone(),
                version: winning_token,
                fields: RegionFields::new(&org.id, "North").with_description("second writer"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(retry.outcome, MutationOutcome::Ok);
}

#[tokio::test]
async fn update_of_unknown_or_deleted_record_reports_did_not_exist() {
    let h = harness();
    let org = create_org(&h, "Acme").await;

    let result = h
        .engine
        .regions()
        .update(
            UpdateRequest {
                id: "missing".to_string(),
                version: workplace_db::VersionToken::fresh(),
                fields: RegionFields::new(&org.id, "North"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::RecordDidNotExist);

    let region = h
        .engine
        .regions()
        .create(RegionFields::new(&org.id, "North"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();
    let deleted = h
        .engine
        .regions()
        .delete(
            DeleteRequest {
                id: region.id.clone(),
                version: region.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.outcome, MutationOutcome::Ok);

    let result = h
        .engine
        .regions()
        .update(
            UpdateRequest {
                id: region.id.clone(),
                version: deleted.entity.unwrap().version,
                fields: RegionFields::new(&org.id, "North"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::RecordDidNotExist);
}

#[tokio::test]
async fn function_with_desks_cannot_be_deleted() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let building = create_building(&h, &org.id, "HQ").await;
    let function = h
        .engine
        .functions()
        .create(
            FunctionFields::new(&org.id, &building.id, "Desk Zone").with_capacity(12),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();

    h.store.add_desk(&function.id, "d1", "Desk 1");
    h.store.add_desk(&function.id, "d2", "Desk 2");

    let result = h
        .engine
        .functions()
        .delete(
            DeleteRequest {
                id: function.id.clone(),
                version: function.version.clone(),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::RecordIsInUse);
    let in_use = result.in_use.unwrap();
    assert_eq!(in_use.len(), 2);
    assert_eq!(in_use[0].display_name, "Desk 1");
    assert_eq!(in_use[1].display_name, "Desk 2");

    // The row is untouched and no audit entry was written for the attempt.
    let fetched = h.engine.functions().get(&function.id).await.unwrap().unwrap();
    assert!(!fetched.deleted);
    assert_eq!(fetched.version, function.version);
    let audit = h.engine.functions().audit(&function.id).await.unwrap();
    assert_eq!(audit.len(), 1);

    h.store.clear_desks(&function.id);
    let result = h
        .engine
        .functions()
        .delete(
            DeleteRequest {
                id: function.id.clone(),
                version: function.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
}

#[tokio::test]
async fn rename_splits_history_at_the_bucket_boundary() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let building = create_building(&h, &org.id, "HQ").await;

    h.clock.advance(Duration::minutes(13)); // 10:20, next bucket
    let result = h
        .engine
        .buildings()
        .update(
            UpdateRequest {
                id: building.id.clone(),
                version: building.version,
                fields: BuildingFields::new(&org.id, "HQ2"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);

    let history = h.engine.buildings().history(&building.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].valid_from, bucket(10, 0));
    assert_eq!(history[0].valid_to, bucket(10, 15));
    assert_eq!(history[0].attrs["name"], "HQ");
    assert_eq!(history[1].valid_from, bucket(10, 15));
    assert_eq!(history[1].valid_to, end_of_time());
    assert_eq!(history[1].attrs["name"], "HQ2");

    let audit = h.engine.buildings().audit(&building.id).await.unwrap();
    assert_eq!(audit.len(), 2);
    let update = &audit[1];
    assert_eq!(update.description, "Renamed Building 'HQ' to 'HQ2'");
    assert_eq!(update.old_attrs.as_ref().unwrap()["name"], "HQ");
    assert_eq!(update.new_attrs.as_ref().unwrap()["name"], "HQ2");
    assert_eq!(update.old_deleted, Some(false));
    assert_eq!(update.new_deleted, Some(false));
}

#[tokio::test]
async fn updates_within_one_bucket_collapse_into_a_single_interval() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let building = create_building(&h, &org.id, "HQ").await;

    h.clock.advance(Duration::minutes(3)); // 10:10, same bucket
    let result = h
        .engine
        .buildings()
        .update(
            UpdateRequest {
                id: building.id.clone(),
                version: building.version,
                fields: BuildingFields::new(&org.id, "HQ").with_timezone("Europe/Oslo"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);

    let history = h.engine.buildings().history(&building.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].valid_from, bucket(10, 0));
    assert_eq!(history[0].valid_to, end_of_time());
    assert_eq!(history[0].attrs["timezone"], "Europe/Oslo");
}

#[tokio::test]
async fn delete_in_the_creation_bucket_leaves_no_open_interval() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let building = create_building(&h, &org.id, "HQ").await;

    h.clock.advance(Duration::minutes(1));
    let result = h
        .engine
        .buildings()
        .delete(
            DeleteRequest {
                id: building.id.clone(),
                version: building.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
    assert!(result.entity.unwrap().deleted);

    let history = h.engine.buildings().history(&building.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].valid_to, history[0].valid_from);
}

#[tokio::test]
async fn delete_closes_history_at_the_current_boundary() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let building = create_building(&h, &org.id, "HQ").await;

    h.clock.advance(Duration::minutes(40)); // 10:47, bucket 10:45
    let result = h
        .engine
        .buildings()
        .delete(
            DeleteRequest {
                id: building.id.clone(),
                version: building.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);

    let history = h.engine.buildings().history(&building.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].valid_from, bucket(10, 0));
    assert_eq!(history[0].valid_to, bucket(10, 45));
}

#[tokio::test]
async fn lock_contention_yields_unknown_and_is_retryable() {
    let h = harness();
    let org = create_org(&h, "Acme").await;

    let key = build_lock_key(
        EntityKind::Building,
        &Scope::organization(org.id.clone()),
        "HQ",
    );
    let guard = h.store.hold_lock(key).unwrap();

    let result = h
        .engine
        .buildings()
        .create(BuildingFields::new(&org.id, "HQ"), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Unknown);
    assert!(h
        .engine
        .buildings()
        .get(&"missing".to_string())
        .await
        .unwrap()
        .is_none());

    drop(guard);
    let result = h
        .engine
        .buildings()
        .create(BuildingFields::new(&org.id, "HQ"), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);
}

#[tokio::test]
async fn sub_record_validation_outcomes() {
    let h = harness();

    // Region pointing at a missing organization.
    let result = h
        .engine
        .regions()
        .create(RegionFields::new("no-such-org", "North"), &actor())
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::SubRecordDidNotExist);

    // Building referencing a region of a different organization.
    let org = create_org(&h, "Acme").await;
    let other = create_org(&h, "Globex").await;
    let region = h
        .engine
        .regions()
        .create(RegionFields::new(&other.id, "North"), &actor())
        .await
        .unwrap()
        .entity
        .unwrap();
    let result = h
        .engine
        .buildings()
        .create(
            BuildingFields::new(&org.id, "HQ").in_region(&region.id),
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::SubRecordInvalid);

    // Function referencing a deleted building.
    let building = create_building(&h, &org.id, "Annex").await;
    h.engine
        .buildings()
        .delete(
            DeleteRequest {
                id: building.id.clone(),
                version: building.version,
            },
            &actor(),
        )
        .await
        .unwrap();
    let result = h
        .engine
        .functions()
        .create(
            FunctionFields::new(&org.id, &building.id, "Desk Zone"),
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::SubRecordDidNotExist);
}

#[tokio::test]
async fn replaced_images_are_deleted_and_caches_invalidated_after_update() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    h.images.store("img-old");
    h.images.store("img-new");

    let building = h
        .engine
        .buildings()
        .create(
            BuildingFields::new(&org.id, "HQ")
                .with_timezone("Europe/Stockholm")
                .with_map_image("img-old"),
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();

    let result = h
        .engine
        .buildings()
        .update(
            UpdateRequest {
                id: building.id.clone(),
                version: building.version,
                fields: BuildingFields::new(&org.id, "HQ")
                    .with_timezone("Europe/Oslo")
                    .with_map_image("img-new"),
            },
            &actor(),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, MutationOutcome::Ok);

    assert_eq!(h.images.deletion_log(), vec!["img-old".to_string()]);
    assert!(!h.images.contains(&"img-old".to_string()));
    assert!(h.images.contains(&"img-new".to_string()));
    assert!(h
        .caches
        .invalidated()
        .contains(&CacheKey::BuildingTimezone(building.id.clone())));
}

#[tokio::test]
async fn every_write_regenerates_the_version_token() {
    let h = harness();
    let org = create_org(&h, "Acme").await;
    let created = create_building(&h, &org.id, "HQ").await;

    let updated = h
        .engine
        .buildings()
        .update(
            UpdateRequest {
                id: created.id.clone(),
                version: created.version.clone(),
                fields: BuildingFields::new(&org.id, "HQ").with_address("1 Main St"),
            },
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    assert_ne!(updated.version, created.version);

    let deleted = h
        .engine
        .buildings()
        .delete(
            DeleteRequest {
                id: created.id.clone(),
                version: updated.version.clone(),
            },
            &actor(),
        )
        .await
        .unwrap()
        .entity
        .unwrap();
    assert_ne!(deleted.version, updated.version);
    assert_ne!(deleted.version, created.version);
}
