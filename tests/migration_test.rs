mod helpers;

use engram::engine::StoreRequest;
use engram::error::ErrorCode;
use engram::migration::state::MigrationPhase;
use helpers::test_engine;

async fn store_fact(engine: &engram::engine::Engine, statement: &str) -> String {
    engine
        .store(StoreRequest {
            memory_type: "fact".into(),
            content: serde_json::json!({ "statement": statement }),
            importance: Some(0.5),
            tags: None,
            source: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn start_enters_preparation_and_double_start_is_rejected() {
    let (engine, _dir) = test_engine().await;
    store_fact(&engine, "migration seed fact").await;

    let record = engine.migration_start("hash-8".into()).await.unwrap();
    assert_eq!(record.state, MigrationPhase::Preparation);
    assert_eq!(record.secondary_model.as_deref(), Some("hash-8"));
    assert_eq!(record.progress.total, 1);

    let err = engine.migration_start("hash-8".into()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn status_is_inactive_before_any_migration() {
    let (engine, _dir) = test_engine().await;
    let record = engine.migration_status().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Inactive);
    assert_eq!(record.primary_model, "hash-32");
}

#[tokio::test]
async fn dual_writes_populate_the_secondary_collection_from_shadow() {
    let (engine, _dir) = test_engine().await;

    engine.migration_start("hash-8".into()).await.unwrap();
    engine.migration_advance().await.unwrap(); // preparation -> shadow

    store_fact(&engine, "written during shadow phase").await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.index.vectors["primary"], 1);
    assert_eq!(stats.index.vectors["mig_hash_8"], 1);
}

#[tokio::test]
async fn advance_walks_shadow_canary_gradual() {
    let (engine, _dir) = test_engine().await;

    engine.migration_start("hash-8".into()).await.unwrap();
    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Shadow);
    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Canary);
    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Gradual);
}

#[tokio::test]
async fn gradual_to_full_blocked_until_covered() {
    let (engine, _dir) = test_engine().await;
    // Stored before migration: only in the primary collection
    store_fact(&engine, "pre-migration fact one").await;
    store_fact(&engine, "pre-migration fact two").await;

    engine.migration_start("hash-8".into()).await.unwrap();
    engine.migration_advance().await.unwrap(); // shadow
    engine.migration_advance().await.unwrap(); // canary
    engine.migration_advance().await.unwrap(); // gradual

    // Nothing has been re-embedded yet
    let err = engine.migration_advance().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);
    assert_eq!(
        engine.migration_status().await.unwrap().state,
        MigrationPhase::Gradual
    );
}

#[tokio::test]
async fn pause_blocks_advance_until_resume() {
    let (engine, _dir) = test_engine().await;

    engine.migration_start("hash-8".into()).await.unwrap();
    engine.migration_advance().await.unwrap(); // shadow

    let record = engine.migration_pause().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Paused);

    let err = engine.migration_advance().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);

    let record = engine.migration_resume().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Shadow);
    engine.migration_advance().await.unwrap();
}

#[tokio::test]
async fn rollback_drops_secondary_and_resets() {
    let (engine, _dir) = test_engine().await;
    store_fact(&engine, "surviving fact").await;

    engine.migration_start("hash-8".into()).await.unwrap();
    engine.migration_advance().await.unwrap(); // shadow

    let record = engine.migration_rollback().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Inactive);
    assert_eq!(record.last_failure_reason.as_deref(), Some("operator_request"));

    let stats = engine.stats().await.unwrap();
    assert!(!stats.index.vectors.contains_key("mig_hash_8"));
    assert_eq!(stats.index.vectors["primary"], 1);

    // Rolling back again violates the graph
    let err = engine.migration_rollback().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn storing_during_shadow_counts_as_migrated() {
    let (engine, _dir) = test_engine().await;

    engine.migration_start("hash-8".into()).await.unwrap();
    engine.migration_advance().await.unwrap(); // shadow
    engine.migration_advance().await.unwrap(); // canary
    engine.migration_advance().await.unwrap(); // gradual

    // Dual-written during the migration, so coverage is already complete and
    // the gate opens without any gradual batches
    store_fact(&engine, "dual written during migration").await;

    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Full);

    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Cleanup);
    assert_eq!(record.primary_model, "hash-8");

    let record = engine.migration_advance().await.unwrap();
    assert_eq!(record.state, MigrationPhase::Inactive);
    assert!(record.completed_at.is_some());

    // After cleanup the old primary collection is gone
    let stats = engine.stats().await.unwrap();
    assert!(!stats.index.vectors.contains_key("primary"));
    assert_eq!(stats.index.vectors["mig_hash_8"], 1);

    // Retrieval now serves from the new collection
    let response = engine
        .retrieve(engram::engine::RetrieveRequest {
            query: "dual written during migration".into(),
            limit: Some(1),
            types: None,
            min_similarity: None,
        })
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
}
