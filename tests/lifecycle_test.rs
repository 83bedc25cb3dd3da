mod helpers;

use engram::engine::{Engine, Lifecycle, RetrieveRequest, StoreRequest};
use engram::error::ErrorCode;
use helpers::{test_config, test_engine};

#[tokio::test]
async fn calls_before_warming_get_initializing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir));

    // starting: not even the transport handshake yet
    let err = engine
        .retrieve(RetrieveRequest {
            query: "anything".into(),
            limit: None,
            types: None,
            min_similarity: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Initializing);

    // transport_ready: tool list is served, engine still not warm
    engine.mark_transport_ready();
    assert_eq!(engine.lifecycle(), Lifecycle::TransportReady);
    let err = engine
        .store(StoreRequest {
            memory_type: "fact".into(),
            content: serde_json::json!({"statement": "too early"}),
            importance: None,
            tags: None,
            source: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Initializing);
}

#[tokio::test]
async fn warmed_engine_is_ready_and_drains_cleanly() {
    let (engine, _dir) = test_engine().await;
    assert_eq!(engine.lifecycle(), Lifecycle::Ready);

    engine
        .store(StoreRequest {
            memory_type: "fact".into(),
            content: serde_json::json!({"statement": "stored while ready"}),
            importance: None,
            tags: None,
            source: None,
        })
        .await
        .unwrap();

    engine.drain().await;
    assert_eq!(engine.lifecycle(), Lifecycle::Stopped);

    let err = engine
        .retrieve(RetrieveRequest {
            query: "anything".into(),
            limit: None,
            types: None,
            min_similarity: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
}

#[tokio::test]
async fn drain_flushes_pending_access_updates() {
    let (engine, _dir) = test_engine().await;

    let id = engine
        .store(StoreRequest {
            memory_type: "fact".into(),
            content: serde_json::json!({"statement": "flushed on drain"}),
            importance: None,
            tags: None,
            source: None,
        })
        .await
        .unwrap()
        .id;

    engine
        .retrieve(RetrieveRequest {
            query: "flushed on drain".into(),
            limit: Some(1),
            types: None,
            min_similarity: None,
        })
        .await
        .unwrap();

    // Drain must push the buffered access update out before stopping. Read
    // the count through a fresh engine over the same database.
    let config = engine.config().clone();
    engine.drain().await;

    let reopened = Engine::new(config);
    reopened.mark_transport_ready();
    reopened.warm().await.unwrap();
    let memory = reopened.get(id).await.unwrap();
    assert_eq!(memory.access_count, 1);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let id = {
        let engine = Engine::new(config.clone());
        engine.mark_transport_ready();
        engine.warm().await.unwrap();
        let id = engine
            .store(StoreRequest {
                memory_type: "fact".into(),
                content: serde_json::json!({"statement": "durable fact"}),
                importance: Some(0.9),
                tags: None,
                source: None,
            })
            .await
            .unwrap()
            .id;
        engine.drain().await;
        id
    };

    let engine = Engine::new(config);
    engine.mark_transport_ready();
    engine.warm().await.unwrap();

    let memory = engine.get(id.clone()).await.unwrap();
    assert!((memory.importance - 0.9).abs() < 1e-9);

    let response = engine
        .retrieve(RetrieveRequest {
            query: "durable fact".into(),
            limit: Some(1),
            types: None,
            min_similarity: None,
        })
        .await
        .unwrap();
    assert_eq!(response.results[0].memory.id, id);
}
