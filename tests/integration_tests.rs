/// Integration tests for the synchronization engine.
///
/// These exercise the public engine API end to end: mutation batches, the
/// conflict rule, the pull path with and without long-polling, and the push
/// stream.
use futures::StreamExt;
use scorecard_sync::{
    json, DeletePolicy, MutationOp, Op, SyncConfig, SyncEngine, SyncError, SyncStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_scorecard_scenario() {
    let engine = SyncEngine::start_in_memory().await.unwrap();

    let first = engine
        .mutate(
            "t1",
            "c1",
            vec![MutationOp::upsert("score", "5", json!({"strokes": 4}), 0)],
        )
        .await
        .unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.applied, 1);
    assert!(first.conflicts.is_empty());

    // A second client still believes the entity is new
    let second = engine
        .mutate(
            "t1",
            "c2",
            vec![MutationOp::upsert("score", "5", json!({"strokes": 5}), 0)],
        )
        .await
        .unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.conflicts.len(), 1);
    assert_eq!(second.conflicts[0].entity_type, "score");
    assert_eq!(second.conflicts[0].id, "5");
    assert_eq!(second.version, 1);

    let response = engine.sync("t1", 0, Duration::ZERO).await.unwrap();
    assert_eq!(response.changes.len(), 1);
    let change = &response.changes[0];
    assert_eq!(change.version, 1);
    assert_eq!(change.op, Op::Upsert);
    assert_eq!(change.client_id, "c1");
    assert_eq!(change.entity_type, "score");
    assert_eq!(change.entity_id, "5");
    assert_eq!(change.data, Some(json!({"strokes": 4})));

    let entity = engine.get_entity("t1", "score", "5").await.unwrap().unwrap();
    assert_eq!(entity.data, json!({"strokes": 4}));
    assert_eq!(entity.updated_by, "c1");
}

#[tokio::test]
async fn test_conflict_rule_with_current_base() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(3), 0)])
        .await
        .unwrap();
    let seen = engine
        .get_entity("t1", "score", "1")
        .await
        .unwrap()
        .unwrap()
        .updated_at;

    // Stale base is dropped
    let stale = engine
        .mutate(
            "t1",
            "c2",
            vec![MutationOp::upsert("score", "1", json!(9), seen - 1)],
        )
        .await
        .unwrap();
    assert_eq!(stale.applied, 0);
    assert_eq!(engine.current_version().await.unwrap(), 1);

    // Current base wins and produces exactly one entry
    let fresh = engine
        .mutate("t1", "c2", vec![MutationOp::upsert("score", "1", json!(4), seen)])
        .await
        .unwrap();
    assert_eq!(fresh.applied, 1);
    assert_eq!(fresh.version, 2);

    let entity = engine.get_entity("t1", "score", "1").await.unwrap().unwrap();
    assert_eq!(entity.data, json!(4));
    assert!(entity.updated_at > seen);

    let response = engine.sync("t1", 1, Duration::ZERO).await.unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].client_id, "c2");
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(1), 0)])
        .await
        .unwrap();

    let first = engine.sync("t1", 0, Duration::ZERO).await.unwrap();
    let again = engine.sync("t1", first.version, Duration::ZERO).await.unwrap();
    let third = engine.sync("t1", first.version, Duration::ZERO).await.unwrap();

    assert!(again.changes.is_empty());
    assert_eq!(again.version, first.version);
    assert_eq!(third, again);
}

#[tokio::test]
async fn test_global_versions_with_namespace_isolation() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    for (namespace, id) in [("t1", "a"), ("t2", "b"), ("t1", "c")] {
        engine
            .mutate(namespace, "c1", vec![MutationOp::upsert("score", id, json!(1), 0)])
            .await
            .unwrap();
    }

    let t1 = engine.sync("t1", 0, Duration::ZERO).await.unwrap();
    let versions: Vec<i64> = t1.changes.iter().map(|c| c.version).collect();
    assert_eq!(versions, vec![1, 3]);
    assert!(t1.changes.iter().all(|c| c.namespace == "t1"));
    assert_eq!(t1.version, 3);

    let t2 = engine.sync("t2", 0, Duration::ZERO).await.unwrap();
    assert_eq!(t2.changes.len(), 1);
    assert_eq!(t2.changes[0].version, 2);
    assert_eq!(t2.version, 2);

    // Caught up: cursor advances to the global version
    let t2_again = engine.sync("t2", 2, Duration::ZERO).await.unwrap();
    assert!(t2_again.changes.is_empty());
    assert_eq!(t2_again.version, 3);

    assert!(engine.get_entity("t2", "score", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_changes_after_cursor_in_ascending_order() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    let batch: Vec<MutationOp> = (0..10)
        .map(|i| MutationOp::upsert("score", i.to_string(), json!({"hole": i}), 0))
        .collect();
    engine.mutate("t1", "c1", batch).await.unwrap();

    let response = engine.sync("t1", 4, Duration::ZERO).await.unwrap();
    let versions: Vec<i64> = response.changes.iter().map(|c| c.version).collect();
    assert_eq!(versions, (5..=10).collect::<Vec<_>>());
    assert_eq!(response.version, 10);
}

#[tokio::test]
async fn test_delete_flow() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    engine
        .mutate(
            "t1",
            "c1",
            vec![
                MutationOp::upsert("team", "1", json!({"name": "Eagles"}), 0),
                MutationOp::upsert("team", "2", json!({"name": "Hawks"}), 0),
            ],
        )
        .await
        .unwrap();

    // Unconditional by default: a stale base still deletes
    let outcome = engine
        .mutate("t1", "c2", vec![MutationOp::delete("team", "1")])
        .await
        .unwrap();
    assert_eq!(outcome.applied, 1);

    let teams = engine.list_entities("t1", "team").await.unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].id, "2");

    let response = engine.sync("t1", 2, Duration::ZERO).await.unwrap();
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.changes[0].op, Op::Delete);
    assert_eq!(response.changes[0].data, None);

    // Deleting again has no effect
    let outcome = engine
        .mutate("t1", "c2", vec![MutationOp::delete("team", "1")])
        .await
        .unwrap();
    assert_eq!(outcome.applied, 0);
    assert!(outcome.conflicts.is_empty());
    assert_eq!(engine.current_version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_guarded_delete_respects_base() {
    let engine = SyncEngine::start_in_memory_with(
        SyncConfig::default().with_delete_policy(DeletePolicy::Guarded),
    )
    .await
    .unwrap();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("team", "1", json!(1), 0)])
        .await
        .unwrap();
    let current = engine
        .get_entity("t1", "team", "1")
        .await
        .unwrap()
        .unwrap()
        .updated_at;

    let stale = engine
        .mutate("t1", "c2", vec![MutationOp::delete("team", "1").with_base(current - 1)])
        .await
        .unwrap();
    assert_eq!(stale.applied, 0);
    assert_eq!(stale.conflicts.len(), 1);

    let fresh = engine
        .mutate("t1", "c2", vec![MutationOp::delete("team", "1").with_base(current)])
        .await
        .unwrap();
    assert_eq!(fresh.applied, 1);
    assert!(engine.get_entity("t1", "team", "1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_batch_has_no_effect() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    let result = engine
        .mutate(
            "t1",
            "c1",
            vec![
                MutationOp::upsert("score", "1", json!(1), 0),
                MutationOp::upsert("score", "2", json!(2), 0),
                MutationOp::upsert("score", "", json!(3), 0),
            ],
        )
        .await;

    match result {
        Err(SyncError::InvalidMutation { index, .. }) => assert_eq!(index, 2),
        other => panic!("expected invalid mutation, got {:?}", other),
    }
    assert_eq!(engine.current_version().await.unwrap(), 0);
    assert!(engine.list_entities("t1", "score").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_storage_failure_rolls_back_batch() {
    let conn = scorecard_sync::schema::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_third BEFORE INSERT ON entities
         WHEN NEW.entity_id = 'c'
         BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
    )
    .unwrap();
    let store = Arc::new(SyncStore::from_connection(conn));
    let engine = SyncEngine::from_store(store, SyncConfig::default());
    let mut events = Box::pin(engine.events("t1"));

    let result = engine
        .mutate(
            "t1",
            "c1",
            vec![
                MutationOp::upsert("score", "a", json!(1), 0),
                MutationOp::upsert("score", "b", json!(2), 0),
                MutationOp::upsert("score", "c", json!(3), 0),
            ],
        )
        .await;
    assert!(matches!(result, Err(SyncError::Sqlite(_))));

    assert_eq!(engine.current_version().await.unwrap(), 0);
    assert!(engine.list_entities("t1", "score").await.unwrap().is_empty());
    assert!(engine.sync("t1", 0, Duration::ZERO).await.unwrap().changes.is_empty());

    // Nothing committed, nothing announced
    tokio::select! {
        version = events.next() => panic!("Unexpected notification {:?}", version),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }
}

#[tokio::test]
async fn test_long_poll_timeout() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(1), 0)])
        .await
        .unwrap();
    let cursor = engine.current_version().await.unwrap();

    let start = Instant::now();
    let response = engine
        .sync("t1", cursor, Duration::from_secs(1))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
    assert!(response.changes.is_empty());
    assert_eq!(response.version, cursor);
    assert_eq!(engine.broadcaster().subscriber_count("t1"), 0);
}

#[tokio::test]
async fn test_long_poll_wakes_on_mutation() {
    let engine = SyncEngine::start_in_memory().await.unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync("t1", 0, Duration::from_secs(10)).await })
    };
    while engine.broadcaster().subscriber_count("t1") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let start = Instant::now();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(1), 0)])
        .await
        .unwrap();
    let response = waiter.await.unwrap().unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(response.changes.len(), 1);
    assert_eq!(response.version, 1);
}

#[tokio::test]
async fn test_cancelled_long_poll_releases_subscription() {
    let engine = SyncEngine::start_in_memory().await.unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync("t1", 0, Duration::from_secs(30)).await })
    };
    while engine.broadcaster().subscriber_count("t1") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(engine.broadcaster().subscriber_count("t1"), 0);
}

#[tokio::test]
async fn test_long_poll_ignores_other_namespaces() {
    let engine = SyncEngine::start_in_memory().await.unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync("t2", 0, Duration::from_millis(500)).await })
    };
    while engine.broadcaster().subscriber_count("t2") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let start = Instant::now();
    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(1), 0)])
        .await
        .unwrap();
    let response = waiter.await.unwrap().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(response.changes.is_empty());
}

#[tokio::test]
async fn test_wait_is_capped_by_config() {
    let config = SyncConfig {
        max_wait: Duration::from_millis(300),
        ..SyncConfig::default()
    };
    let engine = SyncEngine::start_in_memory_with(config).await.unwrap();

    let start = Instant::now();
    let response = engine.sync("t1", 0, Duration::from_secs(60)).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(response.changes.is_empty());
}

#[tokio::test]
async fn test_event_stream_receives_versions() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    let mut events = Box::pin(engine.events("t1"));
    let mut other = Box::pin(engine.events("t2"));

    engine
        .mutate(
            "t1",
            "c1",
            vec![
                MutationOp::upsert("score", "1", json!(1), 0),
                MutationOp::upsert("score", "2", json!(2), 0),
            ],
        )
        .await
        .unwrap();

    // One notification per batch, carrying the batch's last version
    tokio::select! {
        version = events.next() => assert_eq!(version, Some(2)),
        _ = tokio::time::sleep(Duration::from_millis(500)) => {
            panic!("Should have received event");
        }
    }
    tokio::select! {
        version = other.next() => panic!("t2 should not be notified, got {:?}", version),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }

    drop(events);
    drop(other);
    assert_eq!(engine.broadcaster().total_subscribers(), 0);
}

#[tokio::test]
async fn test_event_stream_outlives_its_arguments() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    let mut events = {
        let handle = engine.clone();
        let namespace = String::from("t1");
        Box::pin(handle.events(&namespace))
    };

    engine
        .mutate("t1", "c1", vec![MutationOp::upsert("score", "1", json!(1), 0)])
        .await
        .unwrap();

    let version = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap();
    assert_eq!(version, Some(1));
}

#[tokio::test]
async fn test_concurrent_writers_get_unique_versions() {
    let engine = SyncEngine::start_in_memory().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let client = format!("c{}", i);
            engine
                .mutate(
                    "t1",
                    &client,
                    vec![MutationOp::upsert("score", i.to_string(), json!(i), 0)],
                )
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().applied, 1);
    }

    let response = engine.sync("t1", 0, Duration::ZERO).await.unwrap();
    let versions: Vec<i64> = response.changes.iter().map(|c| c.version).collect();
    assert_eq!(versions, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_racing_writers_on_same_base() {
    let engine = SyncEngine::start_in_memory().await.unwrap();
    engine
        .mutate("t1", "c0", vec![MutationOp::upsert("score", "1", json!(0), 0)])
        .await
        .unwrap();
    let base = engine
        .get_entity("t1", "score", "1")
        .await
        .unwrap()
        .unwrap()
        .updated_at;

    let mut handles = Vec::new();
    for i in 1..=5 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let client = format!("c{}", i);
            engine
                .mutate("t1", &client, vec![MutationOp::upsert("score", "1", json!(i), base)])
                .await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        winners += handle.await.unwrap().unwrap().applied;
    }

    assert_eq!(winners, 1);
    assert_eq!(engine.current_version().await.unwrap(), 2);
}
