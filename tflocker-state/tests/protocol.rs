use std::sync::Arc;
use std::time::Duration;

use tflocker_state::{
    Ledger, LedgerTransaction, LockToken, MemoryLedger, PostgresLedger, StateError, StateKey,
    StateStore,
};

const STATE_ID: &str = "0d3c6f7a-2b8e-4f61-9c1d-7a5e4b3f2a10";

fn memory_store() -> (MemoryLedger, StateStore) {
    let ledger = MemoryLedger::new();
    (ledger.clone(), StateStore::new(Arc::new(ledger)))
}

#[tokio::test]
async fn test_lock_write_unlock_scenario() {
    let (ledger, store) = memory_store();
    let key = StateKey::parse("env", STATE_ID).unwrap();
    let tok1 = LockToken::new("tok1");

    store.acquire_lock(&key, &tok1).await.unwrap();
    store.write(&key, &tok1, b"data").await.unwrap();

    let result = store.write(&key, &LockToken::none(), b"x").await;
    assert!(matches!(result, Err(StateError::Conflict { .. })));

    store.release_lock(&key, &tok1).await.unwrap();
    assert_eq!(store.read(&key).await.unwrap(), b"data");

    // The placeholder row from the lock keeps its token; unlock clears the current row
    let versions = ledger.versions(&key).await;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].lock_token.as_deref(), Some("tok1"));
    assert_eq!(versions[1].lock_token, None);
}

#[tokio::test]
async fn test_nth_write_is_version_n() {
    let (ledger, store) = memory_store();
    let key = StateKey::parse("env", STATE_ID).unwrap();

    for n in 1..=10 {
        let blob = format!("{{\"serial\":{}}}", n);
        store
            .write(&key, &LockToken::none(), blob.as_bytes())
            .await
            .unwrap();

        let versions = ledger.versions(&key).await;
        assert_eq!(versions.last().unwrap().version, n);
        assert_eq!(store.read(&key).await.unwrap(), blob.as_bytes());
    }
}

#[tokio::test]
async fn test_keys_are_independent() {
    let (_, store) = memory_store();
    let env = StateKey::parse("env", STATE_ID).unwrap();
    let other = StateKey::parse("other", STATE_ID).unwrap();

    store
        .acquire_lock(&env, &LockToken::new("tok1"))
        .await
        .unwrap();
    store
        .write(&other, &LockToken::none(), b"other")
        .await
        .unwrap();
    store
        .acquire_lock(&other, &LockToken::new("tok2"))
        .await
        .unwrap();

    assert!(store.read(&env).await.unwrap().is_empty());
    assert_eq!(store.read(&other).await.unwrap(), b"other");
}

async fn assert_single_lock_winner(store: &StateStore, key: &StateKey, contenders: usize) {
    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let token = LockToken::new(format!("tok-{}", i));
                store.acquire_lock(&key, &token).await.map(|()| token)
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "results: {:?}", results);

    let winner = winners[0].clone();
    for result in &results {
        match result {
            Ok(_) => {}
            Err(StateError::AlreadyLocked { current, .. }) => assert_eq!(current, &winner),
            Err(other) => panic!("Expected AlreadyLocked, got {:?}", other),
        }
    }

    // The winner still holds the lock
    store.release_lock(key, &winner).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_on_new_key_has_one_winner() {
    let (_, store) = memory_store();
    let key = StateKey::parse("env", STATE_ID).unwrap();
    assert_single_lock_winner(&store, &key, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_on_existing_key_has_one_winner() {
    let (_, store) = memory_store();
    let key = StateKey::parse("env", STATE_ID).unwrap();
    store
        .write(&key, &LockToken::none(), b"data")
        .await
        .unwrap();
    assert_single_lock_winner(&store, &key, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_under_one_lock_get_distinct_versions() {
    let (ledger, store) = memory_store();
    let key = StateKey::parse("env", STATE_ID).unwrap();
    let token = LockToken::new("tok1");
    store.acquire_lock(&key, &token).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let key = key.clone();
            let token = token.clone();
            tokio::spawn(async move {
                store
                    .write(&key, &token, format!("write-{}", i).as_bytes())
                    .await
            })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        joined.unwrap().unwrap();
    }

    let versions: Vec<i64> = ledger
        .versions(&key)
        .await
        .iter()
        .map(|row| row.version)
        .collect();
    assert_eq!(versions, (1..=9).collect::<Vec<_>>());
}

/// Stage `blob` as the next version in an open transaction holding the current row
async fn begin_racing_write(
    ledger: &Arc<dyn Ledger>,
    key: &StateKey,
    blob: &[u8],
) -> Box<dyn LedgerTransaction> {
    let mut writer = ledger.begin().await.unwrap();
    let current = writer.locking_read_current(key).await.unwrap().unwrap();
    writer
        .insert_version(key, current.version + 1, current.lock_token.as_deref(), blob)
        .await
        .unwrap();
    writer
}

/// A lock that waited behind a committing writer lands on the new current version
async fn assert_lock_after_racing_write(ledger: Arc<dyn Ledger>, key: &StateKey) {
    let store = StateStore::new(Arc::clone(&ledger));
    store.write(key, &LockToken::none(), b"v1").await.unwrap();

    let writer = begin_racing_write(&ledger, key, b"v2").await;
    let locker = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.acquire_lock(&key, &LockToken::new("tok1")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    writer.commit().await.unwrap();
    locker.await.unwrap().unwrap();

    let result = store.write(key, &LockToken::none(), b"intruder").await;
    assert!(matches!(result, Err(StateError::Conflict { .. })));
    match store.acquire_lock(key, &LockToken::new("tok2")).await {
        Err(StateError::AlreadyLocked { current, .. }) => {
            assert_eq!(current, LockToken::new("tok1"))
        }
        other => panic!("Expected AlreadyLocked, got {:?}", other),
    }
    assert_eq!(store.read(key).await.unwrap(), b"v2");
}

/// An unlock that waited behind a committing locked write clears the new current version
async fn assert_unlock_after_racing_write(ledger: Arc<dyn Ledger>, key: &StateKey) {
    let store = StateStore::new(Arc::clone(&ledger));
    let tok1 = LockToken::new("tok1");
    store.acquire_lock(key, &tok1).await.unwrap();

    let writer = begin_racing_write(&ledger, key, b"v2").await;
    let unlocker = {
        let store = store.clone();
        let key = key.clone();
        let tok1 = tok1.clone();
        tokio::spawn(async move { store.release_lock(&key, &tok1).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    writer.commit().await.unwrap();
    unlocker.await.unwrap().unwrap();

    store
        .write(key, &LockToken::none(), b"v3")
        .await
        .unwrap();
    store
        .acquire_lock(key, &LockToken::new("tok2"))
        .await
        .unwrap();
    assert_eq!(store.read(key).await.unwrap(), b"v3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_waiting_on_writer_locks_newest_version() {
    let key = StateKey::parse("env", STATE_ID).unwrap();
    assert_lock_after_racing_write(Arc::new(MemoryLedger::new()), &key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unlock_waiting_on_writer_clears_newest_version() {
    let key = StateKey::parse("env", STATE_ID).unwrap();
    assert_unlock_after_racing_write(Arc::new(MemoryLedger::new()), &key).await;
}

/// Connects when `TFLOCKER_TEST_DATABASE_URL` is set
async fn postgres_ledger() -> Option<Arc<dyn Ledger>> {
    let Ok(url) = std::env::var("TFLOCKER_TEST_DATABASE_URL") else {
        eprintln!("TFLOCKER_TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let ledger = PostgresLedger::connect(&url, Duration::from_secs(5), 4)
        .await
        .unwrap();
    ledger.init().await.unwrap();
    Some(Arc::new(ledger))
}

#[tokio::test]
async fn test_postgres_lock_write_unlock_scenario() {
    let Some(ledger) = postgres_ledger().await else {
        return;
    };
    let store = StateStore::new(ledger);

    // Fresh id per run so reruns start from an empty key
    let key = StateKey::new(uuid_v4(), "env").unwrap();
    let tok1 = LockToken::new("tok1");

    assert!(store.read(&key).await.unwrap().is_empty());
    store.acquire_lock(&key, &tok1).await.unwrap();
    store.acquire_lock(&key, &tok1).await.unwrap();
    assert!(matches!(
        store.acquire_lock(&key, &LockToken::new("tok2")).await,
        Err(StateError::AlreadyLocked { .. })
    ));
    store.write(&key, &tok1, b"data").await.unwrap();
    assert!(matches!(
        store.write(&key, &LockToken::none(), b"x").await,
        Err(StateError::Conflict { .. })
    ));
    store.release_lock(&key, &tok1).await.unwrap();
    assert_eq!(store.read(&key).await.unwrap(), b"data");

    let fresh = StateKey::new(uuid_v4(), "env").unwrap();
    assert_single_lock_winner(&store, &fresh, 8).await;

    let existing = StateKey::new(uuid_v4(), "env").unwrap();
    store
        .write(&existing, &LockToken::none(), b"data")
        .await
        .unwrap();
    assert_single_lock_winner(&store, &existing, 8).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_postgres_lock_waiting_on_writer_locks_newest_version() {
    let Some(ledger) = postgres_ledger().await else {
        return;
    };
    let key = StateKey::new(uuid_v4(), "env").unwrap();
    assert_lock_after_racing_write(ledger, &key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_postgres_unlock_waiting_on_writer_clears_newest_version() {
    let Some(ledger) = postgres_ledger().await else {
        return;
    };
    let key = StateKey::new(uuid_v4(), "env").unwrap();
    assert_unlock_after_racing_write(ledger, &key).await;
}

fn uuid_v4() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
