//! Work queue integration tests: exactly-once claiming under
//! contention, session affinity, limits, message ordering, and
//! transient storage failure handling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use kernelfleet::error::FleetError;
use kernelfleet::queue::{DeviceId, ItemId, MemoryStore, SessionId, WorkQueue};

#[tokio::test]
async fn concurrent_claimers_never_overlap() {
    let queue = WorkQueue::in_memory();

    // Unique sessions, so every item goes through the open pool.
    for i in 0..200 {
        queue
            .submit_work(&SessionId::new(format!("session-{i}")), json!(i))
            .await
            .unwrap();
    }

    let claimed: Arc<Mutex<Vec<ItemId>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        let claimed = claimed.clone();
        tasks.push(tokio::spawn(async move {
            let device = DeviceId::new();
            loop {
                let batch = queue.claim(&device, Some(7)).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed
                    .lock()
                    .await
                    .extend(batch.iter().map(|i| i.item_id));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let claimed = claimed.lock().await;
    assert_eq!(claimed.len(), 200);
    let unique: HashSet<ItemId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), 200);
}

#[tokio::test]
async fn session_sticks_to_first_claimer() {
    let queue = WorkQueue::in_memory();
    let session = SessionId::from("interactive");
    let owner = DeviceId::new();
    let other = DeviceId::new();

    queue.submit_work(&session, json!("first")).await.unwrap();
    assert_eq!(queue.claim(&owner, None).await.unwrap().len(), 1);

    // Later items for the session are invisible to other devices.
    queue.submit_work(&session, json!("second")).await.unwrap();
    assert!(queue.claim(&other, None).await.unwrap().is_empty());
    let batch = queue.claim(&owner, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload, json!("second"));
}

#[tokio::test]
async fn released_session_returns_to_the_pool() {
    let queue = WorkQueue::in_memory();
    let session = SessionId::from("interactive");
    let owner = DeviceId::new();
    let other = DeviceId::new();

    queue.submit_work(&session, json!(1)).await.unwrap();
    queue.claim(&owner, None).await.unwrap();
    queue.release_session(&owner, &session).await.unwrap();

    // Post-release submissions are unassigned and claimable by anyone.
    queue.submit_work(&session, json!(2)).await.unwrap();
    let batch = queue.claim(&other, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].device, Some(other));
}

#[tokio::test]
async fn end_session_without_binding_is_a_noop() {
    let queue = WorkQueue::in_memory();
    queue.end_session(&SessionId::from("never-claimed")).await.unwrap();
}

#[tokio::test]
async fn end_session_releases_whichever_device_owns_it() {
    let queue = WorkQueue::in_memory();
    let session = SessionId::from("s");
    let owner = DeviceId::new();

    queue.submit_work(&session, json!(1)).await.unwrap();
    queue.claim(&owner, None).await.unwrap();
    queue.end_session(&session).await.unwrap();

    queue.submit_work(&session, json!(2)).await.unwrap();
    let fresh = DeviceId::new();
    assert_eq!(queue.claim(&fresh, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claim_limit_semantics() {
    let queue = WorkQueue::in_memory();
    for i in 0..5 {
        queue
            .submit_work(&SessionId::new(format!("s{i}")), json!(i))
            .await
            .unwrap();
    }
    let device = DeviceId::new();

    assert!(queue.claim(&device, Some(0)).await.unwrap().is_empty());
    assert_eq!(queue.claim(&device, Some(2)).await.unwrap().len(), 2);
    // None drains everything that is left.
    assert_eq!(queue.claim(&device, None).await.unwrap().len(), 3);
    assert!(queue.claim(&device, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn messages_are_sequenced_and_polled_incrementally() {
    let queue = WorkQueue::in_memory();
    let session = SessionId::from("s");

    let last = queue
        .append_messages(&session, vec![json!("a"), json!("b")])
        .await
        .unwrap();
    assert_eq!(last, 1);
    let last = queue
        .append_messages(&session, vec![json!("c")])
        .await
        .unwrap();
    assert_eq!(last, 2);

    let all = queue.fetch_messages(&session, 0).await.unwrap();
    assert_eq!(
        all.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    let tail = queue.fetch_messages(&session, 2).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].body, json!("c"));

    // Another session's log is independent.
    assert!(queue
        .fetch_messages(&SessionId::from("other"), 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn claim_with_retry_rides_out_a_storage_outage() {
    let store = Arc::new(MemoryStore::new());
    let queue = WorkQueue::new(store.clone());
    queue
        .submit_work(&SessionId::from("s"), json!(1))
        .await
        .unwrap();

    store.set_offline(true);
    let recover = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            store.set_offline(false);
        })
    };

    let device = DeviceId::new();
    let batch = queue.claim_with_retry(&device, None, 5).await.unwrap();
    assert_eq!(batch.len(), 1);
    recover.await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_surface_the_transient_error() {
    let store = Arc::new(MemoryStore::new());
    let queue = WorkQueue::new(store.clone());
    store.set_offline(true);

    let err = queue
        .claim_with_retry(&DeviceId::new(), None, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::StorageUnavailable(_)));
}
