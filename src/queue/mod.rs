//! Work distribution between submitting sessions and execution units.
//!
//! Producers tag work items with a session key; execution units poll
//! with [`WorkQueue::claim`], which atomically assigns each item to
//! exactly one claimer and pins the session to that device until the
//! session ends. Results flow back through an append-only, per-session
//! message log with monotonic sequence numbers.

pub mod item;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

pub use item::{DeviceId, ItemId, Message, SessionId, WorkItem};
pub use store::{MemoryStore, QueueStore};

use crate::error::Result;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Facade over a [`QueueStore`]. Leaf component: no knowledge of nodes,
/// units, or transports.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn QueueStore>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Submit one unit of work for a session. If the session is already
    /// bound to a device the item is pre-assigned to it; otherwise it
    /// goes into the unassigned pool for any device to claim.
    pub async fn submit_work(&self, session_id: &SessionId, payload: Value) -> Result<WorkItem> {
        let item = self
            .store
            .insert_item(session_id, payload, Utc::now())
            .await?;
        tracing::debug!(
            item_id = %item.item_id,
            session_id = %item.session_id,
            device = ?item.device,
            "Work item submitted"
        );
        Ok(item)
    }

    /// Claim up to `limit` pending items for `device`: items already
    /// assigned to the device first, then unassigned items. Exactly-once
    /// across arbitrary concurrent callers.
    pub async fn claim(&self, device: &DeviceId, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let items = self.store.claim_batch(device, limit).await?;
        if !items.is_empty() {
            tracing::debug!(device = %device, count = items.len(), "Work items claimed");
        }
        Ok(items)
    }

    /// `claim` with bounded exponential backoff over transient storage
    /// failures. Non-transient errors propagate immediately.
    pub async fn claim_with_retry(
        &self,
        device: &DeviceId,
        limit: Option<usize>,
        attempts: u32,
    ) -> Result<Vec<WorkItem>> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match self.claim(device, limit).await {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    attempt += 1;
                    tracing::warn!(
                        device = %device,
                        attempt,
                        error = %e,
                        "Claim failed transiently, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    /// Drop the sticky binding between a session and the device that
    /// owns it; later items for the session return to the open pool.
    pub async fn release_session(&self, device: &DeviceId, session_id: &SessionId) -> Result<()> {
        if self.store.remove_affinity(device, session_id).await? {
            tracing::info!(session_id = %session_id, device = %device, "Session released");
        }
        Ok(())
    }

    /// Collaborator surface: end a session regardless of which device
    /// holds it. No-op if the session was never bound.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        if let Some(device) = self.store.device_for_session(session_id).await? {
            self.release_session(&device, session_id).await?;
        }
        Ok(())
    }

    pub async fn append_messages(&self, session_id: &SessionId, bodies: Vec<Value>) -> Result<u64> {
        self.store.append_messages(session_id, bodies).await
    }

    /// Incremental poll: messages with `sequence >= since_sequence`.
    pub async fn fetch_messages(
        &self,
        session_id: &SessionId,
        since_sequence: u64,
    ) -> Result<Vec<Message>> {
        self.store.messages_since(session_id, since_sequence).await
    }
}
