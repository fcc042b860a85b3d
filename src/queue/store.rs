//! Storage seam for the work queue.
//!
//! The queue does no application-level locking: every consistency
//! guarantee (exactly-once claim, affinity creation, message ordering)
//! is delegated to the store's atomic conditional-update primitive. Each
//! trait method is one atomic batch; no partial effect of a batch is
//! ever visible to a concurrent caller. Any transactional key-value or
//! document store can implement this; `MemoryStore` ships as the
//! in-process implementation and the reference for the semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::queue::item::{DeviceId, ItemId, Message, SessionId, WorkItem};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new work item, resolving session affinity in the same
    /// batch: if the session is already bound to a device, the item is
    /// inserted pre-assigned to it (device set, unclaimed, so the owning
    /// device's next claim pass returns it without a claim race).
    async fn insert_item(
        &self,
        session_id: &SessionId,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// Two-phase claim executed as one atomic batch.
    ///
    /// Phase one takes unclaimed items already assigned to `device`;
    /// phase two takes unassigned items up to the remaining quota,
    /// setting device and claimed together and creating an affinity row
    /// for each newly bound session. `limit` of `None` means unbounded;
    /// `Some(0)` claims nothing. Concurrent callers never observe
    /// overlapping result sets.
    async fn claim_batch(&self, device: &DeviceId, limit: Option<usize>) -> Result<Vec<WorkItem>>;

    async fn device_for_session(&self, session_id: &SessionId) -> Result<Option<DeviceId>>;

    /// Delete the affinity row binding `session_id` to `device`.
    /// Returns false if no such row existed.
    async fn remove_affinity(&self, device: &DeviceId, session_id: &SessionId) -> Result<bool>;

    /// Append messages for a session, assigning consecutive sequence
    /// numbers in one batch. Returns the last sequence assigned.
    async fn append_messages(&self, session_id: &SessionId, bodies: Vec<Value>) -> Result<u64>;

    /// Messages for `session_id` with `sequence >= since`, ordered by
    /// sequence.
    async fn messages_since(&self, session_id: &SessionId, since: u64) -> Result<Vec<Message>>;
}

#[derive(Default)]
struct Tables {
    /// Insertion order doubles as chronological claim order
    items: Vec<WorkItem>,
    affinities: HashMap<SessionId, DeviceId>,
    messages: HashMap<SessionId, Vec<Message>>,
}

/// In-process store. One mutex around all tables makes every trait call
/// a single atomic batch, which is exactly the conditional-update
/// contract the queue relies on.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Fault injection for exercising the transient-failure path
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate storage unavailability; while set, every operation fails
    /// with `StorageUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FleetError::StorageUnavailable(
                "memory store offline".to_string(),
            ));
        }
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_item(
        &self,
        session_id: &SessionId,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut tables = self.guard()?;
        let item = WorkItem {
            item_id: ItemId::new(),
            session_id: session_id.clone(),
            payload,
            device: tables.affinities.get(session_id).copied(),
            claimed: false,
            timestamp,
        };
        tables.items.push(item.clone());
        Ok(item)
    }

    async fn claim_batch(&self, device: &DeviceId, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let mut tables = self.guard()?;
        let mut claimed = Vec::new();

        // Phase one: items already assigned to this device.
        for item in tables.items.iter_mut() {
            if limit.is_some_and(|n| claimed.len() >= n) {
                break;
            }
            if !item.claimed && item.device == Some(*device) {
                item.claimed = true;
                claimed.push(item.clone());
            }
        }

        // Phase two: unassigned items, up to the remaining quota. Device
        // and claimed flip together, and the session binds to this
        // device in the same batch.
        let mut bound = Vec::new();
        for item in tables.items.iter_mut() {
            if limit.is_some_and(|n| claimed.len() >= n) {
                break;
            }
            if !item.claimed && item.device.is_none() {
                item.device = Some(*device);
                item.claimed = true;
                bound.push(item.session_id.clone());
                claimed.push(item.clone());
            }
        }
        for session in bound {
            tables.affinities.entry(session).or_insert(*device);
        }

        Ok(claimed)
    }

    async fn device_for_session(&self, session_id: &SessionId) -> Result<Option<DeviceId>> {
        Ok(self.guard()?.affinities.get(session_id).copied())
    }

    async fn remove_affinity(&self, device: &DeviceId, session_id: &SessionId) -> Result<bool> {
        let mut tables = self.guard()?;
        match tables.affinities.get(session_id) {
            Some(bound) if bound == device => {
                tables.affinities.remove(session_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_messages(&self, session_id: &SessionId, bodies: Vec<Value>) -> Result<u64> {
        let mut tables = self.guard()?;
        let log = tables.messages.entry(session_id.clone()).or_default();
        let mut sequence = log.last().map_or(0, |m| m.sequence + 1);
        for body in bodies {
            log.push(Message {
                session_id: session_id.clone(),
                sequence,
                body,
            });
            sequence += 1;
        }
        Ok(sequence.saturating_sub(1))
    }

    async fn messages_since(&self, session_id: &SessionId, since: u64) -> Result<Vec<Message>> {
        let tables = self.guard()?;
        Ok(tables
            .messages
            .get(session_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.sequence >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
