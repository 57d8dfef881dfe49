//! Lease-based per-shape locks.
//!
//! A lock lives at `locks/<canvas>/<shape>` in the ephemeral store as
//! `{lockedBy, lockedAt}`. A lock whose `lockedAt` is older than the TTL is
//! expired and every reader treats it as absent. Live locks are kept fresh
//! by the session's [`Heartbeat`](crate::heartbeat::Heartbeat), which walks
//! the held set maintained here.
//!
//! Acquisition is read-then-write, not a transaction. Mutual exclusion
//! relies on every client following this protocol.

use crate::clock::Timestamp;
use crate::shapes::{ShapeId, UserId};
use crate::store::{DisconnectHook, EphemeralStore, PathWrite, StoreResult, paths};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// A lock entry as stored in the ephemeral store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub locked_by: UserId,
    pub locked_at: Timestamp,
}

impl LockRecord {
    pub fn new(locked_by: impl Into<UserId>, locked_at: Timestamp) -> Self {
        Self {
            locked_by: locked_by.into(),
            locked_at,
        }
    }

    /// Whether the lease is still valid at `now`.
    pub fn is_active(&self, now: Timestamp, ttl_ms: i64) -> bool {
        now - self.locked_at < ttl_ms
    }

    fn to_value(&self) -> Value {
        serde_json::json!({ "lockedBy": self.locked_by, "lockedAt": self.locked_at })
    }
}

/// Outcome of [`LockManager::acquire_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLockResult {
    pub acquired: Vec<ShapeId>,
    pub failed: Vec<ShapeId>,
}

impl BatchLockResult {
    pub fn all_acquired(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Parse the `locks/<canvas>` subtree. Malformed entries are skipped.
pub(crate) fn parse_locks(value: Option<&Value>) -> HashMap<ShapeId, LockRecord> {
    let Some(Value::Object(entries)) = value else {
        return HashMap::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| {
            let id = key.parse::<ShapeId>().ok()?;
            let record = serde_json::from_value::<LockRecord>(entry.clone()).ok()?;
            Some((id, record))
        })
        .collect()
}

/// One lock this client holds and keeps alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldLock {
    pub(crate) user_id: UserId,
    /// Bumped on every acquisition, so a release queued before a re-acquire
    /// can tell the lock is no longer the one it meant to drop.
    pub(crate) epoch: u64,
}

pub(crate) type HeldLocks = Arc<Mutex<HashMap<ShapeId, HeldLock>>>;

/// Held epochs captured when a deferred release was queued.
pub(crate) type ReleaseTicket = Vec<(ShapeId, Option<u64>)>;

struct Inner {
    canvas_id: String,
    store: Arc<dyn EphemeralStore>,
    ttl_ms: i64,
    held: HeldLocks,
    next_epoch: AtomicU64,
    locks_rx: watch::Receiver<Option<Value>>,
}

/// Grants and releases per-shape editing leases. Cheap to clone.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl LockManager {
    pub fn new(canvas_id: impl Into<String>, store: Arc<dyn EphemeralStore>, ttl_ms: u64) -> Self {
        let canvas_id = canvas_id.into();
        let locks_rx = store.subscribe(&paths::locks(&canvas_id));
        Self {
            inner: Arc::new(Inner {
                canvas_id,
                store,
                ttl_ms: i64::try_from(ttl_ms).unwrap_or(i64::MAX),
                held: Arc::new(Mutex::new(HashMap::new())),
                next_epoch: AtomicU64::new(1),
                locks_rx,
            }),
        }
    }

    pub fn canvas_id(&self) -> &str {
        &self.inner.canvas_id
    }

    pub fn ttl_ms(&self) -> i64 {
        self.inner.ttl_ms
    }

    pub(crate) fn store(&self) -> &Arc<dyn EphemeralStore> {
        &self.inner.store
    }

    pub(crate) fn held_locks(&self) -> &HeldLocks {
        &self.inner.held
    }

    fn now(&self) -> Timestamp {
        self.inner.store.server_time()
    }

    fn lock_path(&self, shape_id: ShapeId) -> String {
        paths::lock(&self.inner.canvas_id, shape_id)
    }

    fn disconnect_hook(&self, shape_id: ShapeId, user_id: &str) -> DisconnectHook {
        DisconnectHook::remove_if_owned(self.lock_path(shape_id), "lockedBy", user_id)
    }

    fn hold(&self, shape_ids: &[ShapeId], user_id: &str) {
        let mut held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        for id in shape_ids {
            let epoch = self.inner.next_epoch.fetch_add(1, Ordering::SeqCst);
            held.insert(
                *id,
                HeldLock {
                    user_id: user_id.to_string(),
                    epoch,
                },
            );
        }
    }

    fn unhold(&self, shape_ids: &[ShapeId]) {
        let mut held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        for id in shape_ids {
            held.remove(id);
        }
    }

    /// Drop ids from the held set whose epoch still matches `ticket`.
    /// Returns the ids that were dropped.
    fn unhold_unchanged(&self, ticket: &ReleaseTicket) -> Vec<ShapeId> {
        let mut held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = Vec::with_capacity(ticket.len());
        for (id, epoch) in ticket {
            if held.get(id).map(|h| h.epoch) != *epoch {
                log::debug!("Skipping release of {}: re-acquired since it was queued", id);
                continue;
            }
            held.remove(id);
            dropped.push(*id);
        }
        dropped
    }

    /// Capture the current held epochs of `shape_ids` for a later
    /// [`release_unchanged`](Self::release_unchanged).
    pub(crate) fn release_ticket(&self, shape_ids: &[ShapeId]) -> ReleaseTicket {
        let held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        dedup(shape_ids)
            .into_iter()
            .map(|id| (id, held.get(&id).map(|h| h.epoch)))
            .collect()
    }

    /// Ids of `ticket` a [`release_unchanged`](Self::release_unchanged) would
    /// still release right now.
    pub(crate) fn unchanged(&self, ticket: &ReleaseTicket) -> Vec<ShapeId> {
        let held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        ticket
            .iter()
            .filter(|(id, epoch)| held.get(id).map(|h| h.epoch) == *epoch)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Read every lock on the canvas straight from the store, expired ones included.
    pub(crate) async fn fetch_all(&self) -> StoreResult<HashMap<ShapeId, LockRecord>> {
        let value = self.inner.store.get(&paths::locks(&self.inner.canvas_id)).await?;
        Ok(parse_locks(value.as_ref()))
    }

    /// Active lock owners read straight from the store.
    pub async fn fetch_active(&self) -> StoreResult<HashMap<ShapeId, UserId>> {
        let now = self.now();
        Ok(self
            .fetch_all()
            .await?
            .into_iter()
            .filter(|(_, record)| record.is_active(now, self.inner.ttl_ms))
            .map(|(id, record)| (id, record.locked_by))
            .collect())
    }

    /// Try to take the lock on `shape_id` for `user_id`.
    ///
    /// Fails when another user holds an unexpired lock, or when any store
    /// write fails. Re-acquiring one's own lock refreshes it.
    pub async fn acquire(&self, shape_id: ShapeId, user_id: &str) -> bool {
        if user_id.is_empty() {
            log::warn!("Refusing lock on {} for empty user id", shape_id);
            return false;
        }

        let path = self.lock_path(shape_id);
        let existing = match self.inner.store.get(&path).await {
            Ok(value) => value.and_then(|v| serde_json::from_value::<LockRecord>(v).ok()),
            Err(e) => {
                log::warn!("Failed to read lock {}: {}", shape_id, e);
                return false;
            }
        };

        let now = self.now();
        if let Some(record) = existing {
            if record.locked_by != user_id && record.is_active(now, self.inner.ttl_ms) {
                log::debug!("Lock on {} denied to {}: held by {}", shape_id, user_id, record.locked_by);
                return false;
            }
        }

        let record = LockRecord::new(user_id, now);
        if let Err(e) = self
            .inner
            .store
            .update(vec![PathWrite::set(path.clone(), record.to_value())])
            .await
        {
            log::warn!("Failed to write lock {}: {}", shape_id, e);
            return false;
        }

        if let Err(e) = self
            .inner
            .store
            .on_disconnect(vec![self.disconnect_hook(shape_id, user_id)])
            .await
        {
            log::warn!("Failed to register disconnect cleanup for lock {}: {}", shape_id, e);
            if let Err(e) = self.inner.store.update(vec![PathWrite::remove(path)]).await {
                log::warn!("Failed to roll back lock {}: {}", shape_id, e);
            }
            return false;
        }

        self.hold(&[shape_id], user_id);
        log::debug!("Lock on {} acquired by {}", shape_id, user_id);
        true
    }

    /// Take as many of `shape_ids` as possible with one read and one write.
    pub async fn acquire_batch(&self, shape_ids: &[ShapeId], user_id: &str) -> BatchLockResult {
        let ids = dedup(shape_ids);
        if user_id.is_empty() {
            log::warn!("Refusing batch lock for empty user id");
            return BatchLockResult {
                acquired: Vec::new(),
                failed: ids,
            };
        }
        if ids.is_empty() {
            return BatchLockResult::default();
        }

        let current = match self.fetch_all().await {
            Ok(locks) => locks,
            Err(e) => {
                log::warn!("Failed to read locks for batch acquire: {}", e);
                return BatchLockResult {
                    acquired: Vec::new(),
                    failed: ids,
                };
            }
        };

        let now = self.now();
        let (acquired, failed): (Vec<ShapeId>, Vec<ShapeId>) = ids.into_iter().partition(|id| {
            current.get(id).is_none_or(|record| {
                record.locked_by == user_id || !record.is_active(now, self.inner.ttl_ms)
            })
        });
        if acquired.is_empty() {
            log::debug!("Batch lock denied to {} for all {} shapes", user_id, failed.len());
            return BatchLockResult { acquired, failed };
        }

        let record = LockRecord::new(user_id, now).to_value();
        let lock_paths: Vec<String> = acquired.iter().map(|id| self.lock_path(*id)).collect();
        let writes = lock_paths
            .iter()
            .map(|path| PathWrite::set(path.clone(), record.clone()))
            .collect();

        if let Err(e) = self.inner.store.update(writes).await {
            log::warn!("Failed to write batch lock: {}", e);
            let mut failed = failed;
            failed.extend(acquired);
            return BatchLockResult {
                acquired: Vec::new(),
                failed,
            };
        }

        let hooks = acquired.iter().map(|id| self.disconnect_hook(*id, user_id)).collect();
        if let Err(e) = self.inner.store.on_disconnect(hooks).await {
            log::warn!("Failed to register disconnect cleanup for batch lock: {}", e);
            let rollback = lock_paths.into_iter().map(PathWrite::remove).collect();
            if let Err(e) = self.inner.store.update(rollback).await {
                log::warn!("Failed to roll back batch lock: {}", e);
            }
            let mut failed = failed;
            failed.extend(acquired);
            return BatchLockResult {
                acquired: Vec::new(),
                failed,
            };
        }

        self.hold(&acquired, user_id);
        log::debug!(
            "Batch lock for {}: {} acquired, {} denied",
            user_id,
            acquired.len(),
            failed.len()
        );
        BatchLockResult { acquired, failed }
    }

    /// Release the lock on `shape_id` if `user_id` holds it.
    pub async fn release(&self, shape_id: ShapeId, user_id: &str) {
        self.release_batch(&[shape_id], user_id).await;
    }

    /// Release every lock in `shape_ids` that `user_id` holds, in one write.
    ///
    /// Ids locked by someone else, or not locked at all, are left alone.
    pub async fn release_batch(&self, shape_ids: &[ShapeId], user_id: &str) {
        let ids = dedup(shape_ids);
        if ids.is_empty() || user_id.is_empty() {
            return;
        }
        self.unhold(&ids);
        self.remove_owned(&ids, user_id).await;
    }

    /// Release the ids of `ticket` unless they were acquired again after
    /// the ticket was taken.
    pub(crate) async fn release_unchanged(&self, ticket: ReleaseTicket, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        let ids = self.unhold_unchanged(&ticket);
        if !ids.is_empty() {
            self.remove_owned(&ids, user_id).await;
        }
    }

    /// Delete the store records of `ids` owned by `user_id`. Ids that were
    /// held again while the locks were being read are left in place.
    async fn remove_owned(&self, ids: &[ShapeId], user_id: &str) {
        let current = match self.fetch_all().await {
            Ok(locks) => locks,
            Err(e) => {
                log::warn!("Failed to read locks for release: {}", e);
                return;
            }
        };

        let held = self.held();
        let owned: Vec<String> = ids
            .iter()
            .filter(|id| !held.contains(id))
            .filter(|id| current.get(id).is_some_and(|r| r.locked_by == user_id))
            .map(|id| self.lock_path(*id))
            .collect();
        if owned.is_empty() {
            return;
        }

        let writes = owned.iter().cloned().map(PathWrite::remove).collect();
        if let Err(e) = self.inner.store.update(writes).await {
            log::warn!("Failed to release {} locks: {}", owned.len(), e);
            return;
        }
        if let Err(e) = self.inner.store.cancel_on_disconnect(owned).await {
            log::debug!("Failed to cancel disconnect cleanup: {}", e);
        }
    }

    /// Delete every expired lock on the canvas. Returns how many were removed.
    pub async fn sweep_expired(&self) -> StoreResult<usize> {
        let now = self.now();
        let stale: Vec<PathWrite> = self
            .fetch_all()
            .await?
            .into_iter()
            .filter(|(_, record)| !record.is_active(now, self.inner.ttl_ms))
            .map(|(id, _)| PathWrite::remove(self.lock_path(id)))
            .collect();
        let count = stale.len();
        if count > 0 {
            self.inner.store.update(stale).await?;
            log::info!("Swept {} expired locks on {}", count, self.inner.canvas_id);
        }
        Ok(count)
    }

    /// Every active lock, from the live subscription.
    pub fn locks(&self) -> HashMap<ShapeId, LockRecord> {
        let now = self.now();
        let value = self.inner.locks_rx.borrow();
        parse_locks(value.as_ref())
            .into_iter()
            .filter(|(_, record)| record.is_active(now, self.inner.ttl_ms))
            .collect()
    }

    /// Owner of the active lock on `shape_id`, if any.
    pub fn lock_owner(&self, shape_id: ShapeId) -> Option<UserId> {
        self.locks().remove(&shape_id).map(|r| r.locked_by)
    }

    pub fn is_locked_by_other(&self, shape_id: ShapeId, user_id: &str) -> bool {
        self.lock_owner(shape_id).is_some_and(|owner| owner != user_id)
    }

    /// Ids this client currently holds and refreshes.
    pub fn held(&self) -> HashSet<ShapeId> {
        let held = self.inner.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.keys().copied().collect()
    }

    /// A receiver that changes whenever any lock on the canvas does.
    pub fn changes(&self) -> watch::Receiver<Option<Value>> {
        self.inner.locks_rx.clone()
    }
}

/// Drop duplicate ids, keeping first occurrence order.
pub(crate) fn dedup(ids: &[ShapeId]) -> Vec<ShapeId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
