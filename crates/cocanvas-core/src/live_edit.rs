//! Ephemeral in-flight geometry.
//!
//! While a shape is dragged, resized or rotated its owner broadcasts the
//! current geometry to `liveEdits/<canvas>/<shape>` many times per second.
//! Other clients overlay it on the persisted shape until the edit ends and
//! the final geometry is committed to the document store.

use crate::clock::{Clock, Timestamp};
use crate::lock::{LockManager, dedup};
use crate::shapes::{GeometryPatch, ShapeId, UserId};
use crate::store::{DisconnectHook, EphemeralStore, PathWrite, paths};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// A live edit record as stored in the ephemeral store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEdit {
    pub shape_id: ShapeId,
    #[serde(flatten)]
    pub geometry: GeometryPatch,
    pub locked_by: UserId,
    pub last_update: Timestamp,
}

/// Outcome of [`LiveEditOverlay::begin_edit_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchEditResult {
    /// True only when every requested shape was editable and written.
    pub success: bool,
    pub editable_ids: Vec<ShapeId>,
    pub blocked_ids: Vec<ShapeId>,
}

struct LocalEdit {
    user_id: UserId,
    geometry: GeometryPatch,
    /// Local time of the last broadcast update.
    last_sent: Option<Timestamp>,
}

/// Publishes this client's live edits and exposes everyone's.
pub struct LiveEditOverlay {
    canvas_id: String,
    store: Arc<dyn EphemeralStore>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    throttle_ms: i64,
    local: Mutex<HashMap<ShapeId, LocalEdit>>,
    edits_rx: watch::Receiver<Option<Value>>,
}

impl LiveEditOverlay {
    pub fn new(locks: LockManager, clock: Arc<dyn Clock>, throttle_ms: u64) -> Self {
        let canvas_id = locks.canvas_id().to_string();
        let store = locks.store().clone();
        let edits_rx = store.subscribe(&paths::live_edits(&canvas_id));
        Self {
            canvas_id,
            store,
            locks,
            clock,
            throttle_ms: i64::try_from(throttle_ms).unwrap_or(i64::MAX),
            local: Mutex::new(HashMap::new()),
            edits_rx,
        }
    }

    fn local(&self) -> MutexGuard<'_, HashMap<ShapeId, LocalEdit>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, shape_id: ShapeId, edit: &LocalEdit) -> Option<PathWrite> {
        let record = LiveEdit {
            shape_id,
            geometry: edit.geometry.clone(),
            locked_by: edit.user_id.clone(),
            last_update: self.store.server_time(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => Some(PathWrite::set(paths::live_edit(&self.canvas_id, shape_id), value)),
            Err(e) => {
                log::error!("Failed to serialize live edit for {}: {}", shape_id, e);
                None
            }
        }
    }

    /// Start broadcasting geometry for `shape_id`.
    ///
    /// Fails when another user holds an active lock on the shape.
    pub async fn begin_edit(&self, shape_id: ShapeId, user_id: &str, initial: GeometryPatch) -> bool {
        self.begin_edit_batch(&[shape_id], user_id, &HashMap::from([(shape_id, initial)]))
            .await
            .success
    }

    /// Start editing every shape in `shape_ids`, or none of them.
    ///
    /// Any shape locked by another user blocks the whole batch and nothing
    /// is written.
    pub async fn begin_edit_batch(
        &self,
        shape_ids: &[ShapeId],
        user_id: &str,
        initial: &HashMap<ShapeId, GeometryPatch>,
    ) -> BatchEditResult {
        let ids = dedup(shape_ids);
        if user_id.is_empty() || ids.is_empty() {
            return BatchEditResult {
                success: false,
                editable_ids: Vec::new(),
                blocked_ids: ids,
            };
        }

        let owners = match self.locks.fetch_active().await {
            Ok(owners) => owners,
            Err(e) => {
                log::warn!("Failed to read locks for live edit: {}", e);
                return BatchEditResult {
                    success: false,
                    editable_ids: Vec::new(),
                    blocked_ids: ids,
                };
            }
        };

        let (editable_ids, blocked_ids): (Vec<ShapeId>, Vec<ShapeId>) = ids
            .into_iter()
            .partition(|id| owners.get(id).is_none_or(|owner| owner == user_id));
        if !blocked_ids.is_empty() {
            log::debug!(
                "Live edit for {} blocked on {} of {} shapes",
                user_id,
                blocked_ids.len(),
                blocked_ids.len() + editable_ids.len()
            );
            return BatchEditResult {
                success: false,
                editable_ids,
                blocked_ids,
            };
        }

        let edits: Vec<(ShapeId, LocalEdit)> = editable_ids
            .iter()
            .map(|id| {
                let edit = LocalEdit {
                    user_id: user_id.to_string(),
                    geometry: initial.get(id).cloned().unwrap_or_default(),
                    last_sent: None,
                };
                (*id, edit)
            })
            .collect();
        let writes: Vec<PathWrite> = edits
            .iter()
            .filter_map(|(id, edit)| self.record(*id, edit))
            .collect();
        let hooks: Vec<DisconnectHook> = writes
            .iter()
            .map(|w| DisconnectHook::remove_if_owned(w.path.clone(), "lockedBy", user_id))
            .collect();

        if let Err(e) = self.store.update(writes).await {
            log::warn!("Failed to write live edits: {}", e);
            return BatchEditResult {
                success: false,
                editable_ids,
                blocked_ids,
            };
        }
        if let Err(e) = self.store.on_disconnect(hooks).await {
            log::warn!("Failed to register live edit cleanup: {}", e);
        }

        self.local().extend(edits);
        BatchEditResult {
            success: true,
            editable_ids,
            blocked_ids,
        }
    }

    /// Broadcast new geometry for a shape being edited.
    ///
    /// The patch is always merged into the local edit. The broadcast is
    /// skipped when the previous one was less than the throttle interval
    /// ago, unless `force` is set. Returns whether a broadcast happened.
    pub async fn update(&self, shape_id: ShapeId, patch: &GeometryPatch, force: bool) -> bool {
        self.update_batch(&HashMap::from([(shape_id, patch.clone())]), force)
            .await
            == 1
    }

    /// [`update`](Self::update) for many shapes in one write.
    /// Returns how many shapes were broadcast.
    pub async fn update_batch(&self, patches: &HashMap<ShapeId, GeometryPatch>, force: bool) -> usize {
        let writes: Vec<PathWrite> = {
            let now = self.clock.now();
            let mut local = self.local();
            let mut writes = Vec::with_capacity(patches.len());
            for (id, patch) in patches {
                let Some(edit) = local.get_mut(id) else {
                    log::debug!("Ignoring live update for {}: not being edited", id);
                    continue;
                };
                edit.geometry.merge(patch);
                if !force && edit.last_sent.is_some_and(|t| now - t < self.throttle_ms) {
                    continue;
                }
                edit.last_sent = Some(now);
                writes.extend(self.record(*id, edit));
            }
            writes
        };

        let count = writes.len();
        if count == 0 {
            return 0;
        }
        match self.store.update(writes).await {
            Ok(()) => count,
            Err(e) => {
                log::warn!("Failed to broadcast {} live edits: {}", count, e);
                0
            }
        }
    }

    /// Stop broadcasting for `shape_id`. Locks are left alone.
    pub async fn end_edit(&self, shape_id: ShapeId) {
        self.end_edit_batch(&[shape_id]).await;
    }

    pub async fn end_edit_batch(&self, shape_ids: &[ShapeId]) {
        let ids = dedup(shape_ids);
        if ids.is_empty() {
            return;
        }
        {
            let mut local = self.local();
            for id in &ids {
                local.remove(id);
            }
        }

        let edit_paths: Vec<String> = ids
            .iter()
            .map(|id| paths::live_edit(&self.canvas_id, *id))
            .collect();
        let writes = edit_paths.iter().cloned().map(PathWrite::remove).collect();
        if let Err(e) = self.store.update(writes).await {
            log::warn!("Failed to remove live edits: {}", e);
            return;
        }
        if let Err(e) = self.store.cancel_on_disconnect(edit_paths).await {
            log::debug!("Failed to cancel live edit cleanup: {}", e);
        }
    }

    /// Every live edit on the canvas, from the live subscription.
    pub fn live_edits(&self) -> HashMap<ShapeId, LiveEdit> {
        let value = self.edits_rx.borrow();
        let Some(Value::Object(entries)) = value.as_ref() else {
            return HashMap::new();
        };
        entries
            .iter()
            .filter_map(|(key, entry)| {
                let id = key.parse::<ShapeId>().ok()?;
                let edit = serde_json::from_value::<LiveEdit>(entry.clone()).ok()?;
                Some((id, edit))
            })
            .collect()
    }

    /// The accumulated geometry of this client's edit on `shape_id`,
    /// including updates that were throttled.
    pub fn local_geometry(&self, shape_id: ShapeId) -> Option<GeometryPatch> {
        self.local().get(&shape_id).map(|e| e.geometry.clone())
    }

    /// Shapes this client is currently editing.
    pub fn editing(&self) -> Vec<ShapeId> {
        self.local().keys().copied().collect()
    }

    pub fn changes(&self) -> watch::Receiver<Option<Value>> {
        self.edits_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryEphemeralBackend;
    use uuid::Uuid;

    struct Client {
        locks: LockManager,
        overlay: LiveEditOverlay,
    }

    fn client(backend: &Arc<MemoryEphemeralBackend>, clock: &ManualClock) -> Client {
        let locks = LockManager::new("main", Arc::new(backend.connect()), 30_000);
        let overlay = LiveEditOverlay::new(locks.clone(), Arc::new(clock.clone()), 16);
        Client { locks, overlay }
    }

    fn setup() -> (ManualClock, Arc<MemoryEphemeralBackend>) {
        let clock = ManualClock::new(5_000);
        let backend = MemoryEphemeralBackend::new(Arc::new(clock.clone()));
        (clock, backend)
    }

    #[tokio::test]
    async fn test_begin_and_observe() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let bob = client(&backend, &clock);
        let shape = Uuid::new_v4();

        assert!(alice.locks.acquire(shape, "alice").await);
        assert!(alice.overlay.begin_edit(shape, "alice", GeometryPatch::position(1.0, 2.0)).await);

        let edits = bob.overlay.live_edits();
        let edit = &edits[&shape];
        assert_eq!(edit.locked_by, "alice");
        assert_eq!(edit.geometry.x, Some(1.0));
        assert_eq!(edit.last_update, 5_000);
    }

    #[tokio::test]
    async fn test_begin_blocked_by_foreign_lock() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let bob = client(&backend, &clock);
        let shape = Uuid::new_v4();

        assert!(alice.locks.acquire(shape, "alice").await);
        assert!(!bob.overlay.begin_edit(shape, "bob", GeometryPatch::default()).await);
        assert!(bob.overlay.live_edits().is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let bob = client(&backend, &clock);
        let (a, b, contested) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(bob.locks.acquire(contested, "bob").await);
        let geometry = HashMap::from([
            (a, GeometryPatch::position(0.0, 0.0)),
            (b, GeometryPatch::position(1.0, 1.0)),
        ]);
        let result = alice
            .overlay
            .begin_edit_batch(&[a, b, contested], "alice", &geometry)
            .await;

        assert!(!result.success);
        assert_eq!(result.editable_ids, vec![a, b]);
        assert_eq!(result.blocked_ids, vec![contested]);
        assert!(alice.overlay.live_edits().is_empty());
        assert!(alice.overlay.editing().is_empty());
        assert!(backend.snapshot("liveEdits/main").is_none());
    }

    #[tokio::test]
    async fn test_batch_success() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let result = alice
            .overlay
            .begin_edit_batch(&[a, b], "alice", &HashMap::new())
            .await;
        assert!(result.success);
        assert!(result.blocked_ids.is_empty());
        assert_eq!(alice.overlay.live_edits().len(), 2);
    }

    #[tokio::test]
    async fn test_update_throttled_unless_forced() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let bob = client(&backend, &clock);
        let shape = Uuid::new_v4();

        assert!(alice.overlay.begin_edit(shape, "alice", GeometryPatch::position(0.0, 0.0)).await);
        assert!(alice.overlay.update(shape, &GeometryPatch::position(1.0, 0.0), false).await);

        clock.advance(5);
        assert!(!alice.overlay.update(shape, &GeometryPatch::position(2.0, 0.0), false).await);
        assert_eq!(bob.overlay.live_edits()[&shape].geometry.x, Some(1.0));
        // Throttled updates still accumulate locally
        assert_eq!(alice.overlay.local_geometry(shape).unwrap().x, Some(2.0));

        assert!(alice.overlay.update(shape, &GeometryPatch::position(3.0, 0.0), true).await);
        assert_eq!(bob.overlay.live_edits()[&shape].geometry.x, Some(3.0));

        clock.advance(16);
        assert!(alice.overlay.update(shape, &GeometryPatch::position(4.0, 0.0), false).await);
    }

    #[tokio::test]
    async fn test_update_batch_single_write() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let bob = client(&backend, &clock);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx = bob.overlay.changes();

        assert!(alice.overlay.begin_edit_batch(&[a, b], "alice", &HashMap::new()).await.success);
        let _ = rx.borrow_and_update();

        let patches = HashMap::from([
            (a, GeometryPatch::position(10.0, 10.0)),
            (b, GeometryPatch::position(20.0, 20.0)),
        ]);
        assert_eq!(alice.overlay.update_batch(&patches, false).await, 2);
        assert!(rx.has_changed().unwrap());
        let edits = bob.overlay.live_edits();
        assert_eq!(edits[&a].geometry.x, Some(10.0));
        assert_eq!(edits[&b].geometry.y, Some(20.0));
    }

    #[tokio::test]
    async fn test_update_without_edit_ignored() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        assert!(!alice.overlay.update(Uuid::new_v4(), &GeometryPatch::position(1.0, 1.0), true).await);
    }

    #[tokio::test]
    async fn test_end_edit_keeps_lock() {
        let (clock, backend) = setup();
        let alice = client(&backend, &clock);
        let shape = Uuid::new_v4();

        assert!(alice.locks.acquire(shape, "alice").await);
        assert!(alice.overlay.begin_edit(shape, "alice", GeometryPatch::default()).await);
        alice.overlay.end_edit(shape).await;

        assert!(alice.overlay.live_edits().is_empty());
        assert_eq!(alice.locks.lock_owner(shape).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_live_edits() {
        let (clock, backend) = setup();
        let conn = Arc::new(backend.connect());
        let locks = LockManager::new("main", conn.clone(), 30_000);
        let overlay = LiveEditOverlay::new(locks, Arc::new(clock.clone()), 16);
        let shape = Uuid::new_v4();

        assert!(overlay.begin_edit(shape, "alice", GeometryPatch::default()).await);
        conn.disconnect();
        assert!(backend.snapshot("liveEdits/main").is_none());
    }
}
