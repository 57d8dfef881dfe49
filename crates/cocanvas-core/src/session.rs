//! Per-client session.
//!
//! A [`CanvasSession`] owns everything one client needs to take part in a
//! canvas: its locks and their heartbeat, its live edits, selection, undo
//! history, presence, and the merged view. It is created on connect and
//! torn down on disconnect.

use crate::canvas::CanvasDocument;
use crate::clock::Clock;
use crate::config::{ConfigError, SessionConfig};
use crate::heartbeat::{Heartbeat, HeartbeatHandle};
use crate::history::{ChangeEntry, HistoryAction, Replay, ReplayStep, UndoLedger};
use crate::live_edit::{BatchEditResult, LiveEditOverlay};
use crate::lock::{BatchLockResult, LockManager, dedup};
use crate::optimistic::{self, OptimisticShapes};
use crate::presence::{Presence, PresenceEntry, UserInfo};
use crate::reconcile::{ReconciledShape, Reconciler};
use crate::selection::{Selection, SelectionCoordinator};
use crate::shapes::{FieldMap, GeometryPatch, Shape, ShapeId, UserId};
use crate::store::{DocumentStore, EphemeralStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("User id must not be empty")]
    EmptyUserId,
    #[error("User id must not contain '/': {0}")]
    InvalidUserId(UserId),
    #[error("Shape not found: {0}")]
    ShapeNotFound(ShapeId),
    #[error("Shape {0} is locked by {1}")]
    LockedByOther(ShapeId, UserId),
    #[error("Invalid shape fields: {0}")]
    InvalidFields(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A change to one persisted shape.
enum ShapeEdit {
    Fields(FieldMap),
    Geometry(GeometryPatch),
}

impl ShapeEdit {
    fn apply(&self, shape: &Shape) -> Result<Shape, serde_json::Error> {
        match self {
            ShapeEdit::Fields(fields) => shape.with_fields(fields),
            ShapeEdit::Geometry(patch) => Ok(patch.apply(shape)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CanvasSession {
    config: SessionConfig,
    canvas_id: String,
    user: UserInfo,
    clock: Arc<dyn Clock>,
    documents: Arc<dyn DocumentStore>,
    document_rx: watch::Receiver<Arc<CanvasDocument>>,
    locks: LockManager,
    live_edits: Arc<LiveEditOverlay>,
    selection: SelectionCoordinator,
    presence: Presence,
    history: Mutex<UndoLedger>,
    optimistic: Mutex<OptimisticShapes>,
    reconciler: Mutex<Reconciler>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl CanvasSession {
    /// Join `canvas_id` as `user`.
    ///
    /// Subscribes to both stores, publishes presence and starts the lock
    /// heartbeat. Must be called from within a Tokio runtime.
    pub async fn connect(
        config: SessionConfig,
        canvas_id: impl Into<String>,
        user: UserInfo,
        documents: Arc<dyn DocumentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
    ) -> SessionResult<Self> {
        config.validate()?;
        if user.id.is_empty() {
            return Err(SessionError::EmptyUserId);
        }
        if user.id.contains('/') {
            return Err(SessionError::InvalidUserId(user.id));
        }
        let canvas_id = canvas_id.into();

        let document_rx = documents.subscribe(&canvas_id);
        let locks = LockManager::new(canvas_id.clone(), ephemeral.clone(), config.lock_ttl_ms);
        let live_edits = Arc::new(LiveEditOverlay::new(
            locks.clone(),
            clock.clone(),
            config.live_edit_throttle_ms,
        ));
        let selection = SelectionCoordinator::new(user.id.clone(), locks.clone(), live_edits.clone());
        let presence = Presence::new(canvas_id.clone(), ephemeral, user.clone());
        presence.announce().await?;

        let heartbeat = Heartbeat::new(locks.clone(), config.heartbeat_interval(), config.sweep_interval()).spawn();

        log::info!("{} connected to canvas {}", user.id, canvas_id);
        Ok(Self {
            history: Mutex::new(UndoLedger::new(user.id.clone(), clock.clone(), config.max_history)),
            reconciler: Mutex::new(Reconciler::new(user.id.clone())),
            optimistic: Mutex::new(OptimisticShapes::new()),
            heartbeat: Mutex::new(Some(heartbeat)),
            config,
            canvas_id,
            user,
            clock,
            documents,
            document_rx,
            locks,
            live_edits,
            selection,
            presence,
        })
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn live_edits(&self) -> &LiveEditOverlay {
        &self.live_edits
    }

    /// The latest persisted document seen by this client.
    pub fn document(&self) -> Arc<CanvasDocument> {
        self.document_rx.borrow().clone()
    }

    /// A receiver that changes whenever the persisted document does.
    pub fn document_changes(&self) -> watch::Receiver<Arc<CanvasDocument>> {
        self.document_rx.clone()
    }

    /// The merged view: persisted shapes with remote live edits, lock owners
    /// and local optimistic shapes, in paint order.
    pub fn shapes(&self) -> Vec<Arc<ReconciledShape>> {
        let document = self.document();
        let mut optimistic = lock(&self.optimistic);
        optimistic.confirm_against(&document);
        let live_edits = self.live_edits.live_edits();
        let locks = self.locks.locks();
        lock(&self.reconciler).reconcile(&document, &live_edits, &locks, &optimistic)
    }

    fn knows(&self, id: ShapeId) -> bool {
        self.document().contains(id) || lock(&self.optimistic).contains(id)
    }

    fn check_editable(&self, ids: &[ShapeId]) -> SessionResult<()> {
        for id in ids {
            if !self.knows(*id) {
                return Err(SessionError::ShapeNotFound(*id));
            }
            if let Some(owner) = self.locks.lock_owner(*id) {
                if owner != self.user.id {
                    return Err(SessionError::LockedByOther(*id, owner));
                }
            }
        }
        Ok(())
    }

    /// Run a read-modify-write on the document and hand back what the
    /// mutation produced.
    async fn mutate<T, F>(&self, f: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CanvasDocument) -> (bool, T) + Send + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        self.documents
            .update(
                &self.canvas_id,
                Box::new(move |doc| {
                    let (changed, value) = f(doc);
                    *lock(&out) = Some(value);
                    changed
                }),
            )
            .await?;
        let value = lock(&slot).take();
        value.ok_or_else(|| StoreError::Other("mutation was not applied".to_string()).into())
    }

    fn record(&self, changes: Vec<ChangeEntry>, batch_action: HistoryAction, description: String) {
        let mut history = lock(&self.history);
        if let [change] = changes.as_slice() {
            history.record(change.shape_id, &change.before, &change.after, change.action);
        } else if !changes.is_empty() {
            history.record_batch(changes, batch_action, Some(description));
        }
    }

    // --- Document mutations ---

    /// Create a shape. It shows up in [`shapes`](Self::shapes) immediately.
    pub async fn add_shape(&self, shape: Shape) -> SessionResult<ShapeId> {
        let ids = self.add_shapes(vec![shape]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| StoreError::Other("no shape created".to_string()).into())
    }

    pub async fn add_shapes(&self, shapes: Vec<Shape>) -> SessionResult<Vec<ShapeId>> {
        if shapes.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let shapes: Vec<Shape> = shapes
            .into_iter()
            .map(|mut shape| {
                if shape.id.is_nil() {
                    shape.id = Uuid::new_v4();
                }
                shape.created_by = self.user.id.clone();
                shape.created_at = now;
                shape.updated_at = now;
                shape
            })
            .collect();
        let ids: Vec<ShapeId> = shapes.iter().map(|s| s.id).collect();

        let to_write = shapes.clone();
        optimistic::attempt(
            || {
                let mut optimistic = lock(&self.optimistic);
                for shape in &shapes {
                    optimistic.insert(shape.clone());
                }
            },
            self.mutate(move |doc| {
                for shape in to_write {
                    doc.add_shape(shape);
                }
                (true, ())
            }),
            |result| {
                if let Err(e) = result {
                    log::warn!("Failed to create {} shapes: {}", ids.len(), e);
                    let mut optimistic = lock(&self.optimistic);
                    for id in &ids {
                        optimistic.discard(*id);
                    }
                }
            },
        )
        .await?;

        let changes = shapes
            .iter()
            .map(|shape| ChangeEntry {
                shape_id: shape.id,
                action: HistoryAction::Create,
                before: FieldMap::new(),
                after: shape.to_fields(),
            })
            .collect();
        self.record(changes, HistoryAction::BatchCreate, format!("Add {} shapes", ids.len()));
        Ok(ids)
    }

    /// Overwrite fields of a shape. Immutable fields are ignored.
    pub async fn update_shape(&self, id: ShapeId, patch: FieldMap) -> SessionResult<()> {
        self.update_shapes(vec![(id, patch)]).await
    }

    pub async fn update_shapes(&self, patches: Vec<(ShapeId, FieldMap)>) -> SessionResult<()> {
        let edits = patches
            .into_iter()
            .map(|(id, fields)| (id, ShapeEdit::Fields(fields)))
            .collect();
        self.apply_edits(edits, "Update").await.map(|_| ())
    }

    async fn apply_edits(&self, edits: Vec<(ShapeId, ShapeEdit)>, verb: &str) -> SessionResult<usize> {
        if edits.is_empty() {
            return Ok(0);
        }
        let ids: Vec<ShapeId> = edits.iter().map(|(id, _)| *id).collect();
        self.check_editable(&ids)?;

        let now = self.clock.now();
        let changed: Vec<(Shape, Shape)> = self
            .mutate(move |doc| {
                let mut changed = Vec::new();
                for (id, edit) in &edits {
                    let Some(shape) = doc.get_shape(*id) else {
                        return (false, Err(SessionError::ShapeNotFound(*id)));
                    };
                    match edit.apply(shape) {
                        Ok(mut next) => {
                            if next == *shape {
                                continue;
                            }
                            next.updated_at = now;
                            changed.push((shape.clone(), next));
                        }
                        Err(e) => return (false, Err(e.into())),
                    }
                }
                for (_, next) in &changed {
                    doc.add_shape(next.clone());
                }
                (!changed.is_empty(), Ok(changed))
            })
            .await??;

        let count = changed.len();
        let changes = changed
            .into_iter()
            .map(|(before, after)| ChangeEntry {
                shape_id: before.id,
                action: HistoryAction::Update,
                before: before.to_fields(),
                after: after.to_fields(),
            })
            .collect();
        self.record(changes, HistoryAction::BatchUpdate, format!("{} {} shapes", verb, count));
        Ok(count)
    }

    /// Delete a shape, dropping it from the selection and releasing its lock.
    pub async fn delete_shape(&self, id: ShapeId) -> SessionResult<()> {
        self.delete_shapes(&[id]).await
    }

    pub async fn delete_shapes(&self, ids: &[ShapeId]) -> SessionResult<()> {
        let ids = dedup(ids);
        if ids.is_empty() {
            return Ok(());
        }
        self.check_editable(&ids)?;

        let editing: Vec<ShapeId> = self
            .live_edits
            .editing()
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect();
        self.live_edits.end_edit_batch(&editing).await;
        {
            let mut optimistic = lock(&self.optimistic);
            for id in &ids {
                optimistic.discard(*id);
            }
        }

        let to_remove = ids.clone();
        let removed: Vec<Shape> = self
            .mutate(move |doc| {
                let removed: Vec<Shape> = to_remove.iter().filter_map(|id| doc.remove_shape(*id)).collect();
                (!removed.is_empty(), removed)
            })
            .await?;
        self.selection.forget_many(&ids).await;

        let count = removed.len();
        let changes = removed
            .into_iter()
            .map(|shape| ChangeEntry {
                shape_id: shape.id,
                action: HistoryAction::Delete,
                before: shape.to_fields(),
                after: FieldMap::new(),
            })
            .collect();
        self.record(changes, HistoryAction::BatchDelete, format!("Delete {} shapes", count));
        Ok(())
    }

    // --- Transforms ---

    /// Lock `ids` and open live edits on all of them, or on none.
    pub async fn begin_transform(&self, ids: &[ShapeId]) -> SessionResult<BatchEditResult> {
        let document = self.document();
        let mut geometry = HashMap::with_capacity(ids.len());
        for id in ids {
            let shape = match document.get_shape(*id) {
                Some(shape) => shape.clone(),
                None => lock(&self.optimistic)
                    .get(*id)
                    .cloned()
                    .ok_or(SessionError::ShapeNotFound(*id))?,
            };
            geometry.insert(*id, GeometryPatch::from_shape(&shape));
        }
        Ok(self.selection.start_editing_multiple(ids, &geometry).await)
    }

    /// Broadcast in-flight geometry. Returns how many shapes were broadcast.
    pub async fn transform(&self, patches: &HashMap<ShapeId, GeometryPatch>) -> usize {
        self.live_edits.update_batch(patches, false).await
    }

    /// Persist the accumulated geometry of every open live edit, record it
    /// as one undo step and end the edits. Locks stay held.
    pub async fn commit_transform(&self) -> SessionResult<usize> {
        let ids = self.live_edits.editing();
        if ids.is_empty() {
            return Ok(0);
        }
        let edits: Vec<(ShapeId, ShapeEdit)> = ids
            .iter()
            .filter_map(|id| {
                let patch = self.live_edits.local_geometry(*id)?;
                Some((*id, ShapeEdit::Geometry(patch)))
            })
            .collect();

        let result = self.apply_edits(edits, "Transform").await;
        self.live_edits.end_edit_batch(&ids).await;
        result
    }

    /// End every open live edit without persisting it.
    pub async fn cancel_transform(&self) {
        let ids = self.live_edits.editing();
        self.live_edits.end_edit_batch(&ids).await;
    }

    // --- Undo / redo ---

    /// Undo this client's newest change. Returns false when there is nothing
    /// to undo.
    pub async fn undo(&self) -> SessionResult<bool> {
        let replay = lock(&self.history).begin_undo();
        match replay {
            Some(replay) => self.replay(replay).await,
            None => Ok(false),
        }
    }

    pub async fn redo(&self) -> SessionResult<bool> {
        let replay = lock(&self.history).begin_redo();
        match replay {
            Some(replay) => self.replay(replay).await,
            None => Ok(false),
        }
    }

    async fn replay(&self, replay: Replay) -> SessionResult<bool> {
        let mut steps = replay.steps();
        steps.retain(|step| match self.locks.lock_owner(step.shape_id()) {
            Some(owner) if owner != self.user.id => {
                log::warn!("Skipping replay on {}: locked by {}", step.shape_id(), owner);
                false
            }
            _ => true,
        });
        let removed: Vec<ShapeId> = steps
            .iter()
            .filter(|s| matches!(s, ReplayStep::Remove { .. }))
            .map(ReplayStep::shape_id)
            .collect();

        let now = self.clock.now();
        let result = self
            .mutate(move |doc| {
                let changed = steps.iter().fold(false, |changed, step| step.apply(doc, now) | changed);
                (changed, ())
            })
            .await;

        match result {
            Ok(()) => {
                lock(&self.history).finish(replay);
                {
                    let mut optimistic = lock(&self.optimistic);
                    for id in &removed {
                        optimistic.discard(*id);
                    }
                }
                self.selection.forget_many(&removed).await;
                Ok(true)
            }
            Err(e) => {
                log::warn!("Replay failed, keeping entry: {}", e);
                lock(&self.history).abort(replay);
                Err(e)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.history).can_undo()
    }

    pub fn can_redo(&self) -> bool {
        lock(&self.history).can_redo()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    // --- Selection ---

    pub async fn select(&self, id: ShapeId) -> bool {
        self.selection.select(id).await
    }

    pub async fn toggle_selection(&self, id: ShapeId) -> bool {
        self.selection.toggle(id).await
    }

    pub async fn select_multiple(&self, ids: &[ShapeId]) -> BatchLockResult {
        self.selection.select_multiple(ids).await
    }

    /// Select every shape on the canvas that nobody else has locked.
    pub async fn select_all(&self) -> BatchLockResult {
        let ids: Vec<ShapeId> = self.shapes().iter().map(|s| s.id()).collect();
        self.selection.select_all(&ids).await
    }

    pub async fn clear_selection(&self) {
        self.selection.clear().await;
    }

    pub fn selection(&self) -> Selection {
        self.selection.selection()
    }

    pub fn subscribe_selection(&self) -> watch::Receiver<Selection> {
        self.selection.subscribe()
    }

    // --- Presence ---

    pub async fn set_cursor(&self, x: f64, y: f64) -> SessionResult<()> {
        Ok(self.presence.set_cursor(x, y).await?)
    }

    pub async fn clear_cursor(&self) -> SessionResult<()> {
        Ok(self.presence.clear_cursor().await?)
    }

    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.presence.peers()
    }

    /// Leave the canvas gracefully: end edits, release locks, remove
    /// presence and stop the heartbeat. Failures are logged; the stores'
    /// disconnect cleanup and lock expiry cover anything left behind.
    pub async fn disconnect(&self) {
        if let Some(mut heartbeat) = lock(&self.heartbeat).take() {
            heartbeat.stop();
        }

        self.cancel_transform().await;
        self.selection.clear().await;
        let held: Vec<ShapeId> = self.locks.held().into_iter().collect();
        self.locks.release_batch(&held, &self.user.id).await;

        if let Err(e) = self.presence.leave().await {
            log::warn!("Failed to remove presence: {}", e);
        }
        log::info!("{} disconnected from canvas {}", self.user.id, self.canvas_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryDocumentStore, MemoryEphemeralBackend, MemoryEphemeralStore};
    use serde_json::json;

    struct World {
        clock: ManualClock,
        documents: Arc<MemoryDocumentStore>,
        backend: Arc<MemoryEphemeralBackend>,
    }

    impl World {
        fn new() -> Self {
            let clock = ManualClock::new(1_000_000);
            Self {
                documents: Arc::new(MemoryDocumentStore::new()),
                backend: MemoryEphemeralBackend::new(Arc::new(clock.clone())),
                clock,
            }
        }

        async fn join(&self, user: &str) -> (CanvasSession, Arc<MemoryEphemeralStore>) {
            let connection = Arc::new(self.backend.connect());
            let session = CanvasSession::connect(
                SessionConfig::default(),
                "main",
                UserInfo::new(user, user.to_uppercase(), "#333"),
                self.documents.clone(),
                connection.clone(),
                Arc::new(self.clock.clone()),
            )
            .await
            .unwrap();
            (session, connection)
        }
    }

    fn patch(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_user() {
        let world = World::new();
        let result = CanvasSession::connect(
            SessionConfig::default(),
            "main",
            UserInfo::new("", "Nobody", "#000"),
            world.documents.clone(),
            Arc::new(world.backend.connect()),
            Arc::new(world.clock.clone()),
        )
        .await;
        assert!(matches!(result, Err(SessionError::EmptyUserId)));
    }

    #[tokio::test]
    async fn test_connect_rejects_path_in_user_id() {
        let world = World::new();
        let result = CanvasSession::connect(
            SessionConfig::default(),
            "main",
            UserInfo::new("alice/../locks", "Alice", "#000"),
            world.documents.clone(),
            Arc::new(world.backend.connect()),
            Arc::new(world.clock.clone()),
        )
        .await;
        assert!(matches!(result, Err(SessionError::InvalidUserId(_))));
        assert!(world.backend.snapshot("presence/main").is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_config() {
        let world = World::new();
        let config = SessionConfig {
            heartbeat_interval_ms: 20_000,
            ..SessionConfig::default()
        };
        let result = CanvasSession::connect(
            config,
            "main",
            UserInfo::new("alice", "Alice", "#000"),
            world.documents.clone(),
            Arc::new(world.backend.connect()),
            Arc::new(world.clock.clone()),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_add_stamps_and_shows_everywhere() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;

        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).await.unwrap();

        let shape = alice.document().get_shape(id).cloned().unwrap();
        assert_eq!(shape.created_by, "alice");
        assert_eq!(shape.created_at, 1_000_000);
        assert_eq!(bob.shapes().len(), 1);
        assert!(alice.can_undo());
    }

    #[tokio::test]
    async fn test_create_then_delete_before_echo_leaves_no_ghost() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        world.documents.hold_notifications(true);

        let id = alice.add_shape(Shape::circle(5.0, 5.0, 2.0)).await.unwrap();
        let view = alice.shapes();
        assert_eq!(view.len(), 1);
        assert!(view[0].pending);

        alice.delete_shape(id).await.unwrap();
        assert!(alice.shapes().is_empty());

        world.documents.hold_notifications(false);
        assert!(alice.shapes().is_empty());
        assert!(!alice.document().contains(id));
    }

    #[tokio::test]
    async fn test_update_undo_redo() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let id = alice.add_shape(Shape::rectangle(10.0, 0.0, 5.0, 5.0)).await.unwrap();
        alice.clear_history();

        alice.update_shape(id, patch(json!({"x": 50.0}))).await.unwrap();
        assert_eq!(alice.document().get_shape(id).unwrap().x, 50.0);

        assert!(alice.undo().await.unwrap());
        assert_eq!(alice.document().get_shape(id).unwrap().x, 10.0);
        assert!(alice.redo().await.unwrap());
        assert_eq!(alice.document().get_shape(id).unwrap().x, 50.0);

        assert!(alice.undo().await.unwrap());
        assert!(!alice.undo().await.unwrap());
        assert_eq!(alice.document().get_shape(id).unwrap().x, 10.0);
        assert!(alice.can_redo());
    }

    #[tokio::test]
    async fn test_noop_update_not_recorded() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let id = alice.add_shape(Shape::rectangle(5.0, 5.0, 1.0, 1.0)).await.unwrap();
        alice.clear_history();

        alice.update_shape(id, patch(json!({"x": 5.0, "y": 5.0}))).await.unwrap();
        assert!(!alice.can_undo());
    }

    #[tokio::test]
    async fn test_new_edit_clears_redo() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        alice.update_shape(id, patch(json!({"x": 1.0}))).await.unwrap();
        alice.undo().await.unwrap();
        assert!(alice.can_redo());

        alice.update_shape(id, patch(json!({"y": 1.0}))).await.unwrap();
        assert!(!alice.can_redo());
    }

    #[tokio::test]
    async fn test_update_rejected_when_locked_by_other() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        assert!(bob.select(id).await);
        let result = alice.update_shape(id, patch(json!({"x": 9.0}))).await;
        assert!(matches!(result, Err(SessionError::LockedByOther(_, ref owner)) if owner == "bob"));
        assert!(matches!(alice.delete_shape(id).await, Err(SessionError::LockedByOther(..))));
    }

    #[tokio::test]
    async fn test_missing_shape_rejected() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let ghost = ShapeId::new_v4();
        assert!(matches!(
            alice.update_shape(ghost, FieldMap::new()).await,
            Err(SessionError::ShapeNotFound(id)) if id == ghost
        ));
        assert!(matches!(alice.delete_shape(ghost).await, Err(SessionError::ShapeNotFound(_))));
    }

    #[tokio::test]
    async fn test_transform_overlay_and_commit() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let ids = alice
            .add_shapes(vec![
                Shape::rectangle(0.0, 0.0, 10.0, 10.0),
                Shape::circle(50.0, 50.0, 5.0).with_z_index(1),
            ])
            .await
            .unwrap();
        alice.clear_history();

        let started = alice.begin_transform(&ids).await.unwrap();
        assert!(started.success);

        let patches = ids
            .iter()
            .map(|id| (*id, GeometryPatch::position(100.0, 100.0)))
            .collect();
        assert_eq!(alice.transform(&patches).await, 2);

        // Bob sees the drag, Alice's own view is not overlaid
        assert!(bob.shapes().iter().all(|s| s.shape.x == 100.0));
        assert!(bob.shapes().iter().all(|s| s.lock_owner.as_deref() == Some("alice")));
        assert_eq!(alice.shapes()[0].shape.x, 0.0);

        assert_eq!(alice.commit_transform().await.unwrap(), 2);
        assert!(bob.live_edits().live_edits().is_empty());
        assert!(ids.iter().all(|id| bob.document().get_shape(*id).unwrap().x == 100.0));
        assert_eq!(alice.locks().held().len(), 2);

        // One undo step for the whole group
        assert!(alice.undo().await.unwrap());
        assert_eq!(bob.document().get_shape(ids[0]).unwrap().x, 0.0);
        assert_eq!(bob.document().get_shape(ids[1]).unwrap().x, 50.0);
        assert!(!alice.can_undo());
    }

    #[tokio::test]
    async fn test_group_transform_blocked_by_one_lock() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let ids = alice
            .add_shapes(vec![
                Shape::rectangle(0.0, 0.0, 1.0, 1.0),
                Shape::rectangle(5.0, 5.0, 1.0, 1.0),
            ])
            .await
            .unwrap();

        assert!(bob.select(ids[1]).await);
        let result = alice.begin_transform(&ids).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.blocked_ids, vec![ids[1]]);
        assert!(bob.live_edits().live_edits().is_empty());
    }

    #[tokio::test]
    async fn test_undo_of_create_deselects() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        assert!(alice.select(id).await);

        assert!(alice.undo().await.unwrap());
        assert!(!alice.document().contains(id));
        assert!(alice.selection().is_empty());
        assert!(alice.locks().lock_owner(id).is_none());
    }

    #[tokio::test]
    async fn test_undo_delete_when_id_recreated() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let original = Shape::rectangle(0.0, 0.0, 1.0, 1.0);
        let id = alice.add_shape(original.clone()).await.unwrap();
        alice.delete_shape(id).await.unwrap();

        let mut replacement = original.clone();
        replacement.x = 99.0;
        bob.add_shape(replacement).await.unwrap();

        assert!(alice.undo().await.unwrap());
        let shape = alice.document().get_shape(id).cloned().unwrap();
        assert_eq!(shape.x, 99.0);
        assert_eq!(shape.created_by, "bob");
    }

    #[tokio::test]
    async fn test_undo_skips_shape_locked_by_other() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        alice.update_shape(id, patch(json!({"x": 10.0}))).await.unwrap();

        assert!(bob.select(id).await);
        bob.update_shape(id, patch(json!({"x": 500.0}))).await.unwrap();

        assert!(alice.undo().await.unwrap());
        assert_eq!(alice.document().get_shape(id).unwrap().x, 500.0);
        assert_eq!(alice.locks().lock_owner(id).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_deselect_mid_transform_drops_overlay() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        assert!(alice.begin_transform(&[id]).await.unwrap().success);
        let patches = HashMap::from([(id, GeometryPatch::position(77.0, 0.0))]);
        assert_eq!(alice.transform(&patches).await, 1);
        assert_eq!(bob.shapes()[0].shape.x, 77.0);

        assert!(!alice.toggle_selection(id).await);
        assert!(bob.select(id).await);

        assert!(bob.live_edits().live_edits().is_empty());
        assert_eq!(bob.shapes()[0].shape.x, 0.0);
        assert_eq!(bob.shapes()[0].lock_owner.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_reselect_keeps_lock() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let ids = alice
            .add_shapes(vec![
                Shape::rectangle(0.0, 0.0, 1.0, 1.0),
                Shape::rectangle(5.0, 5.0, 1.0, 1.0),
            ])
            .await
            .unwrap();

        assert!(alice.select(ids[0]).await);
        assert!(alice.select(ids[1]).await);
        assert!(alice.select(ids[0]).await);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(bob.locks().lock_owner(ids[0]).as_deref(), Some("alice"));
        assert!(bob.locks().lock_owner(ids[1]).is_none());
        assert!(!bob.select(ids[0]).await);
    }

    #[tokio::test]
    async fn test_undo_update_of_deleted_shape_is_noop() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        alice.update_shape(id, patch(json!({"x": 3.0}))).await.unwrap();
        bob.delete_shape(id).await.unwrap();

        assert!(alice.undo().await.unwrap());
        assert!(!alice.document().contains(id));
        assert!(alice.can_redo());
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_optimistic() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        world.documents.set_available(false);

        let result = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await;
        assert!(matches!(result, Err(SessionError::Store(_))));
        assert!(alice.shapes().is_empty());
        assert!(!alice.can_undo());
    }

    #[tokio::test]
    async fn test_ungraceful_disconnect_cleans_up() {
        let world = World::new();
        let (alice, connection) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        assert!(alice.begin_transform(&[id]).await.unwrap().success);
        alice.set_cursor(3.0, 4.0).await.unwrap();
        assert_eq!(bob.peers().len(), 1);
        assert_eq!(bob.locks().lock_owner(id).as_deref(), Some("alice"));

        connection.disconnect();

        assert!(bob.locks().locks().is_empty());
        assert!(bob.live_edits().live_edits().is_empty());
        assert!(bob.peers().is_empty());
        assert!(bob.select(id).await);
    }

    #[tokio::test]
    async fn test_graceful_disconnect() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let id = alice.add_shape(Shape::rectangle(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        assert!(alice.select(id).await);

        alice.disconnect().await;

        assert!(alice.locks().held().is_empty());
        assert!(bob.locks().lock_owner(id).is_none());
        assert!(bob.peers().is_empty());
    }

    #[tokio::test]
    async fn test_select_all_skips_foreign_locks() {
        let world = World::new();
        let (alice, _) = world.join("alice").await;
        let (bob, _) = world.join("bob").await;
        let ids = alice
            .add_shapes(vec![
                Shape::rectangle(0.0, 0.0, 1.0, 1.0),
                Shape::rectangle(1.0, 1.0, 1.0, 1.0),
                Shape::rectangle(2.0, 2.0, 1.0, 1.0),
            ])
            .await
            .unwrap();

        assert!(bob.select(ids[0]).await);
        let result = alice.select_all().await;
        assert_eq!(result.acquired.len(), 2);
        assert_eq!(result.failed, vec![ids[0]]);
        assert_eq!(alice.selection().len(), 2);
    }
}
