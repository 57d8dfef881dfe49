//! Selection backed by locks.
//!
//! Selecting a shape means trying to lock it. The selection is updated
//! optimistically so the UI responds immediately, and rolled back for every
//! id whose lock was denied.

use crate::live_edit::{BatchEditResult, LiveEditOverlay};
use crate::lock::{BatchLockResult, LockManager, dedup};
use crate::optimistic;
use crate::shapes::{GeometryPatch, ShapeId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Per-shape selection state. Unselected shapes are absent from the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionState {
    /// Shown as selected while the lock request is in flight.
    LockPending,
    LockedSelected,
}

/// The local selection set.
pub type Selection = BTreeMap<ShapeId, SelectionState>;

pub struct SelectionCoordinator {
    user_id: UserId,
    locks: LockManager,
    overlay: Arc<LiveEditOverlay>,
    state: watch::Sender<Selection>,
}

impl SelectionCoordinator {
    pub fn new(user_id: impl Into<UserId>, locks: LockManager, overlay: Arc<LiveEditOverlay>) -> Self {
        let (state, _) = watch::channel(Selection::new());
        Self {
            user_id: user_id.into(),
            locks,
            overlay,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Selection> {
        self.state.subscribe()
    }

    pub fn selection(&self) -> Selection {
        self.state.borrow().clone()
    }

    /// Selected ids, pending ones included.
    pub fn selected_ids(&self) -> Vec<ShapeId> {
        self.state.borrow().keys().copied().collect()
    }

    pub fn state_of(&self, id: ShapeId) -> Option<SelectionState> {
        self.state.borrow().get(&id).copied()
    }

    pub fn is_selected(&self, id: ShapeId) -> bool {
        self.state.borrow().contains_key(&id)
    }

    /// Release locks without waiting for the outcome.
    ///
    /// An id locked again before the task runs keeps its lock. Live edits on
    /// the released ids are ended first, since an edit must not outlive its
    /// lock.
    fn release_in_background(&self, ids: Vec<ShapeId>) {
        if ids.is_empty() {
            return;
        }
        let ticket = self.locks.release_ticket(&ids);
        let locks = self.locks.clone();
        let overlay = self.overlay.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            let releasing = locks.unchanged(&ticket);
            end_edits(&overlay, &releasing).await;
            locks.release_unchanged(ticket, &user_id).await;
        });
    }

    /// Promote granted ids and drop denied ones.
    ///
    /// Ids granted after they were deselected in the meantime get their lock
    /// released again.
    fn settle(&self, granted: &[ShapeId], denied: &[ShapeId]) {
        let mut orphaned = Vec::new();
        self.state.send_modify(|selection| {
            for id in granted {
                match selection.get_mut(id) {
                    Some(state) => *state = SelectionState::LockedSelected,
                    None => orphaned.push(*id),
                }
            }
            for id in denied {
                selection.remove(id);
            }
        });
        self.release_in_background(orphaned);
    }

    /// Make `id` the only selected shape. Returns whether its lock was granted.
    pub async fn select(&self, id: ShapeId) -> bool {
        let previous: Vec<ShapeId> = self.selected_ids().into_iter().filter(|p| *p != id).collect();
        self.release_in_background(previous);

        optimistic::attempt(
            || {
                self.state
                    .send_replace(Selection::from([(id, SelectionState::LockPending)]));
            },
            self.locks.acquire(id, &self.user_id),
            |granted| {
                if *granted {
                    self.settle(&[id], &[]);
                } else {
                    log::debug!("Selection of {} rolled back: lock denied", id);
                    self.settle(&[], &[id]);
                }
            },
        )
        .await
    }

    /// Add `id` to the selection, or remove it if already selected.
    /// Returns whether `id` is selected afterwards.
    pub async fn toggle(&self, id: ShapeId) -> bool {
        if self.is_selected(id) {
            self.forget(id).await;
            return false;
        }

        optimistic::attempt(
            || {
                self.state.send_modify(|selection| {
                    selection.insert(id, SelectionState::LockPending);
                });
            },
            self.locks.acquire(id, &self.user_id),
            |granted| {
                if *granted {
                    self.settle(&[id], &[]);
                } else {
                    self.settle(&[], &[id]);
                }
            },
        )
        .await
    }

    /// Replace the selection with `ids`, locking them as one batch.
    ///
    /// Ids already locked by someone else are never shown as selected; ids
    /// whose batch acquisition failed are rolled back.
    pub async fn select_multiple(&self, ids: &[ShapeId]) -> BatchLockResult {
        let (candidates, foreign): (Vec<ShapeId>, Vec<ShapeId>) = dedup(ids)
            .into_iter()
            .partition(|id| !self.locks.is_locked_by_other(*id, &self.user_id));

        let previous: Vec<ShapeId> = self
            .selected_ids()
            .into_iter()
            .filter(|p| !candidates.contains(p))
            .collect();
        self.release_in_background(previous);

        let mut result = optimistic::attempt(
            || {
                self.state.send_replace(
                    candidates
                        .iter()
                        .map(|id| (*id, SelectionState::LockPending))
                        .collect(),
                );
            },
            self.locks.acquire_batch(&candidates, &self.user_id),
            |result: &BatchLockResult| {
                if !result.failed.is_empty() {
                    log::debug!("{} shapes rolled back from selection", result.failed.len());
                }
                self.settle(&result.acquired, &result.failed);
            },
        )
        .await;

        result.failed.extend(foreign);
        result
    }

    /// Select every shape in `ids` (normally the whole canvas).
    pub async fn select_all(&self, ids: &[ShapeId]) -> BatchLockResult {
        self.select_multiple(ids).await
    }

    /// Deselect everything and release the locks.
    pub async fn clear(&self) {
        let ids: Vec<ShapeId> = self.state.send_replace(Selection::new()).into_keys().collect();
        end_edits(&self.overlay, &ids).await;
        self.locks.release_batch(&ids, &self.user_id).await;
    }

    /// Drop `id` from the selection and release its lock.
    pub async fn forget(&self, id: ShapeId) {
        self.forget_many(&[id]).await;
    }

    pub async fn forget_many(&self, ids: &[ShapeId]) {
        self.state.send_if_modified(|selection| {
            let before = selection.len();
            selection.retain(|id, _| !ids.contains(id));
            selection.len() != before
        });
        end_edits(&self.overlay, ids).await;
        self.locks.release_batch(ids, &self.user_id).await;
    }

    /// Lock `ids` and open live edits on all of them, or on none.
    ///
    /// On success the ids join the selection as locked.
    pub async fn start_editing_multiple(
        &self,
        ids: &[ShapeId],
        geometry: &HashMap<ShapeId, GeometryPatch>,
    ) -> BatchEditResult {
        let ids = dedup(ids);
        let already_held = self.locks.held();

        let locked = self.locks.acquire_batch(&ids, &self.user_id).await;
        let fresh: Vec<ShapeId> = locked
            .acquired
            .iter()
            .filter(|id| !already_held.contains(id))
            .copied()
            .collect();
        if !locked.all_acquired() {
            log::debug!("Group edit blocked on {} shapes", locked.failed.len());
            self.locks.release_batch(&fresh, &self.user_id).await;
            return BatchEditResult {
                success: false,
                editable_ids: locked.acquired,
                blocked_ids: locked.failed,
            };
        }

        let result = self.overlay.begin_edit_batch(&ids, &self.user_id, geometry).await;
        if !result.success {
            self.locks.release_batch(&fresh, &self.user_id).await;
            return result;
        }

        self.state.send_modify(|selection| {
            for id in &ids {
                selection.insert(*id, SelectionState::LockedSelected);
            }
        });
        result
    }
}

/// End this client's open live edits on any of `ids`.
async fn end_edits(overlay: &LiveEditOverlay, ids: &[ShapeId]) {
    let editing: Vec<ShapeId> = overlay
        .editing()
        .into_iter()
        .filter(|id| ids.contains(id))
        .collect();
    if !editing.is_empty() {
        overlay.end_edit_batch(&editing).await;
    }
}
