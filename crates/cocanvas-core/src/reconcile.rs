//! Merging persisted, live and optimistic state into one shape list.

use crate::canvas::CanvasDocument;
use crate::live_edit::LiveEdit;
use crate::lock::LockRecord;
use crate::optimistic::OptimisticShapes;
use crate::shapes::{GeometryPatch, Shape, ShapeId, UserId};
use std::collections::HashMap;
use std::sync::Arc;

/// A shape as every consumer should render it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledShape {
    pub shape: Shape,
    /// Owner of the active lock on the shape, if any.
    pub lock_owner: Option<UserId>,
    /// Created locally and not yet confirmed by the document store.
    pub pending: bool,
}

impl ReconciledShape {
    pub fn id(&self) -> ShapeId {
        self.shape.id
    }
}

/// The inputs one output entry was derived from.
#[derive(PartialEq)]
struct Derivation {
    base: Shape,
    overlay: Option<GeometryPatch>,
    lock_owner: Option<UserId>,
    pending: bool,
}

struct Memo {
    derivation: Derivation,
    output: Arc<ReconciledShape>,
}

/// Computes the merged view for one viewer.
///
/// Apart from the memo the output is a pure function of the inputs. The
/// memo makes unchanged shapes come back as the same `Arc` across calls, so
/// consumers can skip work with [`Arc::ptr_eq`].
pub struct Reconciler {
    viewer: UserId,
    memo: HashMap<ShapeId, Memo>,
}

impl Reconciler {
    pub fn new(viewer: impl Into<UserId>) -> Self {
        Self {
            viewer: viewer.into(),
            memo: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    /// Produce the merged, paint-ordered shape list.
    ///
    /// - Live edits are overlaid unless the viewer owns them, and only while
    ///   their owner holds the active lock on the shape.
    /// - Every shape is annotated with its active lock owner.
    /// - Optimistic shapes not yet in the document are appended.
    /// - Output is sorted by z-index, ties broken by id.
    ///
    /// `locks` is expected to hold active locks only.
    pub fn reconcile(
        &mut self,
        document: &CanvasDocument,
        live_edits: &HashMap<ShapeId, LiveEdit>,
        locks: &HashMap<ShapeId, LockRecord>,
        optimistic: &OptimisticShapes,
    ) -> Vec<Arc<ReconciledShape>> {
        let mut derivations: Vec<Derivation> = Vec::with_capacity(document.len() + optimistic.len());

        for shape in document.shapes.values() {
            let lock_owner = locks.get(&shape.id).map(|r| r.locked_by.clone());
            let overlay = live_edits
                .get(&shape.id)
                .filter(|edit| edit.locked_by != self.viewer)
                .filter(|edit| lock_owner.as_deref() == Some(edit.locked_by.as_str()))
                .map(|edit| edit.geometry.clone());
            derivations.push(Derivation {
                base: shape.clone(),
                overlay,
                lock_owner,
                pending: false,
            });
        }

        for shape in optimistic.iter().filter(|s| !document.contains(s.id)) {
            derivations.push(Derivation {
                base: shape.clone(),
                overlay: None,
                lock_owner: locks.get(&shape.id).map(|r| r.locked_by.clone()),
                pending: true,
            });
        }

        let mut previous = std::mem::take(&mut self.memo);
        let mut output = Vec::with_capacity(derivations.len());
        for derivation in derivations {
            let id = derivation.base.id;
            let shape = match previous.remove(&id) {
                Some(memo) if memo.derivation == derivation => {
                    let shape = memo.output.clone();
                    self.memo.insert(id, memo);
                    shape
                }
                _ => {
                    let shape = Arc::new(derive(&derivation));
                    self.memo.insert(
                        id,
                        Memo {
                            derivation,
                            output: shape.clone(),
                        },
                    );
                    shape
                }
            };
            output.push(shape);
        }

        output.sort_by(|a, b| {
            a.shape
                .z_index
                .cmp(&b.shape.z_index)
                .then(a.shape.id.cmp(&b.shape.id))
        });
        output
    }
}

fn derive(derivation: &Derivation) -> ReconciledShape {
    let shape = match &derivation.overlay {
        Some(patch) => patch.apply(&derivation.base),
        None => derivation.base.clone(),
    };
    ReconciledShape {
        shape,
        lock_owner: derivation.lock_owner.clone(),
        pending: derivation.pending,
    }
}
