//! Optimistic local state.
//!
//! Local changes are shown before the store confirms them and rolled back
//! when it does not. [`attempt`] is the one place that sequencing lives;
//! [`OptimisticShapes`] holds created shapes until the document echoes them.

use crate::canvas::CanvasDocument;
use crate::shapes::{Shape, ShapeId};
use std::collections::HashMap;
use std::future::Future;

/// Apply a change, await its confirmation, then settle.
///
/// `apply` runs synchronously before anything is awaited, so the change is
/// visible to readers for the whole round trip. `settle` receives the
/// outcome and rolls back whatever was not confirmed.
pub async fn attempt<T, Fut>(apply: impl FnOnce(), confirm: Fut, settle: impl FnOnce(&T)) -> T
where
    Fut: Future<Output = T>,
{
    apply();
    let outcome = confirm.await;
    settle(&outcome);
    outcome
}

/// Shapes created locally whose write has not been echoed back yet.
#[derive(Debug, Clone, Default)]
pub struct OptimisticShapes {
    shapes: HashMap<ShapeId, Shape>,
}

impl OptimisticShapes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, shape: Shape) {
        self.shapes.insert(shape.id, shape);
    }

    /// Forget a shape, e.g. because it was deleted or its write failed.
    pub fn discard(&mut self, id: ShapeId) -> Option<Shape> {
        self.shapes.remove(&id)
    }

    /// Drop every shape the document now contains. Returns how many were dropped.
    pub fn confirm_against(&mut self, document: &CanvasDocument) -> usize {
        let before = self.shapes.len();
        self.shapes.retain(|id, _| !document.contains(*id));
        before - self.shapes.len()
    }

    pub fn contains(&self, id: ShapeId) -> bool {
        self.shapes.contains_key(&id)
    }

    pub fn get(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }
}
