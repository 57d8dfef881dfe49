//! External store abstractions.
//!
//! Two collaborators back the core:
//!
//! - a [`DocumentStore`] holding the authoritative shape collection, with
//!   whole-document read-modify-write and push subscriptions;
//! - an [`EphemeralStore`], a path-addressed JSON tree with multi-path
//!   writes, per-path subscriptions, remove-on-disconnect registration and a
//!   server clock. Locks, live edits and presence live here.
//!
//! Paths are `/`-separated; see [`paths`] for the layout used by the core.

mod file;
mod memory;

pub use file::FileDocumentStore;
pub use memory::{MemoryDocumentStore, MemoryEphemeralBackend, MemoryEphemeralStore};

use crate::canvas::CanvasDocument;
use crate::clock::Timestamp;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("Store error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future for async store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A read-modify-write step over a whole document.
///
/// Returns whether it changed anything; unchanged documents are not written
/// and do not notify subscribers.
pub type Mutation = Box<dyn FnOnce(&mut CanvasDocument) -> bool + Send>;

/// The authoritative, durable shape collection.
pub trait DocumentStore: Send + Sync {
    /// Read the full document. A canvas that was never written is empty.
    fn load(&self, canvas_id: &str) -> BoxFuture<'_, StoreResult<CanvasDocument>>;

    /// Atomically apply `mutation` to the current document.
    /// Resolves to whether the document changed.
    fn update(&self, canvas_id: &str, mutation: Mutation) -> BoxFuture<'_, StoreResult<bool>>;

    /// Subscribe to the full document, re-delivered after every change.
    fn subscribe(&self, canvas_id: &str) -> watch::Receiver<Arc<CanvasDocument>>;
}

/// One entry of a multi-path write.
#[derive(Debug, Clone, PartialEq)]
pub struct PathWrite {
    pub path: String,
    /// `None` removes the path.
    pub value: Option<Value>,
}

impl PathWrite {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: None,
        }
    }
}

/// A removal the store performs when this client's connection drops.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectHook {
    pub path: String,
    /// Skip the removal unless child `.0` of `path` still equals `.1`.
    pub guard: Option<(String, Value)>,
}

impl DisconnectHook {
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            guard: None,
        }
    }

    /// Remove `path` only while its `field` still holds `owner`, so a record
    /// someone else has taken over survives this client's drop.
    pub fn remove_if_owned(path: impl Into<String>, field: impl Into<String>, owner: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            guard: Some((field.into(), owner.into())),
        }
    }
}

/// The low-latency, non-durable store shared by all clients.
pub trait EphemeralStore: Send + Sync {
    /// Read the subtree at `path`.
    fn get(&self, path: &str) -> BoxFuture<'_, StoreResult<Option<Value>>>;

    /// Apply every write as one operation.
    fn update(&self, writes: Vec<PathWrite>) -> BoxFuture<'_, StoreResult<()>>;

    /// Subscribe to the subtree at `path`.
    fn subscribe(&self, path: &str) -> watch::Receiver<Option<Value>>;

    /// Run `hooks` when this client's connection drops, without the client
    /// running any code. A later hook for the same path replaces the earlier one.
    fn on_disconnect(&self, hooks: Vec<DisconnectHook>) -> BoxFuture<'_, StoreResult<()>>;

    /// Withdraw earlier [`EphemeralStore::on_disconnect`] registrations.
    fn cancel_on_disconnect(&self, paths: Vec<String>) -> BoxFuture<'_, StoreResult<()>>;

    /// The store's clock, used for every lock and heartbeat timestamp.
    fn server_time(&self) -> Timestamp;
}

/// Ephemeral store path layout.
pub mod paths {
    use crate::shapes::ShapeId;

    pub fn locks(canvas_id: &str) -> String {
        format!("locks/{canvas_id}")
    }

    pub fn lock(canvas_id: &str, shape_id: ShapeId) -> String {
        format!("locks/{canvas_id}/{shape_id}")
    }

    pub fn live_edits(canvas_id: &str) -> String {
        format!("liveEdits/{canvas_id}")
    }

    pub fn live_edit(canvas_id: &str, shape_id: ShapeId) -> String {
        format!("liveEdits/{canvas_id}/{shape_id}")
    }

    pub fn presence(canvas_id: &str) -> String {
        format!("presence/{canvas_id}")
    }

    pub fn presence_entry(canvas_id: &str, user_id: &str) -> String {
        format!("presence/{canvas_id}/{user_id}")
    }
}
