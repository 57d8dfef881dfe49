//! In-memory store implementations.
//!
//! Used by tests and the demo. One backend is shared by every simulated
//! client; each client talks to it through its own connection handle so
//! disconnect hooks can be scoped per connection.

use super::{BoxFuture, DisconnectHook, DocumentStore, EphemeralStore, Mutation, PathWrite, StoreError, StoreResult};
use crate::canvas::CanvasDocument;
use crate::clock::{Clock, Timestamp};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

// ============================================================================
// Document store
// ============================================================================

struct DocumentSlot {
    current: Arc<CanvasDocument>,
    tx: watch::Sender<Arc<CanvasDocument>>,
}

impl DocumentSlot {
    fn new(canvas_id: &str) -> Self {
        let current = Arc::new(CanvasDocument::new(canvas_id));
        let (tx, _) = watch::channel(current.clone());
        Self { current, tx }
    }
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, DocumentSlot>>,
    unavailable: AtomicBool,
    notifications_held: AtomicBool,
}

impl MemoryDocumentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read and write fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay subscriber notifications, simulating a slow echo. Releasing
    /// delivers the latest document to every subscriber.
    pub fn hold_notifications(&self, held: bool) {
        self.notifications_held.store(held, Ordering::SeqCst);
        if !held {
            let docs = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
            for slot in docs.values() {
                slot.tx.send_replace(slot.current.clone());
            }
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("document store offline".to_string()));
        }
        Ok(())
    }

    fn documents(&self) -> StoreResult<MutexGuard<'_, HashMap<String, DocumentSlot>>> {
        self.documents
            .lock()
            .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, canvas_id: &str) -> BoxFuture<'_, StoreResult<CanvasDocument>> {
        let canvas_id = canvas_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            let docs = self.documents()?;
            Ok(docs
                .get(&canvas_id)
                .map(|slot| slot.current.as_ref().clone())
                .unwrap_or_else(|| CanvasDocument::new(canvas_id)))
        })
    }

    fn update(&self, canvas_id: &str, mutation: Mutation) -> BoxFuture<'_, StoreResult<bool>> {
        let canvas_id = canvas_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            let mut docs = self.documents()?;
            let slot = docs
                .entry(canvas_id.clone())
                .or_insert_with(|| DocumentSlot::new(&canvas_id));

            let mut next = slot.current.as_ref().clone();
            if !mutation(&mut next) {
                return Ok(false);
            }
            next.revision += 1;
            slot.current = Arc::new(next);

            if !self.notifications_held.load(Ordering::SeqCst) {
                slot.tx.send_replace(slot.current.clone());
            }
            Ok(true)
        })
    }

    fn subscribe(&self, canvas_id: &str) -> watch::Receiver<Arc<CanvasDocument>> {
        let mut docs = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        docs.entry(canvas_id.to_string())
            .or_insert_with(|| DocumentSlot::new(canvas_id))
            .tx
            .subscribe()
    }
}

// ============================================================================
// Ephemeral store
// ============================================================================

struct Subscriber {
    path: String,
    tx: watch::Sender<Option<Value>>,
}

#[derive(Default)]
struct EphemeralState {
    root: Value,
    subscribers: Vec<Subscriber>,
    disconnect_hooks: HashMap<u64, BTreeMap<String, Option<(String, Value)>>>,
}

impl EphemeralState {
    fn apply(&mut self, writes: &[PathWrite]) {
        for write in writes {
            let segs = segments(&write.path);
            match &write.value {
                Some(value) if !value.is_null() => tree_set(&mut self.root, &segs, value.clone()),
                _ => tree_remove(&mut self.root, &segs),
            }
        }
        self.notify(writes.iter().map(|w| w.path.as_str()));
    }

    fn notify<'a>(&mut self, written: impl Iterator<Item = &'a str> + Clone) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &self.subscribers {
            if !written.clone().any(|path| overlaps(&sub.path, path)) {
                continue;
            }
            let value = tree_get(&self.root, &segments(&sub.path)).cloned();
            sub.tx.send_if_modified(|current| {
                if *current != value {
                    *current = value;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// The shared in-memory ephemeral tree. Clients talk to it through
/// [`MemoryEphemeralStore`] handles obtained from [`MemoryEphemeralBackend::connect`].
pub struct MemoryEphemeralBackend {
    state: Mutex<EphemeralState>,
    clock: Arc<dyn Clock>,
    next_connection: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryEphemeralBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EphemeralState::default()),
            clock,
            next_connection: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Open a new client connection.
    pub fn connect(self: &Arc<Self>) -> MemoryEphemeralStore {
        MemoryEphemeralStore {
            backend: self.clone(),
            connection: self.next_connection.fetch_add(1, Ordering::SeqCst),
            connected: AtomicBool::new(true),
        }
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Read a subtree synchronously (inspection helper).
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tree_get(&state.root, &segments(path)).cloned()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, EphemeralState>> {
        self.state
            .lock()
            .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ephemeral store offline".to_string()));
        }
        Ok(())
    }

    fn drop_connection(&self, connection: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(hooks) = state.disconnect_hooks.remove(&connection) else {
            return;
        };
        let writes: Vec<PathWrite> = hooks
            .into_iter()
            .filter(|(path, guard)| match guard {
                Some((field, expected)) => {
                    let mut segs = segments(path);
                    segs.push(field.as_str());
                    tree_get(&state.root, &segs) == Some(expected)
                }
                None => true,
            })
            .map(|(path, _)| PathWrite::remove(path))
            .collect();
        log::debug!("Connection {} dropped, removing {} paths", connection, writes.len());
        state.apply(&writes);
    }
}

/// One client's connection to a [`MemoryEphemeralBackend`].
pub struct MemoryEphemeralStore {
    backend: Arc<MemoryEphemeralBackend>,
    connection: u64,
    connected: AtomicBool,
}

impl MemoryEphemeralStore {
    /// Drop the connection ungracefully: every path registered through
    /// [`EphemeralStore::on_disconnect`] is removed by the backend.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.backend.drop_connection(self.connection);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &Arc<MemoryEphemeralBackend> {
        &self.backend
    }

    fn check_connected(&self) -> StoreResult<()> {
        if !self.is_connected() {
            return Err(StoreError::Disconnected);
        }
        self.backend.check_available()
    }
}

impl Drop for MemoryEphemeralStore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl EphemeralStore for MemoryEphemeralStore {
    fn get(&self, path: &str) -> BoxFuture<'_, StoreResult<Option<Value>>> {
        let segs: Vec<String> = segments(path).into_iter().map(str::to_string).collect();
        Box::pin(async move {
            self.check_connected()?;
            let state = self.backend.state()?;
            let segs: Vec<&str> = segs.iter().map(String::as_str).collect();
            Ok(tree_get(&state.root, &segs).cloned())
        })
    }

    fn update(&self, writes: Vec<PathWrite>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_connected()?;
            if writes.is_empty() {
                return Ok(());
            }
            let mut state = self.backend.state()?;
            state.apply(&writes);
            Ok(())
        })
    }

    fn subscribe(&self, path: &str) -> watch::Receiver<Option<Value>> {
        let mut state = self.backend.state.lock().unwrap_or_else(PoisonError::into_inner);
        let initial = tree_get(&state.root, &segments(path)).cloned();
        let (tx, rx) = watch::channel(initial);
        state.subscribers.push(Subscriber {
            path: path.to_string(),
            tx,
        });
        rx
    }

    fn on_disconnect(&self, hooks: Vec<DisconnectHook>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_connected()?;
            let mut state = self.backend.state()?;
            state
                .disconnect_hooks
                .entry(self.connection)
                .or_default()
                .extend(hooks.into_iter().map(|hook| (hook.path, hook.guard)));
            Ok(())
        })
    }

    fn cancel_on_disconnect(&self, paths: Vec<String>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_connected()?;
            let mut state = self.backend.state()?;
            if let Some(hooks) = state.disconnect_hooks.get_mut(&self.connection) {
                for path in &paths {
                    hooks.remove(path);
                }
            }
            Ok(())
        })
    }

    fn server_time(&self) -> Timestamp {
        self.backend.clock.now()
    }
}

// ============================================================================
// Tree helpers
// ============================================================================

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Whether one path is an ancestor of (or equal to) the other.
fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (segments(a), segments(b));
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn tree_get<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(*seg)?;
    }
    (!node.is_null()).then_some(node)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn tree_set(root: &mut Value, segs: &[&str], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.to_string())
            .or_insert(Value::Null);
    }
    ensure_object(node).insert(last.to_string(), value);
}

fn tree_remove(node: &mut Value, segs: &[&str]) {
    let Some((first, rest)) = segs.split_first() else {
        *node = Value::Null;
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(*first);
        return;
    }
    if let Some(child) = map.get_mut(*first) {
        tree_remove(child, rest);
        let empty = child.is_null() || child.as_object().is_some_and(Map::is_empty);
        if empty {
            map.remove(*first);
        }
    }
}
