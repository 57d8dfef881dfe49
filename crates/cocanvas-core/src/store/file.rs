//! File-backed document store for native platforms.

use super::{BoxFuture, DocumentStore, Mutation, StoreError, StoreResult};
use crate::canvas::CanvasDocument;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Document store keeping one JSON file per canvas in a directory.
///
/// Subscriptions are process-local: only writes made through this store
/// instance are pushed to subscribers.
pub struct FileDocumentStore {
    /// Base directory for document storage.
    base_path: PathBuf,
    /// Per-canvas subscriber channels. Also serializes read-modify-write.
    watchers: Mutex<HashMap<String, watch::Sender<Arc<CanvasDocument>>>>,
}

impl FileDocumentStore {
    /// Create a store rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: PathBuf) -> StoreResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StoreError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self {
            base_path,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Create a store in the default location.
    ///
    /// On Unix: `~/.local/share/cocanvas/canvases/`
    /// On Windows: `%LOCALAPPDATA%\cocanvas\canvases\`
    pub fn default_location() -> StoreResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StoreError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("cocanvas").join("canvases"))
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn document_path(&self, canvas_id: &str) -> PathBuf {
        // Keep ids filename-safe
        let safe_id: String = canvas_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", safe_id))
    }

    fn read(&self, canvas_id: &str) -> StoreResult<CanvasDocument> {
        let path = self.document_path(canvas_id);
        if !path.exists() {
            return Ok(CanvasDocument::new(canvas_id));
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| StoreError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        CanvasDocument::from_json(&json).map_err(|e| {
            StoreError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn write(&self, canvas_id: &str, document: &CanvasDocument) -> StoreResult<()> {
        let path = self.document_path(canvas_id);
        let json = document.to_json()?;
        fs::write(&path, json)
            .map_err(|e| StoreError::Io(format!("Failed to write {}: {}", path.display(), e)))
    }

    fn watchers(&self) -> StoreResult<MutexGuard<'_, HashMap<String, watch::Sender<Arc<CanvasDocument>>>>> {
        self.watchers
            .lock()
            .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))
    }
}

impl DocumentStore for FileDocumentStore {
    fn load(&self, canvas_id: &str) -> BoxFuture<'_, StoreResult<CanvasDocument>> {
        let canvas_id = canvas_id.to_string();
        Box::pin(async move {
            let _guard = self.watchers()?;
            self.read(&canvas_id)
        })
    }

    fn update(&self, canvas_id: &str, mutation: Mutation) -> BoxFuture<'_, StoreResult<bool>> {
        let canvas_id = canvas_id.to_string();
        Box::pin(async move {
            let watchers = self.watchers()?;
            let mut document = self.read(&canvas_id)?;
            if !mutation(&mut document) {
                return Ok(false);
            }
            document.revision += 1;
            self.write(&canvas_id, &document)?;
            log::debug!("Saved canvas {} at revision {}", canvas_id, document.revision);

            if let Some(tx) = watchers.get(&canvas_id) {
                tx.send_replace(Arc::new(document));
            }
            Ok(true)
        })
    }

    fn subscribe(&self, canvas_id: &str) -> watch::Receiver<Arc<CanvasDocument>> {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = watchers.get(canvas_id) {
            return tx.subscribe();
        }
        let initial = self.read(canvas_id).unwrap_or_else(|e| {
            log::warn!("Failed to read canvas {} for subscription: {}", canvas_id, e);
            CanvasDocument::new(canvas_id)
        });
        let (tx, rx) = watch::channel(Arc::new(initial));
        watchers.insert(canvas_id.to_string(), tx);
        rx
    }
}
