//! Who is on the canvas, and where their cursor is.

use crate::clock::Timestamp;
use crate::shapes::UserId;
use crate::store::{DisconnectHook, EphemeralStore, PathWrite, StoreResult, paths};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// The local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub color: String,
}

impl UserInfo {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// A presence entry as stored at `presence/<canvas>/<user>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub last_seen: Timestamp,
}

pub struct Presence {
    canvas_id: String,
    store: Arc<dyn EphemeralStore>,
    user: UserInfo,
    cursor: Mutex<Option<CursorPosition>>,
    presence_rx: watch::Receiver<Option<Value>>,
}

impl Presence {
    pub fn new(canvas_id: impl Into<String>, store: Arc<dyn EphemeralStore>, user: UserInfo) -> Self {
        let canvas_id = canvas_id.into();
        let presence_rx = store.subscribe(&paths::presence(&canvas_id));
        Self {
            canvas_id,
            store,
            user,
            cursor: Mutex::new(None),
            presence_rx,
        }
    }

    fn path(&self) -> String {
        paths::presence_entry(&self.canvas_id, &self.user.id)
    }

    async fn publish(&self) -> StoreResult<()> {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = PresenceEntry {
            user_id: self.user.id.clone(),
            display_name: self.user.name.clone(),
            color: self.user.color.clone(),
            cursor,
            last_seen: self.store.server_time(),
        };
        let value = serde_json::to_value(&entry)?;
        self.store.update(vec![PathWrite::set(self.path(), value)]).await
    }

    /// Publish the presence entry and have it removed on disconnect.
    pub async fn announce(&self) -> StoreResult<()> {
        self.publish().await?;
        self.store.on_disconnect(vec![DisconnectHook::remove(self.path())]).await?;
        log::info!("{} joined canvas {}", self.user.name, self.canvas_id);
        Ok(())
    }

    pub async fn set_cursor(&self, x: f64, y: f64) -> StoreResult<()> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(CursorPosition { x, y });
        self.publish().await
    }

    pub async fn clear_cursor(&self) -> StoreResult<()> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.publish().await
    }

    /// Other users present on the canvas, sorted by user id.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        let value = self.presence_rx.borrow();
        let Some(Value::Object(entries)) = value.as_ref() else {
            return Vec::new();
        };
        let mut peers: Vec<PresenceEntry> = entries
            .values()
            .filter_map(|v| serde_json::from_value::<PresenceEntry>(v.clone()).ok())
            .filter(|p| p.user_id != self.user.id)
            .collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    /// Remove the presence entry.
    pub async fn leave(&self) -> StoreResult<()> {
        let path = self.path();
        self.store.update(vec![PathWrite::remove(path.clone())]).await?;
        self.store.cancel_on_disconnect(vec![path]).await?;
        log::info!("{} left canvas {}", self.user.name, self.canvas_id);
        Ok(())
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }
}
