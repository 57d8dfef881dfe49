//! CoCanvas Core Library
//!
//! Client-side coordination for a shared canvas edited by several users at
//! once: shape locks with leases, live-edit broadcasting, a merged view of
//! persisted and in-flight state, optimistic selection and per-user undo.
//!
//! Persistence and realtime fan-out are behind the [`store::DocumentStore`]
//! and [`store::EphemeralStore`] traits. In-memory and file-backed
//! implementations are included.

pub mod canvas;
pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod history;
pub mod live_edit;
pub mod lock;
pub mod optimistic;
pub mod presence;
pub mod reconcile;
pub mod selection;
pub mod session;
pub mod shapes;
pub mod store;

pub use canvas::CanvasDocument;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{ConfigError, SessionConfig};
pub use heartbeat::{Heartbeat, HeartbeatHandle};
pub use history::{HistoryAction, HistoryEntry, UndoLedger};
pub use live_edit::{BatchEditResult, LiveEdit, LiveEditOverlay};
pub use lock::{BatchLockResult, LockManager, LockRecord};
pub use presence::{CursorPosition, PresenceEntry, UserInfo};
pub use reconcile::{ReconciledShape, Reconciler};
pub use selection::{Selection, SelectionCoordinator, SelectionState};
pub use session::{CanvasSession, SessionError, SessionResult};
pub use shapes::{GeometryPatch, Shape, ShapeId, ShapeKind, UserId};
pub use store::{DisconnectHook, DocumentStore, EphemeralStore, StoreError};
