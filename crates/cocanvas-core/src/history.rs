//! Local undo/redo.
//!
//! The ledger records field-level diffs of document mutations made by this
//! client and turns them back into document steps on undo and redo. It never
//! sees live edits: only committed changes are recorded.
//!
//! Replays are not rebased against concurrent remote edits. A step whose
//! target is gone (or already exists, for a recreate) is skipped with a
//! warning while the rest of the entry still applies.

use crate::canvas::CanvasDocument;
use crate::clock::{Clock, Timestamp};
use crate::config::DEFAULT_MAX_HISTORY;
use crate::shapes::{FieldMap, Shape, ShapeId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// Bookkeeping fields left out of diffs.
const IGNORED_FIELDS: &[&str] = &["updatedAt"];

/// Kind of recorded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Create,
    Delete,
    Update,
    BatchCreate,
    BatchDelete,
    BatchUpdate,
}

impl HistoryAction {
    /// The per-shape action of a batch action.
    pub fn single(self) -> Self {
        match self {
            HistoryAction::Create | HistoryAction::BatchCreate => HistoryAction::Create,
            HistoryAction::Delete | HistoryAction::BatchDelete => HistoryAction::Delete,
            HistoryAction::Update | HistoryAction::BatchUpdate => HistoryAction::Update,
        }
    }
}

/// One shape's part of a history entry.
///
/// For creates `before` is empty and `after` holds the whole shape; deletes
/// are the reverse. Updates hold only the fields that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub shape_id: ShapeId,
    pub action: HistoryAction,
    #[serde(rename = "beforeState")]
    pub before: FieldMap,
    #[serde(rename = "afterState")]
    pub after: FieldMap,
}

impl ChangeEntry {
    /// Build the recorded form of a change, or `None` if nothing changed.
    pub fn diffed(shape_id: ShapeId, action: HistoryAction, before: &FieldMap, after: &FieldMap) -> Option<Self> {
        let action = action.single();
        let (before, after) = match action {
            HistoryAction::Create if !after.is_empty() => (FieldMap::new(), after.clone()),
            HistoryAction::Delete if !before.is_empty() => (before.clone(), FieldMap::new()),
            HistoryAction::Update => {
                let (before, after) = diff_fields(before, after);
                if before.is_empty() && after.is_empty() {
                    return None;
                }
                (before, after)
            }
            _ => return None,
        };
        Some(Self {
            shape_id,
            action,
            before,
            after,
        })
    }
}

/// A recorded, undoable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub user_id: UserId,
    pub action: HistoryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entries: Vec<ChangeEntry>,
}

/// Compute the changed fields between two snapshots.
///
/// Values are compared as JSON. A key missing on one side is recorded as
/// `null` on that side.
pub fn diff_fields(before: &FieldMap, after: &FieldMap) -> (FieldMap, FieldMap) {
    let mut old = FieldMap::new();
    let mut new = FieldMap::new();
    let keys = before.keys().chain(after.keys().filter(|k| !before.contains_key(*k)));
    for key in keys {
        if IGNORED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let (b, a) = (before.get(key), after.get(key));
        if b != a {
            old.insert(key.clone(), b.cloned().unwrap_or(Value::Null));
            new.insert(key.clone(), a.cloned().unwrap_or(Value::Null));
        }
    }
    (old, new)
}

/// Direction of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Undo,
    Redo,
}

/// One document operation produced by a replay.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    /// Delete the shape. Skipped if it is already gone.
    Remove { shape_id: ShapeId },
    /// Recreate the shape from a full snapshot. Skipped if the id exists.
    Recreate { shape_id: ShapeId, fields: FieldMap },
    /// Overwrite fields on the shape. Skipped if it is gone.
    Patch { shape_id: ShapeId, fields: FieldMap },
}

impl ReplayStep {
    pub fn shape_id(&self) -> ShapeId {
        match self {
            ReplayStep::Remove { shape_id }
            | ReplayStep::Recreate { shape_id, .. }
            | ReplayStep::Patch { shape_id, .. } => *shape_id,
        }
    }

    /// Apply to `document`. Returns whether the document changed.
    pub fn apply(&self, document: &mut CanvasDocument, now: Timestamp) -> bool {
        match self {
            ReplayStep::Remove { shape_id } => {
                if document.remove_shape(*shape_id).is_none() {
                    log::warn!("Cannot remove {}: shape no longer exists", shape_id);
                    return false;
                }
                true
            }
            ReplayStep::Recreate { shape_id, fields } => {
                if document.contains(*shape_id) {
                    log::warn!("Cannot recreate {}: id already exists", shape_id);
                    return false;
                }
                match Shape::from_fields(fields) {
                    Ok(mut shape) => {
                        shape.updated_at = now;
                        document.add_shape(shape);
                        true
                    }
                    Err(e) => {
                        log::error!("Cannot recreate {}: {}", shape_id, e);
                        false
                    }
                }
            }
            ReplayStep::Patch { shape_id, fields } => {
                let Some(shape) = document.get_shape_mut(*shape_id) else {
                    log::warn!("Cannot update {}: shape no longer exists", shape_id);
                    return false;
                };
                match shape.with_fields(fields) {
                    Ok(mut patched) => {
                        if patched == *shape {
                            log::debug!("Shape {} already in target state", shape_id);
                            return false;
                        }
                        patched.updated_at = now;
                        *shape = patched;
                        true
                    }
                    Err(e) => {
                        log::error!("Cannot update {}: {}", shape_id, e);
                        false
                    }
                }
            }
        }
    }
}

/// An entry taken off a stack for replay.
///
/// Hand it back with [`UndoLedger::finish`] once its steps were applied.
#[derive(Debug, Clone)]
pub struct Replay {
    pub direction: Direction,
    pub entry: HistoryEntry,
}

impl Replay {
    /// Document steps in application order: reversed for undo.
    pub fn steps(&self) -> Vec<ReplayStep> {
        let step = |change: &ChangeEntry| {
            let shape_id = change.shape_id;
            match (self.direction, change.action.single()) {
                (Direction::Undo, HistoryAction::Create) | (Direction::Redo, HistoryAction::Delete) => {
                    ReplayStep::Remove { shape_id }
                }
                (Direction::Undo, HistoryAction::Delete) => ReplayStep::Recreate {
                    shape_id,
                    fields: change.before.clone(),
                },
                (Direction::Redo, HistoryAction::Create) => ReplayStep::Recreate {
                    shape_id,
                    fields: change.after.clone(),
                },
                (Direction::Undo, _) => ReplayStep::Patch {
                    shape_id,
                    fields: change.before.clone(),
                },
                (Direction::Redo, _) => ReplayStep::Patch {
                    shape_id,
                    fields: change.after.clone(),
                },
            }
        };
        match self.direction {
            Direction::Undo => self.entry.entries.iter().rev().map(step).collect(),
            Direction::Redo => self.entry.entries.iter().map(step).collect(),
        }
    }
}

/// Bounded undo stack with a redo stack.
pub struct UndoLedger {
    user_id: UserId,
    clock: Arc<dyn Clock>,
    max_history: usize,
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    /// Set while a replay is in flight; suppresses recording.
    replaying: bool,
}

impl UndoLedger {
    pub fn new(user_id: impl Into<UserId>, clock: Arc<dyn Clock>, max_history: usize) -> Self {
        Self {
            user_id: user_id.into(),
            clock,
            max_history: if max_history == 0 { DEFAULT_MAX_HISTORY } else { max_history },
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            replaying: false,
        }
    }

    /// Record a single-shape change. Returns the new entry id, or `None`
    /// when nothing changed or a replay is in flight.
    pub fn record(
        &mut self,
        shape_id: ShapeId,
        before: &FieldMap,
        after: &FieldMap,
        action: HistoryAction,
    ) -> Option<Uuid> {
        let change = ChangeEntry::diffed(shape_id, action, before, after)?;
        self.push(action.single(), None, vec![change])
    }

    /// Record several changes as one undo step. Changes with no effect are
    /// dropped; if none remain nothing is recorded.
    pub fn record_batch(
        &mut self,
        changes: Vec<ChangeEntry>,
        action: HistoryAction,
        description: Option<String>,
    ) -> Option<Uuid> {
        let entries: Vec<ChangeEntry> = changes
            .into_iter()
            .filter_map(|c| ChangeEntry::diffed(c.shape_id, c.action, &c.before, &c.after))
            .collect();
        if entries.is_empty() {
            return None;
        }
        self.push(action, description, entries)
    }

    fn push(&mut self, action: HistoryAction, description: Option<String>, entries: Vec<ChangeEntry>) -> Option<Uuid> {
        if self.replaying {
            log::debug!("Not recording {:?} during replay", action);
            return None;
        }
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            user_id: self.user_id.clone(),
            action,
            description,
            entries,
        };
        let id = entry.id;
        self.undo_stack.push_back(entry);
        self.redo_stack.clear();

        while self.undo_stack.len() > self.max_history {
            self.undo_stack.pop_front();
        }
        Some(id)
    }

    /// Take the newest entry for undoing. `None` if the stack is empty or
    /// another replay is in flight.
    pub fn begin_undo(&mut self) -> Option<Replay> {
        if self.replaying {
            return None;
        }
        let entry = self.undo_stack.pop_back()?;
        self.replaying = true;
        Some(Replay {
            direction: Direction::Undo,
            entry,
        })
    }

    /// Take the newest undone entry for redoing.
    pub fn begin_redo(&mut self) -> Option<Replay> {
        if self.replaying {
            return None;
        }
        let entry = self.redo_stack.pop()?;
        self.replaying = true;
        Some(Replay {
            direction: Direction::Redo,
            entry,
        })
    }

    /// Complete a replay: the entry moves to the opposite stack.
    pub fn finish(&mut self, replay: Replay) {
        self.replaying = false;
        match replay.direction {
            Direction::Undo => self.redo_stack.push(replay.entry),
            Direction::Redo => {
                self.undo_stack.push_back(replay.entry);
                while self.undo_stack.len() > self.max_history {
                    self.undo_stack.pop_front();
                }
            }
        }
    }

    /// Abandon a replay that could not be applied: the entry goes back where
    /// it came from.
    pub fn abort(&mut self, replay: Replay) {
        self.replaying = false;
        match replay.direction {
            Direction::Undo => self.undo_stack.push_back(replay.entry),
            Direction::Redo => self.redo_stack.push(replay.entry),
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// The entry the next undo would replay.
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo_stack.back()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    fn ledger(max: usize) -> UndoLedger {
        UndoLedger::new("alice", Arc::new(ManualClock::new(42)), max)
    }

    /// Undo or redo one step against `doc`, the way a session does.
    fn replay(ledger: &mut UndoLedger, doc: &mut CanvasDocument, direction: Direction) -> bool {
        let replay = match direction {
            Direction::Undo => ledger.begin_undo(),
            Direction::Redo => ledger.begin_redo(),
        };
        let Some(replay) = replay else {
            return false;
        };
        for step in replay.steps() {
            step.apply(doc, 0);
        }
        ledger.finish(replay);
        true
    }

    #[test]
    fn test_identical_update_records_nothing() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        let state = fields(json!({"x": 5, "y": 5}));

        assert!(ledger.record(id, &state, &state, HistoryAction::Update).is_none());
        assert!(!ledger.can_undo());
    }

    #[test]
    fn test_diff_ignores_updated_at() {
        let (before, after) = diff_fields(
            &fields(json!({"x": 1, "updatedAt": 1, "fill": {"r": 0}})),
            &fields(json!({"x": 1, "updatedAt": 2, "fill": {"r": 0}})),
        );
        assert!(before.is_empty() && after.is_empty());

        let (before, after) = diff_fields(
            &fields(json!({"x": 1, "y": 2})),
            &fields(json!({"x": 3, "y": 2, "rotation": 90})),
        );
        assert_eq!(Value::Object(before), json!({"x": 1, "rotation": null}));
        assert_eq!(Value::Object(after), json!({"x": 3, "rotation": 90}));
    }

    #[test]
    fn test_entry_metadata() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 2})), HistoryAction::Update);

        let entry = ledger.peek_undo().unwrap();
        assert_eq!(entry.user_id, "alice");
        assert_eq!(entry.timestamp, 42);
        assert_eq!(entry.action, HistoryAction::Update);
        assert_eq!(entry.entries[0].before, fields(json!({"x": 1})));
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let shape = Shape::rectangle(10.0, 0.0, 5.0, 5.0);
        let id = shape.id;
        let mut doc = CanvasDocument::new("main");
        doc.add_shape(shape.clone());

        let mut ledger = ledger(50);
        let moved = shape.with_fields(&fields(json!({"x": 50.0}))).unwrap();
        doc.add_shape(moved.clone());
        ledger.record(id, &shape.to_fields(), &moved.to_fields(), HistoryAction::Update);

        assert!(replay(&mut ledger, &mut doc, Direction::Undo));
        assert_eq!(doc.get_shape(id).unwrap().x, 10.0);
        assert!(ledger.can_redo());

        assert!(replay(&mut ledger, &mut doc, Direction::Redo));
        assert_eq!(doc.get_shape(id).unwrap().x, 50.0);

        assert!(replay(&mut ledger, &mut doc, Direction::Undo));
        assert!(!replay(&mut ledger, &mut doc, Direction::Undo));
        assert_eq!(doc.get_shape(id).unwrap().x, 10.0);
    }

    #[test]
    fn test_new_record_clears_redo() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 2})), HistoryAction::Update);
        let replay = ledger.begin_undo().unwrap();
        ledger.finish(replay);
        assert!(ledger.can_redo());

        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 3})), HistoryAction::Update);
        assert!(!ledger.can_redo());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut ledger = ledger(3);
        let id = ShapeId::new_v4();
        let mut first = None;
        for i in 0..5 {
            let recorded = ledger.record(
                id,
                &fields(json!({"x": i})),
                &fields(json!({"x": i + 1})),
                HistoryAction::Update,
            );
            first.get_or_insert(recorded);
        }
        assert_eq!(ledger.undo_count(), 3);
        assert_eq!(ledger.peek_undo().unwrap().entries[0].after, fields(json!({"x": 5})));

        let mut seen = Vec::new();
        while let Some(replay) = ledger.begin_undo() {
            seen.push(replay.entry.id);
            ledger.finish(replay);
        }
        assert!(!seen.contains(&first.flatten().unwrap()));
    }

    #[test]
    fn test_recording_suppressed_during_replay() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 2})), HistoryAction::Update);

        let replay = ledger.begin_undo().unwrap();
        assert!(ledger.is_replaying());
        assert!(ledger
            .record(id, &fields(json!({"x": 2})), &fields(json!({"x": 1})), HistoryAction::Update)
            .is_none());
        assert!(ledger.begin_redo().is_none());
        ledger.finish(replay);

        assert!(!ledger.is_replaying());
        assert_eq!(ledger.undo_count(), 0);
        assert_eq!(ledger.redo_count(), 1);
    }

    #[test]
    fn test_abort_restores_entry() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 2})), HistoryAction::Update);

        let replay = ledger.begin_undo().unwrap();
        ledger.abort(replay);
        assert_eq!(ledger.undo_count(), 1);
        assert!(!ledger.can_redo());
    }

    #[test]
    fn test_undo_create_and_delete() {
        let shape = Shape::circle(1.0, 1.0, 4.0);
        let id = shape.id;
        let mut doc = CanvasDocument::new("main");
        let mut ledger = ledger(50);

        doc.add_shape(shape.clone());
        ledger.record(id, &FieldMap::new(), &shape.to_fields(), HistoryAction::Create);
        doc.remove_shape(id);
        ledger.record(id, &shape.to_fields(), &FieldMap::new(), HistoryAction::Delete);

        assert!(replay(&mut ledger, &mut doc, Direction::Undo));
        assert!(doc.contains(id));
        assert!(replay(&mut ledger, &mut doc, Direction::Undo));
        assert!(!doc.contains(id));

        assert!(replay(&mut ledger, &mut doc, Direction::Redo));
        assert_eq!(doc.get_shape(id).unwrap().kind, shape.kind);
    }

    #[test]
    fn test_undo_delete_of_recreated_id_is_noop() {
        let shape = Shape::rectangle(0.0, 0.0, 5.0, 5.0);
        let id = shape.id;
        let mut ledger = ledger(50);
        ledger.record(id, &shape.to_fields(), &FieldMap::new(), HistoryAction::Delete);

        // Someone else put a shape with the same id back in the meantime
        let mut doc = CanvasDocument::new("main");
        let mut other = shape.clone();
        other.x = 99.0;
        doc.add_shape(other);

        assert!(replay(&mut ledger, &mut doc, Direction::Undo));
        assert_eq!(doc.get_shape(id).unwrap().x, 99.0);
        assert!(ledger.can_redo());
    }

    #[test]
    fn test_batch_steps_reverse_on_undo() {
        let mut ledger = ledger(50);
        let (a, b) = (ShapeId::new_v4(), ShapeId::new_v4());
        let changes = vec![
            ChangeEntry {
                shape_id: a,
                action: HistoryAction::Update,
                before: fields(json!({"x": 1})),
                after: fields(json!({"x": 2})),
            },
            ChangeEntry {
                shape_id: b,
                action: HistoryAction::Update,
                before: fields(json!({"y": 1})),
                after: fields(json!({"y": 1})),
            },
            ChangeEntry {
                shape_id: b,
                action: HistoryAction::Update,
                before: fields(json!({"x": 0})),
                after: fields(json!({"x": 7})),
            },
        ];
        ledger.record_batch(changes, HistoryAction::BatchUpdate, Some("Move 2 shapes".into()));

        let entry = ledger.peek_undo().unwrap();
        assert_eq!(entry.action, HistoryAction::BatchUpdate);
        assert_eq!(entry.entries.len(), 2);
        assert_eq!(entry.description.as_deref(), Some("Move 2 shapes"));

        let replay = ledger.begin_undo().unwrap();
        let order: Vec<ShapeId> = replay.steps().iter().map(ReplayStep::shape_id).collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn test_batch_of_noops_records_nothing() {
        let mut ledger = ledger(50);
        let change = ChangeEntry {
            shape_id: ShapeId::new_v4(),
            action: HistoryAction::Update,
            before: fields(json!({"x": 1})),
            after: fields(json!({"x": 1})),
        };
        assert!(ledger.record_batch(vec![change], HistoryAction::BatchUpdate, None).is_none());
    }

    #[test]
    fn test_entry_serialization() {
        let mut ledger = ledger(50);
        let id = ShapeId::new_v4();
        ledger.record(id, &fields(json!({"x": 1})), &fields(json!({"x": 2})), HistoryAction::Update);

        let json = serde_json::to_value(ledger.peek_undo().unwrap()).unwrap();
        assert_eq!(json["action"], json!("UPDATE"));
        assert_eq!(json["entries"][0]["beforeState"], json!({"x": 1}));
        assert_eq!(json["userId"], json!("alice"));
    }
}
