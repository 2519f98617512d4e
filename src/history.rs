use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::clock::Clock;
use crate::document_model::Range;
use crate::error::{BufferError, Result};
use crate::markers::MarkerSnapshot;

pub const STATE_VERSION: u32 = 1;
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// One replacement of text, in the form it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub old_range: Range,
    pub new_range: Range,
    pub old_text: String,
    pub new_text: String,
}

impl Change {
    /// The change that undoes this one.
    pub fn invert(&self) -> Change {
        Change {
            old_range: self.new_range,
            new_range: self.old_range,
            old_text: self.new_text.clone(),
            new_text: self.old_text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Entry {
    Checkpoint {
        id: u64,
        snapshot: MarkerSnapshot,
        is_boundary: bool,
    },
    Change(Change),
    GroupStart {
        snapshot: MarkerSnapshot,
    },
    GroupEnd {
        snapshot: MarkerSnapshot,
        timestamp: u64,
        grouping_interval: u64,
    },
}

/// What an undo, redo or truncation hands back to the buffer: the changes
/// to apply in order, and the marker state to restore afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPop {
    pub snapshot: Option<MarkerSnapshot>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryState {
    pub version: u32,
    pub next_checkpoint_id: u64,
    pub max_entries: usize,
    pub undo_stack: Vec<Entry>,
    pub redo_stack: Vec<Entry>,
}

/// Undo and redo stacks of changes, checkpoints and transaction groups.
#[derive(Debug)]
pub struct History {
    undo_stack: Vec<Entry>,
    redo_stack: Vec<Entry>,
    next_checkpoint_id: u64,
    max_entries: usize,
    clock: Rc<dyn Clock>,
}

impl History {
    pub fn new(max_entries: usize, clock: Rc<dyn Clock>) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            next_checkpoint_id: 0,
            max_entries,
            clock,
        }
    }

    pub fn undo_stack(&self) -> &[Entry] {
        &self.undo_stack
    }

    pub fn redo_stack(&self) -> &[Entry] {
        &self.redo_stack
    }

    pub fn has_undo(&self) -> bool {
        self.undo_stack
            .iter()
            .any(|entry| matches!(entry, Entry::Change(_)))
    }

    pub fn has_redo(&self) -> bool {
        self.redo_stack
            .iter()
            .any(|entry| matches!(entry, Entry::Change(_)))
    }

    pub fn create_checkpoint(&mut self, snapshot: MarkerSnapshot, is_boundary: bool) -> u64 {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        self.undo_stack.push(Entry::Checkpoint {
            id,
            snapshot,
            is_boundary,
        });
        id
    }

    /// Wraps every change recorded after `checkpoint` in one group so it
    /// undoes atomically. Nested groups are flattened. Fails without touching
    /// the stack if a boundary checkpoint or an unmatched group start lies in
    /// between, or if the checkpoint is gone.
    pub fn group_changes_since_checkpoint(
        &mut self,
        checkpoint: u64,
        end_snapshot: MarkerSnapshot,
        delete_checkpoint: bool,
    ) -> bool {
        let mut within_group = false;
        let mut found = None;
        let mut changes = Vec::new();

        for (i, entry) in self.undo_stack.iter().enumerate().rev() {
            match entry {
                Entry::GroupEnd { .. } => within_group = true,
                Entry::GroupStart { .. } => {
                    if !within_group {
                        return false;
                    }
                    within_group = false;
                }
                Entry::Checkpoint {
                    id,
                    snapshot,
                    is_boundary,
                } => {
                    if *id == checkpoint {
                        found = Some((i, snapshot.clone()));
                        break;
                    }
                    if *is_boundary {
                        return false;
                    }
                }
                Entry::Change(change) => changes.push(change.clone()),
            }
        }

        let Some((index, start_snapshot)) = found else {
            return false;
        };
        if !changes.is_empty() {
            changes.reverse();
            self.undo_stack.truncate(index + 1);
            self.undo_stack.push(Entry::GroupStart {
                snapshot: start_snapshot,
            });
            self.undo_stack.extend(changes.into_iter().map(Entry::Change));
            self.undo_stack.push(Entry::GroupEnd {
                snapshot: end_snapshot,
                timestamp: self.clock.now_millis(),
                grouping_interval: 0,
            });
        }
        if delete_checkpoint {
            self.undo_stack.remove(index);
        }
        true
    }

    /// Records the grouping interval on the newest group and merges it into
    /// the group below when the two ended closer together than either
    /// interval allows.
    pub fn apply_grouping_interval(&mut self, grouping_interval: u64) -> Result<()> {
        let Some(Entry::GroupEnd {
            timestamp,
            grouping_interval: interval,
            ..
        }) = self.undo_stack.last_mut()
        else {
            return Ok(());
        };
        *interval = grouping_interval;
        let top_timestamp = *timestamp;
        if grouping_interval == 0 {
            return Ok(());
        }

        let start = self
            .undo_stack
            .iter()
            .rposition(|entry| matches!(entry, Entry::GroupStart { .. }))
            .ok_or(BufferError::InvalidHistoryState(
                "group end without matching group start",
            ))?;
        if start == 0 {
            return Ok(());
        }
        if let Entry::GroupEnd {
            timestamp,
            grouping_interval: previous_interval,
            ..
        } = &self.undo_stack[start - 1]
        {
            let elapsed = top_timestamp.saturating_sub(*timestamp);
            if elapsed < grouping_interval.min(*previous_interval) {
                trace!(elapsed, "merging adjacent transactions");
                self.undo_stack.drain(start - 1..=start);
            }
        }
        Ok(())
    }

    /// Appends a change, clears the redo stack and evicts the oldest whole
    /// groups once the stack outgrows its budget. Nothing above a boundary
    /// checkpoint is evicted, since an open transaction may still revert to it.
    pub fn push_change(&mut self, change: Change) -> Result<()> {
        self.undo_stack.push(Entry::Change(change));
        self.redo_stack.clear();

        if self.undo_stack.len() <= self.max_entries {
            return Ok(());
        }
        let mut within_group = false;
        let mut cut = None;
        for (i, entry) in self.undo_stack.iter().enumerate() {
            match entry {
                Entry::GroupStart { .. } => {
                    if within_group {
                        return Err(BufferError::InvalidHistoryState("nested group start"));
                    }
                    within_group = true;
                }
                Entry::GroupEnd { .. } => {
                    if !within_group {
                        return Err(BufferError::InvalidHistoryState(
                            "group end without matching group start",
                        ));
                    }
                    cut = Some(i);
                    break;
                }
                Entry::Checkpoint {
                    is_boundary: true, ..
                } => break,
                _ => {}
            }
        }
        if let Some(cut) = cut {
            trace!(entries = cut + 1, "evicting oldest history group");
            self.undo_stack.drain(..=cut);
        }
        Ok(())
    }

    /// Pops the newest change or group onto the redo stack. `None` when
    /// there is nothing to undo or a boundary checkpoint is in the way.
    pub fn pop_undo_stack(&mut self) -> Result<Option<HistoryPop>> {
        let mut snapshot = None;
        let mut cut = None;
        let mut within_group = false;
        let mut changes = Vec::new();

        for (i, entry) in self.undo_stack.iter().enumerate().rev() {
            match entry {
                Entry::GroupStart { snapshot: below } => {
                    if !within_group {
                        return Err(BufferError::InvalidHistoryState(
                            "group start without matching group end",
                        ));
                    }
                    snapshot = Some(below.clone());
                    cut = Some(i);
                }
                Entry::GroupEnd { .. } => {
                    if within_group {
                        return Err(BufferError::InvalidHistoryState("nested group end"));
                    }
                    within_group = true;
                }
                Entry::Checkpoint { is_boundary, .. } => {
                    if *is_boundary {
                        return Ok(None);
                    }
                }
                Entry::Change(change) => {
                    changes.push(change.invert());
                    if !within_group {
                        cut = Some(i);
                    }
                }
            }
            if cut.is_some() {
                break;
            }
        }

        let Some(cut) = cut else {
            return Ok(None);
        };
        let popped = self.undo_stack.split_off(cut);
        self.redo_stack.extend(popped.into_iter().rev());
        Ok(Some(HistoryPop { snapshot, changes }))
    }

    /// Moves the newest undone change or group back onto the undo stack,
    /// together with any checkpoints recorded right after it.
    pub fn pop_redo_stack(&mut self) -> Result<Option<HistoryPop>> {
        let mut snapshot = None;
        let mut cut = None;
        let mut within_group = false;
        let mut changes = Vec::new();

        for (i, entry) in self.redo_stack.iter().enumerate().rev() {
            match entry {
                Entry::GroupEnd { snapshot: after, .. } => {
                    if !within_group {
                        return Err(BufferError::InvalidHistoryState(
                            "group end without matching group start",
                        ));
                    }
                    snapshot = Some(after.clone());
                    cut = Some(i);
                }
                Entry::GroupStart { .. } => {
                    if within_group {
                        return Err(BufferError::InvalidHistoryState("nested group start"));
                    }
                    within_group = true;
                }
                Entry::Checkpoint { is_boundary, .. } => {
                    if *is_boundary {
                        return Err(BufferError::InvalidHistoryState(
                            "boundary checkpoint on the redo stack",
                        ));
                    }
                }
                Entry::Change(change) => {
                    changes.push(change.clone());
                    if !within_group {
                        cut = Some(i);
                    }
                }
            }
            if cut.is_some() {
                break;
            }
        }

        let Some(mut cut) = cut else {
            return Ok(None);
        };
        while cut > 0 && matches!(self.redo_stack[cut - 1], Entry::Checkpoint { .. }) {
            cut -= 1;
        }
        let popped = self.redo_stack.split_off(cut);
        self.undo_stack.extend(popped.into_iter().rev());
        Ok(Some(HistoryPop { snapshot, changes }))
    }

    /// Removes everything recorded after `checkpoint`, the checkpoint
    /// included, returning the inverted changes and the checkpoint's
    /// snapshot. `None` if the checkpoint is gone or behind a boundary.
    pub fn truncate_undo_stack(&mut self, checkpoint: u64) -> Result<Option<HistoryPop>> {
        let mut found = None;
        let mut within_group = false;
        let mut changes = Vec::new();

        for (i, entry) in self.undo_stack.iter().enumerate().rev() {
            match entry {
                Entry::GroupStart { .. } => {
                    if !within_group {
                        return Err(BufferError::InvalidHistoryState(
                            "group start without matching group end",
                        ));
                    }
                    within_group = false;
                }
                Entry::GroupEnd { .. } => {
                    if within_group {
                        return Err(BufferError::InvalidHistoryState("nested group end"));
                    }
                    within_group = true;
                }
                Entry::Checkpoint {
                    id,
                    snapshot,
                    is_boundary,
                } => {
                    if *id == checkpoint {
                        found = Some((i, snapshot.clone()));
                        break;
                    }
                    if *is_boundary {
                        return Ok(None);
                    }
                }
                Entry::Change(change) => changes.push(change.invert()),
            }
        }

        let Some((index, snapshot)) = found else {
            return Ok(None);
        };
        self.undo_stack.truncate(index);
        Ok(Some(HistoryPop {
            snapshot: Some(snapshot),
            changes,
        }))
    }

    /// Changes recorded after `checkpoint`, oldest first, ignoring group
    /// brackets. `None` if the checkpoint is gone.
    pub fn get_changes_since_checkpoint(&self, checkpoint: u64) -> Option<Vec<Change>> {
        let mut changes = Vec::new();
        for entry in self.undo_stack.iter().rev() {
            match entry {
                Entry::Checkpoint { id, .. } if *id == checkpoint => {
                    changes.reverse();
                    return Some(changes);
                }
                Entry::Change(change) => changes.push(change.clone()),
                _ => {}
            }
        }
        None
    }

    pub fn clear_undo_stack(&mut self) {
        self.undo_stack.clear();
    }

    pub fn clear_redo_stack(&mut self) {
        self.redo_stack.clear();
    }

    pub fn clear(&mut self) {
        self.clear_undo_stack();
        self.clear_redo_stack();
    }

    pub fn serialize(&self) -> HistoryState {
        HistoryState {
            version: STATE_VERSION,
            next_checkpoint_id: self.next_checkpoint_id,
            max_entries: self.max_entries,
            undo_stack: self.undo_stack.clone(),
            redo_stack: self.redo_stack.clone(),
        }
    }

    /// Replaces both stacks. Returns false, leaving the history alone, for
    /// a state written by another version.
    pub fn deserialize(&mut self, state: &HistoryState) -> bool {
        if state.version != STATE_VERSION {
            warn!(
                found = state.version,
                expected = STATE_VERSION,
                "ignoring history state with mismatched version"
            );
            return false;
        }
        self.next_checkpoint_id = state.next_checkpoint_id;
        self.max_entries = state.max_entries;
        self.undo_stack = state.undo_stack.clone();
        self.redo_stack = state.redo_stack.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document_model::Position;
    use crate::marker_index::MarkerId;
    use crate::markers::{MarkerParams, MarkerState};
    use pretty_assertions::assert_eq;

    fn history(clock: &ManualClock) -> History {
        History::new(DEFAULT_MAX_ENTRIES, Rc::new(clock.clone()))
    }

    fn change(text: &str) -> Change {
        Change {
            old_range: Range::empty_at(Position::ZERO),
            new_range: Range::from_text(Position::ZERO, text),
            old_text: String::new(),
            new_text: text.to_string(),
        }
    }

    fn snapshot(tag: u64) -> MarkerSnapshot {
        let params = MarkerParams::new().maintain_history(true);
        let state = MarkerState {
            range: Range::empty_at(Position::new(0, tag as usize)),
            reversed: params.reversed,
            tailed: params.tailed,
            valid: true,
            invalidate: params.invalidate,
            exclusive: None,
            persistent: true,
            maintain_history: true,
            properties: params.properties,
        };
        MarkerSnapshot::from([(MarkerId::new(tag), state)])
    }

    /// One transaction: boundary checkpoint, changes, grouped.
    fn transaction(history: &mut History, texts: &[&str], interval: u64) {
        let checkpoint = history.create_checkpoint(snapshot(0), true);
        for text in texts {
            history.push_change(change(text)).unwrap();
        }
        assert!(history.group_changes_since_checkpoint(checkpoint, snapshot(1), true));
        history.apply_grouping_interval(interval).unwrap();
    }

    fn undo_steps(history: &mut History) -> usize {
        let mut steps = 0;
        while history.pop_undo_stack().unwrap().is_some() {
            steps += 1;
        }
        steps
    }

    #[test]
    fn test_invert_swaps_old_and_new() {
        let forward = change("ab");
        let backward = forward.invert();
        assert_eq!(backward.old_text, "ab");
        assert_eq!(backward.new_range, forward.old_range);
        assert_eq!(backward.invert(), forward);
    }

    #[test]
    fn test_undo_bare_changes_one_at_a_time() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.push_change(change("a")).unwrap();
        history.push_change(change("b")).unwrap();

        let popped = history.pop_undo_stack().unwrap().unwrap();
        assert_eq!(popped.snapshot, None);
        assert_eq!(popped.changes, vec![change("b").invert()]);
        assert!(history.has_redo());

        let redone = history.pop_redo_stack().unwrap().unwrap();
        assert_eq!(redone.changes, vec![change("b")]);
        assert!(!history.has_redo());
    }

    #[test]
    fn test_group_undoes_atomically() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        transaction(&mut history, &["a", "b", "c"], 0);

        let popped = history.pop_undo_stack().unwrap().unwrap();
        assert_eq!(popped.snapshot, Some(snapshot(0)));
        assert_eq!(
            popped.changes,
            vec![change("c").invert(), change("b").invert(), change("a").invert()]
        );
        assert!(history.pop_undo_stack().unwrap().is_none());

        let redone = history.pop_redo_stack().unwrap().unwrap();
        assert_eq!(redone.snapshot, Some(snapshot(1)));
        assert_eq!(redone.changes, vec![change("a"), change("b"), change("c")]);
    }

    #[test]
    fn test_grouping_interval_merges_close_transactions() {
        let clock = ManualClock::new(1_000);
        let mut history = history(&clock);
        transaction(&mut history, &["a"], 300);
        clock.advance(299);
        transaction(&mut history, &["b"], 300);

        assert_eq!(undo_steps(&mut history), 1);
    }

    #[test]
    fn test_grouping_interval_keeps_distant_transactions_apart() {
        let clock = ManualClock::new(1_000);
        let mut history = history(&clock);
        transaction(&mut history, &["a"], 300);
        clock.advance(301);
        transaction(&mut history, &["b"], 300);

        assert_eq!(undo_steps(&mut history), 2);
    }

    #[test]
    fn test_smaller_interval_wins() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        transaction(&mut history, &["a"], 100);
        clock.advance(200);
        transaction(&mut history, &["b"], 500);

        assert_eq!(undo_steps(&mut history), 2);
    }

    #[test]
    fn test_boundary_checkpoint_blocks_grouping() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        let checkpoint = history.create_checkpoint(snapshot(0), false);
        history.push_change(change("a")).unwrap();
        history.create_checkpoint(snapshot(1), true);
        history.push_change(change("b")).unwrap();
        let before = history.undo_stack().to_vec();

        assert!(!history.group_changes_since_checkpoint(checkpoint, snapshot(2), false));
        assert_eq!(history.undo_stack(), before.as_slice());
    }

    #[test]
    fn test_boundary_checkpoint_blocks_undo() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.push_change(change("a")).unwrap();
        history.create_checkpoint(snapshot(0), true);
        assert!(history.pop_undo_stack().unwrap().is_none());
    }

    #[test]
    fn test_group_without_changes_keeps_stack_clean() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        let checkpoint = history.create_checkpoint(snapshot(0), true);
        assert!(history.group_changes_since_checkpoint(checkpoint, snapshot(1), true));
        assert!(history.undo_stack().is_empty());
        assert!(!history.group_changes_since_checkpoint(99, snapshot(1), false));
    }

    #[test]
    fn test_nested_groups_flatten() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        let outer = history.create_checkpoint(snapshot(0), true);
        history.push_change(change("a")).unwrap();
        transaction(&mut history, &["b"], 0);
        history.push_change(change("c")).unwrap();
        assert!(history.group_changes_since_checkpoint(outer, snapshot(3), true));

        let groups = history
            .undo_stack()
            .iter()
            .filter(|entry| matches!(entry, Entry::GroupStart { .. }))
            .count();
        assert_eq!(groups, 1);
        assert_eq!(undo_steps(&mut history), 1);
    }

    #[test]
    fn test_undo_reports_unmatched_group_start() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.undo_stack.push(Entry::GroupStart {
            snapshot: snapshot(0),
        });
        assert!(matches!(
            history.pop_undo_stack(),
            Err(BufferError::InvalidHistoryState(_))
        ));
    }

    #[test]
    fn test_redo_carries_trailing_checkpoints() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.push_change(change("a")).unwrap();
        let checkpoint = history.create_checkpoint(snapshot(0), false);

        history.pop_undo_stack().unwrap();
        assert!(history.get_changes_since_checkpoint(checkpoint).is_none());
        history.pop_redo_stack().unwrap();
        assert_eq!(history.get_changes_since_checkpoint(checkpoint), Some(vec![]));
    }

    #[test]
    fn test_truncate_undo_stack() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.push_change(change("a")).unwrap();
        let checkpoint = history.create_checkpoint(snapshot(4), false);
        history.push_change(change("b")).unwrap();
        transaction(&mut history, &["c"], 0);

        assert_eq!(
            history.get_changes_since_checkpoint(checkpoint),
            Some(vec![change("b"), change("c")])
        );
        let popped = history.truncate_undo_stack(checkpoint).unwrap().unwrap();
        assert_eq!(popped.snapshot, Some(snapshot(4)));
        assert_eq!(popped.changes, vec![change("c").invert(), change("b").invert()]);
        assert_eq!(history.undo_stack().len(), 1);
        assert!(history.truncate_undo_stack(checkpoint).unwrap().is_none());
    }

    #[test]
    fn test_push_change_evicts_whole_groups() {
        let clock = ManualClock::new(0);
        let mut history = History::new(6, Rc::new(clock.clone()));
        transaction(&mut history, &["a", "b"], 0);
        transaction(&mut history, &["c"], 0);
        assert_eq!(history.undo_stack().len(), 7);

        history.push_change(change("d")).unwrap();

        assert!(matches!(history.undo_stack()[0], Entry::GroupStart { .. }));
        assert_eq!(history.undo_stack().len(), 4);
        assert_eq!(undo_steps(&mut history), 2);
    }

    #[test]
    fn test_push_change_never_evicts_past_a_boundary() {
        let clock = ManualClock::new(0);
        let mut history = History::new(3, Rc::new(clock.clone()));
        let boundary = history.create_checkpoint(snapshot(0), true);
        transaction(&mut history, &["a"], 0);
        history.push_change(change("b")).unwrap();

        assert_eq!(history.undo_stack().len(), 5);
        let reverted = history.truncate_undo_stack(boundary).unwrap().unwrap();
        assert_eq!(reverted.changes, vec![change("b").invert(), change("a").invert()]);
    }

    #[test]
    fn test_push_change_clears_redo() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        history.push_change(change("a")).unwrap();
        history.pop_undo_stack().unwrap();
        history.push_change(change("b")).unwrap();
        assert!(history.redo_stack().is_empty());
    }

    #[test]
    fn test_serialize_round_trip() {
        let clock = ManualClock::new(0);
        let mut history = history(&clock);
        transaction(&mut history, &["a"], 300);
        history.push_change(change("b")).unwrap();
        history.pop_undo_stack().unwrap();

        let json = serde_json::to_string(&history.serialize()).unwrap();
        let state: HistoryState = serde_json::from_str(&json).unwrap();
        let mut restored = History::new(1, Rc::new(clock.clone()));
        assert!(restored.deserialize(&state));
        assert_eq!(restored.undo_stack(), history.undo_stack());
        assert_eq!(restored.redo_stack(), history.redo_stack());

        let mut stale = state.clone();
        stale.version += 1;
        let mut untouched = History::new(1, Rc::new(clock));
        assert!(!untouched.deserialize(&stale));
        assert!(untouched.undo_stack().is_empty());
    }
}
