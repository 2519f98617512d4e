use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::marker::{Marker, MarkerParams, MarkerState, MarkerUpdate, Properties};
use crate::document_model::{Position, Range};
use crate::events::{Emitter, SubscriptionId};
use crate::marker_index::{MarkerId, MarkerIndex};

pub const STATE_VERSION: u32 = 1;

/// Marker states keyed by id, restricted to history-tracked markers.
pub type MarkerSnapshot = BTreeMap<MarkerId, MarkerState>;

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerChangeEvent {
    pub id: MarkerId,
    pub old_head: Position,
    pub new_head: Position,
    pub old_tail: Position,
    pub new_tail: Position,
    pub was_valid: bool,
    pub is_valid: bool,
    pub had_tail: bool,
    pub has_tail: bool,
    pub old_properties: Properties,
    pub new_properties: Properties,
    pub text_changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    Created(MarkerId),
    Destroyed(MarkerId),
    Changed(MarkerChangeEvent),
    /// One notification after a batch of per-marker changes.
    Updated,
}

/// Positional and property filters for [`MarkerStore::find_markers`]. Every
/// set field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerQuery {
    pub start_position: Option<Position>,
    pub end_position: Option<Position>,
    pub contains_point: Option<Position>,
    pub contains_range: Option<Range>,
    pub intersects_range: Option<Range>,
    pub start_row: Option<usize>,
    pub end_row: Option<usize>,
    pub intersects_row: Option<usize>,
    pub valid: Option<bool>,
    pub properties: Properties,
}

impl MarkerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_position(mut self, position: Position) -> Self {
        self.start_position = Some(position);
        self
    }

    pub fn end_position(mut self, position: Position) -> Self {
        self.end_position = Some(position);
        self
    }

    pub fn contains_point(mut self, position: Position) -> Self {
        self.contains_point = Some(position);
        self
    }

    pub fn contains_range(mut self, range: Range) -> Self {
        self.contains_range = Some(range);
        self
    }

    pub fn intersects_range(mut self, range: Range) -> Self {
        self.intersects_range = Some(range);
        self
    }

    pub fn start_row(mut self, row: usize) -> Self {
        self.start_row = Some(row);
        self
    }

    pub fn end_row(mut self, row: usize) -> Self {
        self.end_row = Some(row);
        self
    }

    pub fn intersects_row(mut self, row: usize) -> Self {
        self.intersects_row = Some(row);
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = Some(valid);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Serialized form of a store. Only persistent markers are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerStoreState {
    pub version: u32,
    pub next_id: u64,
    pub markers: BTreeMap<MarkerId, MarkerState>,
}

/// Owns every marker, keeps their ranges in a [`MarkerIndex`] and decides
/// which ones an edit invalidates.
#[derive(Debug, Default)]
pub struct MarkerStore {
    index: MarkerIndex,
    markers: HashMap<MarkerId, Marker>,
    historied: BTreeSet<MarkerId>,
    reported: HashMap<MarkerId, MarkerState>,
    next_id: u64,
    emitter: Emitter<MarkerEvent>,
}

impl MarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&MarkerEvent) + 'static,
    {
        self.emitter.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn mark_range(&mut self, range: Range, params: MarkerParams) -> MarkerId {
        let id = MarkerId::new(self.next_id);
        self.next_id += 1;
        self.insert_marker(id, range, params, true);
        id
    }

    /// A tail-less marker sitting at one position.
    pub fn mark_position(&mut self, position: Position, params: MarkerParams) -> MarkerId {
        self.mark_range(Range::empty_at(position), params.tailed(false))
    }

    pub fn get(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.get(&id)
    }

    pub fn contains(&self, id: MarkerId) -> bool {
        self.markers.contains_key(&id)
    }

    /// Ids in creation order.
    pub fn ids(&self) -> Vec<MarkerId> {
        let mut ids: Vec<MarkerId> = self.markers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn range(&self, id: MarkerId) -> Option<Range> {
        self.markers.get(&id)?;
        self.index.get_range(id)
    }

    pub fn state(&self, id: MarkerId) -> Option<MarkerState> {
        let marker = self.markers.get(&id)?;
        Some(marker.state(self.index.get_range(id)?))
    }

    pub fn head_position(&self, id: MarkerId) -> Option<Position> {
        self.state(id).map(|state| state.head())
    }

    pub fn tail_position(&self, id: MarkerId) -> Option<Position> {
        self.state(id).map(|state| state.tail())
    }

    pub fn compare(&self, a: MarkerId, b: MarkerId) -> Option<Ordering> {
        Some(self.range(a)?.cmp(&self.range(b)?))
    }

    /// The single mutation path for markers. Emits a change event if the
    /// marker now differs from what it last reported. Returns false for
    /// unknown ids or when no event fired.
    pub fn update(&mut self, id: MarkerId, update: MarkerUpdate) -> bool {
        self.apply_update(id, update, false)
    }

    pub fn set_range(&mut self, id: MarkerId, range: Range, reversed: Option<bool>) -> bool {
        self.update(
            id,
            MarkerUpdate {
                range: Some(range),
                reversed,
                tailed: Some(true),
                ..MarkerUpdate::default()
            },
        )
    }

    /// Moves the head, flipping orientation when it crosses the tail.
    pub fn set_head_position(&mut self, id: MarkerId, position: Position) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let old = state.range;
        let mut update = MarkerUpdate::default();
        if !state.tailed {
            update.range = Some(Range::empty_at(position));
        } else if state.reversed {
            if position < old.end {
                update.range = Some(Range::new(position, old.end));
            } else {
                update.reversed = Some(false);
                update.range = Some(Range::new(old.end, position));
            }
        } else if position < old.start {
            update.reversed = Some(true);
            update.range = Some(Range::new(position, old.start));
        } else {
            update.range = Some(Range::new(old.start, position));
        }
        self.update(id, update)
    }

    /// Moves the tail, planting one first if the marker has none.
    pub fn set_tail_position(&mut self, id: MarkerId, position: Position) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let old = state.range;
        let mut update = MarkerUpdate {
            tailed: Some(true),
            ..MarkerUpdate::default()
        };
        if state.reversed {
            if position < old.start {
                update.reversed = Some(false);
                update.range = Some(Range::new(position, old.start));
            } else {
                update.range = Some(Range::new(old.start, position));
            }
        } else if position < old.end {
            update.range = Some(Range::new(position, old.end));
        } else {
            update.reversed = Some(true);
            update.range = Some(Range::new(old.end, position));
        }
        self.update(id, update)
    }

    /// Collapses the marker onto its head and drops the tail.
    pub fn clear_tail(&mut self, id: MarkerId) -> bool {
        let Some(head) = self.head_position(id) else {
            return false;
        };
        self.update(
            id,
            MarkerUpdate {
                range: Some(Range::empty_at(head)),
                tailed: Some(false),
                reversed: Some(false),
                ..MarkerUpdate::default()
            },
        )
    }

    /// Gives a tail-less marker a tail at its head.
    pub fn plant_tail(&mut self, id: MarkerId) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        if state.tailed {
            return false;
        }
        self.update(
            id,
            MarkerUpdate {
                range: Some(Range::empty_at(state.head())),
                tailed: Some(true),
                ..MarkerUpdate::default()
            },
        )
    }

    /// Merges `properties` into the marker's bag.
    pub fn set_properties(&mut self, id: MarkerId, properties: Properties) -> bool {
        let Some(marker) = self.markers.get(&id) else {
            return false;
        };
        let mut merged = marker.properties().clone();
        merged.extend(properties);
        self.update(
            id,
            MarkerUpdate {
                properties: Some(merged),
                ..MarkerUpdate::default()
            },
        )
    }

    /// A new marker with the same range and flags, its properties extended
    /// by `properties`.
    pub fn copy_marker(&mut self, id: MarkerId, properties: Properties) -> Option<MarkerId> {
        let state = self.state(id)?;
        let mut params = state.params();
        params.properties.extend(properties);
        let copy = MarkerId::new(self.next_id);
        self.next_id += 1;
        self.insert_marker(copy, state.range, params, state.valid);
        Some(copy)
    }

    pub fn destroy(&mut self, id: MarkerId) -> bool {
        if self.markers.remove(&id).is_none() {
            return false;
        }
        self.index.delete(id);
        self.historied.remove(&id);
        self.reported.remove(&id);
        self.emitter.emit(&MarkerEvent::Destroyed(id));
        true
    }

    /// Markers matching every filter in `query`, ordered by range.
    pub fn find_markers(&self, query: &MarkerQuery) -> Vec<MarkerId> {
        let mut candidates: Option<BTreeSet<MarkerId>> = None;
        if let Some(position) = query.start_position {
            narrow(&mut candidates, self.index.find_starting_at(position));
        }
        if let Some(position) = query.end_position {
            narrow(&mut candidates, self.index.find_ending_at(position));
        }
        if let Some(position) = query.contains_point {
            narrow(&mut candidates, self.index.find_containing(position, position));
        }
        if let Some(range) = query.contains_range {
            narrow(&mut candidates, self.index.find_containing(range.start, range.end));
        }
        if let Some(range) = query.intersects_range {
            narrow(&mut candidates, self.index.find_intersecting(range.start, range.end));
        }
        if let Some(row) = query.start_row {
            let (start, end) = row_bounds(row);
            narrow(&mut candidates, self.index.find_starting_in(start, end));
        }
        if let Some(row) = query.end_row {
            let (start, end) = row_bounds(row);
            narrow(&mut candidates, self.index.find_ending_in(start, end));
        }
        if let Some(row) = query.intersects_row {
            let (start, end) = row_bounds(row);
            narrow(&mut candidates, self.index.find_intersecting(start, end));
        }

        let candidates = candidates.unwrap_or_else(|| self.markers.keys().copied().collect());
        let mut found: Vec<(Range, MarkerId)> = candidates
            .into_iter()
            .filter_map(|id| {
                let marker = self.markers.get(&id)?;
                if query.valid.is_some_and(|valid| valid != marker.is_valid()) {
                    return None;
                }
                let matches = query
                    .properties
                    .iter()
                    .all(|(key, value)| marker.properties().get(key) == Some(value));
                if !matches {
                    return None;
                }
                Some((self.index.get_range(id)?, id))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// Moves markers through an edit and marks invalid the ones whose
    /// strategy objects to it. Change events wait for the next flush.
    /// Returns the ids invalidated by this edit.
    pub fn splice(&mut self, start: Position, old_extent: Position, new_extent: Position) -> Vec<MarkerId> {
        let sets = self.index.splice(start, old_extent, new_extent);
        let mut invalidated = Vec::new();
        for id in &sets.intersecting {
            let Some(marker) = self.markers.get_mut(id) else {
                continue;
            };
            if marker.is_valid() && marker.invalidation_strategy().invalidates(*id, &sets) {
                trace!(marker = %id, strategy = ?marker.invalidation_strategy(), "marker invalidated");
                marker.set_valid(false);
                invalidated.push(*id);
            }
        }
        invalidated
    }

    /// Emits change events for every marker whose state moved since it last
    /// reported, then one aggregate event if any fired.
    pub fn emit_change_events(&mut self, text_changed: bool) {
        let mut any = false;
        for id in self.ids() {
            any |= self.emit_change_event(id, text_changed);
        }
        if any {
            self.emitter.emit(&MarkerEvent::Updated);
        }
    }

    pub fn create_snapshot(&mut self, emit_change_events: bool) -> MarkerSnapshot {
        let snapshot: MarkerSnapshot = self
            .index
            .dump(&self.historied)
            .into_iter()
            .filter_map(|(id, range)| self.markers.get(&id).map(|marker| (id, marker.state(range))))
            .collect();
        if emit_change_events {
            self.emit_change_events(true);
        }
        snapshot
    }

    /// Resets markers to a snapshot. Tracked markers missing from the store
    /// are recreated; tracked markers missing from the snapshot are
    /// destroyed; untracked ones are only notified.
    pub fn restore_from_snapshot(&mut self, snapshot: &MarkerSnapshot) {
        let mut any = false;
        for (id, state) in snapshot {
            if self.markers.contains_key(id) {
                let update = MarkerUpdate {
                    range: Some(state.range),
                    reversed: Some(state.reversed),
                    tailed: Some(state.tailed),
                    valid: Some(state.valid),
                    properties: Some(state.properties.clone()),
                };
                any |= self.apply_update(*id, update, true);
            } else {
                self.next_id = self.next_id.max(id.get() + 1);
                self.insert_marker(*id, state.range, state.params(), state.valid);
                any = true;
            }
        }

        for id in self.ids() {
            if snapshot.contains_key(&id) {
                continue;
            }
            if self.historied.contains(&id) {
                self.destroy(id);
            } else {
                any |= self.emit_change_event(id, true);
            }
        }
        if any {
            self.emitter.emit(&MarkerEvent::Updated);
        }
    }

    pub fn serialize(&self) -> MarkerStoreState {
        let markers = self
            .markers
            .values()
            .filter(|marker| marker.is_persistent())
            .filter_map(|marker| {
                let range = self.index.get_range(marker.id())?;
                Some((marker.id(), marker.state(range)))
            })
            .collect();
        MarkerStoreState {
            version: STATE_VERSION,
            next_id: self.next_id,
            markers,
        }
    }

    /// Replaces every marker with the serialized ones. A state written by a
    /// different version is ignored and false returned.
    pub fn deserialize(&mut self, state: &MarkerStoreState) -> bool {
        if state.version != STATE_VERSION {
            warn!(
                found = state.version,
                expected = STATE_VERSION,
                "ignoring marker state with mismatched version"
            );
            return false;
        }
        for id in self.ids() {
            self.destroy(id);
        }
        for (id, marker) in &state.markers {
            self.insert_marker(*id, marker.range, marker.params(), marker.valid);
        }
        let highest = state.markers.keys().map(|id| id.get() + 1).max().unwrap_or(0);
        self.next_id = self.next_id.max(state.next_id).max(highest);
        true
    }

    fn insert_marker(&mut self, id: MarkerId, range: Range, params: MarkerParams, valid: bool) {
        let mut marker = Marker::new(id, params);
        marker.set_valid(valid);
        let range = if marker.has_tail() {
            range
        } else {
            Range::empty_at(range.end)
        };
        self.index.insert(id, range.start, range.end);
        self.index.set_exclusive(id, marker.is_exclusive());
        if marker.maintains_history() {
            self.historied.insert(id);
        }
        self.reported.insert(id, marker.state(range));
        self.markers.insert(id, marker);
        self.emitter.emit(&MarkerEvent::Created(id));
    }

    fn apply_update(&mut self, id: MarkerId, update: MarkerUpdate, text_changed: bool) -> bool {
        let Some(marker) = self.markers.get_mut(&id) else {
            return false;
        };
        marker.apply(&update);
        let exclusive = marker.is_exclusive();
        if let Some(range) = update.range {
            if self.index.get_range(id) != Some(range) {
                self.index.insert(id, range.start, range.end);
            }
        }
        self.index.set_exclusive(id, exclusive);
        self.emit_change_event(id, text_changed)
    }

    fn emit_change_event(&mut self, id: MarkerId, text_changed: bool) -> bool {
        let Some(current) = self.state(id) else {
            return false;
        };
        let Some(previous) = self.reported.insert(id, current.clone()) else {
            return false;
        };
        if previous == current {
            return false;
        }
        let event = MarkerChangeEvent {
            id,
            old_head: previous.head(),
            new_head: current.head(),
            old_tail: previous.tail(),
            new_tail: current.tail(),
            was_valid: previous.valid,
            is_valid: current.valid,
            had_tail: previous.tailed,
            has_tail: current.tailed,
            old_properties: previous.properties,
            new_properties: current.properties,
            text_changed,
        };
        self.emitter.emit(&MarkerEvent::Changed(event));
        true
    }
}

fn narrow(candidates: &mut Option<BTreeSet<MarkerId>>, found: BTreeSet<MarkerId>) {
    *candidates = Some(match candidates.take() {
        Some(current) => current.intersection(&found).copied().collect(),
        None => found,
    });
}

fn row_bounds(row: usize) -> (Position, Position) {
    (Position::new(row, 0), Position::new(row, usize::MAX))
}
