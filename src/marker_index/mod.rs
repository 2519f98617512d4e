/// Marker index subsystem - Range-annotated tree of marker ids
///
/// Markers are stored on the highest tree nodes whose span lies entirely
/// inside the marker's range, so containment and intersection queries only
/// visit the nodes around the queried positions. Splices re-derive the
/// ranges of the markers they touch and leave every other marker in place.

mod node;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::document_model::{Position, Range};
use crate::error::BufferError;
use node::{Branch, Leaf, Node};

/// Opaque marker identifier. Rendered as a decimal string at serialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerId(u64);

impl MarkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MarkerId {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(MarkerId)
            .map_err(|_| BufferError::InvalidMarkerId(s.to_string()))
    }
}

impl Serialize for MarkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MarkerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The markers a splice touched, classified against the edited span
/// `[start, old end]` before any position moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpliceSets {
    /// Markers intersecting the edited span, touching boundaries included.
    pub intersecting: BTreeSet<MarkerId>,
    /// Markers ending exactly where the edit starts.
    pub preceding: BTreeSet<MarkerId>,
    /// Markers starting exactly where the edit ends.
    pub following: BTreeSet<MarkerId>,
    pub starting_in: BTreeSet<MarkerId>,
    pub ending_in: BTreeSet<MarkerId>,
    /// Zero-width markers inside the edited span.
    pub empty: BTreeSet<MarkerId>,
}

#[derive(Debug, Clone)]
pub struct MarkerIndex {
    root: Node,
    exclusive: HashSet<MarkerId>,
    known: HashSet<MarkerId>,
    ranges: RefCell<HashMap<MarkerId, Range>>,
}

impl Default for MarkerIndex {
    fn default() -> Self {
        Self {
            root: Node::Leaf(Leaf::new(Position::INFINITY, BTreeSet::new())),
            exclusive: HashSet::new(),
            known: HashSet::new(),
            ranges: RefCell::new(HashMap::new()),
        }
    }
}

impl MarkerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn contains(&self, id: MarkerId) -> bool {
        self.known.contains(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.known.iter().copied()
    }

    pub fn insert(&mut self, id: MarkerId, start: Position, end: Position) {
        if self.known.contains(&id) {
            self.delete(id);
        }
        let range = Range::new(start, end);
        self.place(id, range);
        self.known.insert(id);
        self.ranges.borrow_mut().insert(id, range);
    }

    /// Returns false for unknown ids.
    pub fn delete(&mut self, id: MarkerId) -> bool {
        let Some(range) = self.get_range(id) else {
            return false;
        };
        self.root.remove(Position::ZERO, range.start, range.end, id);
        self.prune(range.start);
        if range.end != range.start {
            self.prune(range.end);
        }
        self.known.remove(&id);
        self.exclusive.remove(&id);
        self.ranges.borrow_mut().remove(&id);
        true
    }

    pub fn set_exclusive(&mut self, id: MarkerId, exclusive: bool) {
        if exclusive {
            self.exclusive.insert(id);
        } else {
            self.exclusive.remove(&id);
        }
    }

    pub fn is_exclusive(&self, id: MarkerId) -> bool {
        self.exclusive.contains(&id)
    }

    pub fn get_start(&self, id: MarkerId) -> Option<Position> {
        self.get_range(id).map(|range| range.start)
    }

    pub fn get_end(&self, id: MarkerId) -> Option<Position> {
        self.get_range(id).map(|range| range.end)
    }

    /// Looked up in the tree on first use after a splice, then cached.
    pub fn get_range(&self, id: MarkerId) -> Option<Range> {
        if !self.known.contains(&id) {
            return None;
        }
        if let Some(range) = self.ranges.borrow().get(&id) {
            return Some(*range);
        }
        let start = self.root.start_of(Position::ZERO, id)?;
        let end = self.root.end_of(Position::ZERO, id)?;
        let range = Range { start, end };
        self.ranges.borrow_mut().insert(id, range);
        Some(range)
    }

    pub fn find_intersecting(&self, start: Position, end: Position) -> BTreeSet<MarkerId> {
        let mut ids = BTreeSet::new();
        self.root
            .collect_intersecting(Position::ZERO, start, end, &mut ids);
        ids
    }

    pub fn find_containing(&self, start: Position, end: Position) -> BTreeSet<MarkerId> {
        let mut at_start = BTreeSet::new();
        self.root.collect_containing(Position::ZERO, start, &mut at_start);
        if start == end {
            return at_start;
        }
        let mut at_end = BTreeSet::new();
        self.root.collect_containing(Position::ZERO, end, &mut at_end);
        at_start.intersection(&at_end).copied().collect()
    }

    pub fn find_contained_in(&self, start: Position, end: Position) -> BTreeSet<MarkerId> {
        self.filter_intersecting(start, end, |range| range.start >= start && range.end <= end)
    }

    pub fn find_starting_in(&self, start: Position, end: Position) -> BTreeSet<MarkerId> {
        self.filter_intersecting(start, end, |range| {
            range.start >= start && range.start <= end
        })
    }

    pub fn find_ending_in(&self, start: Position, end: Position) -> BTreeSet<MarkerId> {
        self.filter_intersecting(start, end, |range| range.end >= start && range.end <= end)
    }

    pub fn find_starting_at(&self, position: Position) -> BTreeSet<MarkerId> {
        self.find_starting_in(position, position)
    }

    pub fn find_ending_at(&self, position: Position) -> BTreeSet<MarkerId> {
        self.find_ending_in(position, position)
    }

    /// Ranges of the given ids, skipping unknown ones.
    pub fn dump<'a>(&self, ids: impl IntoIterator<Item = &'a MarkerId>) -> HashMap<MarkerId, Range> {
        ids.into_iter()
            .filter_map(|id| self.get_range(*id).map(|range| (*id, range)))
            .collect()
    }

    /// Replaces `old_extent` at `start` with `new_extent`, moving every
    /// marker the edit touches. Returns how each touched marker related to
    /// the edited span beforehand.
    pub fn splice(&mut self, start: Position, old_extent: Position, new_extent: Position) -> SpliceSets {
        if old_extent.is_zero() && new_extent.is_zero() {
            return SpliceSets::default();
        }
        let old_end = start.traverse(old_extent);
        let new_end = start.traverse(new_extent);

        let intersecting = self.find_intersecting(start, old_end);
        let touched: Vec<(MarkerId, Range)> = intersecting
            .iter()
            .filter_map(|id| self.get_range(*id).map(|range| (*id, range)))
            .collect();

        let mut sets = SpliceSets {
            intersecting,
            ..SpliceSets::default()
        };
        for (id, range) in &touched {
            if range.end == start {
                sets.preceding.insert(*id);
            }
            if range.start == old_end {
                sets.following.insert(*id);
            }
            if range.start >= start && range.start <= old_end {
                sets.starting_in.insert(*id);
            }
            if range.end >= start && range.end <= old_end {
                sets.ending_in.insert(*id);
            }
            if range.is_empty() {
                sets.empty.insert(*id);
            }
            self.root.remove(Position::ZERO, range.start, range.end, *id);
        }

        let run_start = self.root.run_start(Position::ZERO, start);
        let run_end = self.root.run_end(Position::ZERO, old_end);
        let merged = start
            .traversal_from(run_start)
            .traverse(new_extent)
            .traverse(run_end.traversal_from(old_end));
        let mut kept = false;
        self.root
            .replace_run(Position::ZERO, start, old_end, merged, &mut kept);
        self.collapse_root();
        self.ranges.borrow_mut().clear();

        for (id, range) in touched {
            let exclusive = self.exclusive.contains(&id);
            let moved = relocate(range, exclusive, start, old_end, new_end);
            self.place(id, moved);
            self.ranges.borrow_mut().insert(id, moved);
        }
        sets
    }

    /// Verifies tree shape and that every id's stored spans describe its range.
    pub fn is_consistent(&self) -> bool {
        if !self.root.is_well_formed() {
            return false;
        }
        let mut spans = BTreeMap::new();
        self.root.collect_spans(Position::ZERO, &mut spans);
        if spans.len() != self.known.len() {
            return false;
        }
        spans.into_iter().all(|(id, mut stored)| {
            let Some(range) = self.get_range(id) else {
                return false;
            };
            stored.sort();
            let mut reach = range.start;
            for span in &stored {
                if span.start < range.start || span.end > range.end || span.start > reach {
                    return false;
                }
                reach = reach.max(span.end);
            }
            stored.first().map(|span| span.start) == Some(range.start) && reach == range.end
        })
    }

    fn place(&mut self, id: MarkerId, range: Range) {
        if range.is_empty() {
            if let Some(replacement) = self.root.insert_empty(Position::ZERO, range.start, id) {
                self.adopt(replacement);
            }
            return;
        }
        for boundary in [range.start, range.end] {
            if let Some(replacement) = self.root.split_at(Position::ZERO, boundary) {
                self.adopt(replacement);
            }
        }
        self.root.cover(Position::ZERO, range.start, range.end, id);
    }

    fn adopt(&mut self, replacement: Vec<Node>) {
        self.root = Node::Branch(Branch::from_children(replacement));
    }

    fn prune(&mut self, point: Position) {
        self.root.prune_at(Position::ZERO, point);
        self.collapse_root();
    }

    fn collapse_root(&mut self) {
        while let Node::Branch(branch) = &mut self.root {
            if branch.children.len() != 1 {
                break;
            }
            let ids = std::mem::take(&mut branch.ids);
            let mut only = branch.children.remove(0);
            only.ids_mut().extend(ids);
            self.root = only;
        }
    }

    fn filter_intersecting(
        &self,
        start: Position,
        end: Position,
        keep: impl Fn(&Range) -> bool,
    ) -> BTreeSet<MarkerId> {
        self.find_intersecting(start, end)
            .into_iter()
            .filter(|id| self.get_range(*id).is_some_and(|range| keep(&range)))
            .collect()
    }
}

/// Where a marker lands after `[start, old_end]` is replaced by text ending
/// at `new_end`. Exclusive markers never grow to take in text inserted at
/// their edges; inclusive ones do. Zero-width markers stay zero-width.
fn relocate(range: Range, exclusive: bool, start: Position, old_end: Position, new_end: Position) -> Range {
    let insertion = start == old_end;
    let inside_start = if exclusive { new_end } else { start };
    let inside_end = if exclusive { start } else { new_end };

    let map = |point: Position, is_start: bool| -> Position {
        if point < start {
            point
        } else if point > old_end {
            new_end.traverse(point.traversal_from(old_end))
        } else if insertion {
            if is_start { inside_start } else { inside_end }
        } else if point == start {
            start
        } else if point == old_end {
            new_end
        } else if is_start {
            inside_start
        } else {
            inside_end
        }
    };

    if range.is_empty() {
        return Range::empty_at(map(range.start, true));
    }
    let moved_start = map(range.start, true);
    let moved_end = map(range.end, false);
    if moved_start > moved_end {
        Range::empty_at(moved_start)
    } else {
        Range {
            start: moved_start,
            end: moved_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn p(row: usize, column: usize) -> Position {
        Position::new(row, column)
    }

    fn id(raw: u64) -> MarkerId {
        MarkerId::new(raw)
    }

    fn ids(raw: &[u64]) -> BTreeSet<MarkerId> {
        raw.iter().copied().map(MarkerId::new).collect()
    }

    fn r(start: (usize, usize), end: (usize, usize)) -> Range {
        Range::from((start, end))
    }

    #[test]
    fn test_insert_and_get_range() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 2), p(0, 5));
        index.insert(id(2), p(1, 0), p(3, 4));
        index.insert(id(3), p(2, 2), p(2, 2));

        assert_eq!(index.get_range(id(1)), Some(r((0, 2), (0, 5))));
        assert_eq!(index.get_start(id(2)), Some(p(1, 0)));
        assert_eq!(index.get_end(id(2)), Some(p(3, 4)));
        assert_eq!(index.get_range(id(3)), Some(r((2, 2), (2, 2))));
        assert_eq!(index.get_range(id(9)), None);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_find_queries() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 2), p(0, 5));
        index.insert(id(2), p(0, 4), p(0, 8));
        index.insert(id(3), p(0, 5), p(0, 5));
        index.insert(id(4), p(0, 9), p(0, 12));

        assert_eq!(index.find_intersecting(p(0, 5), p(0, 5)), ids(&[1, 2, 3]));
        assert_eq!(index.find_intersecting(p(0, 8), p(0, 9)), ids(&[2, 4]));
        assert_eq!(index.find_containing(p(0, 4), p(0, 5)), ids(&[1, 2]));
        assert_eq!(index.find_containing(p(0, 6), p(0, 6)), ids(&[2]));
        assert_eq!(index.find_contained_in(p(0, 0), p(0, 6)), ids(&[1, 3]));
        assert_eq!(index.find_starting_in(p(0, 4), p(0, 9)), ids(&[2, 3, 4]));
        assert_eq!(index.find_ending_in(p(0, 5), p(0, 8)), ids(&[1, 2, 3]));
        assert_eq!(index.find_starting_at(p(0, 5)), ids(&[3]));
        assert_eq!(index.find_ending_at(p(0, 5)), ids(&[1, 3]));
    }

    #[test]
    fn test_many_markers_keep_tree_consistent() {
        let mut index = MarkerIndex::new();
        for n in 0..60u64 {
            let row = (n % 7) as usize;
            let column = (n * 3 % 11) as usize;
            index.insert(id(n), p(row, column), p(row + (n % 3) as usize, column + 2));
        }
        assert!(index.is_consistent());
        for n in 0..60u64 {
            let row = (n % 7) as usize;
            let column = (n * 3 % 11) as usize;
            assert_eq!(
                index.get_range(id(n)),
                Some(Range::new(p(row, column), p(row + (n % 3) as usize, column + 2)))
            );
        }
        for n in (0..60u64).step_by(2) {
            assert!(index.delete(id(n)));
        }
        assert!(!index.delete(id(0)));
        assert_eq!(index.len(), 30);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_splice_shifts_following_markers() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 6), p(0, 8));
        index.insert(id(2), p(2, 1), p(2, 3));

        index.splice(p(0, 2), p(0, 0), p(1, 3));

        assert_eq!(index.get_range(id(1)), Some(r((1, 7), (1, 9))));
        assert_eq!(index.get_range(id(2)), Some(r((3, 1), (3, 3))));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_splice_leaves_preceding_markers_alone() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 0), p(0, 1));
        index.splice(p(0, 3), p(0, 2), p(0, 0));
        assert_eq!(index.get_range(id(1)), Some(r((0, 0), (0, 1))));
    }

    #[test]
    fn test_insertion_at_boundaries_inclusive() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 2), p(0, 4));
        index.splice(p(0, 2), p(0, 0), p(0, 3));
        assert_eq!(index.get_range(id(1)), Some(r((0, 2), (0, 7))));
        index.splice(p(0, 7), p(0, 0), p(0, 1));
        assert_eq!(index.get_range(id(1)), Some(r((0, 2), (0, 8))));
    }

    #[test]
    fn test_insertion_at_boundaries_exclusive() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 2), p(0, 4));
        index.set_exclusive(id(1), true);
        index.splice(p(0, 2), p(0, 0), p(0, 3));
        assert_eq!(index.get_range(id(1)), Some(r((0, 5), (0, 7))));
        index.splice(p(0, 7), p(0, 0), p(0, 1));
        assert_eq!(index.get_range(id(1)), Some(r((0, 5), (0, 7))));
    }

    #[test]
    fn test_empty_marker_at_insertion_point() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 3), p(0, 3));
        index.insert(id(2), p(0, 3), p(0, 3));
        index.set_exclusive(id(2), true);

        index.splice(p(0, 3), p(0, 0), p(0, 2));

        assert_eq!(index.get_range(id(1)), Some(r((0, 3), (0, 3))));
        assert_eq!(index.get_range(id(2)), Some(r((0, 5), (0, 5))));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_deletion_collapses_enclosed_marker() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 3), p(0, 5));
        index.insert(id(2), p(0, 1), p(0, 9));

        let sets = index.splice(p(0, 2), p(0, 5), p(0, 0));

        assert_eq!(index.get_range(id(1)), Some(r((0, 2), (0, 2))));
        assert_eq!(index.get_range(id(2)), Some(r((0, 1), (0, 4))));
        assert_eq!(sets.intersecting, ids(&[1, 2]));
        assert_eq!(sets.starting_in, ids(&[1]));
        assert!(sets.ending_in.contains(&id(1)));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_replacement_of_marked_text() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 2), p(0, 4));
        index.splice(p(0, 2), p(0, 2), p(1, 1));
        assert_eq!(index.get_range(id(1)), Some(r((0, 2), (1, 1))));
    }

    #[test]
    fn test_splice_sets_classify_boundaries() {
        let mut index = MarkerIndex::new();
        index.insert(id(1), p(0, 0), p(0, 2));
        index.insert(id(2), p(0, 4), p(0, 6));
        index.insert(id(3), p(0, 1), p(0, 5));
        index.insert(id(4), p(0, 3), p(0, 3));

        let sets = index.splice(p(0, 2), p(0, 2), p(0, 1));

        assert_eq!(sets.intersecting, ids(&[1, 2, 3, 4]));
        assert_eq!(sets.preceding, ids(&[1]));
        assert_eq!(sets.following, ids(&[2]));
        assert_eq!(sets.starting_in, ids(&[2, 4]));
        assert_eq!(sets.ending_in, ids(&[1, 4]));
        assert_eq!(sets.empty, ids(&[4]));
    }

    #[test]
    fn test_marker_id_parsing() {
        assert_eq!("42".parse::<MarkerId>().unwrap(), id(42));
        assert!(matches!(
            "forty-two".parse::<MarkerId>(),
            Err(BufferError::InvalidMarkerId(_))
        ));
        assert_eq!(serde_json::to_string(&id(7)).unwrap(), "\"7\"");
        assert!(serde_json::from_str::<MarkerId>("\"x\"").is_err());
    }

    fn shift(point: Position, start: Position, old_end: Position, new_end: Position) -> Position {
        if point < start {
            point
        } else if point > old_end {
            new_end.traverse(point.traversal_from(old_end))
        } else {
            point
        }
    }

    proptest! {
        #[test]
        fn prop_markers_clear_of_edits_shift_exactly(
            markers in prop::collection::vec((0..6usize, 0..8usize, 0..3usize, 0..5usize), 1..25),
            edits in prop::collection::vec((0..6usize, 0..8usize, 0..2usize, 0..4usize, 0..2usize, 0..4usize), 1..12),
        ) {
            let mut index = MarkerIndex::new();
            let mut expected = HashMap::new();
            for (n, (row, column, rows, columns)) in markers.into_iter().enumerate() {
                let range = Range::new(p(row, column), p(row + rows, column + columns));
                index.insert(id(n as u64), range.start, range.end);
                expected.insert(id(n as u64), range);
            }

            for (row, column, old_rows, old_columns, new_rows, new_columns) in edits {
                let start = p(row, column);
                let old_extent = p(old_rows, old_columns);
                let new_extent = p(new_rows, new_columns);
                let old_end = start.traverse(old_extent);
                let new_end = start.traverse(new_extent);
                let sets = index.splice(start, old_extent, new_extent);

                for (marker, range) in expected.iter_mut() {
                    if sets.intersecting.contains(marker) {
                        *range = index.get_range(*marker).unwrap();
                    } else {
                        *range = Range {
                            start: shift(range.start, start, old_end, new_end),
                            end: shift(range.end, start, old_end, new_end),
                        };
                    }
                }
                prop_assert!(index.is_consistent());
            }

            for (marker, range) in expected {
                prop_assert_eq!(index.get_range(marker), Some(range));
            }
        }
    }
}
