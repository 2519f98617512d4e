use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::line_ending::text_extent;
use super::point::Position;

/// A half-open span between two positions. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    /// Builds a range from two positions in either order.
    pub fn new(a: Position, b: Position) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn empty_at(position: Position) -> Self {
        Self {
            start: position,
            end: position,
        }
    }

    /// The range `text` would occupy if inserted at `start`.
    pub fn from_text(start: Position, text: &str) -> Self {
        Self::from_point_with_delta(start, text_extent(text))
    }

    pub fn from_point_with_delta(start: Position, delta: Position) -> Self {
        Self {
            start,
            end: start.traverse(delta),
        }
    }

    pub fn extent(&self) -> Position {
        self.end.traversal_from(self.start)
    }

    /// Row and column deltas from start to end. Same as [`Range::extent`].
    pub fn to_delta(&self) -> Position {
        self.extent()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_single_line(&self) -> bool {
        self.start.row == self.end.row
    }

    pub fn row_count(&self) -> usize {
        self.end.row - self.start.row + 1
    }

    pub fn rows(&self) -> std::ops::RangeInclusive<usize> {
        self.start.row..=self.end.row
    }

    pub fn union(&self, other: &Range) -> Range {
        Range {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn translate(&self, start_delta: Position, end_delta: Position) -> Range {
        Range::new(self.start.translate(start_delta), self.end.translate(end_delta))
    }

    pub fn traverse(&self, delta: Position) -> Range {
        Range::new(self.start.traverse(delta), self.end.traverse(delta))
    }

    pub fn contains_point(&self, point: Position, exclusive: bool) -> bool {
        if exclusive {
            self.start < point && point < self.end
        } else {
            self.start <= point && point <= self.end
        }
    }

    pub fn contains_range(&self, other: &Range, exclusive: bool) -> bool {
        self.contains_point(other.start, exclusive) && self.contains_point(other.end, exclusive)
    }

    /// Inclusive intersection counts ranges that merely touch.
    pub fn intersects_with(&self, other: &Range, exclusive: bool) -> bool {
        if exclusive {
            self.end > other.start && self.start < other.end
        } else {
            self.end >= other.start && self.start <= other.end
        }
    }

    pub fn intersects_row(&self, row: usize) -> bool {
        self.start.row <= row && row <= self.end.row
    }

    pub fn intersects_row_range(&self, start_row: usize, end_row: usize) -> bool {
        let (low, high) = if start_row <= end_row {
            (start_row, end_row)
        } else {
            (end_row, start_row)
        };
        self.end.row >= low && high >= self.start.row
    }
}

/// Ranges order by start; at equal starts the longer range comes first.
impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| other.end.cmp(&self.end))
    }
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<((usize, usize), (usize, usize))> for Range {
    fn from((start, end): ((usize, usize), (usize, usize))) -> Self {
        Range::new(start.into(), end.into())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {}]", self.start, self.end)
    }
}
