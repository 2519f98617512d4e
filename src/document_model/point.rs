use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BufferError;

/// A (row, column) coordinate in the document, or a relative extent
/// between two coordinates.
///
/// Columns count characters. `usize::MAX` stands in for "end of line" and
/// arithmetic saturates so that [`Position::INFINITY`] absorbs any offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub column: usize,
}

impl Position {
    pub const ZERO: Position = Position { row: 0, column: 0 };
    pub const INFINITY: Position = Position {
        row: usize::MAX,
        column: usize::MAX,
    };

    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }

    pub fn is_zero(&self) -> bool {
        self.row == 0 && self.column == 0
    }

    pub fn is_positive(&self) -> bool {
        !self.is_zero()
    }

    /// Adds both components independently.
    pub fn translate(&self, delta: Position) -> Position {
        Position::new(
            self.row.saturating_add(delta.row),
            self.column.saturating_add(delta.column),
        )
    }

    /// Moves by an extent. A delta spanning rows lands on its own column;
    /// a same-row delta adds to the current column.
    pub fn traverse(&self, delta: Position) -> Position {
        if delta.row == 0 {
            Position::new(self.row, self.column.saturating_add(delta.column))
        } else {
            Position::new(self.row.saturating_add(delta.row), delta.column)
        }
    }

    /// The extent that carries `origin` to `self`. Inverse of [`Position::traverse`].
    pub fn traversal_from(&self, origin: Position) -> Position {
        if self.row == usize::MAX && origin.row != usize::MAX {
            return Position::INFINITY;
        }
        if self.row == origin.row {
            if self.column == usize::MAX && origin.column == usize::MAX {
                Position::ZERO
            } else {
                Position::new(0, self.column.saturating_sub(origin.column))
            }
        } else {
            Position::new(self.row.saturating_sub(origin.row), self.column)
        }
    }

    pub fn min(self, other: Position) -> Position {
        if other < self { other } else { self }
    }

    pub fn max(self, other: Position) -> Position {
        if other > self { other } else { self }
    }

    pub fn to_array(&self) -> [usize; 2] {
        [self.row, self.column]
    }

    fn from_components(row: &Value, column: &Value) -> Result<Self, BufferError> {
        match (row.as_u64(), column.as_u64()) {
            (Some(row), Some(column)) => Ok(Position::new(row as usize, column as usize)),
            _ => Err(BufferError::InvalidPosition(format!(
                "row {row} and column {column} must be non-negative integers"
            ))),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<(usize, usize)> for Position {
    fn from((row, column): (usize, usize)) -> Self {
        Position::new(row, column)
    }
}

/// Accepts `[row, column]` or `{"row": .., "column": ..}`.
impl TryFrom<&Value> for Position {
    type Error = BufferError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(items) if items.len() == 2 => {
                Position::from_components(&items[0], &items[1])
            }
            Value::Object(map) => match (map.get("row"), map.get("column")) {
                (Some(row), Some(column)) => Position::from_components(row, column),
                _ => Err(BufferError::InvalidPosition(value.to_string())),
            },
            _ => Err(BufferError::InvalidPosition(value.to_string())),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}
