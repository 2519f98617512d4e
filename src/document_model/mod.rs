/// Document model subsystem - Coordinates and the line offset index
///
/// This module contains the value types every other component speaks in
/// (positions, ranges, line endings) and the skip list that converts between
/// rows and flat character offsets.

pub mod line_ending;
pub mod offset_index;
pub mod point;
pub mod range;

// Re-export main types for convenience
pub use line_ending::LineEnding;
pub use offset_index::{Dimension, OffsetIndex, Span};
pub use point::Position;
pub use range::Range;
