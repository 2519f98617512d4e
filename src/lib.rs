//! In-memory document model for a text editor: lines with exact line
//! endings, row/offset conversion, markers that survive edits and
//! transactional undo history.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod document_model;
pub mod error;
pub mod events;
pub mod history;
pub mod marker_index;
pub mod markers;
pub mod patch;

pub use buffer::{BufferEvent, EditOptions, ScanAction, ScanMatch, TextBuffer, TextBufferState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BufferConfig, RcLoader};
pub use document_model::{LineEnding, Position, Range};
pub use error::{BufferError, Result};
pub use history::{Change, History};
pub use marker_index::{MarkerId, MarkerIndex};
pub use markers::{InvalidationStrategy, MarkerEvent, MarkerParams, MarkerQuery, MarkerStore};
pub use patch::Patch;
