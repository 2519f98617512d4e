/// Buffer subsystem - The document everything else hangs off
///
/// `TextBuffer` owns the lines and composes the offset index, markers and
/// history into atomic edits. Search, file lifecycle and serialization
/// live in their own files as further `impl TextBuffer` blocks.

pub mod file;
pub mod search;
pub mod serialize;
pub mod text_buffer;

// Re-export main types for convenience
pub use file::backup_path_for;
pub use search::{ScanAction, ScanMatch};
pub use serialize::TextBufferState;
pub use text_buffer::{BufferEvent, EditOptions, TextBuffer};
