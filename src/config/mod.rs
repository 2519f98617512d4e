/// Configuration subsystem - Buffer settings and preferences
///
/// This module loads buffer defaults from .tbufrc files: preferred line
/// endings, undo depth, transaction grouping and save behaviour.

pub mod rc;

// Re-export public interface
pub use rc::{BufferConfig, RcLoader};
