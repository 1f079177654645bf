/// pario public API
///
/// Session setup, the file lifecycle (open, create, sync, close, delete)
/// and staging of distributed-array writes. Handles and sessions are plain
/// `i32` ids agreed by every rank.
pub mod file_ops;
pub mod registry;
pub mod types;

// Re-export main types
pub use file_ops::Pio;
pub use registry::FileRegistry;
pub use types::*;
