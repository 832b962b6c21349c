//! Storage of shard files in the local filesystem.
//!
//! Each node owns one storage root. A [LogicalPath](crate::path::LogicalPath) maps to
//! `<root>/<relative path>`, no metadata besides the files themselves is persisted.

pub mod filesystem;

/// Result of deleting a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}
