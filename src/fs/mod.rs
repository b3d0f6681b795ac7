//! Sandboxed filesystem: navigation, listing, conflict policy and mutations

pub mod catalog;
pub mod conflict;
pub mod listing;
pub mod locks;
pub mod mutator;
pub mod selection;

pub use catalog::{DirectoryHandle, PathCatalog, SandboxRoot};
pub use conflict::{parse_suffix_style, ConflictDecision, ConflictResolver, OnConflict, SuffixStyle};
pub use listing::{disk_usage, parse_sort_key, sort_key_to_string, DirectoryLister, DiskUsage, Entry, EntryKind, SortKey};
pub use locks::{PathLockGuard, PathLocks};
pub use mutator::{is_valid_filename, FileMutator, MutationStage};
pub use selection::{BatchAction, BatchResult, SelectionBatch};
