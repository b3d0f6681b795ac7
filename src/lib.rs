//! Sandboxed file repository: navigation and listing, conflict-aware file
//! mutations, ZIP/IPA extraction and compression, password-based file
//! encryption, and byte-level inspection, with long-running work on a
//! cancellable task runner.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod inspect;
pub mod logging;
pub mod repository;
pub mod task;
pub mod utils;

pub use archive::{ArchiveReader, BundleInfo, ExtractSummary, PlistValue, ZipArchive, ZipWriter};
pub use config::Settings;
pub use crypto::{CipherBox, CipherEnvelope};
pub use error::{ArchiveError, CipherError, Error, InspectError, MutationError, PathError, Result};
pub use fs::{
    BatchAction, BatchResult, ConflictDecision, ConflictResolver, DirectoryLister, Entry, EntryKind, FileMutator,
    OnConflict, PathCatalog, SandboxRoot, SelectionBatch, SortKey,
};
pub use inspect::{ByteInspector, ByteWindow};
pub use repository::{FileRepository, MutationOp};
pub use task::{ProgressEvent, TaskContext, TaskHandle, TaskOutcome, TaskRunner, TaskState};
