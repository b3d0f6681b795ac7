use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to map a requested path onto the sandbox
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path escapes the sandbox: {}", .0.display())]
    OutsideSandbox(PathBuf),
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid sandbox root {}: {reason}", .path.display())]
    InvalidRoot { path: PathBuf, reason: String },
}

/// Failure of a single copy/move/rename/delete/create
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("cannot copy or move {} into itself", .0.display())]
    RecursiveOperation(PathBuf),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("operation cancelled")]
    Cancelled,
}

impl MutationError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => MutationError::NotFound(path),
            io::ErrorKind::PermissionDenied => MutationError::PermissionDenied(path),
            io::ErrorKind::AlreadyExists => MutationError::DestinationExists(path),
            _ => MutationError::Io { path, source },
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a zip archive: {}", .0.display())]
    NotAnArchive(PathBuf),
    #[error("corrupt archive entry: {0}")]
    Corrupt(String),
    #[error("archive entry escapes the destination: {0}")]
    UnsafePath(String),
    #[error("unsupported archive entry {entry}: {reason}")]
    Unsupported { entry: String, reason: String },
    #[error("destination is busy with another extraction: {}", .0.display())]
    Busy(PathBuf),
    #[error("{0} is too large for a zip archive without zip64")]
    TooLarge(String),
    #[error("invalid property list: {0}")]
    Plist(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Wrong password and corrupted envelopes are deliberately one variant
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("wrong password or corrupt data")]
    WrongPasswordOrCorrupt,
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("cipher I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("write of {len} bytes at offset {offset} exceeds file length {file_len}")]
    OutOfBounds { offset: u64, len: usize, file_len: u64 },
    #[error("invalid hex pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("inspect I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("search cancelled")]
    Cancelled,
}

/// A worker closure panicked instead of returning
#[derive(Debug, Clone, Error)]
#[error("task panicked: {0}")]
pub struct TaskPanicked(pub String);

/// Returned by `TaskContext::checkpoint` once cancellation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl From<Cancelled> for MutationError {
    fn from(_: Cancelled) -> Self {
        MutationError::Cancelled
    }
}

impl From<Cancelled> for ArchiveError {
    fn from(_: Cancelled) -> Self {
        ArchiveError::Cancelled
    }
}

impl From<Cancelled> for CipherError {
    fn from(_: Cancelled) -> Self {
        CipherError::Cancelled
    }
}

impl From<Cancelled> for InspectError {
    fn from(_: Cancelled) -> Self {
        InspectError::Cancelled
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}

impl Error {
    /// True for every flavour of "the caller asked us to stop"
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Mutation(MutationError::Cancelled)
                | Error::Archive(ArchiveError::Cancelled)
                | Error::Cipher(CipherError::Cancelled)
                | Error::Inspect(InspectError::Cancelled)
        )
    }
}

/// Umbrella error for the repository facade
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    TaskPanicked(#[from] TaskPanicked),
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classifies_kinds() {
        let err = MutationError::from_io("/a", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, MutationError::NotFound(_)));

        let err = MutationError::from_io("/a", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, MutationError::PermissionDenied(_)));

        let err = MutationError::from_io("/a", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, MutationError::Io { .. }));
    }

    #[test]
    fn test_cipher_error_message_does_not_leak_cause() {
        let msg = CipherError::WrongPasswordOrCorrupt.to_string();
        assert_eq!(msg, "wrong password or corrupt data");
    }

    #[test]
    fn test_umbrella_wraps_components() {
        let err: Error = PathError::OutsideSandbox(PathBuf::from("/etc")).into();
        assert!(matches!(err, Error::Path(PathError::OutsideSandbox(_))));
        let err: Error = TaskPanicked("x".into()).into();
        assert!(err.to_string().contains("panicked"));
    }
}
