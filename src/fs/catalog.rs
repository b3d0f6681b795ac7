use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PathError;
use crate::fs::listing::{Entry, EntryKind};

/// Absolute, canonical boundary every resolved path must stay under.
///
/// Cheap to clone; immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    path: Arc<PathBuf>,
}

impl SandboxRoot {
    /// Open an existing directory as the sandbox root
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).map_err(|e| PathError::InvalidRoot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(PathError::InvalidRoot {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self { path: Arc::new(canonical) })
    }

    /// Create the directory (and parents) if needed, then open it
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|e| PathError::InvalidRoot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate an absolute (or root-relative) path against the boundary.
    ///
    /// `..` that would climb above the root is rejected rather than clamped, and
    /// the deepest existing ancestor is canonicalized so that symlinks pointing
    /// outside the root are caught.
    pub fn check(&self, candidate: &Path) -> Result<PathBuf, PathError> {
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.path.join(candidate)
        };

        let logical = normalize_lexically(&absolute)
            .ok_or_else(|| PathError::OutsideSandbox(candidate.to_path_buf()))?;
        if !logical.starts_with(self.path.as_path()) {
            return Err(PathError::OutsideSandbox(candidate.to_path_buf()));
        }

        let resolved = soft_canonicalize(&logical)
            .map_err(|_| PathError::OutsideSandbox(candidate.to_path_buf()))?;
        if !resolved.starts_with(self.path.as_path()) {
            warn!(path = %candidate.display(), resolved = %resolved.display(), "symlink escapes sandbox");
            return Err(PathError::OutsideSandbox(candidate.to_path_buf()));
        }
        Ok(resolved)
    }

    /// Path relative to the root, rendered with a leading `/`
    pub fn virtual_path(&self, path: &Path) -> String {
        match path.strip_prefix(self.path.as_path()) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Resolve `.` and `..` without touching the filesystem.
/// Returns `None` when `..` would climb past the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Canonicalize the deepest existing ancestor and re-append the missing tail.
fn soft_canonicalize(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if fs::symlink_metadata(existing).is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
    // A dangling symlink fails here, which callers treat as an escape.
    let mut resolved = fs::canonicalize(existing)?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// A directory under the sandbox root, known to exist at last check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    path: PathBuf,
}

impl DirectoryHandle {
    /// Validate `path` against `root` and check it is a directory right now
    pub fn open(root: &SandboxRoot, path: &Path) -> Result<Self, PathError> {
        let path = root.check(path)?;
        let handle = Self { path };
        handle.revalidate()?;
        Ok(handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existence + kind check; run before every listing
    pub fn revalidate(&self) -> Result<(), PathError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(PathError::NotADirectory(self.path.clone())),
            Err(_) => Err(PathError::NotFound(self.path.clone())),
        }
    }
}

/// Sandbox root plus the directory the user is currently looking at
#[derive(Debug, Clone)]
pub struct PathCatalog {
    root: SandboxRoot,
    current: PathBuf,
}

impl PathCatalog {
    pub fn new(root: SandboxRoot) -> Self {
        let current = root.path().to_path_buf();
        Self { root, current }
    }

    pub fn root(&self) -> &SandboxRoot {
        &self.root
    }

    pub fn current_directory(&self) -> &Path {
        &self.current
    }

    pub fn is_at_root(&self) -> bool {
        self.current == self.root.path()
    }

    pub fn directory_handle(&self) -> Result<DirectoryHandle, PathError> {
        DirectoryHandle::open(&self.root, &self.current)
    }

    /// Resolve user input: a leading `/` is anchored at the sandbox root,
    /// anything else is relative to the current directory.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, PathError> {
        let trimmed = relative.trim();
        let candidate = match trimmed.strip_prefix('/') {
            Some(rest) => self.root.path().join(rest),
            None => self.current.join(trimmed),
        };
        self.root.check(&candidate).map_err(|e| match e {
            PathError::OutsideSandbox(_) => PathError::OutsideSandbox(PathBuf::from(relative)),
            other => other,
        })
    }

    /// Enter a directory entry from the latest listing
    pub fn navigate(&mut self, entry: &Entry) -> Result<PathBuf, PathError> {
        let target = self.current.join(&entry.name);
        if entry.kind != EntryKind::Directory {
            return Err(PathError::NotADirectory(target));
        }
        if entry.name.contains('/') || entry.name == ".." || entry.name == "." {
            return Err(PathError::OutsideSandbox(PathBuf::from(&entry.name)));
        }
        let handle = DirectoryHandle::open(&self.root, &target)?;
        self.current = handle.path().to_path_buf();
        debug!(path = %self.current.display(), "navigated");
        Ok(self.current.clone())
    }

    /// Jump to a resolved directory (goto)
    pub fn navigate_to(&mut self, relative: &str) -> Result<PathBuf, PathError> {
        let target = self.resolve(relative)?;
        let handle = DirectoryHandle::open(&self.root, &target)?;
        self.current = handle.path().to_path_buf();
        Ok(self.current.clone())
    }

    /// Go up one level; a no-op at the sandbox root
    pub fn navigate_to_parent(&mut self) -> PathBuf {
        if !self.is_at_root() {
            if let Some(parent) = self.current.parent() {
                if parent.starts_with(self.root.path()) {
                    self.current = parent.to_path_buf();
                }
            }
        }
        self.current.clone()
    }

    /// If the current directory vanished, walk up to the nearest surviving ancestor
    pub fn recover(&mut self) -> PathBuf {
        while !self.is_at_root() && !self.current.is_dir() {
            self.navigate_to_parent();
        }
        self.current.clone()
    }

    pub fn virtual_path(&self) -> String {
        self.root.virtual_path(&self.current)
    }
}
