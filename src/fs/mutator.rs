use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{MutationError, PathError};
use crate::fs::catalog::SandboxRoot;
use crate::fs::conflict::{ConflictDecision, ConflictResolver, OnConflict};
use crate::fs::locks::PathLocks;
use crate::task::{ProgressEvent, TaskContext};

/// Prefix for staging and trash names; listings skip dot-files
const STAGING_PREFIX: &str = ".filevault.";

/// Lifecycle of a single mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStage {
    Requested,
    Validating,
    Executing,
    Succeeded,
    Failed,
}

impl MutationStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, MutationStage::Succeeded | MutationStage::Failed)
    }
}

/// Validate a single path component typed by the user
pub fn is_valid_filename(name: &str) -> Result<(), MutationError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." {
        "name is a relative directory reference"
    } else if name.contains('/') || name.contains('\\') {
        "name contains a path separator"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(MutationError::InvalidName(format!("{:?}: {}", name, reason)))
}

/// Tracks one mutation through its stages and logs every transition
struct Mutation<'a> {
    op: &'static str,
    path: &'a Path,
    stage: MutationStage,
}

impl<'a> Mutation<'a> {
    fn begin(op: &'static str, path: &'a Path) -> Self {
        debug!(op, path = %path.display(), stage = ?MutationStage::Requested, "mutation");
        Self { op, path, stage: MutationStage::Requested }
    }

    fn advance(&mut self, stage: MutationStage) {
        debug!(op = self.op, path = %self.path.display(), from = ?self.stage, to = ?stage, "mutation");
        self.stage = stage;
    }

    fn finish<T>(mut self, result: Result<T, MutationError>) -> Result<T, MutationError> {
        match &result {
            Ok(_) => self.advance(MutationStage::Succeeded),
            Err(e) => {
                self.advance(MutationStage::Failed);
                warn!(op = self.op, path = %self.path.display(), error = %e, "mutation failed");
            }
        }
        result
    }
}

/// Copy, move, rename, delete and create inside a sandbox.
///
/// Every operation validates first and then either completes or leaves the
/// filesystem as it found it: new content is staged under a hidden name in
/// the target directory and renamed into place, deletes rename the victim
/// away before removing it.
#[derive(Debug, Clone)]
pub struct FileMutator {
    root: SandboxRoot,
    locks: Arc<PathLocks>,
    resolver: ConflictResolver,
}

impl FileMutator {
    pub fn new(root: SandboxRoot, locks: Arc<PathLocks>, resolver: ConflictResolver) -> Self {
        Self { root, locks, resolver }
    }

    pub fn root(&self) -> &SandboxRoot {
        &self.root
    }

    pub fn locks(&self) -> &Arc<PathLocks> {
        &self.locks
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Map a path into the sandbox without following a symlink in the last component
    fn confine(&self, path: &Path) -> Result<PathBuf, MutationError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.path().join(path)
        };
        let name = absolute
            .file_name()
            .ok_or_else(|| MutationError::InvalidName(path.display().to_string()))?
            .to_os_string();
        let parent = absolute.parent().ok_or_else(|| PathError::OutsideSandbox(path.to_path_buf()))?;
        let parent = self.root.check(parent)?;
        if !parent.starts_with(self.root.path()) {
            return Err(PathError::OutsideSandbox(path.to_path_buf()).into());
        }
        Ok(parent.join(name))
    }

    /// Sandbox-checked path of an entry that must exist
    pub fn locate(&self, path: &Path) -> Result<PathBuf, MutationError> {
        let confined = self.confine(path)?;
        if fs::symlink_metadata(&confined).is_err() {
            return Err(MutationError::NotFound(confined));
        }
        Ok(confined)
    }

    fn target_for(&self, destination: &Path, policy: OnConflict) -> Result<(PathBuf, bool), MutationError> {
        let decision = self.resolver.decide(destination, policy);
        let overwrite = decision == ConflictDecision::Overwrite;
        match decision.target(destination) {
            Some(target) => Ok((target, overwrite)),
            None => Err(MutationError::DestinationExists(destination.to_path_buf())),
        }
    }

    /// Copy `source` to the full path `destination`; directories recurse
    pub fn copy(
        &self,
        source: &Path,
        destination: &Path,
        policy: OnConflict,
        ctx: &TaskContext,
    ) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("copy", source);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            ctx.checkpoint()?;
            let source = self.locate(source)?;
            let destination = self.confine(destination)?;
            check_not_recursive(&source, &destination)?;

            let _guard = self.locks.lock(&[&source, &destination]);
            let (target, overwrite) = self.target_for(&destination, policy)?;

            m.advance(MutationStage::Executing);
            let parent = parent_of(&target)?;
            let staged = stage_copy(&source, parent, ctx)?;
            place(staged.path(), &target, overwrite)?;
            Ok(target)
        })();
        m.finish(result)
    }

    /// Move `source` to the full path `destination`, falling back to copy+delete across devices
    pub fn move_to(
        &self,
        source: &Path,
        destination: &Path,
        policy: OnConflict,
        ctx: &TaskContext,
    ) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("move", source);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            ctx.checkpoint()?;
            let source = self.locate(source)?;
            let destination = self.confine(destination)?;
            if source == destination {
                return Err(MutationError::DestinationExists(destination));
            }
            check_not_recursive(&source, &destination)?;

            let _guard = self.locks.lock(&[&source, &destination]);
            let (target, overwrite) = self.target_for(&destination, policy)?;

            m.advance(MutationStage::Executing);
            relocate(&source, &target, overwrite, ctx)?;
            Ok(target)
        })();
        m.finish(result)
    }

    /// Give `source` a new name in the same directory
    pub fn rename(&self, source: &Path, new_name: &str, policy: OnConflict) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("rename", source);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            is_valid_filename(new_name)?;
            let source = self.locate(source)?;
            let destination = parent_of(&source)?.join(new_name);
            if source == destination {
                return Ok(destination);
            }

            let _guard = self.locks.lock(&[&source, &destination]);
            let (target, overwrite) = self.target_for(&destination, policy)?;

            m.advance(MutationStage::Executing);
            if overwrite {
                place(&source, &target, true)?;
            } else {
                fs::rename(&source, &target).map_err(|e| MutationError::from_io(&source, e))?;
            }
            Ok(target)
        })();
        m.finish(result)
    }

    /// Remove a file, symlink or whole directory tree
    pub fn delete(&self, path: &Path, ctx: &TaskContext) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("delete", path);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            ctx.checkpoint()?;
            let path = self.locate(path)?;

            let _guard = self.locks.lock(&[&path]);
            m.advance(MutationStage::Executing);

            // Disappear atomically first, then reclaim the space
            let trash = staging_path(parent_of(&path)?);
            fs::rename(&path, &trash).map_err(|e| MutationError::from_io(&path, e))?;
            if let Err(e) = remove_any(&trash) {
                if fs::symlink_metadata(&trash).is_ok() {
                    let _ = fs::rename(&trash, &path);
                }
                return Err(MutationError::from_io(&path, e));
            }
            Ok(path)
        })();
        m.finish(result)
    }

    /// `parent/name` as a new empty directory
    pub fn create_directory(&self, parent: &Path, name: &str) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("create_directory", parent);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            is_valid_filename(name)?;
            let path = self.confine(&parent.join(name))?;
            let _guard = self.locks.lock(&[&path]);

            m.advance(MutationStage::Executing);
            fs::create_dir(&path).map_err(|e| MutationError::from_io(&path, e))?;
            Ok(path)
        })();
        m.finish(result)
    }

    /// `parent/name` as a new empty file; never truncates an existing one
    pub fn create_file(&self, parent: &Path, name: &str) -> Result<PathBuf, MutationError> {
        let mut m = Mutation::begin("create_file", parent);
        let result = (|| -> Result<PathBuf, MutationError> {
            m.advance(MutationStage::Validating);
            is_valid_filename(name)?;
            let path = self.confine(&parent.join(name))?;
            let _guard = self.locks.lock(&[&path]);

            m.advance(MutationStage::Executing);
            File::create_new(&path).map_err(|e| MutationError::from_io(&path, e))?;
            Ok(path)
        })();
        m.finish(result)
    }

    pub fn delete_all(&self, paths: &[PathBuf], ctx: &TaskContext) -> Vec<Result<PathBuf, MutationError>> {
        self.batch("delete", paths, ctx, |path| self.delete(path, ctx))
    }

    /// Copy each source into `directory`, keeping its name
    pub fn copy_into(
        &self,
        sources: &[PathBuf],
        directory: &Path,
        policy: OnConflict,
        ctx: &TaskContext,
    ) -> Vec<Result<PathBuf, MutationError>> {
        self.batch("copy", sources, ctx, |source| {
            let destination = self.destination_in(source, directory)?;
            self.copy(source, &destination, policy, ctx)
        })
    }

    /// Move each source into `directory`, keeping its name
    pub fn move_into(
        &self,
        sources: &[PathBuf],
        directory: &Path,
        policy: OnConflict,
        ctx: &TaskContext,
    ) -> Vec<Result<PathBuf, MutationError>> {
        self.batch("move", sources, ctx, |source| {
            let destination = self.destination_in(source, directory)?;
            self.move_to(source, &destination, policy, ctx)
        })
    }

    fn destination_in(&self, source: &Path, directory: &Path) -> Result<PathBuf, MutationError> {
        let directory = self.root.check(directory)?;
        if !directory.is_dir() {
            return Err(PathError::NotADirectory(directory).into());
        }
        let name = source
            .file_name()
            .ok_or_else(|| MutationError::InvalidName(source.display().to_string()))?;
        Ok(directory.join(name))
    }

    /// One outcome per input; a failure never stops the remaining items
    fn batch<F>(
        &self,
        op: &'static str,
        items: &[PathBuf],
        ctx: &TaskContext,
        mut each: F,
    ) -> Vec<Result<PathBuf, MutationError>>
    where
        F: FnMut(&Path) -> Result<PathBuf, MutationError>,
    {
        let total = items.len();
        ctx.send(ProgressEvent::Preparing(format!("{} {} items", op, total)));
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.iter().enumerate() {
            let label = item.display().to_string();
            let result = if ctx.is_cancelled() {
                Err(MutationError::Cancelled)
            } else {
                ctx.send(ProgressEvent::ItemStarted(label.clone()));
                each(item)
            };
            match &result {
                Ok(_) => ctx.send(ProgressEvent::ItemCompleted(label)),
                Err(e) => ctx.send(ProgressEvent::ItemFailed(label, e.to_string())),
            }
            results.push(result);
            ctx.set_progress((index + 1) as f64 / total as f64);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(op, total, failed, "batch finished");
        results
    }
}

fn parent_of(path: &Path) -> Result<&Path, MutationError> {
    path.parent().ok_or_else(|| PathError::OutsideSandbox(path.to_path_buf()).into())
}

/// A directory may not be copied or moved into itself
fn check_not_recursive(source: &Path, destination: &Path) -> Result<(), MutationError> {
    let is_dir = fs::symlink_metadata(source).map(|m| m.is_dir()).unwrap_or(false);
    if is_dir && destination.starts_with(source) && destination != source {
        return Err(MutationError::RecursiveOperation(source.to_path_buf()));
    }
    Ok(())
}

fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}{:016x}", STAGING_PREFIX, rand::random::<u64>()))
}

/// Staged copy that removes itself unless it was renamed into place
struct Staged {
    path: PathBuf,
}

impl Staged {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if fs::symlink_metadata(&self.path).is_ok() {
            if let Err(e) = remove_any(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to clean up staging copy");
            }
        }
    }
}

fn stage_copy(source: &Path, dir: &Path, ctx: &TaskContext) -> Result<Staged, MutationError> {
    let staged = Staged { path: staging_path(dir) };
    copy_entry(source, staged.path(), ctx)?;
    Ok(staged)
}

/// Recursive copy that preserves symlinks and permission bits
fn copy_entry(source: &Path, dest: &Path, ctx: &TaskContext) -> Result<(), MutationError> {
    ctx.checkpoint()?;
    let meta = fs::symlink_metadata(source).map_err(|e| MutationError::from_io(source, e))?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(source).map_err(|e| MutationError::from_io(source, e))?;
        make_symlink(&target, dest).map_err(|e| MutationError::from_io(dest, e))?;
    } else if file_type.is_dir() {
        fs::create_dir(dest).map_err(|e| MutationError::from_io(dest, e))?;
        let mut children: Vec<_> = fs::read_dir(source)
            .map_err(|e| MutationError::from_io(source, e))?
            .filter_map(|e| e.ok())
            .collect();
        children.sort_by_key(|e| e.file_name());
        for child in children {
            copy_entry(&child.path(), &dest.join(child.file_name()), ctx)?;
        }
        fs::set_permissions(dest, meta.permissions()).map_err(|e| MutationError::from_io(dest, e))?;
    } else {
        let mut reader = File::open(source).map_err(|e| MutationError::from_io(source, e))?;
        let mut writer = File::create_new(dest).map_err(|e| MutationError::from_io(dest, e))?;
        io::copy(&mut reader, &mut writer).map_err(|e| MutationError::from_io(dest, e))?;
        writer.sync_all().map_err(|e| MutationError::from_io(dest, e))?;
        fs::set_permissions(dest, meta.permissions()).map_err(|e| MutationError::from_io(dest, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported on this platform"))
}

fn remove_any(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Rename `staged` onto `target`; with `overwrite` the old target is swapped out first
fn place(staged: &Path, target: &Path, overwrite: bool) -> Result<(), MutationError> {
    if !overwrite || fs::symlink_metadata(target).is_err() {
        return fs::rename(staged, target).map_err(|e| MutationError::from_io(target, e));
    }

    let trash = staging_path(parent_of(target)?);
    fs::rename(target, &trash).map_err(|e| MutationError::from_io(target, e))?;
    if let Err(e) = fs::rename(staged, target) {
        let _ = fs::rename(&trash, target);
        return Err(MutationError::from_io(target, e));
    }
    if let Err(e) = remove_any(&trash) {
        warn!(path = %trash.display(), error = %e, "failed to remove replaced entry");
    }
    Ok(())
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

fn relocate(source: &Path, target: &Path, overwrite: bool, ctx: &TaskContext) -> Result<(), MutationError> {
    let err = match place(source, target, overwrite) {
        Ok(()) => return Ok(()),
        Err(MutationError::Io { source: e, .. }) if is_cross_device(&e) => e,
        Err(other) => return Err(other),
    };
    debug!(source = %source.display(), target = %target.display(), error = %err, "cross-device move, copying");

    let staged = stage_copy(source, parent_of(target)?, ctx)?;
    place(staged.path(), target, overwrite)?;
    if let Err(e) = remove_any(source) {
        // Undo so the move is all-or-nothing
        let _ = remove_any(target);
        return Err(MutationError::from_io(source, e));
    }
    Ok(())
}
