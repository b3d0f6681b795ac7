use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::MutationError;
use crate::fs::conflict::OnConflict;
use crate::fs::listing::Entry;
use crate::fs::mutator::FileMutator;
use crate::task::{ProgressEvent, TaskContext};

/// What to do with every selected entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    Delete,
    /// Into this directory, auto-renaming on conflict
    Move(PathBuf),
    /// Into this directory, auto-renaming on conflict
    Copy(PathBuf),
    /// Resolve the paths so they can be handed to the outside world
    Share,
}

impl BatchAction {
    pub fn name(&self) -> &'static str {
        match self {
            BatchAction::Delete => "delete",
            BatchAction::Move(_) => "move",
            BatchAction::Copy(_) => "copy",
            BatchAction::Share => "share",
        }
    }
}

/// Marked entries plus the action pending on them.
///
/// Keeps the order in which entries were marked; marking twice is a no-op.
#[derive(Debug, Clone)]
pub struct SelectionBatch {
    action: BatchAction,
    order: Vec<PathBuf>,
    marked: HashSet<PathBuf>,
}

impl SelectionBatch {
    pub fn new(action: BatchAction) -> Self {
        Self {
            action,
            order: Vec::new(),
            marked: HashSet::new(),
        }
    }

    pub fn action(&self) -> &BatchAction {
        &self.action
    }

    pub fn set_action(&mut self, action: BatchAction) {
        self.action = action;
    }

    /// Returns false if the path was already selected
    pub fn add(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if !self.marked.insert(path.clone()) {
            return false;
        }
        self.order.push(path);
        true
    }

    /// Select a listed entry of `directory`
    pub fn add_entry(&mut self, directory: &Path, entry: &Entry) -> bool {
        self.add(directory.join(&entry.name))
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        if !self.marked.remove(path) {
            return false;
        }
        self.order.retain(|p| p != path);
        true
    }

    /// Flip selection state; returns whether the path is now selected
    pub fn toggle(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.remove(&path) {
            false
        } else {
            self.add(path)
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.marked.contains(path)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.order
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.marked.clear();
    }

    /// Run the pending action over every selected path, one outcome per path
    pub fn commit(&self, mutator: &FileMutator, ctx: &TaskContext) -> BatchResult {
        let outcomes = match &self.action {
            BatchAction::Delete => mutator.delete_all(&self.order, ctx),
            BatchAction::Move(target) => mutator.move_into(&self.order, target, OnConflict::AutoRename, ctx),
            BatchAction::Copy(target) => mutator.copy_into(&self.order, target, OnConflict::AutoRename, ctx),
            BatchAction::Share => self.share(mutator, ctx),
        };

        let result = BatchResult {
            action: self.action.clone(),
            items: self.order.iter().cloned().zip(outcomes).collect(),
        };
        info!(
            action = self.action.name(),
            total = result.len(),
            failed = result.failed().len(),
            "selection committed"
        );
        result
    }

    fn share(&self, mutator: &FileMutator, ctx: &TaskContext) -> Vec<Result<PathBuf, MutationError>> {
        self.order
            .iter()
            .map(|path| {
                ctx.checkpoint()?;
                let resolved = mutator.locate(path)?;
                ctx.send(ProgressEvent::ItemCompleted(resolved.display().to_string()));
                Ok(resolved)
            })
            .collect()
    }
}

/// Per-item outcomes of a committed selection, in selection order
#[derive(Debug)]
pub struct BatchResult {
    pub action: BatchAction,
    pub items: Vec<(PathBuf, Result<PathBuf, MutationError>)>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resulting paths of the items that went through
    pub fn succeeded(&self) -> Vec<&Path> {
        self.items
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().map(PathBuf::as_path))
            .collect()
    }

    pub fn failed(&self) -> Vec<(&Path, &MutationError)> {
        self.items
            .iter()
            .filter_map(|(p, r)| r.as_ref().err().map(|e| (p.as_path(), e)))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|(_, r)| r.is_ok())
    }

    pub fn summary(&self) -> String {
        let failed = self.failed().len();
        match failed {
            0 => format!("{} items done", self.items.len()),
            1 => "1 item failed".to_string(),
            n => format!("{} items failed", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::catalog::SandboxRoot;
    use crate::fs::conflict::ConflictResolver;
    use crate::fs::locks::PathLocks;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileMutator, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp.path()).unwrap();
        let base = root.path().to_path_buf();
        let mutator = FileMutator::new(root, PathLocks::new(), ConflictResolver::default());
        (temp, mutator, base)
    }

    #[test]
    fn test_selection_keeps_order_and_dedupes() {
        let mut batch = SelectionBatch::new(BatchAction::Delete);
        assert!(batch.add("/b"));
        assert!(batch.add("/a"));
        assert!(!batch.add("/b"));
        assert_eq!(batch.paths(), &[PathBuf::from("/b"), PathBuf::from("/a")]);

        assert!(!batch.toggle("/b"));
        assert!(batch.toggle("/c"));
        assert_eq!(batch.paths(), &[PathBuf::from("/a"), PathBuf::from("/c")]);
        assert!(batch.contains(Path::new("/c")));

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_delete_batch_reports_partial_failure() {
        let (_temp, mutator, base) = setup();
        fs::write(base.join("a"), "a").unwrap();
        fs::write(base.join("b"), "b").unwrap();

        let mut batch = SelectionBatch::new(BatchAction::Delete);
        batch.add(base.join("a"));
        batch.add(base.join("gone"));
        batch.add(base.join("b"));

        let result = batch.commit(&mutator, &TaskContext::detached());
        assert_eq!(result.len(), 3);
        assert_eq!(result.succeeded().len(), 2);
        let failed = result.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, base.join("gone"));
        assert!(matches!(failed[0].1, MutationError::NotFound(_)));
        assert_eq!(result.summary(), "1 item failed");
    }

    #[test]
    fn test_move_batch_into_directory() {
        let (_temp, mutator, base) = setup();
        fs::create_dir(base.join("box")).unwrap();
        fs::write(base.join("one.txt"), "1").unwrap();
        fs::write(base.join("two.txt"), "2").unwrap();

        let mut batch = SelectionBatch::new(BatchAction::Move(base.join("box")));
        batch.add(base.join("one.txt"));
        batch.add(base.join("two.txt"));

        let result = batch.commit(&mutator, &TaskContext::detached());
        assert!(result.all_succeeded());
        assert_eq!(result.summary(), "2 items done");
        assert!(base.join("box/one.txt").exists());
        assert!(base.join("box/two.txt").exists());
        assert!(!base.join("one.txt").exists());
    }

    #[test]
    fn test_copy_batch_auto_renames() {
        let (_temp, mutator, base) = setup();
        fs::create_dir(base.join("box")).unwrap();
        fs::write(base.join("box/one.txt"), "old").unwrap();
        fs::write(base.join("one.txt"), "new").unwrap();

        let mut batch = SelectionBatch::new(BatchAction::Copy(base.join("box")));
        batch.add(base.join("one.txt"));
        let result = batch.commit(&mutator, &TaskContext::detached());

        let copied = result.succeeded()[0].to_path_buf();
        assert_ne!(copied, base.join("box/one.txt"));
        assert_eq!(fs::read_to_string(base.join("box/one.txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(copied).unwrap(), "new");
        assert!(base.join("one.txt").exists());
    }

    #[test]
    fn test_share_resolves_existing_paths() {
        let (_temp, mutator, base) = setup();
        fs::write(base.join("photo.jpg"), "jpg").unwrap();

        let mut batch = SelectionBatch::new(BatchAction::Share);
        batch.add(base.join("photo.jpg"));
        batch.add(base.join("nope.jpg"));
        let result = batch.commit(&mutator, &TaskContext::detached());

        assert_eq!(result.succeeded(), vec![base.join("photo.jpg").as_path()]);
        assert_eq!(result.summary(), "1 item failed");
        assert!(base.join("photo.jpg").exists());
    }
}
