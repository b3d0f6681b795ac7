use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::archive::{compress_paths, ArchiveReader, BundleInfo, ExtractSummary};
use crate::config::Settings;
use crate::crypto::CipherBox;
use crate::error::{Error, MutationError, PathError, Result};
use crate::fs::{
    disk_usage, BatchResult, ConflictDecision, ConflictResolver, DirectoryHandle, DirectoryLister, DiskUsage, Entry,
    FileMutator, OnConflict, PathCatalog, PathLocks, SandboxRoot, SelectionBatch, SortKey,
};
use crate::inspect::{ByteInspector, ByteWindow};
use crate::task::{TaskHandle, TaskRunner};

/// A single change to the sandbox, run through `FileRepository::mutate`.
///
/// Relative paths are taken relative to the current directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Copy { source: PathBuf, destination: PathBuf, policy: OnConflict },
    Move { source: PathBuf, destination: PathBuf, policy: OnConflict },
    Rename { source: PathBuf, new_name: String, policy: OnConflict },
    Delete { path: PathBuf },
    CreateDirectory { parent: PathBuf, name: String },
    CreateFile { parent: PathBuf, name: String },
}

impl MutationOp {
    fn label(&self) -> String {
        match self {
            MutationOp::Copy { source, .. } => format!("copy {}", source.display()),
            MutationOp::Move { source, .. } => format!("move {}", source.display()),
            MutationOp::Rename { source, new_name, .. } => format!("rename {} -> {}", source.display(), new_name),
            MutationOp::Delete { path } => format!("delete {}", path.display()),
            MutationOp::CreateDirectory { name, .. } => format!("mkdir {}", name),
            MutationOp::CreateFile { name, .. } => format!("touch {}", name),
        }
    }
}

/// Everything a front end needs: navigation on the caller's thread, all
/// filesystem and crypto work on the task runner.
pub struct FileRepository {
    settings: Settings,
    catalog: PathCatalog,
    lister: DirectoryLister,
    resolver: ConflictResolver,
    mutator: FileMutator,
    archives: ArchiveReader,
    cipher: CipherBox,
    locks: Arc<PathLocks>,
    runner: TaskRunner,
}

impl FileRepository {
    /// Open (creating if needed) the sandbox named by `settings`
    pub fn open(settings: Settings) -> Result<Self> {
        let root_path = settings.sandbox_root_path().ok_or_else(|| PathError::InvalidRoot {
            path: PathBuf::new(),
            reason: "cannot determine a documents directory".to_string(),
        })?;
        let root = SandboxRoot::create(&root_path)?;
        Self::with_root(root, settings)
    }

    pub fn with_root(root: SandboxRoot, settings: Settings) -> Result<Self> {
        let settings = settings.validated();
        let locks = PathLocks::new();
        let resolver = ConflictResolver::new(settings.suffix_style());
        let runner = TaskRunner::new(settings.worker_threads)?;
        info!(root = %root.path().display(), workers = settings.worker_threads, "repository opened");

        Ok(Self {
            catalog: PathCatalog::new(root.clone()),
            lister: DirectoryLister::new(settings.search_chunk_size),
            mutator: FileMutator::new(root, Arc::clone(&locks), resolver.clone()),
            archives: ArchiveReader::new(Arc::clone(&locks)).with_nested_depth(settings.nested_archive_depth),
            cipher: CipherBox::with_iterations(settings.kdf_iterations),
            resolver,
            locks,
            runner,
            settings,
        })
    }

    /// Replace the conflict resolver used by every operation
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.mutator = FileMutator::new(self.root().clone(), Arc::clone(&self.locks), resolver.clone());
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> &SandboxRoot {
        self.catalog.root()
    }

    pub fn catalog(&self) -> &PathCatalog {
        &self.catalog
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    // === Navigation (synchronous, no I/O beyond stat) ===

    pub fn resolve(&self, relative: &str) -> std::result::Result<PathBuf, PathError> {
        self.catalog.resolve(relative)
    }

    pub fn current_directory(&self) -> &Path {
        self.catalog.current_directory()
    }

    pub fn navigate(&mut self, entry: &Entry) -> std::result::Result<PathBuf, PathError> {
        self.catalog.navigate(entry)
    }

    pub fn navigate_to(&mut self, relative: &str) -> std::result::Result<PathBuf, PathError> {
        self.catalog.navigate_to(relative)
    }

    pub fn navigate_to_parent(&mut self) -> PathBuf {
        self.catalog.navigate_to_parent()
    }

    pub fn disk_usage(&self) -> Option<DiskUsage> {
        disk_usage(self.current_directory())
    }

    fn scope(&self) -> Scope {
        Scope {
            root: self.root().clone(),
            current: self.current_directory().to_path_buf(),
        }
    }

    // === Background operations ===

    /// List the current directory; `None` uses the configured sort key
    pub fn list_directory(&self, sort_key: Option<SortKey>, search: Option<String>) -> TaskHandle<Vec<Entry>, Error> {
        let scope = self.scope();
        let lister = self.lister.clone();
        let sort_key = sort_key.unwrap_or_else(|| self.settings.sort_key());
        self.runner.spawn("list directory", move |ctx| {
            ctx.checkpoint()?;
            let handle = DirectoryHandle::open(&scope.root, &scope.current)?;
            lister.list(&handle, sort_key, search.as_deref())
        })
    }

    /// Files in the current directory whose contents contain `needle`
    pub fn search_contents(&self, needle: Vec<u8>, sort_key: Option<SortKey>) -> TaskHandle<Vec<Entry>, Error> {
        let scope = self.scope();
        let lister = self.lister.clone();
        let sort_key = sort_key.unwrap_or_else(|| self.settings.sort_key());
        self.runner.spawn("search contents", move |ctx| {
            ctx.checkpoint()?;
            let handle = DirectoryHandle::open(&scope.root, &scope.current)?;
            lister.search_contents(&handle, &needle, sort_key, ctx)
        })
    }

    pub fn mutate(&self, op: MutationOp) -> TaskHandle<PathBuf, Error> {
        let scope = self.scope();
        let mutator = self.mutator.clone();
        self.runner.spawn(op.label(), move |ctx| {
            let result = match op {
                MutationOp::Copy { source, destination, policy } => {
                    mutator.copy(&scope.anchor(&source), &scope.anchor(&destination), policy, ctx)
                }
                MutationOp::Move { source, destination, policy } => {
                    mutator.move_to(&scope.anchor(&source), &scope.anchor(&destination), policy, ctx)
                }
                MutationOp::Rename { source, new_name, policy } => {
                    mutator.rename(&scope.anchor(&source), &new_name, policy)
                }
                MutationOp::Delete { path } => mutator.delete(&scope.anchor(&path), ctx),
                MutationOp::CreateDirectory { parent, name } => mutator.create_directory(&scope.anchor(&parent), &name),
                MutationOp::CreateFile { parent, name } => mutator.create_file(&scope.anchor(&parent), &name),
            };
            Ok(result?)
        })
    }

    /// Selections hold absolute paths (see `SelectionBatch::add_entry`)
    pub fn commit_batch(&self, batch: SelectionBatch) -> TaskHandle<BatchResult, Error> {
        let mutator = self.mutator.clone();
        let label = format!("{} {} items", batch.action().name(), batch.len());
        self.runner.spawn(label, move |ctx| Ok(batch.commit(&mutator, ctx)))
    }

    /// Extract into `destination`, or a fresh `<stem>` directory next to the archive
    pub fn extract_archive(&self, archive: PathBuf, destination: Option<PathBuf>) -> TaskHandle<ExtractSummary, Error> {
        let scope = self.scope();
        let archives = self.archives.clone();
        let resolver = self.resolver.clone();
        self.runner.spawn(format!("extract {}", archive.display()), move |ctx| {
            let archive = scope.check(&archive)?;
            let destination = match destination {
                Some(d) => scope.check(&d)?,
                None => free_target(&resolver, &stem_directory(&archive)?, OnConflict::AutoRename)?,
            };
            Ok(archives.extract_nested(&archive, &destination, ctx)?)
        })
    }

    pub fn extract_bundle(
        &self,
        archive: PathBuf,
        destination: Option<PathBuf>,
    ) -> TaskHandle<(ExtractSummary, BundleInfo), Error> {
        let scope = self.scope();
        let archives = self.archives.clone();
        let resolver = self.resolver.clone();
        self.runner.spawn(format!("extract bundle {}", archive.display()), move |ctx| {
            let archive = scope.check(&archive)?;
            let destination = match destination {
                Some(d) => scope.check(&d)?,
                None => free_target(&resolver, &stem_directory(&archive)?, OnConflict::AutoRename)?,
            };
            Ok(archives.extract_bundle(&archive, &destination, ctx)?)
        })
    }

    /// Zip `sources` into `destination`, auto-renaming if it exists
    pub fn compress(&self, sources: Vec<PathBuf>, destination: PathBuf) -> TaskHandle<PathBuf, Error> {
        let scope = self.scope();
        let resolver = self.resolver.clone();
        let locks = Arc::clone(&self.locks);
        self.runner.spawn(format!("compress {}", destination.display()), move |ctx| {
            let sources = sources
                .iter()
                .map(|s| scope.check(s))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let wanted = scope.check(&destination)?;
            let target = free_target(&resolver, &wanted, OnConflict::AutoRename)?;
            let _guard = locks.lock(&[&target]);
            Ok(compress_paths(&sources, &target, ctx)?)
        })
    }

    /// Bring an outside file into the current directory.
    ///
    /// `.zip` and `.ipa` files are extracted into a directory named after the
    /// archive; anything else is copied in.
    pub fn import(&self, source: PathBuf, policy: OnConflict) -> TaskHandle<PathBuf, Error> {
        let scope = self.scope();
        let archives = self.archives.clone();
        let resolver = self.resolver.clone();
        let locks = Arc::clone(&self.locks);
        self.runner.spawn(format!("import {}", source.display()), move |ctx| {
            ctx.checkpoint()?;
            let name = source
                .file_name()
                .ok_or_else(|| MutationError::InvalidName(source.display().to_string()))?;

            if is_archive_file(&source) {
                let wanted = stem_directory(&scope.current.join(name))?;
                let target = free_target(&resolver, &wanted, policy)?;
                archives.extract_nested(&source, &target, ctx)?;
                info!(source = %source.display(), target = %target.display(), "imported archive");
                return Ok(target);
            }

            let wanted = scope.current.join(name);
            let target = free_target(&resolver, &wanted, policy)?;
            let _guard = locks.lock(&[&target]);
            copy_in(&source, &target, policy == OnConflict::Overwrite)?;
            info!(source = %source.display(), target = %target.display(), "imported file");
            Ok(target)
        })
    }

    /// Returns the number of plaintext bytes read from `source`
    pub fn encrypt_file(&self, source: PathBuf, destination: PathBuf, password: String) -> TaskHandle<u64, Error> {
        let scope = self.scope();
        let cipher = self.cipher.clone();
        let locks = Arc::clone(&self.locks);
        self.runner.spawn(format!("encrypt {}", source.display()), move |ctx| {
            let (source, destination) = scope.check_pair(&source, &destination)?;
            let _guard = locks.lock(&[&source, &destination]);
            Ok(cipher.encrypt_file(&source, &destination, &password, ctx)?)
        })
    }

    /// Returns the number of plaintext bytes written
    pub fn decrypt_file(&self, source: PathBuf, destination: PathBuf, password: String) -> TaskHandle<u64, Error> {
        let scope = self.scope();
        let cipher = self.cipher.clone();
        let locks = Arc::clone(&self.locks);
        self.runner.spawn(format!("decrypt {}", source.display()), move |ctx| {
            let (source, destination) = scope.check_pair(&source, &destination)?;
            let _guard = locks.lock(&[&source, &destination]);
            Ok(cipher.decrypt_file(&source, &destination, &password, ctx)?)
        })
    }

    /// One hex-view row; `width` defaults to the configured row width
    pub fn read_byte_row(&self, file: PathBuf, offset: u64, width: Option<usize>) -> TaskHandle<ByteWindow, Error> {
        let scope = self.scope();
        let width = width.unwrap_or(self.settings.hex_row_width);
        self.runner.spawn(format!("read {}", file.display()), move |ctx| {
            ctx.checkpoint()?;
            let inspector = ByteInspector::open(scope.check(&file)?)?;
            Ok(inspector.read_row(offset, width)?)
        })
    }

    pub fn search_bytes(&self, file: PathBuf, pattern: Vec<u8>, from: u64) -> TaskHandle<Option<u64>, Error> {
        let scope = self.scope();
        let chunk_size = self.settings.search_chunk_size;
        self.runner.spawn(format!("search {}", file.display()), move |ctx| {
            let inspector = ByteInspector::open(scope.check(&file)?)?.with_chunk_size(chunk_size);
            Ok(inspector.search_with(&pattern, from, ctx)?)
        })
    }

    /// Overwrite bytes in place; the file never changes length
    pub fn write_bytes(&self, file: PathBuf, offset: u64, bytes: Vec<u8>) -> TaskHandle<(), Error> {
        let scope = self.scope();
        let locks = Arc::clone(&self.locks);
        self.runner.spawn(format!("write {}", file.display()), move |ctx| {
            ctx.checkpoint()?;
            let path = scope.check(&file)?;
            let _guard = locks.lock(&[&path]);
            Ok(ByteInspector::open(&path)?.write_row(offset, &bytes)?)
        })
    }
}

/// Snapshot of where the caller stood when a task was submitted
struct Scope {
    root: SandboxRoot,
    current: PathBuf,
}

impl Scope {
    fn anchor(&self, input: &Path) -> PathBuf {
        if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.current.join(input)
        }
    }

    fn check(&self, input: &Path) -> std::result::Result<PathBuf, PathError> {
        self.root.check(&self.anchor(input))
    }

    /// Source must exist, destination must not
    fn check_pair(&self, source: &Path, destination: &Path) -> Result<(PathBuf, PathBuf)> {
        let source = self.check(source)?;
        if !source.is_file() {
            return Err(MutationError::NotFound(source).into());
        }
        let destination = self.check(destination)?;
        if destination.exists() {
            return Err(MutationError::DestinationExists(destination).into());
        }
        Ok((source, destination))
    }
}

fn is_archive_file(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_lowercase();
            e == "zip" || e == "ipa"
        })
        .unwrap_or(false)
}

/// "dir/App.ipa" -> "dir/App"
fn stem_directory(archive: &Path) -> std::result::Result<PathBuf, MutationError> {
    let stem = archive
        .file_stem()
        .ok_or_else(|| MutationError::InvalidName(archive.display().to_string()))?;
    Ok(archive.with_file_name(stem))
}

fn free_target(
    resolver: &ConflictResolver,
    wanted: &Path,
    policy: OnConflict,
) -> std::result::Result<PathBuf, MutationError> {
    match resolver.decide(wanted, policy) {
        ConflictDecision::Abort => Err(MutationError::DestinationExists(wanted.to_path_buf())),
        decision => Ok(decision.target(wanted).unwrap_or_else(|| wanted.to_path_buf())),
    }
}

/// Copy an outside file through a staging file in the target directory
fn copy_in(source: &Path, target: &Path, overwrite: bool) -> std::result::Result<(), MutationError> {
    if source.is_dir() {
        return Err(MutationError::Io {
            path: source.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "directories cannot be imported"),
        });
    }
    let parent = target
        .parent()
        .ok_or_else(|| MutationError::InvalidName(target.display().to_string()))?;
    let mut reader = File::open(source).map_err(|e| MutationError::from_io(source, e))?;
    let mut staged = tempfile::Builder::new()
        .prefix(".filevault.")
        .tempfile_in(parent)
        .map_err(|e| MutationError::from_io(parent, e))?;
    io::copy(&mut reader, staged.as_file_mut()).map_err(|e| MutationError::from_io(target, e))?;
    staged.as_file().sync_all().map_err(|e| MutationError::from_io(target, e))?;

    let persisted = if overwrite {
        staged.persist(target)
    } else {
        staged.persist_noclobber(target)
    };
    persisted.map_err(|e| MutationError::from_io(target, e.error))?;
    Ok(())
}
