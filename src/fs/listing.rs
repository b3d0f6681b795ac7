use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Cancelled, Error, InspectError};
use crate::fs::catalog::DirectoryHandle;
use crate::inspect::ByteInspector;
use crate::task::{ProgressEvent, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One row of a directory listing. Built fresh on every `list` call.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: DateTime<Local>,
    /// rwxrwxrwx on unix, empty elsewhere
    pub permissions: String,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    Date,
    Size,
}

/// Parse sort key string from settings
pub fn parse_sort_key(s: &str) -> SortKey {
    match s.to_lowercase().as_str() {
        "size" => SortKey::Size,
        "modified" | "date" => SortKey::Date,
        _ => SortKey::Name,
    }
}

/// Convert SortKey to its settings string
pub fn sort_key_to_string(key: SortKey) -> String {
    match key {
        SortKey::Name => "name".to_string(),
        SortKey::Date => "date".to_string(),
        SortKey::Size => "size".to_string(),
    }
}

/// Total order used for every listing: directories first, then the key
/// (name ascending, date/size descending), ties by case-insensitive name.
pub fn compare_entries(a: &Entry, b: &Entry, key: SortKey) -> Ordering {
    if a.is_directory() && !b.is_directory() {
        return Ordering::Less;
    }
    if !a.is_directory() && b.is_directory() {
        return Ordering::Greater;
    }

    let by_name = || {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    };

    match key {
        SortKey::Name => by_name(),
        SortKey::Date => b.modified_at.cmp(&a.modified_at).then_with(by_name),
        SortKey::Size => b.size.cmp(&a.size).then_with(by_name),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone)]
pub struct DirectoryLister {
    search_chunk_size: usize,
}

impl Default for DirectoryLister {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl DirectoryLister {
    pub fn new(search_chunk_size: usize) -> Self {
        Self { search_chunk_size }
    }

    /// Enumerate, filter by case-insensitive name substring, and sort.
    ///
    /// Dot-files are hidden. Entries that vanish between enumeration and stat
    /// are skipped instead of failing the listing.
    pub fn list(
        &self,
        directory: &DirectoryHandle,
        sort_key: SortKey,
        search_text: Option<&str>,
    ) -> Result<Vec<Entry>, Error> {
        directory.revalidate()?;

        let needle = search_text
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let entries: Vec<_> = fs::read_dir(directory.path())?.filter_map(|e| e.ok()).collect();
        let mut items: Vec<Entry> = Vec::with_capacity(entries.len());

        items.extend(entries.into_iter().filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            if let Some(ref needle) = needle {
                if !name.to_lowercase().contains(needle.as_str()) {
                    return None;
                }
            }
            // follows symlinks; a dangling link or a vanished entry is skipped
            let metadata = fs::metadata(entry.path()).ok()?;
            Some(entry_from_metadata(name, &metadata))
        }));

        items.sort_by(|a, b| compare_entries(a, b, sort_key));
        debug!(dir = %directory.path().display(), count = items.len(), "listed directory");
        Ok(items)
    }

    /// Content search: files whose bytes contain `needle`, in listing order.
    ///
    /// Unreadable files are reported as `ItemFailed` and left out; cancellation
    /// is checked between files and between chunks of each file.
    pub fn search_contents(
        &self,
        directory: &DirectoryHandle,
        needle: &[u8],
        sort_key: SortKey,
        ctx: &TaskContext,
    ) -> Result<Vec<Entry>, Error> {
        let all = self.list(directory, sort_key, None)?;
        let mut matches = Vec::new();
        for entry in all.into_iter().filter(|e| e.kind == EntryKind::File) {
            ctx.checkpoint()?;
            let path = directory.path().join(&entry.name);
            // FIFOs and devices would block or never end
            if !fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
                continue;
            }
            let found = ByteInspector::open(&path)
                .map(|inspector| inspector.with_chunk_size(self.search_chunk_size))
                .and_then(|inspector| inspector.search_with(needle, 0, ctx));
            match found {
                Ok(Some(_)) => matches.push(entry),
                Ok(None) => {}
                Err(InspectError::Cancelled) => return Err(Cancelled.into()),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "content search skipped file");
                    ctx.send(ProgressEvent::ItemFailed(entry.name.clone(), e.to_string()));
                }
            }
        }
        debug!(dir = %directory.path().display(), count = matches.len(), "content search finished");
        Ok(matches)
    }
}

fn entry_from_metadata(name: String, metadata: &fs::Metadata) -> Entry {
    let is_directory = metadata.is_dir();
    let size = if is_directory { 0 } else { metadata.len() };
    let modified_at = metadata
        .modified()
        .ok()
        .map(DateTime::<Local>::from)
        .unwrap_or_else(Local::now);

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        crate::utils::format::format_permissions_short(metadata.permissions().mode())
    };
    #[cfg(not(unix))]
    let permissions = String::new();

    Entry {
        name,
        kind: if is_directory { EntryKind::Directory } else { EntryKind::File },
        size,
        modified_at,
        permissions,
    }
}

/// Total and available bytes of the filesystem holding `path`
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;

        let c_path = CString::new(path.to_str()?).ok()?;
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        // SAFETY: statvfs is a standard POSIX function, c_path is valid
        let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if result == 0 {
            // SAFETY: statvfs succeeded, stat is initialized
            let stat = unsafe { stat.assume_init() };
            return Some(DiskUsage {
                total: stat.f_blocks as u64 * stat.f_frsize as u64,
                available: stat.f_bavail as u64 * stat.f_frsize as u64,
            });
        }
        None
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::catalog::SandboxRoot;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn handle(temp: &TempDir) -> DirectoryHandle {
        let root = SandboxRoot::new(temp.path()).unwrap();
        DirectoryHandle::open(&root, root.path()).unwrap()
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago)).unwrap();
    }

    #[test]
    fn test_name_sort_dirs_first_case_insensitive() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("beta.txt"), "b").unwrap();
        fs::write(temp.path().join("Alpha.txt"), "a").unwrap();
        fs::create_dir(temp.path().join("zdir")).unwrap();
        fs::create_dir(temp.path().join("Adir")).unwrap();

        let lister = DirectoryLister::default();
        let entries = lister.list(&handle(&temp), SortKey::Name, None).unwrap();
        assert_eq!(names(&entries), vec!["Adir", "zdir", "Alpha.txt", "beta.txt"]);
    }

    #[test]
    fn test_listing_is_stable() {
        let temp = TempDir::new().unwrap();
        for name in ["c", "B", "a", "b"] {
            fs::write(temp.path().join(name), name).unwrap();
        }
        let lister = DirectoryLister::default();
        let h = handle(&temp);
        let first = names(&lister.list(&h, SortKey::Name, None).unwrap())
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        for _ in 0..5 {
            let again = lister.list(&h, SortKey::Name, None).unwrap();
            assert_eq!(names(&again), first);
        }
        assert_eq!(first, vec!["a", "B", "b", "c"]);
    }

    #[test]
    fn test_hidden_files_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".hidden"), "x").unwrap();
        fs::write(temp.path().join("shown"), "x").unwrap();
        let entries = DirectoryLister::default().list(&handle(&temp), SortKey::Name, None).unwrap();
        assert_eq!(names(&entries), vec!["shown"]);
    }

    #[test]
    fn test_search_text_filters_case_insensitively() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("Report.PDF"), "x").unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();
        fs::create_dir(temp.path().join("reports")).unwrap();
        let entries = DirectoryLister::default()
            .list(&handle(&temp), SortKey::Name, Some("rEpOrT"))
            .unwrap();
        assert_eq!(names(&entries), vec!["reports", "Report.PDF"]);
    }

    #[test]
    fn test_size_sort_descending() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("small"), vec![0u8; 10]).unwrap();
        fs::write(temp.path().join("large"), vec![0u8; 1000]).unwrap();
        fs::write(temp.path().join("mid"), vec![0u8; 100]).unwrap();
        fs::create_dir(temp.path().join("dir")).unwrap();
        let entries = DirectoryLister::default().list(&handle(&temp), SortKey::Size, None).unwrap();
        assert_eq!(names(&entries), vec!["dir", "large", "mid", "small"]);
    }

    #[test]
    fn test_date_sort_most_recent_first() {
        let temp = TempDir::new().unwrap();
        for (name, age) in [("old", 3000), ("new", 10), ("middle", 600)] {
            let p = temp.path().join(name);
            fs::write(&p, "x").unwrap();
            set_mtime(&p, age);
        }
        let entries = DirectoryLister::default().list(&handle(&temp), SortKey::Date, None).unwrap();
        assert_eq!(names(&entries), vec!["new", "middle", "old"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("real"), "x").unwrap();
        std::os::unix::fs::symlink(temp.path().join("gone"), temp.path().join("link")).unwrap();
        let entries = DirectoryLister::default().list(&handle(&temp), SortKey::Name, None).unwrap();
        assert_eq!(names(&entries), vec!["real"]);
    }

    #[test]
    fn test_list_vanished_directory_fails() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("d")).unwrap();
        let root = SandboxRoot::new(temp.path()).unwrap();
        let h = DirectoryHandle::open(&root, &root.path().join("d")).unwrap();
        fs::remove_dir(temp.path().join("d")).unwrap();
        assert!(DirectoryLister::default().list(&h, SortKey::Name, None).is_err());
    }

    #[test]
    fn test_search_contents() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "nothing here").unwrap();
        fs::write(temp.path().join("b.txt"), "the needle is here").unwrap();
        fs::create_dir(temp.path().join("needle_dir")).unwrap();
        let entries = DirectoryLister::new(4)
            .search_contents(&handle(&temp), b"needle", SortKey::Name, &TaskContext::detached())
            .unwrap();
        assert_eq!(names(&entries), vec!["b.txt"]);
    }

    #[test]
    fn test_search_contents_stops_when_cancelled() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "the needle").unwrap();
        let ctx = TaskContext::detached();
        ctx.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);

        let err = DirectoryLister::new(4)
            .search_contents(&handle(&temp), b"needle", SortKey::Name, &ctx)
            .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn test_search_contents_skips_fifos() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "the needle").unwrap();
        let fifo = std::ffi::CString::new(temp.path().join("pipe").to_string_lossy().as_bytes()).unwrap();
        #[allow(unsafe_code)]
        // SAFETY: fifo is a valid NUL-terminated path
        let rc = unsafe { libc::mkfifo(fifo.as_ptr(), 0o644) };
        assert_eq!(rc, 0);

        let entries = DirectoryLister::new(4)
            .search_contents(&handle(&temp), b"needle", SortKey::Name, &TaskContext::detached())
            .unwrap();
        assert_eq!(names(&entries), vec!["a.txt"]);
    }

    #[test]
    fn test_parse_sort_key() {
        assert_eq!(parse_sort_key("SIZE"), SortKey::Size);
        assert_eq!(parse_sort_key("modified"), SortKey::Date);
        assert_eq!(parse_sort_key("whatever"), SortKey::Name);
        assert_eq!(sort_key_to_string(SortKey::Date), "date");
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_usage() {
        let temp = TempDir::new().unwrap();
        let usage = disk_usage(temp.path()).unwrap();
        assert!(usage.total >= usage.available);
    }
}
