use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{Local, NaiveDateTime, TimeZone};
use flate2::read::DeflateDecoder;
use flate2::Crc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::format::*;
use crate::error::ArchiveError;
use crate::fs::PathLocks;
use crate::task::{ProgressEvent, TaskContext};

const COPY_BUF_SIZE: usize = 64 * 1024;
/// Symlink targets are read into memory; anything longer is not a link
const MAX_LINK_TARGET: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveEntryKind {
    File,
    Directory,
    Symlink,
}

/// One central-directory record, path already sanitized
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    /// Relative, `/`-separated, no `.`/`..`, no trailing slash
    pub path: String,
    pub kind: ArchiveEntryKind,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub method: u16,
    pub flags: u16,
    pub local_header_offset: u64,
    pub modified: Option<NaiveDateTime>,
    pub unix_mode: Option<u32>,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == ArchiveEntryKind::Directory
    }

    pub fn relative_path(&self) -> PathBuf {
        self.path.split('/').collect()
    }

    fn check_supported(&self) -> Result<(), ArchiveError> {
        if self.flags & FLAG_ENCRYPTED != 0 {
            return Err(ArchiveError::Unsupported {
                entry: self.path.clone(),
                reason: "encrypted entry".to_string(),
            });
        }
        if self.method != METHOD_STORED && self.method != METHOD_DEFLATED {
            return Err(ArchiveError::Unsupported {
                entry: self.path.clone(),
                reason: format!("compression method {}", self.method),
            });
        }
        Ok(())
    }
}

/// Map a raw entry name to a safe relative path.
///
/// `Ok(None)` for names that reduce to nothing (`./`).
pub fn sanitize_entry_name(raw: &str) -> Result<Option<String>, ArchiveError> {
    let unified = raw.replace('\\', "/");
    let bytes = unified.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic();
    if unified.starts_with('/') || has_drive || unified.contains('\0') {
        return Err(ArchiveError::UnsafePath(raw.to_string()));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(ArchiveError::UnsafePath(raw.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

/// An open ZIP file with its parsed central directory
pub struct ZipArchive {
    path: PathBuf,
    file: File,
    len: u64,
    entries: Vec<ArchiveEntry>,
}

struct EndRecord {
    entries: u64,
    central_size: u64,
    central_offset: u64,
}

impl ZipArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();

        let end = read_end_record(&mut file, len).ok_or_else(|| ArchiveError::NotAnArchive(path.clone()))?;
        let entries = read_central_directory(&mut file, len, &end).map_err(|e| match e {
            ArchiveError::Corrupt(msg) => ArchiveError::Corrupt(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;

        debug!(archive = %path.display(), entries = entries.len(), "opened zip archive");
        Ok(Self { path, file, len, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn total_uncompressed(&self) -> u64 {
        self.entries.iter().map(|e| e.uncompressed_size).sum()
    }

    pub fn find(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    /// Whole entry in memory, CRC-checked; for small metadata files
    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>, ArchiveError> {
        let entry = self
            .entries
            .get(index)
            .cloned()
            .ok_or_else(|| ArchiveError::Corrupt(format!("no entry #{}", index)))?;
        entry.check_supported()?;

        let mut out = Vec::with_capacity(entry.uncompressed_size.min(16 * 1024 * 1024) as usize);
        let ctx = TaskContext::detached();
        copy_verified(&mut self.entry_reader(&entry)?, &mut out, &entry, &ctx)?;
        Ok(out)
    }

    /// Decompressing reader over an entry's data (no CRC check)
    fn entry_reader(&mut self, entry: &ArchiveEntry) -> Result<Box<dyn Read + '_>, ArchiveError> {
        let corrupt = || ArchiveError::Corrupt(entry.path.clone());

        let mut header = [0u8; LOCAL_HEADER_LEN];
        self.file.seek(SeekFrom::Start(entry.local_header_offset))?;
        self.file.read_exact(&mut header).map_err(|_| corrupt())?;
        if read_u32_le(&header, 0) != Some(LOCAL_HEADER_SIG) {
            return Err(corrupt());
        }
        let name_len = u64::from(read_u16_le(&header, 26).ok_or_else(corrupt)?);
        let extra_len = u64::from(read_u16_le(&header, 28).ok_or_else(corrupt)?);

        let data_start = entry.local_header_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
        let data_end = data_start.checked_add(entry.compressed_size).ok_or_else(corrupt)?;
        if data_end > self.len {
            return Err(corrupt());
        }

        self.file.seek(SeekFrom::Start(data_start))?;
        let raw = (&mut self.file).take(entry.compressed_size);
        Ok(match entry.method {
            METHOD_DEFLATED => Box::new(DeflateDecoder::new(raw)),
            _ => Box::new(raw),
        })
    }
}

fn read_end_record(file: &mut File, len: u64) -> Option<EndRecord> {
    if len < EOCD_LEN as u64 {
        return None;
    }
    let tail_len = len.min((EOCD_LEN + MAX_COMMENT_LEN) as u64);
    let tail_start = len - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    file.seek(SeekFrom::Start(tail_start)).ok()?;
    file.read_exact(&mut tail).ok()?;

    // Scan backwards; the comment must end exactly at EOF
    let mut pos = tail.len() - EOCD_LEN;
    let eocd = loop {
        if read_u32_le(&tail, pos) == Some(EOCD_SIG) {
            let comment_len = usize::from(read_u16_le(&tail, pos + 20)?);
            if pos + EOCD_LEN + comment_len == tail.len() {
                break pos;
            }
        }
        if pos == 0 {
            return None;
        }
        pos -= 1;
    };

    let entries = u64::from(read_u16_le(&tail, eocd + 10)?);
    let central_size = u64::from(read_u32_le(&tail, eocd + 12)?);
    let central_offset = u64::from(read_u32_le(&tail, eocd + 16)?);
    let classic = EndRecord { entries, central_size, central_offset };

    let saturated = entries == u64::from(u16::MAX)
        || central_size == u64::from(u32::MAX)
        || central_offset == u64::from(u32::MAX);
    let eocd_abs = tail_start + eocd as u64;
    if !saturated || eocd_abs < ZIP64_LOCATOR_LEN as u64 {
        return Some(classic);
    }

    read_zip64_end_record(file, eocd_abs).or(Some(classic))
}

fn read_zip64_end_record(file: &mut File, eocd_abs: u64) -> Option<EndRecord> {
    let mut locator = [0u8; ZIP64_LOCATOR_LEN];
    file.seek(SeekFrom::Start(eocd_abs - ZIP64_LOCATOR_LEN as u64)).ok()?;
    file.read_exact(&mut locator).ok()?;
    if read_u32_le(&locator, 0)? != ZIP64_LOCATOR_SIG {
        return None;
    }
    let record_offset = read_u64_le(&locator, 8)?;

    let mut record = [0u8; ZIP64_EOCD_LEN];
    file.seek(SeekFrom::Start(record_offset)).ok()?;
    file.read_exact(&mut record).ok()?;
    if read_u32_le(&record, 0)? != ZIP64_EOCD_SIG {
        return None;
    }
    Some(EndRecord {
        entries: read_u64_le(&record, 32)?,
        central_size: read_u64_le(&record, 40)?,
        central_offset: read_u64_le(&record, 48)?,
    })
}

fn read_central_directory(file: &mut File, len: u64, end: &EndRecord) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let central_end = end
        .central_offset
        .checked_add(end.central_size)
        .ok_or_else(|| ArchiveError::Corrupt("central directory out of range".to_string()))?;
    if central_end > len {
        return Err(ArchiveError::Corrupt("central directory out of range".to_string()));
    }
    // Every record is at least 46 bytes
    if end.entries > end.central_size / CENTRAL_HEADER_LEN as u64 + 1 {
        return Err(ArchiveError::Corrupt("entry count exceeds central directory".to_string()));
    }

    let mut raw = vec![0u8; end.central_size as usize];
    file.seek(SeekFrom::Start(end.central_offset))?;
    file.read_exact(&mut raw)?;

    let mut entries = Vec::with_capacity(end.entries as usize);
    let mut cursor = 0usize;
    for index in 0..end.entries {
        let (entry, next) = parse_central_record(&raw, cursor)
            .ok_or_else(|| ArchiveError::Corrupt(format!("bad central directory record #{}", index)))?;
        cursor = next;

        let Some(path) = sanitize_entry_name(&entry.raw_name)? else {
            continue;
        };
        if entry.local_header_offset >= len {
            return Err(ArchiveError::Corrupt(path));
        }
        entries.push(ArchiveEntry {
            kind: entry.kind(),
            path,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            crc32: entry.crc32,
            method: entry.method,
            flags: entry.flags,
            local_header_offset: entry.local_header_offset,
            modified: from_dos_datetime(entry.dos_date, entry.dos_time),
            unix_mode: entry.unix_mode(),
        });
    }
    Ok(entries)
}

struct RawCentralRecord {
    raw_name: String,
    version_made_by: u16,
    flags: u16,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    external_attrs: u32,
    local_header_offset: u64,
}

impl RawCentralRecord {
    fn host(&self) -> u8 {
        (self.version_made_by >> 8) as u8
    }

    fn unix_mode(&self) -> Option<u32> {
        let mode = self.external_attrs >> 16;
        (self.host() == HOST_UNIX && mode != 0).then_some(mode)
    }

    fn kind(&self) -> ArchiveEntryKind {
        if self.raw_name.ends_with('/') || self.raw_name.ends_with('\\') {
            return ArchiveEntryKind::Directory;
        }
        match self.unix_mode().map(|m| m & S_IFMT) {
            Some(S_IFLNK) => ArchiveEntryKind::Symlink,
            Some(S_IFDIR) => ArchiveEntryKind::Directory,
            _ if self.host() == HOST_DOS && self.external_attrs & DOS_DIRECTORY_ATTR != 0 => {
                ArchiveEntryKind::Directory
            }
            _ => ArchiveEntryKind::File,
        }
    }
}

fn parse_central_record(raw: &[u8], at: usize) -> Option<(RawCentralRecord, usize)> {
    if read_u32_le(raw, at)? != CENTRAL_HEADER_SIG {
        return None;
    }
    let version_made_by = read_u16_le(raw, at + 4)?;
    let flags = read_u16_le(raw, at + 8)?;
    let method = read_u16_le(raw, at + 10)?;
    let dos_time = read_u16_le(raw, at + 12)?;
    let dos_date = read_u16_le(raw, at + 14)?;
    let crc32 = read_u32_le(raw, at + 16)?;
    let compressed_u32 = read_u32_le(raw, at + 20)?;
    let uncompressed_u32 = read_u32_le(raw, at + 24)?;
    let name_len = usize::from(read_u16_le(raw, at + 28)?);
    let extra_len = usize::from(read_u16_le(raw, at + 30)?);
    let comment_len = usize::from(read_u16_le(raw, at + 32)?);
    let external_attrs = read_u32_le(raw, at + 38)?;
    let offset_u32 = read_u32_le(raw, at + 42)?;

    let name_start = at + CENTRAL_HEADER_LEN;
    let extra_start = name_start + name_len;
    let next = extra_start + extra_len + comment_len;
    let name = raw.get(name_start..extra_start)?;
    let extra = raw.get(extra_start..extra_start + extra_len)?;
    if next > raw.len() {
        return None;
    }

    let mut record = RawCentralRecord {
        raw_name: String::from_utf8_lossy(name).into_owned(),
        version_made_by,
        flags,
        method,
        dos_time,
        dos_date,
        crc32,
        compressed_size: u64::from(compressed_u32),
        uncompressed_size: u64::from(uncompressed_u32),
        external_attrs,
        local_header_offset: u64::from(offset_u32),
    };
    apply_zip64_extra(&mut record, extra, uncompressed_u32, compressed_u32, offset_u32)?;
    Some((record, next))
}

/// Saturated 32-bit fields are replaced, in order, by the 0x0001 extra field
fn apply_zip64_extra(
    record: &mut RawCentralRecord,
    extra: &[u8],
    uncompressed_u32: u32,
    compressed_u32: u32,
    offset_u32: u32,
) -> Option<()> {
    let needs = [uncompressed_u32, compressed_u32, offset_u32]
        .iter()
        .any(|&v| v == u32::MAX);
    if !needs {
        return Some(());
    }

    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let id = read_u16_le(extra, pos)?;
        let size = usize::from(read_u16_le(extra, pos + 2)?);
        let body = extra.get(pos + 4..pos + 4 + size)?;
        if id == ZIP64_EXTRA_ID {
            let mut field = 0usize;
            if uncompressed_u32 == u32::MAX {
                record.uncompressed_size = read_u64_le(body, field)?;
                field += 8;
            }
            if compressed_u32 == u32::MAX {
                record.compressed_size = read_u64_le(body, field)?;
                field += 8;
            }
            if offset_u32 == u32::MAX {
                record.local_header_offset = read_u64_le(body, field)?;
            }
            return Some(());
        }
        pos += 4 + size;
    }
    // Saturated without the extra field: take the values at face value
    Some(())
}

/// Copy `reader` into `out`, then check size and CRC against the entry
fn copy_verified(reader: &mut dyn Read, out: &mut dyn Write, entry: &ArchiveEntry, ctx: &TaskContext) -> Result<u64, ArchiveError> {
    let mut crc = Crc::new();
    let mut written = 0u64;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        ctx.checkpoint()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_corrupt_stream(&e) => return Err(ArchiveError::Corrupt(entry.path.clone())),
            Err(e) => return Err(ArchiveError::Io(e)),
        };
        written += n as u64;
        if written > entry.uncompressed_size {
            return Err(ArchiveError::Corrupt(entry.path.clone()));
        }
        crc.update(&buf[..n]);
        out.write_all(&buf[..n])?;
    }

    if written != entry.uncompressed_size || crc.sum() != entry.crc32 {
        return Err(ArchiveError::Corrupt(entry.path.clone()));
    }
    Ok(written)
}

fn is_corrupt_stream(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
    )
}

/// What one extraction produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractSummary {
    pub destination: PathBuf,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub bytes: u64,
    /// Entries deliberately not materialized (e.g. escaping symlinks)
    pub skipped: Vec<String>,
    /// Destinations of archives found inside and extracted too
    pub nested: Vec<PathBuf>,
}

/// Extracts ZIP containers into a destination it holds exclusively
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    locks: Arc<PathLocks>,
    nested_depth: usize,
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new(PathLocks::new())
    }
}

impl ArchiveReader {
    pub fn new(locks: Arc<PathLocks>) -> Self {
        Self { locks, nested_depth: 1 }
    }

    pub fn with_nested_depth(mut self, depth: usize) -> Self {
        self.nested_depth = depth;
        self
    }

    pub fn nested_depth(&self) -> usize {
        self.nested_depth
    }

    pub fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(ZipArchive::open(archive)?.entries().to_vec())
    }

    /// Extract every entry under `destination`.
    ///
    /// Fails with `Busy` if another operation holds the destination. Entries
    /// are validated before anything is written; each file is verified before
    /// it appears under its final name.
    pub fn extract(&self, archive: &Path, destination: &Path, ctx: &TaskContext) -> Result<ExtractSummary, ArchiveError> {
        let _guard = self
            .locks
            .try_lock(&[destination])
            .ok_or_else(|| ArchiveError::Busy(destination.to_path_buf()))?;
        let mut zip = ZipArchive::open(archive)?;
        extract_into(&mut zip, destination, ctx)
    }

    /// `extract`, then extract `.zip`/`.ipa` files found in the result into
    /// sibling directories named after their stem, `nested_depth` levels deep
    pub fn extract_nested(&self, archive: &Path, destination: &Path, ctx: &TaskContext) -> Result<ExtractSummary, ArchiveError> {
        let _guard = self
            .locks
            .try_lock(&[destination])
            .ok_or_else(|| ArchiveError::Busy(destination.to_path_buf()))?;
        let mut zip = ZipArchive::open(archive)?;
        let mut summary = extract_into(&mut zip, destination, ctx)?;

        let mut frontier = vec![destination.to_path_buf()];
        for level in 0..self.nested_depth {
            let mut next = Vec::new();
            for dir in &frontier {
                for inner in find_archives(dir)? {
                    ctx.checkpoint()?;
                    let target = nested_target(&inner);
                    if target.exists() {
                        warn!(archive = %inner.display(), "nested target exists, skipping");
                        summary.skipped.push(inner.display().to_string());
                        continue;
                    }
                    debug!(archive = %inner.display(), level, "extracting nested archive");
                    let mut inner_zip = match ZipArchive::open(&inner) {
                        Ok(z) => z,
                        Err(ArchiveError::NotAnArchive(_)) => {
                            summary.skipped.push(inner.display().to_string());
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let inner_summary = extract_into(&mut inner_zip, &target, ctx)?;
                    summary.files += inner_summary.files;
                    summary.directories += inner_summary.directories;
                    summary.symlinks += inner_summary.symlinks;
                    summary.bytes += inner_summary.bytes;
                    summary.skipped.extend(inner_summary.skipped);
                    summary.nested.push(target.clone());
                    next.push(target);
                }
            }
            frontier = next;
        }
        Ok(summary)
    }
}

fn is_archive_name(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_lowercase();
            e == "zip" || e == "ipa"
        })
        .unwrap_or(false)
}

fn find_archives(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)?.filter_map(|e| e.ok()) {
            let Ok(file_type) = entry.file_type() else { continue };
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() && is_archive_name(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// "a/b/inner.zip" -> "a/b/inner"
fn nested_target(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    archive.with_file_name(stem)
}

fn extract_into(zip: &mut ZipArchive, destination: &Path, ctx: &TaskContext) -> Result<ExtractSummary, ArchiveError> {
    let entries = zip.entries().to_vec();
    for entry in &entries {
        entry.check_supported()?;
    }

    let total = zip.total_uncompressed();
    info!(archive = %zip.path().display(), dest = %destination.display(), entries = entries.len(), "extracting");
    ctx.send(ProgressEvent::Preparing(format!("{} entries", entries.len())));
    fs::create_dir_all(destination)?;

    let mut summary = ExtractSummary { destination: destination.to_path_buf(), ..Default::default() };
    let mut done = 0u64;

    for entry in &entries {
        ctx.checkpoint()?;
        ctx.send(ProgressEvent::ItemStarted(entry.path.clone()));
        let target = destination.join(entry.relative_path());

        let walk_last = entry.kind == ArchiveEntryKind::Directory;
        let result = refuse_symlink_ancestors(destination, entry, walk_last).and_then(|()| match entry.kind {
            ArchiveEntryKind::Directory => {
                fs::create_dir_all(&target).map_err(ArchiveError::from).map(|_| {
                    summary.directories += 1;
                })
            }
            ArchiveEntryKind::File => extract_file(zip, entry, &target, ctx).map(|bytes| {
                summary.files += 1;
                summary.bytes += bytes;
            }),
            ArchiveEntryKind::Symlink => extract_symlink(zip, entry, &target, destination).map(|created| {
                if created {
                    summary.symlinks += 1;
                } else {
                    summary.skipped.push(entry.path.clone());
                }
            }),
        });

        if let Err(e) = result {
            warn!(entry = %entry.path, error = %e, "extraction failed");
            ctx.send(ProgressEvent::ItemFailed(entry.path.clone(), e.to_string()));
            return Err(e);
        }

        done += entry.uncompressed_size;
        ctx.send(ProgressEvent::ItemCompleted(entry.path.clone()));
        ctx.report_bytes(done, total);
    }

    info!(dest = %destination.display(), files = summary.files, dirs = summary.directories, "extraction finished");
    Ok(summary)
}

fn extract_file(zip: &mut ZipArchive, entry: &ArchiveEntry, target: &Path, ctx: &TaskContext) -> Result<u64, ArchiveError> {
    let parent = target
        .parent()
        .ok_or_else(|| ArchiveError::UnsafePath(entry.path.clone()))?;
    fs::create_dir_all(parent)?;

    // Verified bytes only ever reach the final name
    let mut tmp = tempfile::Builder::new()
        .prefix(".filevault.")
        .suffix(".part")
        .tempfile_in(parent)?;
    let written = {
        let mut reader = zip.entry_reader(entry)?;
        let mut out = io::BufWriter::new(tmp.as_file_mut());
        let written = copy_verified(&mut reader, &mut out, entry, ctx)?;
        out.flush()?;
        written
    };

    if let Some(modified) = entry.modified.and_then(|ts| Local.from_local_datetime(&ts).single()) {
        let _ = tmp.as_file().set_modified(SystemTime::from(modified));
    }
    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode {
        use std::os::unix::fs::PermissionsExt;
        let _ = tmp.as_file().set_permissions(fs::Permissions::from_mode(mode & 0o777));
    }

    tmp.persist(target).map_err(|e| ArchiveError::Io(e.error))?;
    Ok(written)
}

/// Returns false when the link would point outside `destination`
fn extract_symlink(zip: &mut ZipArchive, entry: &ArchiveEntry, target: &Path, destination: &Path) -> Result<bool, ArchiveError> {
    if entry.uncompressed_size > MAX_LINK_TARGET {
        return Err(ArchiveError::Corrupt(entry.path.clone()));
    }
    let mut raw = Vec::new();
    copy_verified(&mut zip.entry_reader(entry)?, &mut raw, entry, &TaskContext::detached())?;
    let link = String::from_utf8_lossy(&raw).into_owned();

    let parent = target
        .parent()
        .ok_or_else(|| ArchiveError::UnsafePath(entry.path.clone()))?;
    if !link_stays_inside(parent, &link, destination) {
        warn!(entry = %entry.path, link = %link, "symlink escapes destination, skipped");
        return Ok(false);
    }
    fs::create_dir_all(parent)?;

    #[cfg(unix)]
    {
        if fs::symlink_metadata(target).is_ok() {
            fs::remove_file(target)?;
        }
        std::os::unix::fs::symlink(&link, target)?;
        Ok(true)
    }
    #[cfg(not(unix))]
    {
        warn!(entry = %entry.path, "symlinks unsupported on this platform, skipped");
        Ok(false)
    }
}

/// Entries are never written through a symlink materialized earlier in the
/// same extraction; the walk stops at the first component not on disk yet.
fn refuse_symlink_ancestors(destination: &Path, entry: &ArchiveEntry, walk_last: bool) -> Result<(), ArchiveError> {
    let relative = entry.relative_path();
    let mut components: Vec<_> = relative.components().collect();
    if !walk_last {
        components.pop();
    }
    let mut current = destination.to_path_buf();
    for component in components {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(entry = %entry.path, through = %current.display(), "entry path passes through a symlink");
                return Err(ArchiveError::UnsafePath(entry.path.clone()));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Resolves `link` from `link_parent` without following anything: a target
/// that walks through an existing symlink is treated as escaping.
fn link_stays_inside(link_parent: &Path, link: &str, destination: &Path) -> bool {
    let link_path = Path::new(link);
    if link.is_empty() || link_path.is_absolute() {
        return false;
    }
    let mut resolved = link_parent.to_path_buf();
    for component in link_path.components() {
        match component {
            Component::Normal(name) => {
                resolved.push(name);
                if fs::symlink_metadata(&resolved).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    resolved.starts_with(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::{CompressionMethod, ZipWriter};
    use tempfile::TempDir;

    fn build_zip(path: &Path, method: CompressionMethod) {
        let mut writer = ZipWriter::create(path).unwrap().compression(method);
        writer.add_directory("dir", None).unwrap();
        writer.add_bytes("dir/one.txt", b"first file contents").unwrap();
        writer.add_bytes("dir/two.txt", b"second file, a little longer").unwrap();
        writer.add_bytes("top.bin", &[0u8, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_sanitize_entry_name() {
        assert_eq!(sanitize_entry_name("a/b.txt").unwrap(), Some("a/b.txt".to_string()));
        assert_eq!(sanitize_entry_name("./a//b/").unwrap(), Some("a/b".to_string()));
        assert_eq!(sanitize_entry_name("a\\b").unwrap(), Some("a/b".to_string()));
        assert_eq!(sanitize_entry_name("./").unwrap(), None);
        for bad in ["../x", "a/../../x", "/etc/passwd", "C:/x", "a/.."] {
            assert!(matches!(sanitize_entry_name(bad), Err(ArchiveError::UnsafePath(_))), "{bad}");
        }
    }

    #[test]
    fn test_extract_all_entries() {
        for method in [CompressionMethod::Stored, CompressionMethod::Deflated] {
            let temp = TempDir::new().unwrap();
            let zip_path = temp.path().join("a.zip");
            build_zip(&zip_path, method);
            let dest = temp.path().join("out");

            let summary = ArchiveReader::default()
                .extract(&zip_path, &dest, &TaskContext::detached())
                .unwrap();
            assert_eq!(summary.files, 3);
            assert_eq!(summary.directories, 1);
            assert_eq!(fs::read(dest.join("dir/one.txt")).unwrap(), b"first file contents");
            assert_eq!(fs::read(dest.join("top.bin")).unwrap(), vec![0u8, 1, 2, 3, 4, 5, 6, 7]);

            // CRC of every extracted file matches the central directory
            let archive = ZipArchive::open(&zip_path).unwrap();
            for entry in archive.entries().iter().filter(|e| !e.is_dir()) {
                let bytes = fs::read(dest.join(entry.relative_path())).unwrap();
                let mut crc = Crc::new();
                crc.update(&bytes);
                assert_eq!(crc.sum(), entry.crc32);
            }
        }
    }

    /// Flip one payload byte of "dir/two.txt"
    fn corrupt_second_file(zip_path: &Path, method: CompressionMethod) -> ArchiveEntry {
        build_zip(zip_path, method);
        let archive = ZipArchive::open(zip_path).unwrap();
        let victim = archive.entries()[2].clone();
        assert_eq!(victim.path, "dir/two.txt");
        drop(archive);

        let mut bytes = fs::read(zip_path).unwrap();
        let data_start = victim.local_header_offset as usize + LOCAL_HEADER_LEN + victim.path.len();
        bytes[data_start + victim.compressed_size as usize / 2] ^= 0xFF;
        fs::write(zip_path, &bytes).unwrap();
        victim
    }

    #[test]
    fn test_corrupted_deflated_entry_is_reported_and_not_materialized() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("a.zip");
        let victim = corrupt_second_file(&zip_path, CompressionMethod::Deflated);
        assert_eq!(victim.method, METHOD_DEFLATED);

        let dest = temp.path().join("out");
        let err = ArchiveReader::default()
            .extract(&zip_path, &dest, &TaskContext::detached())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt(ref p) if p == "dir/two.txt"), "{err:?}");
        assert!(dest.join("dir/one.txt").exists());
        assert!(!dest.join("dir/two.txt").exists());
        let leftovers: Vec<_> = fs::read_dir(dest.join("dir")).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_corrupted_entry_is_reported_and_not_materialized() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("a.zip");
        corrupt_second_file(&zip_path, CompressionMethod::Stored);

        let dest = temp.path().join("out");
        let err = ArchiveReader::default()
            .extract(&zip_path, &dest, &TaskContext::detached())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt(ref p) if p == "dir/two.txt"), "{err:?}");
        assert!(dest.join("dir/one.txt").exists());
        assert!(!dest.join("dir/two.txt").exists());
        let leftovers: Vec<_> = fs::read_dir(dest.join("dir")).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_not_an_archive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.txt");
        fs::write(&path, "definitely not a zip file, just text").unwrap();
        assert!(matches!(ZipArchive::open(&path), Err(ArchiveError::NotAnArchive(_))));
        fs::write(&path, "PK").unwrap();
        assert!(matches!(ZipArchive::open(&path), Err(ArchiveError::NotAnArchive(_))));
    }

    #[test]
    fn test_busy_destination() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("a.zip");
        build_zip(&zip_path, CompressionMethod::Deflated);
        let dest = temp.path().join("out");

        let locks = PathLocks::new();
        let reader = ArchiveReader::new(Arc::clone(&locks));
        let _held = locks.lock(&[dest.as_path()]);
        let err = reader.extract(&zip_path, &dest, &TaskContext::detached()).unwrap_err();
        assert!(matches!(err, ArchiveError::Busy(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_cancel_between_entries() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("a.zip");
        build_zip(&zip_path, CompressionMethod::Deflated);
        let ctx = TaskContext::detached();
        ctx.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);

        let err = ArchiveReader::default()
            .extract(&zip_path, &temp.path().join("out"), &ctx)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }

    #[test]
    fn test_nested_archives() {
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("inner.zip");
        let mut writer = ZipWriter::create(&inner).unwrap();
        writer.add_bytes("deep.txt", b"deep").unwrap();
        writer.finish().unwrap();

        let outer = temp.path().join("outer.zip");
        let mut writer = ZipWriter::create(&outer).unwrap();
        writer.add_file(&inner, "pkg/inner.zip").unwrap();
        writer.finish().unwrap();

        let dest = temp.path().join("out");
        let summary = ArchiveReader::default()
            .extract_nested(&outer, &dest, &TaskContext::detached())
            .unwrap();
        assert_eq!(summary.nested, vec![dest.join("pkg/inner")]);
        assert_eq!(fs::read(dest.join("pkg/inner/deep.txt")).unwrap(), b"deep");

        let flat = temp.path().join("flat");
        ArchiveReader::default()
            .with_nested_depth(0)
            .extract_nested(&outer, &flat, &TaskContext::detached())
            .unwrap();
        assert!(!flat.join("pkg/inner").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_entries() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("links.zip");
        let mut writer = ZipWriter::create(&zip_path).unwrap();
        writer.add_bytes("data/real.txt", b"real").unwrap();
        writer.add_symlink("data/ok", "real.txt").unwrap();
        writer.add_symlink("data/escape", "../../outside").unwrap();
        writer.finish().unwrap();

        let dest = temp.path().join("out");
        let summary = ArchiveReader::default()
            .extract(&zip_path, &dest, &TaskContext::detached())
            .unwrap();
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.skipped, vec!["data/escape".to_string()]);
        assert_eq!(fs::read(dest.join("data/ok")).unwrap(), b"real");
        assert!(fs::symlink_metadata(dest.join("data/escape")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_chained_symlinks_cannot_escape() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("chain.zip");
        let mut writer = ZipWriter::create(&zip_path).unwrap();
        writer.add_directory("a", None).unwrap();
        writer.add_symlink("a/up", "..").unwrap();
        writer.add_symlink("esc", "a/up/..").unwrap();
        writer.add_bytes("esc/pwned.txt", b"outside?").unwrap();
        writer.finish().unwrap();

        let boxed = temp.path().join("box");
        let dest = boxed.join("out");
        let summary = ArchiveReader::default()
            .extract(&zip_path, &dest, &TaskContext::detached())
            .unwrap();

        assert_eq!(summary.skipped, vec!["esc".to_string()]);
        assert!(!boxed.join("pwned.txt").exists());
        assert!(!temp.path().join("pwned.txt").exists());
        assert!(fs::symlink_metadata(dest.join("esc")).unwrap().is_dir());
        assert_eq!(fs::read(dest.join("esc/pwned.txt")).unwrap(), b"outside?");
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_through_extracted_symlink_is_rejected() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("through.zip");
        let mut writer = ZipWriter::create(&zip_path).unwrap();
        writer.add_directory("real", None).unwrap();
        writer.add_symlink("alias", "real").unwrap();
        writer.add_bytes("alias/file.txt", b"via link").unwrap();
        writer.finish().unwrap();

        let dest = temp.path().join("out");
        let err = ArchiveReader::default()
            .extract(&zip_path, &dest, &TaskContext::detached())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(ref p) if p == "alias/file.txt"), "{err:?}");
        assert!(!dest.join("real/file.txt").exists());
    }

    #[test]
    fn test_progress_events() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("a.zip");
        build_zip(&zip_path, CompressionMethod::Deflated);
        let ctx = TaskContext::detached();
        ArchiveReader::default()
            .extract(&zip_path, &temp.path().join("out"), &ctx)
            .unwrap();
        assert_eq!(ctx.progress(), 1.0);
    }
}
