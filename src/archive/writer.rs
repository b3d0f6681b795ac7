use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::archive::format::*;
use crate::error::ArchiveError;
use crate::task::{ProgressEvent, TaskContext};

const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    Stored,
    #[default]
    Deflated,
}

#[derive(Debug, Clone)]
struct CentralRecord {
    name: String,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    external_attrs: u32,
    local_header_offset: u32,
}

/// Streaming ZIP writer (no Zip64).
///
/// Each entry's local header is written with placeholder CRC and sizes and
/// patched after the data is streamed. The archive is assembled in a temp
/// file beside `dest` and only renamed into place by `finish`.
pub struct ZipWriter {
    dest: PathBuf,
    tmp: NamedTempFile,
    out: BufWriter<File>,
    offset: u64,
    records: Vec<CentralRecord>,
    method: CompressionMethod,
}

impl ZipWriter {
    pub fn create(dest: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let dest = dest.as_ref().to_path_buf();
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".filevault.")
            .suffix(".zip.tmp")
            .tempfile_in(parent)?;
        let out = BufWriter::new(tmp.as_file().try_clone()?);
        Ok(Self {
            dest,
            tmp,
            out,
            offset: 0,
            records: Vec::new(),
            method: CompressionMethod::default(),
        })
    }

    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn entry_count(&self) -> usize {
        self.records.len()
    }

    /// `name` gets a trailing `/` if it lacks one
    pub fn add_directory(&mut self, name: &str, modified: Option<NaiveDateTime>) -> Result<(), ArchiveError> {
        let name = if name.ends_with('/') { name.to_string() } else { format!("{}/", name) };
        let mode = S_IFDIR | 0o755;
        self.write_entry(&name, &mut io::empty(), METHOD_STORED, (mode << 16) | DOS_DIRECTORY_ATTR, modified)
    }

    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
        let method = self.method_for(data.len() as u64);
        let mut reader = data;
        self.write_entry(name, &mut reader, method, (S_IFREG | 0o644) << 16, Some(Local::now().naive_local()))
    }

    pub fn add_file(&mut self, source: &Path, name: &str) -> Result<(), ArchiveError> {
        let metadata = fs::metadata(source)?;
        if metadata.len() >= u64::from(u32::MAX) {
            return Err(ArchiveError::TooLarge(name.to_string()));
        }
        let mode = unix_mode(&metadata).unwrap_or(0o644) & 0o7777;
        let modified = metadata.modified().ok().map(|t| DateTime::<Local>::from(t).naive_local());
        let method = self.method_for(metadata.len());
        let mut file = File::open(source)?;
        self.write_entry(name, &mut file, method, (S_IFREG | mode) << 16, modified)
    }

    /// Link target is stored as the entry data
    pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<(), ArchiveError> {
        let mut reader = target.as_bytes();
        self.write_entry(name, &mut reader, METHOD_STORED, (S_IFLNK | 0o777) << 16, Some(Local::now().naive_local()))
    }

    /// Add a file, symlink, or whole directory tree under `name`
    pub fn add_path(&mut self, source: &Path, name: &str, ctx: &TaskContext) -> Result<(), ArchiveError> {
        ctx.checkpoint()?;
        let metadata = fs::symlink_metadata(source)?;

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(source)?;
            return self.add_symlink(name, &target.to_string_lossy());
        }

        if !metadata.is_dir() {
            if self.is_staging_file(source) {
                return Ok(());
            }
            ctx.send(ProgressEvent::ItemStarted(name.to_string()));
            self.add_file(source, name)?;
            ctx.send(ProgressEvent::ItemCompleted(name.to_string()));
            return Ok(());
        }

        let modified = metadata.modified().ok().map(|t| DateTime::<Local>::from(t).naive_local());
        self.add_directory(name, modified)?;

        let mut children: Vec<_> = fs::read_dir(source)?.filter_map(|e| e.ok()).collect();
        children.sort_by_key(|e| e.file_name());
        for child in children {
            let child_name = format!("{}/{}", name.trim_end_matches('/'), child.file_name().to_string_lossy());
            self.add_path(&child.path(), &child_name, ctx)?;
        }
        Ok(())
    }

    /// Write the central directory and end record, then move the archive into place
    pub fn finish(mut self) -> Result<PathBuf, ArchiveError> {
        let count = self.records.len();
        if count > usize::from(u16::MAX) {
            return Err(ArchiveError::TooLarge(format!("{} entries", count)));
        }

        let central_start = self.offset;
        let records = std::mem::take(&mut self.records);
        for record in &records {
            let mut header = Vec::with_capacity(CENTRAL_HEADER_LEN + record.name.len());
            header.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            header.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
            header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            header.extend_from_slice(&FLAG_UTF8.to_le_bytes());
            header.extend_from_slice(&record.method.to_le_bytes());
            header.extend_from_slice(&record.dos_time.to_le_bytes());
            header.extend_from_slice(&record.dos_date.to_le_bytes());
            header.extend_from_slice(&record.crc32.to_le_bytes());
            header.extend_from_slice(&record.compressed_size.to_le_bytes());
            header.extend_from_slice(&record.uncompressed_size.to_le_bytes());
            header.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            header.extend_from_slice(&0u16.to_le_bytes()); // extra
            header.extend_from_slice(&0u16.to_le_bytes()); // comment
            header.extend_from_slice(&0u16.to_le_bytes()); // disk start
            header.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            header.extend_from_slice(&record.external_attrs.to_le_bytes());
            header.extend_from_slice(&record.local_header_offset.to_le_bytes());
            header.extend_from_slice(record.name.as_bytes());
            self.write_raw(&header)?;
        }

        let central_size = self.offset - central_start;
        if self.offset > u64::from(u32::MAX) {
            return Err(ArchiveError::TooLarge(self.dest.display().to_string()));
        }

        let mut eocd = Vec::with_capacity(EOCD_LEN);
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&(count as u16).to_le_bytes());
        eocd.extend_from_slice(&(count as u16).to_le_bytes());
        eocd.extend_from_slice(&(central_size as u32).to_le_bytes());
        eocd.extend_from_slice(&(central_start as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        self.write_raw(&eocd)?;

        self.out.flush()?;
        self.tmp.as_file().sync_all()?;
        let ZipWriter { dest, tmp, out, .. } = self;
        drop(out);
        tmp.persist(&dest).map_err(|e| ArchiveError::Io(e.error))?;
        debug!(dest = %dest.display(), entries = count, "wrote zip archive");
        Ok(dest)
    }

    fn method_for(&self, len: u64) -> u16 {
        match self.method {
            CompressionMethod::Deflated if len > 0 => METHOD_DEFLATED,
            _ => METHOD_STORED,
        }
    }

    fn is_staging_file(&self, path: &Path) -> bool {
        if path.file_name() != self.tmp.path().file_name() {
            return false;
        }
        match (fs::canonicalize(path), fs::canonicalize(self.tmp.path())) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn write_entry(
        &mut self,
        name: &str,
        data: &mut dyn Read,
        method: u16,
        external_attrs: u32,
        modified: Option<NaiveDateTime>,
    ) -> Result<(), ArchiveError> {
        if name.len() > usize::from(u16::MAX) {
            return Err(ArchiveError::Unsupported {
                entry: name.chars().take(64).collect(),
                reason: "entry name too long".to_string(),
            });
        }
        let header_offset = self.offset;
        if header_offset > u64::from(u32::MAX) {
            return Err(ArchiveError::TooLarge(name.to_string()));
        }
        let (dos_date, dos_time) = modified.map(to_dos_datetime).unwrap_or(((1 << 5) | 1, 0));

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN + name.len());
        header.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        header.extend_from_slice(&FLAG_UTF8.to_le_bytes());
        header.extend_from_slice(&method.to_le_bytes());
        header.extend_from_slice(&dos_time.to_le_bytes());
        header.extend_from_slice(&dos_date.to_le_bytes());
        header.extend_from_slice(&[0u8; 12]); // crc + sizes, patched below
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(name.as_bytes());
        self.write_raw(&header)?;

        let data_start = self.offset;
        let mut crc = Crc::new();
        let mut uncompressed = 0u64;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        if method == METHOD_DEFLATED {
            let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
            loop {
                let n = data.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                uncompressed += n as u64;
                encoder.write_all(&buf[..n])?;
            }
            encoder.finish()?;
        } else {
            loop {
                let n = data.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                uncompressed += n as u64;
                self.out.write_all(&buf[..n])?;
            }
        }

        let end = self.out.stream_position()?;
        let compressed = end - data_start;
        self.offset = end;
        if uncompressed >= u64::from(u32::MAX) || compressed >= u64::from(u32::MAX) {
            return Err(ArchiveError::TooLarge(name.to_string()));
        }

        let crc32 = crc.sum();
        let mut patch = Vec::with_capacity(12);
        patch.extend_from_slice(&crc32.to_le_bytes());
        patch.extend_from_slice(&(compressed as u32).to_le_bytes());
        patch.extend_from_slice(&(uncompressed as u32).to_le_bytes());
        self.out.seek(SeekFrom::Start(header_offset + 14))?;
        self.out.write_all(&patch)?;
        self.out.seek(SeekFrom::Start(end))?;

        self.records.push(CentralRecord {
            name: name.to_string(),
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size: compressed as u32,
            uncompressed_size: uncompressed as u32,
            external_attrs,
            local_header_offset: header_offset as u32,
        });
        Ok(())
    }
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Zip each source under its own file name; directories recurse
pub fn compress_paths(sources: &[PathBuf], dest: &Path, ctx: &TaskContext) -> Result<PathBuf, ArchiveError> {
    let mut writer = ZipWriter::create(dest)?;
    for source in sources {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ArchiveError::Unsupported {
                entry: source.display().to_string(),
                reason: "source has no file name".to_string(),
            })?;
        writer.add_path(source, &name, ctx)?;
    }
    writer.finish()
}
