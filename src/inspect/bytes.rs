use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::InspectError;
use crate::task::TaskContext;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A materialized slice of a file, for hex rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteWindow {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl ByteWindow {
    pub fn length(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `OFFSET  HEX BYTES  |ascii|` lines, `width` bytes per line
    pub fn render(&self, width: usize) -> String {
        let width = width.max(1);
        let mut out = String::new();

        for (i, chunk) in self.bytes.chunks(width).enumerate() {
            let offset = self.offset + (i * width) as u64;
            out.push_str(&format!("{offset:08X}  "));

            for j in 0..width {
                match chunk.get(j) {
                    Some(b) => out.push_str(&format!("{:02X} ", b)),
                    None => out.push_str("   "),
                }
                if j == 7 && width > 8 {
                    out.push(' ');
                }
            }

            out.push_str(" |");
            out.extend(chunk.iter().map(|&b| printable(b)));
            out.push_str("|\n");
        }
        out
    }
}

fn printable(b: u8) -> char {
    if b.is_ascii_graphic() || b == b' ' {
        b as char
    } else {
        '.'
    }
}

/// Fixed-width row access and pattern search over a file, without loading it whole
#[derive(Debug, Clone)]
pub struct ByteInspector {
    path: PathBuf,
    len: u64,
    chunk_size: usize,
}

impl ByteInspector {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InspectError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        if metadata.is_dir() {
            return Err(InspectError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length observed at open time
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn row_count(&self, width: usize) -> u64 {
        let width = width.max(1) as u64;
        self.len.div_ceil(width)
    }

    /// Up to `width` bytes at `offset`; truncated at EOF, empty past it
    pub fn read_row(&self, offset: u64, width: usize) -> Result<ByteWindow, InspectError> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if offset >= file_len || width == 0 {
            return Ok(ByteWindow { offset, bytes: Vec::new() });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::with_capacity(width.min((file_len - offset) as usize));
        file.take(width as u64).read_to_end(&mut bytes)?;
        Ok(ByteWindow { offset, bytes })
    }

    /// Row `index` of a `width`-wide grid
    pub fn row(&self, index: u64, width: usize) -> Result<ByteWindow, InspectError> {
        self.read_row(index.saturating_mul(width as u64), width)
    }

    /// First offset ≥ `from` where `pattern` occurs
    pub fn search(&self, pattern: &[u8], from: u64) -> Result<Option<u64>, InspectError> {
        self.search_with(pattern, from, &TaskContext::detached())
    }

    /// Chunked forward scan; checks for cancellation between chunks
    pub fn search_with(&self, pattern: &[u8], from: u64, ctx: &TaskContext) -> Result<Option<u64>, InspectError> {
        if pattern.is_empty() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        let total = file.metadata()?.len();
        if from >= total {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(from))?;

        let overlap = pattern.len() - 1;
        let mut window: Vec<u8> = Vec::with_capacity(self.chunk_size + overlap);
        let mut window_start = from;
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            ctx.checkpoint()?;
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            window.extend_from_slice(&chunk[..n]);

            if let Some(pos) = find(&window, pattern) {
                let found = window_start + pos as u64;
                debug!(path = %self.path.display(), offset = found, "pattern found");
                return Ok(Some(found));
            }

            // Keep the tail so matches straddling two chunks are still seen
            let keep = overlap.min(window.len());
            let consumed = window.len() - keep;
            window.drain(..consumed);
            window_start += consumed as u64;
            ctx.report_bytes(window_start - from, total - from);
        }
        Ok(None)
    }

    /// `pattern` as hex digits, whitespace ignored: "DE AD be ef"
    pub fn search_hex(&self, pattern: &str, from: u64) -> Result<Option<u64>, InspectError> {
        let bytes = parse_hex_pattern(pattern)?;
        self.search(&bytes, from)
    }

    /// Overwrite in place; the file length never changes
    pub fn write_row(&self, offset: u64, bytes: &[u8]) -> Result<(), InspectError> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        let file_len = file.metadata()?.len();
        let end = offset.checked_add(bytes.len() as u64);
        if end.map_or(true, |end| end > file_len) {
            return Err(InspectError::OutOfBounds { offset, len: bytes.len(), file_len });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        debug!(path = %self.path.display(), offset, len = bytes.len(), "wrote bytes");
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn parse_hex_pattern(pattern: &str) -> Result<Vec<u8>, InspectError> {
    let digits: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.is_empty() {
        return Err(InspectError::InvalidPattern(pattern.to_string()));
    }
    hex::decode(digits).map_err(|e| InspectError::InvalidPattern(format!("{}: {}", pattern, e)))
}
