//! ZIP containers: reading, extraction, compression, and app-bundle metadata

pub mod bundle;
pub mod format;
pub mod plist;
pub mod reader;
pub mod writer;

pub use bundle::BundleInfo;
pub use plist::PlistValue;
pub use reader::{sanitize_entry_name, ArchiveEntry, ArchiveEntryKind, ArchiveReader, ExtractSummary, ZipArchive};
pub use writer::{compress_paths, CompressionMethod, ZipWriter};
