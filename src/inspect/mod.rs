//! Byte-level inspection for hex views

mod bytes;

pub use bytes::{parse_hex_pattern, ByteInspector, ByteWindow, DEFAULT_CHUNK_SIZE};
