//! Read-only property list parser (XML and binary `bplist00`)

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::DateTime;
use serde::Serialize;

use crate::error::ArchiveError;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;
const MAX_DEPTH: usize = 256;
/// Decoded objects allowed per table entry; shared refs may repeat, bombs may not
const DECODE_BUDGET_FACTOR: u64 = 8;
const MIN_DECODE_BUDGET: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlistValue {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    /// ISO-8601, as written in XML plists
    Date(String),
    Data(Vec<u8>),
    Array(Vec<PlistValue>),
    Dictionary(BTreeMap<String, PlistValue>),
}

impl PlistValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, PlistValue>> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        self.as_dict()?.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }
}

fn plist_err(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::Plist(msg.into())
}

/// Sniff the format and parse
pub fn parse(bytes: &[u8]) -> Result<PlistValue, ArchiveError> {
    if bytes.starts_with(b"bplist00") {
        parse_binary(bytes)
    } else {
        let text = std::str::from_utf8(bytes).map_err(|_| plist_err("XML plist is not UTF-8"))?;
        parse_xml(text)
    }
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Tag<'a> {
    Open(&'a str),
    Close(&'a str),
    Empty(&'a str),
}

struct XmlCursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> XmlCursor<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    /// Skip whitespace, the prolog, doctype and comments
    fn skip_misc(&mut self) -> Result<(), ArchiveError> {
        loop {
            let trimmed = self.rest().trim_start();
            self.pos = self.src.len() - trimmed.len();
            let close = if trimmed.starts_with("<?") {
                "?>"
            } else if trimmed.starts_with("<!--") {
                "-->"
            } else if trimmed.starts_with("<!") {
                ">"
            } else {
                return Ok(());
            };
            let end = trimmed.find(close).ok_or_else(|| plist_err("unterminated markup"))?;
            self.pos += end + close.len();
        }
    }

    fn next_tag(&mut self) -> Result<Tag<'a>, ArchiveError> {
        self.skip_misc()?;
        let rest = self.rest();
        if !rest.starts_with('<') {
            return Err(plist_err(format!("expected a tag at byte {}", self.pos)));
        }
        let end = rest.find('>').ok_or_else(|| plist_err("unterminated tag"))?;
        let inner = &rest[1..end];
        self.pos += end + 1;

        if let Some(name) = inner.strip_prefix('/') {
            return Ok(Tag::Close(name.trim()));
        }
        let (inner, empty) = match inner.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (inner, false),
        };
        // Attributes (e.g. version="1.0") are ignored
        let name = inner.split_whitespace().next().unwrap_or("");
        Ok(if empty { Tag::Empty(name) } else { Tag::Open(name) })
    }

    /// Raw text up to `</name>`, cursor moved past the close tag
    fn text_until_close(&mut self, name: &str) -> Result<String, ArchiveError> {
        let close = format!("</{}>", name);
        let rest = self.rest();
        let end = rest
            .find(&close)
            .ok_or_else(|| plist_err(format!("missing {}", close)))?;
        let text = unescape(&rest[..end])?;
        self.pos += end + close.len();
        Ok(text)
    }
}

fn unescape(raw: &str) -> Result<String, ArchiveError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after.find(';').ok_or_else(|| plist_err("unterminated entity"))?;
        let entity = &after[..semi];
        let ch = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| plist_err(format!("unknown entity &{};", entity)))?
            }
        };
        out.push(ch);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn parse_xml(text: &str) -> Result<PlistValue, ArchiveError> {
    let mut cursor = XmlCursor { src: text, pos: 0 };
    match cursor.next_tag()? {
        Tag::Open("plist") => {
            let value = parse_xml_value(&mut cursor, None, 0)?;
            match cursor.next_tag()? {
                Tag::Close("plist") => Ok(value),
                other => Err(plist_err(format!("expected </plist>, found {:?}", other))),
            }
        }
        // Bare value without the <plist> wrapper
        tag => parse_xml_value(&mut cursor, Some(tag), 0),
    }
}

fn parse_xml_value<'a>(cursor: &mut XmlCursor<'a>, first: Option<Tag<'a>>, depth: usize) -> Result<PlistValue, ArchiveError> {
    if depth > MAX_DEPTH {
        return Err(plist_err("nesting too deep"));
    }
    let tag = match first {
        Some(tag) => tag,
        None => cursor.next_tag()?,
    };

    match tag {
        Tag::Empty("true") => Ok(PlistValue::Boolean(true)),
        Tag::Empty("false") => Ok(PlistValue::Boolean(false)),
        Tag::Empty("string") => Ok(PlistValue::String(String::new())),
        Tag::Empty("array") => Ok(PlistValue::Array(Vec::new())),
        Tag::Empty("dict") => Ok(PlistValue::Dictionary(BTreeMap::new())),
        Tag::Empty("data") => Ok(PlistValue::Data(Vec::new())),
        Tag::Open("string") => Ok(PlistValue::String(cursor.text_until_close("string")?)),
        Tag::Open("date") => Ok(PlistValue::Date(cursor.text_until_close("date")?.trim().to_string())),
        Tag::Open("integer") => {
            let text = cursor.text_until_close("integer")?;
            let text = text.trim();
            let value = match text.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok(),
                None => text.parse::<i64>().ok(),
            };
            value
                .map(PlistValue::Integer)
                .ok_or_else(|| plist_err(format!("bad integer {:?}", text)))
        }
        Tag::Open("real") => {
            let text = cursor.text_until_close("real")?;
            text.trim()
                .parse::<f64>()
                .map(PlistValue::Real)
                .map_err(|_| plist_err(format!("bad real {:?}", text)))
        }
        Tag::Open("data") => {
            let text = cursor.text_until_close("data")?;
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(compact.as_bytes())
                .map(PlistValue::Data)
                .map_err(|e| plist_err(format!("bad base64 data: {}", e)))
        }
        Tag::Open("array") => {
            let mut items = Vec::new();
            loop {
                match cursor.next_tag()? {
                    Tag::Close("array") => return Ok(PlistValue::Array(items)),
                    tag => items.push(parse_xml_value(cursor, Some(tag), depth + 1)?),
                }
            }
        }
        Tag::Open("dict") => {
            let mut map = BTreeMap::new();
            loop {
                match cursor.next_tag()? {
                    Tag::Close("dict") => return Ok(PlistValue::Dictionary(map)),
                    Tag::Open("key") => {
                        let key = cursor.text_until_close("key")?;
                        let value = parse_xml_value(cursor, None, depth + 1)?;
                        map.insert(key, value);
                    }
                    Tag::Empty("key") => {
                        let value = parse_xml_value(cursor, None, depth + 1)?;
                        map.insert(String::new(), value);
                    }
                    other => return Err(plist_err(format!("expected <key>, found {:?}", other))),
                }
            }
        }
        other => Err(plist_err(format!("unexpected {:?}", other))),
    }
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

struct BinaryPlist<'a> {
    data: &'a [u8],
    offsets: Vec<u64>,
    ref_size: usize,
    /// Objects still allowed to be decoded
    budget: Cell<u64>,
    /// Containers being decoded, outermost first
    open: RefCell<Vec<u64>>,
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

pub fn parse_binary(data: &[u8]) -> Result<PlistValue, ArchiveError> {
    const HEADER_LEN: usize = 8;
    const TRAILER_LEN: usize = 32;
    if data.len() < HEADER_LEN + TRAILER_LEN || !data.starts_with(b"bplist00") {
        return Err(plist_err("not a binary plist"));
    }

    let trailer = &data[data.len() - TRAILER_LEN..];
    let offset_size = usize::from(trailer[6]);
    let ref_size = usize::from(trailer[7]);
    let num_objects = read_be(&trailer[8..16]);
    let top_object = read_be(&trailer[16..24]);
    let table_offset = read_be(&trailer[24..32]);

    if !(1..=8).contains(&offset_size) || !(1..=8).contains(&ref_size) {
        return Err(plist_err("bad trailer sizes"));
    }
    let table_len = num_objects
        .checked_mul(offset_size as u64)
        .ok_or_else(|| plist_err("object table overflow"))?;
    let table_end = table_offset
        .checked_add(table_len)
        .filter(|&end| end <= (data.len() - TRAILER_LEN) as u64)
        .ok_or_else(|| plist_err("offset table out of range"))?;
    if top_object >= num_objects {
        return Err(plist_err("top object out of range"));
    }

    let table = &data[table_offset as usize..table_end as usize];
    let offsets = table.chunks_exact(offset_size).map(read_be).collect();
    let plist = BinaryPlist {
        data,
        offsets,
        ref_size,
        budget: Cell::new(num_objects.saturating_mul(DECODE_BUDGET_FACTOR).max(MIN_DECODE_BUDGET)),
        open: RefCell::new(Vec::new()),
    };
    plist.object(top_object, 0)
}

impl<'a> BinaryPlist<'a> {
    fn bytes(&self, at: usize, len: usize) -> Result<&'a [u8], ArchiveError> {
        at.checked_add(len)
            .and_then(|end| self.data.get(at..end))
            .ok_or_else(|| plist_err("object out of range"))
    }

    /// Length nibble, or a following integer object when it is 0xF.
    /// Returns (count, position of the payload).
    fn length(&self, marker: u8, at: usize) -> Result<(usize, usize), ArchiveError> {
        let nibble = marker & 0x0F;
        if nibble != 0x0F {
            return Ok((usize::from(nibble), at + 1));
        }
        let int_marker = self.bytes(at + 1, 1)?[0];
        if int_marker >> 4 != 0x1 {
            return Err(plist_err("bad length marker"));
        }
        let width = 1usize << (int_marker & 0x0F);
        let count = read_be(self.bytes(at + 2, width)?);
        let count = usize::try_from(count).map_err(|_| plist_err("length overflow"))?;
        Ok((count, at + 2 + width))
    }

    fn refs(&self, at: usize, count: usize) -> Result<Vec<u64>, ArchiveError> {
        let len = count.checked_mul(self.ref_size).ok_or_else(|| plist_err("length overflow"))?;
        Ok(self.bytes(at, len)?.chunks_exact(self.ref_size).map(read_be).collect())
    }

    /// Decode a container's children with `index` marked as open
    fn within<T>(&self, index: u64, decode: impl FnOnce() -> Result<T, ArchiveError>) -> Result<T, ArchiveError> {
        if self.open.borrow().contains(&index) {
            return Err(plist_err("reference cycle"));
        }
        self.open.borrow_mut().push(index);
        let result = decode();
        self.open.borrow_mut().pop();
        result
    }

    fn object(&self, index: u64, depth: usize) -> Result<PlistValue, ArchiveError> {
        if depth > MAX_DEPTH {
            return Err(plist_err("nesting too deep"));
        }
        let remaining = self.budget.get();
        if remaining == 0 {
            return Err(plist_err("too many objects"));
        }
        self.budget.set(remaining - 1);
        let offset = *self
            .offsets
            .get(usize::try_from(index).map_err(|_| plist_err("bad object ref"))?)
            .ok_or_else(|| plist_err("bad object ref"))?;
        let at = usize::try_from(offset).map_err(|_| plist_err("bad offset"))?;
        let marker = self.bytes(at, 1)?[0];

        match marker >> 4 {
            0x0 => match marker {
                0x08 => Ok(PlistValue::Boolean(false)),
                0x09 => Ok(PlistValue::Boolean(true)),
                _ => Err(plist_err(format!("unsupported marker {:#04x}", marker))),
            },
            0x1 => {
                let width = 1usize << (marker & 0x0F);
                let raw = self.bytes(at + 1, width)?;
                let value = match width {
                    1 | 2 | 4 => read_be(raw) as i64,
                    8 => i64::from_be_bytes(raw.try_into().map_err(|_| plist_err("bad int"))?),
                    // 128-bit integers: keep the low 64 bits
                    _ => read_be(&raw[raw.len().saturating_sub(8)..]) as i64,
                };
                Ok(PlistValue::Integer(value))
            }
            0x2 => {
                let width = 1usize << (marker & 0x0F);
                let raw = self.bytes(at + 1, width)?;
                match width {
                    4 => Ok(PlistValue::Real(f64::from(f32::from_bits(read_be(raw) as u32)))),
                    8 => Ok(PlistValue::Real(f64::from_bits(read_be(raw)))),
                    _ => Err(plist_err("bad real width")),
                }
            }
            0x3 => {
                let seconds = f64::from_bits(read_be(self.bytes(at + 1, 8)?));
                if !seconds.is_finite() {
                    return Err(plist_err("bad date"));
                }
                let date = APPLE_EPOCH_OFFSET
                    .checked_add(seconds.floor() as i64)
                    .and_then(|unix| DateTime::from_timestamp(unix, 0))
                    .ok_or_else(|| plist_err("bad date"))?;
                Ok(PlistValue::Date(date.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
            }
            0x4 => {
                let (len, start) = self.length(marker, at)?;
                Ok(PlistValue::Data(self.bytes(start, len)?.to_vec()))
            }
            0x5 => {
                let (len, start) = self.length(marker, at)?;
                Ok(PlistValue::String(String::from_utf8_lossy(self.bytes(start, len)?).into_owned()))
            }
            0x6 => {
                let (len, start) = self.length(marker, at)?;
                let byte_len = len.checked_mul(2).ok_or_else(|| plist_err("length overflow"))?;
                let units: Vec<u16> = self
                    .bytes(start, byte_len)?
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(PlistValue::String(String::from_utf16_lossy(&units)))
            }
            0x8 => {
                // UID: surfaced as an integer
                let width = usize::from(marker & 0x0F) + 1;
                Ok(PlistValue::Integer(read_be(self.bytes(at + 1, width)?) as i64))
            }
            0xA => {
                let (count, start) = self.length(marker, at)?;
                let refs = self.refs(start, count)?;
                let items = self.within(index, || {
                    refs.into_iter()
                        .map(|r| self.object(r, depth + 1))
                        .collect::<Result<Vec<_>, _>>()
                })?;
                Ok(PlistValue::Array(items))
            }
            0xD => {
                let (count, start) = self.length(marker, at)?;
                let keys = self.refs(start, count)?;
                let values = self.refs(start + count * self.ref_size, count)?;
                let map = self.within(index, || {
                    let mut map = BTreeMap::new();
                    for (k, v) in keys.into_iter().zip(values) {
                        let key = match self.object(k, depth + 1)? {
                            PlistValue::String(s) => s,
                            _ => return Err(plist_err("dictionary key is not a string")),
                        };
                        map.insert(key, self.object(v, depth + 1)?);
                    }
                    Ok(map)
                })?;
                Ok(PlistValue::Dictionary(map))
            }
            _ => Err(plist_err(format!("unsupported marker {:#04x}", marker))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <!-- a comment -->
    <key>CFBundleDisplayName</key>
    <string>Tom &amp; Jerry</string>
    <key>CFBundleIdentifier</key>
    <string>com.example.tj</string>
    <key>Count</key>
    <integer>-42</integer>
    <key>Ratio</key>
    <real>0.5</real>
    <key>Enabled</key>
    <true/>
    <key>Blob</key>
    <data>
    aGVs
    bG8=
    </data>
    <key>Empty</key>
    <string/>
    <key>Families</key>
    <array>
        <integer>1</integer>
        <integer>2</integer>
    </array>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_xml() {
        let value = parse(INFO_PLIST.as_bytes()).unwrap();
        assert_eq!(value.get_str("CFBundleDisplayName"), Some("Tom & Jerry"));
        assert_eq!(value.get_str("CFBundleIdentifier"), Some("com.example.tj"));
        assert_eq!(value.get("Count"), Some(&PlistValue::Integer(-42)));
        assert_eq!(value.get("Ratio"), Some(&PlistValue::Real(0.5)));
        assert_eq!(value.get("Enabled"), Some(&PlistValue::Boolean(true)));
        assert_eq!(value.get("Blob"), Some(&PlistValue::Data(b"hello".to_vec())));
        assert_eq!(value.get_str("Empty"), Some(""));
        assert_eq!(
            value.get("Families"),
            Some(&PlistValue::Array(vec![PlistValue::Integer(1), PlistValue::Integer(2)]))
        );
    }

    #[test]
    fn test_unescape_numeric() {
        assert_eq!(unescape("a&#65;&#x42;c").unwrap(), "aABc");
        assert!(unescape("&bogus;").is_err());
    }

    #[test]
    fn test_malformed_xml() {
        assert!(parse(b"<plist><dict><key>a</key></plist>").is_err());
        assert!(parse(b"<plist><integer>abc</integer></plist>").is_err());
    }

    /// Hand-assembled: {"CFBundleName": "Demo", "n": 7, "ok": true}
    fn sample_binary() -> Vec<u8> {
        let mut out = b"bplist00".to_vec();
        let mut offsets = Vec::new();

        // 0: dict with 3 entries, keys refs 1,2,3 values refs 4,5,6
        offsets.push(out.len() as u8);
        out.extend_from_slice(&[0xD3, 1, 2, 3, 4, 5, 6]);
        for key in ["CFBundleName", "n", "ok"] {
            offsets.push(out.len() as u8);
            out.push(0x50 | key.len() as u8);
            out.extend_from_slice(key.as_bytes());
        }
        offsets.push(out.len() as u8);
        out.push(0x54);
        out.extend_from_slice(b"Demo");
        offsets.push(out.len() as u8);
        out.extend_from_slice(&[0x10, 7]);
        offsets.push(out.len() as u8);
        out.push(0x09);

        let table_offset = out.len() as u64;
        out.extend_from_slice(&offsets);
        let mut trailer = vec![0u8; 6];
        trailer.push(1); // offset size
        trailer.push(1); // ref size
        trailer.extend_from_slice(&(offsets.len() as u64).to_be_bytes());
        trailer.extend_from_slice(&0u64.to_be_bytes());
        trailer.extend_from_slice(&table_offset.to_be_bytes());
        out.extend_from_slice(&trailer);
        out
    }

    #[test]
    fn test_parse_binary() {
        let value = parse(&sample_binary()).unwrap();
        assert_eq!(value.get_str("CFBundleName"), Some("Demo"));
        assert_eq!(value.get("n"), Some(&PlistValue::Integer(7)));
        assert_eq!(value.get("ok"), Some(&PlistValue::Boolean(true)));
    }

    #[test]
    fn test_truncated_binary() {
        let mut bytes = sample_binary();
        bytes.truncate(20);
        assert!(matches!(parse(&bytes), Err(ArchiveError::Plist(_))));
    }

    #[test]
    fn test_self_referencing_binary_is_bounded() {
        // An array whose only element is itself
        let mut out = b"bplist00".to_vec();
        out.extend_from_slice(&[0xA1, 0]);
        let table_offset = out.len() as u64;
        out.push(8);
        let mut trailer = vec![0u8; 6];
        trailer.extend_from_slice(&[1, 1]);
        trailer.extend_from_slice(&1u64.to_be_bytes());
        trailer.extend_from_slice(&0u64.to_be_bytes());
        trailer.extend_from_slice(&table_offset.to_be_bytes());
        out.extend_from_slice(&trailer);
        assert!(matches!(parse(&out), Err(ArchiveError::Plist(_))));
    }

    /// One-byte offsets and refs; `objects[i]` is object `i`
    fn binary_from(objects: &[Vec<u8>], top: u64) -> Vec<u8> {
        let mut out = b"bplist00".to_vec();
        let mut offsets = Vec::new();
        for object in objects {
            offsets.push(u8::try_from(out.len()).unwrap());
            out.extend_from_slice(object);
        }
        let table_offset = out.len() as u64;
        out.extend_from_slice(&offsets);
        let mut trailer = vec![0u8; 6];
        trailer.extend_from_slice(&[1, 1]);
        trailer.extend_from_slice(&(objects.len() as u64).to_be_bytes());
        trailer.extend_from_slice(&top.to_be_bytes());
        trailer.extend_from_slice(&table_offset.to_be_bytes());
        out.extend_from_slice(&trailer);
        out
    }

    #[test]
    fn test_doubling_reference_chain_is_rejected() {
        // Each array holds the previous object twice: 2^40 leaves if expanded
        let mut objects = vec![vec![0x10, 1]];
        for i in 1..=40u8 {
            objects.push(vec![0xA2, i - 1, i - 1]);
        }
        let bytes = binary_from(&objects, 40);
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, ArchiveError::Plist(ref m) if m == "too many objects"), "{err:?}");
    }

    #[test]
    fn test_shared_references_still_decode() {
        let objects = vec![vec![0xA3, 1, 1, 1], vec![0x52, b'o', b'k']];
        let value = parse(&binary_from(&objects, 0)).unwrap();
        let ok = PlistValue::String("ok".to_string());
        assert_eq!(value, PlistValue::Array(vec![ok.clone(), ok.clone(), ok]));
    }

    #[test]
    fn test_indirect_cycle_is_rejected() {
        // dict {"k": array [dict]}
        let objects = vec![vec![0xD1, 1, 2], vec![0x51, b'k'], vec![0xA1, 0]];
        let err = parse(&binary_from(&objects, 0)).unwrap_err();
        assert!(matches!(err, ArchiveError::Plist(ref m) if m == "reference cycle"), "{err:?}");
    }

    #[test]
    fn test_out_of_range_dates_are_errors() {
        for seconds in [1.0e300_f64, -1.0e300, f64::NAN, f64::INFINITY] {
            let mut date = vec![0x33];
            date.extend_from_slice(&seconds.to_bits().to_be_bytes());
            let err = parse(&binary_from(&[date], 0)).unwrap_err();
            assert!(matches!(err, ArchiveError::Plist(ref m) if m == "bad date"), "{seconds}: {err:?}");
        }

        let mut date = vec![0x33];
        date.extend_from_slice(&0.0f64.to_bits().to_be_bytes());
        assert_eq!(
            parse(&binary_from(&[date], 0)).unwrap(),
            PlistValue::Date("2001-01-01T00:00:00Z".to_string())
        );
    }
}
