//! Sequential tagged-chunk catalog (Topcon FDA/FDS layout).
//!
//! # Layout
//! ```text
//! offset  size  field
//!      0     4  file code (ASCII, e.g. "FOCT")
//!      4     3  file type (ASCII, e.g. "FDA")
//!      7     4  major version, u32 LE
//!     11     4  minor version, u32 LE
//!     15        chunk list
//! ```
//! Each chunk is `u8 name_len | name | u32 LE size | payload`.  A
//! `name_len` of 0 ends the list.  Tags may repeat; every occurrence is
//! kept in file order.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{info, trace};
use serde::{Serialize, Serializer};

use crate::error::{OctError, Result};
use crate::record::{ascii, Field, Schema, U32LE};

pub const TAGGED_HEADER_SIZE: usize = 15;

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedHeader {
    pub file_code: String,
    pub file_type: String,
    pub major_ver: u32,
    pub minor_ver: u32,
}

pub static TAGGED_HEADER: Schema = Schema {
    name: "tagged_header",
    fields: &[
        Field::new("file_code", ascii(4)),
        Field::new("file_type", ascii(3)),
        Field::new("major_ver", U32LE),
        Field::new("minor_ver", U32LE),
    ],
};

impl TaggedHeader {
    /// Read the 15-byte header.  A file code other than `magic`, or a file
    /// too short to hold a header, is a [`OctError::FormatMismatch`].
    pub fn read<R: Read + Seek>(mut reader: R, magic: &[u8; 4], format: &'static str) -> Result<Self> {
        let rec = TAGGED_HEADER.decode(&mut reader).map_err(|e| match e {
            e if e.is_shape_mismatch() => OctError::mismatch(format, e.to_string()),
            other => other.into(),
        })?;
        let file_code = rec.text("file_code")?;
        if file_code.as_bytes() != magic {
            return Err(OctError::mismatch(format, format!("file code {file_code:?}")));
        }
        Ok(Self {
            file_code: file_code.to_owned(),
            file_type: rec.text("file_type")?.to_owned(),
            major_ver: rec.uint("major_ver")? as u32,
            minor_ver: rec.uint("minor_ver")? as u32,
        })
    }
}

// ── Chunks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedChunk {
    #[serde(serialize_with = "serialize_tag")]
    pub tag:    Vec<u8>,
    /// Absolute offset of the first payload byte.
    pub offset: u64,
    pub size:   u64,
}

fn serialize_tag<S: Serializer>(tag: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(tag))
}

impl TaggedChunk {
    pub fn tag_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.tag)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Seek to the payload and read all of it.
    pub fn read_payload<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Vec<u8>> {
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; self.size as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Every chunk of a tagged container, in file order, plus a tag index.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedCatalog {
    pub header: TaggedHeader,
    entries:    Vec<TaggedChunk>,
    #[serde(skip)]
    index:      HashMap<Vec<u8>, Vec<usize>>,
}

impl TaggedCatalog {
    fn new(header: TaggedHeader) -> Self {
        Self { header, entries: Vec::new(), index: HashMap::new() }
    }

    fn push(&mut self, chunk: TaggedChunk) {
        self.index.entry(chunk.tag.clone()).or_default().push(self.entries.len());
        self.entries.push(chunk);
    }

    pub fn entries(&self) -> &[TaggedChunk] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: &[u8]) -> bool {
        self.index.contains_key(tag)
    }

    /// Every occurrence of `tag`, in file order.
    pub fn get<'a>(&'a self, tag: &[u8]) -> impl Iterator<Item = &'a TaggedChunk> + 'a {
        self.index
            .get(tag)
            .into_iter()
            .flatten()
            .map(move |&i| &self.entries[i])
    }

    pub fn first(&self, tag: &[u8]) -> Option<&TaggedChunk> {
        self.get(tag).next()
    }

    /// Distinct tags in order of first appearance.
    pub fn tags(&self) -> Vec<&[u8]> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .filter(|c| seen.insert(c.tag.as_slice()))
            .map(|c| c.tag.as_slice())
            .collect()
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

fn truncated(what: &str, at: u64) -> OctError {
    OctError::Format(format!("truncated tagged container: {what} at offset {at}"))
}

/// Scan a tagged container from offset 0.
///
/// Only the header check can yield [`OctError::FormatMismatch`].  After
/// that, an EOF before the terminating zero-length tag or a chunk running
/// past the end of the file is [`OctError::Format`].
pub fn scan_tagged<R: Read + Seek>(
    reader: &mut R,
    magic:  &[u8; 4],
    format: &'static str,
) -> Result<TaggedCatalog> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let header = TaggedHeader::read(&mut *reader, magic, format)?;
    let mut catalog = TaggedCatalog::new(header);

    loop {
        let pos = reader.stream_position()?;
        let name_len = match reader.read_u8() {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(truncated("missing end-of-catalog marker", pos))
            }
            Err(e) => return Err(e.into()),
        };
        if name_len == 0 {
            break;
        }

        let mut tag = vec![0u8; name_len as usize];
        let size = match reader.read_exact(&mut tag).and_then(|_| reader.read_u32::<LittleEndian>()) {
            Ok(n) => n as u64,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(truncated("chunk prefix cut short", pos))
            }
            Err(e) => return Err(e.into()),
        };

        let offset = reader.stream_position()?;
        if offset + size > file_len {
            return Err(OctError::Format(format!(
                "chunk {:?} at offset {offset} declares {size} bytes, only {} remain",
                String::from_utf8_lossy(&tag),
                file_len - offset,
            )));
        }
        trace!("{format}: {:?} at {offset}, {size} bytes", String::from_utf8_lossy(&tag));
        reader.seek(SeekFrom::Start(offset + size))?;
        catalog.push(TaggedChunk { tag, offset, size });
    }

    info!("{format}: catalogued {} chunks ({} distinct tags)", catalog.len(), catalog.index.len());
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Write};

    fn header(code: &[u8; 4]) -> Vec<u8> {
        let mut buf = code.to_vec();
        buf.extend_from_slice(b"FDA");
        buf.write_u32::<LittleEndian>(8).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf
    }

    fn chunk(buf: &mut Vec<u8>, tag: &[u8], payload: &[u8]) {
        buf.write_u8(tag.len() as u8).unwrap();
        buf.write_all(tag).unwrap();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.write_all(payload).unwrap();
    }

    #[test]
    fn zero_length_tag_first_is_empty_catalog() {
        let mut buf = header(b"FOCT");
        buf.push(0);
        let cat = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap();
        assert!(cat.is_empty());
        assert_eq!(cat.header.file_type, "FDA");
        assert_eq!(cat.header.major_ver, 8);
    }

    #[test]
    fn repeated_tags_kept_in_file_order() {
        let mut buf = header(b"FOCT");
        chunk(&mut buf, b"@CONTOUR_INFO", &[1, 2, 3]);
        chunk(&mut buf, b"@PATIENT_INFO_02", &[0; 8]);
        chunk(&mut buf, b"@CONTOUR_INFO", &[4, 5]);
        buf.push(0);

        let cat = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap();
        assert_eq!(cat.len(), 3);
        let contours: Vec<_> = cat.get(b"@CONTOUR_INFO").map(|c| (c.offset, c.size)).collect();
        assert_eq!(contours, vec![(15 + 1 + 13 + 4, 3), (cat.entries()[2].offset, 2)]);
        assert!(contours[0].0 < contours[1].0);
        assert_eq!(cat.tags().len(), 2);
    }

    #[test]
    fn payload_reads_back() {
        let mut buf = header(b"FOCT");
        chunk(&mut buf, b"@A", b"payload");
        buf.push(0);
        let mut cursor = Cursor::new(buf);
        let cat = scan_tagged(&mut cursor, b"FOCT", "Topcon FDA").unwrap();
        let a = cat.first(b"@A").unwrap();
        assert_eq!(a.read_payload(&mut cursor).unwrap(), b"payload");
    }

    #[test]
    fn wrong_file_code_is_mismatch() {
        let mut buf = header(b"XOCT");
        buf.push(0);
        let err = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap_err();
        assert!(err.is_mismatch());
    }

    #[test]
    fn short_or_non_ascii_header_is_mismatch() {
        let err = scan_tagged(&mut Cursor::new(b"FOCTFDA".to_vec()), b"FOCT", "Topcon FDA").unwrap_err();
        assert!(err.is_mismatch());

        let mut buf = header(b"FOCT");
        buf[5] = 0xC3;
        buf.push(0);
        let err = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap_err();
        assert!(err.is_mismatch());
    }

    #[test]
    fn header_layout_matches_declared_size() {
        let rec = TAGGED_HEADER.decode(&mut Cursor::new(header(b"FOCT"))).unwrap();
        assert_eq!(rec.text("file_type").unwrap(), "FDA");
        assert_eq!(rec.uint("minor_ver").unwrap(), 1);
        assert_eq!(TAGGED_HEADER.fixed_size(), Some(TAGGED_HEADER_SIZE as u64));
    }

    #[test]
    fn oversize_chunk_is_format_error() {
        let mut buf = header(b"FOCT");
        buf.write_u8(2).unwrap();
        buf.write_all(b"@A").unwrap();
        buf.write_u32::<LittleEndian>(1000).unwrap();
        buf.write_all(&[0; 10]).unwrap();
        let err = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap_err();
        assert!(matches!(err, OctError::Format(_)));
    }

    #[test]
    fn missing_terminator_is_format_error() {
        let mut buf = header(b"FOCT");
        chunk(&mut buf, b"@A", b"x");
        let err = scan_tagged(&mut Cursor::new(buf), b"FOCT", "Topcon FDA").unwrap_err();
        assert!(matches!(err, OctError::Format(_)));
    }

    #[test]
    fn rescan_is_identical() {
        let mut buf = header(b"FOCT");
        chunk(&mut buf, b"@A", b"one");
        chunk(&mut buf, b"@B", b"two!");
        buf.push(0);
        let mut cursor = Cursor::new(buf);
        let a = scan_tagged(&mut cursor, b"FOCT", "Topcon FDA").unwrap();
        let b = scan_tagged(&mut cursor, b"FOCT", "Topcon FDA").unwrap();
        assert_eq!(a.entries(), b.entries());
    }
}
