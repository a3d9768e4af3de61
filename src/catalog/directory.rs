//! Linked directory walk (Heidelberg E2E layout).
//!
//! # Layout
//! ```text
//! [64-byte prefix, only when the file starts with "E2EMultipleVolumeFile"]
//! file header        36 bytes  magic "CMDb…", version, 10 × u16
//! main directory     52 bytes  header + num_entries, current, prev, u32
//! … directory pages  52 bytes each, followed by num_entries × 44-byte entries
//! ```
//! Directory pages form a singly linked list through `prev`, ending at 0.
//! Every absolute offset stored in the file is relative to the end of the
//! optional prefix.
//!
//! # Two passes
//! [`walk_directory_chain`] follows `prev` from the main directory's
//! `current` and returns page offsets in visit order.
//! [`collect_entries`] then reads each page's entries, tracking the largest
//! slice id per [`VolumeKey`] and queueing entries whose `start > pos` (the
//! rest describe directory bookkeeping).  Slot arrays need those maxima
//! before the first pixel chunk is placed, so the passes stay separate.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, info, trace};
use serde::Serialize;

use crate::error::{OctError, Result};
use crate::record::{array, ascii, DecodeError, Field, Len, Schema, I32LE, U16LE, U32LE};
use crate::volume::VolumeKey;

pub const MULTI_VOLUME_MARKER: &[u8; 21] = b"E2EMultipleVolumeFile";
pub const MULTI_VOLUME_SKIP: u64 = 64;
pub const HEADER_MAGIC: &str = "CMDb";
pub const DIRECTORY_MAGIC: &str = "MDbMDir";

const FORMAT: &str = "Heidelberg E2E";
const FILE_HEADER_SIZE: u64 = 36;

// ── Record layouts ───────────────────────────────────────────────────────────

pub static FILE_HEADER: Schema = Schema {
    name: "e2e_header",
    fields: &[
        Field::new("magic", ascii(12)),
        Field::new("version", U32LE),
        Field::new("unknown", array(Len::Fixed(10), &U16LE)),
    ],
};

pub static DIRECTORY_PAGE: Schema = Schema {
    name: "e2e_directory",
    fields: &[
        Field::new("magic", ascii(12)),
        Field::new("version", U32LE),
        Field::new("unknown", array(Len::Fixed(10), &U16LE)),
        Field::new("num_entries", U32LE),
        Field::new("current", U32LE),
        Field::new("prev", U32LE),
        Field::new("unknown3", U32LE),
    ],
};

pub static DIRECTORY_ENTRY: Schema = Schema {
    name: "e2e_subdirectory",
    fields: &[
        Field::new("pos", U32LE),
        Field::new("start", U32LE),
        Field::new("size", U32LE),
        Field::new("unknown", U32LE),
        Field::new("patient_db_id", U32LE),
        Field::new("study_id", U32LE),
        Field::new("series_id", U32LE),
        Field::new("slice_id", I32LE),
        Field::new("unknown2", U16LE),
        Field::new("unknown3", U16LE),
        Field::new("type", U32LE),
        Field::new("unknown4", U32LE),
    ],
};

// ── Catalog types ────────────────────────────────────────────────────────────

/// One directory page as read during the first pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirectoryNode {
    pub offset:      u64,
    pub num_entries: u32,
    pub current:     u32,
    pub prev:        u32,
}

/// A directory entry pointing at real chunk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    pub pos:        u32,
    /// Offset of the chunk header, relative to the prefix.
    pub start:      u32,
    pub size:       u32,
    pub key:        VolumeKey,
    pub slice_id:   i32,
    pub chunk_type: u32,
}

/// Largest slice id seen per key, in order of first appearance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SliceExtents {
    order:  Vec<(VolumeKey, i32)>,
    #[serde(skip)]
    lookup: HashMap<VolumeKey, usize>,
}

impl SliceExtents {
    pub fn observe(&mut self, key: VolumeKey, slice_id: i32) {
        match self.lookup.get(&key) {
            Some(&i) => {
                if slice_id > self.order[i].1 {
                    self.order[i].1 = slice_id;
                }
            }
            None => {
                self.lookup.insert(key, self.order.len());
                self.order.push((key, slice_id));
            }
        }
    }

    pub fn max_slice_id(&self, key: &VolumeKey) -> Option<i32> {
        self.lookup.get(key).map(|&i| self.order[i].1)
    }

    /// Slot count for a key's primary volume: `max_id / 2 + 1`, the `+1`
    /// absorbing the vendor's off-by-one.  Keys whose largest id is not
    /// positive get no primary volume.
    pub fn slot_count(&self, key: &VolumeKey) -> Option<usize> {
        self.max_slice_id(key)
            .filter(|&id| id > 0)
            .map(|id| id.div_euclid(2) as usize + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VolumeKey, i32)> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryCatalog {
    /// Bytes to add to every stored offset.
    pub byte_skip: u64,
    pub version:   u32,
    pub nodes:     Vec<DirectoryNode>,
    pub chunks:    Vec<ChunkDescriptor>,
    pub extents:   SliceExtents,
}

// ── Passes ───────────────────────────────────────────────────────────────────

fn read_page<R: Read + Seek>(reader: &mut R, at: u64) -> Result<DirectoryNode> {
    reader.seek(SeekFrom::Start(at))?;
    let rec = DIRECTORY_PAGE.decode(reader).map_err(|e| match e {
        DecodeError::Io(ref io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            OctError::Format(format!("directory page at {at} is truncated"))
        }
        DecodeError::Text { .. } => OctError::Format(format!("directory page at {at} has a non-text magic")),
        other => other.into(),
    })?;
    let magic = rec.text("magic")?;
    if !magic.starts_with(DIRECTORY_MAGIC) {
        return Err(OctError::Format(format!("directory page at {at} has magic {magic:?}")));
    }
    Ok(DirectoryNode {
        offset:      at,
        num_entries: rec.uint("num_entries")? as u32,
        current:     rec.uint("current")? as u32,
        prev:        rec.uint("prev")? as u32,
    })
}

/// First pass: follow `prev` from `current` until 0.
///
/// Returns the pages in visit order.  Revisiting a page is a corrupt
/// container, reported as [`OctError::Format`].
pub fn walk_directory_chain<R: Read + Seek>(
    reader:    &mut R,
    byte_skip: u64,
    current:   u32,
) -> Result<Vec<DirectoryNode>> {
    let mut visited = HashSet::new();
    let mut nodes = Vec::new();
    let mut next = current;
    while next != 0 {
        if !visited.insert(next) {
            return Err(OctError::Format(format!("directory chain loops back to offset {next}")));
        }
        let node = read_page(reader, next as u64 + byte_skip)?;
        trace!("directory page at {next}: {} entries, prev {}", node.num_entries, node.prev);
        next = node.prev;
        nodes.push(node);
    }
    debug!("directory chain: {} pages", nodes.len());
    Ok(nodes)
}

/// Second pass: read every page's entries in discovery order.
pub fn collect_entries<R: Read + Seek>(
    reader:    &mut R,
    byte_skip: u64,
    nodes:     &[DirectoryNode],
) -> Result<(Vec<ChunkDescriptor>, SliceExtents)> {
    let mut chunks = Vec::new();
    let mut extents = SliceExtents::default();
    for node in nodes {
        // Re-read the page header so the entries that follow are next.
        let page = read_page(reader, node.offset)?;
        for i in 0..page.num_entries {
            let rec = DIRECTORY_ENTRY.decode(reader).map_err(|e| match e {
                DecodeError::Io(ref io) if io.kind() == io::ErrorKind::UnexpectedEof => OctError::Format(
                    format!("directory page at {} ends after {i} of {} entries", node.offset, page.num_entries),
                ),
                other => other.into(),
            })?;
            let key = VolumeKey::new(
                rec.uint("patient_db_id")? as u32,
                rec.uint("study_id")? as u32,
                rec.uint("series_id")? as u32,
            );
            let slice_id = rec.int("slice_id")? as i32;
            extents.observe(key, slice_id);

            let pos = rec.uint("pos")? as u32;
            let start = rec.uint("start")? as u32;
            if start > pos {
                chunks.push(ChunkDescriptor {
                    pos,
                    start,
                    size: rec.uint("size")? as u32,
                    key,
                    slice_id,
                    chunk_type: rec.uint("type")? as u32,
                });
            }
        }
    }
    Ok((chunks, extents))
}

/// Detect the multi-volume prefix.  Files shorter than the marker have none.
pub fn detect_byte_skip<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    reader.seek(SeekFrom::Start(0))?;
    let mut marker = [0u8; 21];
    match reader.read_exact(&mut marker) {
        Ok(()) if &marker == MULTI_VOLUME_MARKER => Ok(MULTI_VOLUME_SKIP),
        Ok(()) => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Full catalog: prefix detection, header check, then both passes.
pub fn scan_directory<R: Read + Seek>(reader: &mut R) -> Result<DirectoryCatalog> {
    let byte_skip = detect_byte_skip(reader)?;
    reader.seek(SeekFrom::Start(byte_skip))?;

    let header = FILE_HEADER.decode(reader).map_err(|e| match e {
        e if e.is_shape_mismatch() => OctError::mismatch(FORMAT, e.to_string()),
        other => other.into(),
    })?;
    let magic = header.text("magic")?;
    if !magic.starts_with(HEADER_MAGIC) {
        return Err(OctError::mismatch(FORMAT, format!("header magic {magic:?}")));
    }
    let version = header.uint("version")? as u32;

    let main = read_page(reader, byte_skip + FILE_HEADER_SIZE)?;
    let nodes = walk_directory_chain(reader, byte_skip, main.current)?;
    let (chunks, extents) = collect_entries(reader, byte_skip, &nodes)?;

    info!(
        "{FORMAT}: {} directory pages, {} data chunks, {} volume keys",
        nodes.len(),
        chunks.len(),
        extents.len()
    );
    Ok(DirectoryCatalog { byte_skip, version, nodes, chunks, extents })
}
