//! Chunk catalogs: a single pass over a container recording where each
//! piece of data lives, without reading pixel payloads.
//!
//! | Topology | Module | Formats |
//! |---|---|---|
//! | Sequential tagged chunks | [`tagged`] | Topcon FDA, FDS |
//! | Backward-linked directory pages | [`directory`] | Heidelberg E2E |
//! | Flat frame stack | [`crate::frames`] | Bioptigen OCT |
//! | Raw pixel stream | here ([`ChunkCatalog::Stream`]) | Optovue OCT, Zeiss IMG |

pub mod directory;
pub mod tagged;

use serde::Serialize;

pub use directory::{
    collect_entries, scan_directory, walk_directory_chain, ChunkDescriptor, DirectoryCatalog,
    DirectoryNode, SliceExtents,
};
pub use tagged::{scan_tagged, TaggedCatalog, TaggedChunk, TaggedHeader};

use crate::frames::FrameCatalog;

/// A named byte range, the common denominator of every catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub tag:    String,
    pub offset: u64,
    pub size:   u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topology", rename_all = "snake_case")]
pub enum ChunkCatalog {
    Tagged(TaggedCatalog),
    Directory(DirectoryCatalog),
    Frames(FrameCatalog),
    /// Headerless pixel stream split into named ranges by the reader.
    Stream { entries: Vec<CatalogEntry> },
}

impl ChunkCatalog {
    /// Flatten to `(tag, offset, size)` in catalog order.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        match self {
            ChunkCatalog::Tagged(cat) => cat
                .entries()
                .iter()
                .map(|c| CatalogEntry { tag: c.tag_str().into_owned(), offset: c.offset, size: c.size })
                .collect(),
            ChunkCatalog::Directory(cat) => cat
                .chunks
                .iter()
                .map(|c| CatalogEntry {
                    tag:    format!("{}/{}/{}", c.key, c.chunk_type, c.slice_id),
                    offset: c.start as u64 + cat.byte_skip,
                    size:   c.size as u64,
                })
                .collect(),
            ChunkCatalog::Frames(cat) => cat
                .frames
                .iter()
                .enumerate()
                .map(|(i, f)| CatalogEntry { tag: format!("frame{i}"), offset: f.pixels.offset, size: f.pixels.len })
                .collect(),
            ChunkCatalog::Stream { entries } => entries.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChunkCatalog::Tagged(cat) => cat.len(),
            ChunkCatalog::Directory(cat) => cat.chunks.len(),
            ChunkCatalog::Frames(cat) => cat.frames.len(),
            ChunkCatalog::Stream { entries } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
