//! High-level [`Container`] API: format detection plus the catalog /
//! assemble / load operations for one file.
//!
//! ```no_run
//! use octx::container::Container;
//!
//! let container = Container::open("scan.e2e")?;
//! let catalog = container.catalog()?;
//! let (volumes, fundus) = container.assemble_volumes(&catalog)?;
//! for v in &volumes {
//!     println!("{}: {} slices", v.volume_id, v.len());
//! }
//! # Ok::<(), octx::error::OctError>(())
//! ```
//!
//! Every operation opens its own read-only handle, so a `Container` holds no
//! open file between calls.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::catalog::ChunkCatalog;
use crate::config::ReadOptions;
use crate::error::{OctError, Result};
use crate::formats::topcon::TopconKind;
use crate::formats::{bioptigen, heidelberg, optovue, topcon, zeiss};
use crate::frames::{Buffering, FrameBuffer};
use crate::record::Record;
use crate::volume::{FundusImage, Volume};

// ── FormatKind ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    HeidelbergE2e,
    TopconFda,
    TopconFds,
    BioptigenOct,
    OptovueOct,
    ZeissImg,
}

impl FormatKind {
    pub fn name(self) -> &'static str {
        match self {
            FormatKind::HeidelbergE2e => "Heidelberg E2E",
            FormatKind::TopconFda => "Topcon FDA",
            FormatKind::TopconFds => "Topcon FDS",
            FormatKind::BioptigenOct => bioptigen::FORMAT,
            FormatKind::OptovueOct => optovue::FORMAT,
            FormatKind::ZeissImg => zeiss::FORMAT,
        }
    }

    /// Format implied by the extension.  `.oct` in either case maps to
    /// [`FormatKind::BioptigenOct`]; [`Container::open`] checks the header and
    /// falls back to Optovue.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "e2e" => Ok(FormatKind::HeidelbergE2e),
            "fda" => Ok(FormatKind::TopconFda),
            "fds" => Ok(FormatKind::TopconFds),
            "oct" => Ok(FormatKind::BioptigenOct),
            "img" => Ok(FormatKind::ZeissImg),
            _ => Err(OctError::UnsupportedFormat(format!("extension {ext:?} of {}", path.display()))),
        }
    }

    fn topcon(self) -> Option<TopconKind> {
        match self {
            FormatKind::TopconFda => Some(TopconKind::Fda),
            FormatKind::TopconFds => Some(TopconKind::Fds),
            _ => None,
        }
    }
}

// ── Container ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Container {
    path:    PathBuf,
    kind:    FormatKind,
    options: ReadOptions,
}

impl Container {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, ReadOptions::default())
    }

    /// Detect the format of `path`.  An absent file is
    /// [`OctError::FileNotFound`]; an Optovue file without its sidecar is
    /// [`OctError::MissingSidecar`].
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if !path.is_file() {
            return Err(OctError::FileNotFound(path));
        }

        let mut kind = FormatKind::from_path(&path)?;
        if kind == FormatKind::BioptigenOct {
            let mut reader = BufReader::new(File::open(&path)?);
            match bioptigen::read_header(&mut reader) {
                Ok(_) => {}
                Err(e) if e.is_mismatch() => {
                    debug!("{}: {e}; trying {}", path.display(), optovue::FORMAT);
                    optovue::read_sidecar(&path)?;
                    kind = FormatKind::OptovueOct;
                }
                Err(e) => return Err(e),
            }
        }
        info!("{}: {}", path.display(), kind.name());
        Ok(Self { path, kind, options })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    fn reader(&self) -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(&self.path)?))
    }

    fn unsupported(&self, operation: &str) -> OctError {
        OctError::UnsupportedFormat(format!("{} has no {operation}", self.kind.name()))
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// One pass over the file recording where each chunk lives.
    pub fn catalog(&self) -> Result<ChunkCatalog> {
        let mut reader = self.reader()?;
        Ok(match self.kind {
            FormatKind::HeidelbergE2e => ChunkCatalog::Directory(heidelberg::catalog(&mut reader)?),
            FormatKind::TopconFda | FormatKind::TopconFds => {
                let kind = self.kind.topcon().ok_or_else(|| self.unsupported("tagged catalog"))?;
                ChunkCatalog::Tagged(topcon::catalog(&mut reader, kind)?)
            }
            FormatKind::BioptigenOct => ChunkCatalog::Frames(bioptigen::catalog(&mut reader)?),
            FormatKind::OptovueOct => ChunkCatalog::Stream {
                entries: optovue::catalog(&optovue::read_sidecar(&self.path)?),
            },
            FormatKind::ZeissImg => ChunkCatalog::Stream { entries: zeiss::catalog(&mut reader, &self.options)? },
        })
    }

    /// Decode and assemble every volume and fundus image described by
    /// `catalog`, which must come from [`Container::catalog`] on this file.
    pub fn assemble_volumes(&self, catalog: &ChunkCatalog) -> Result<(Vec<Volume>, Vec<FundusImage>)> {
        let mut reader = self.reader()?;
        let (volumes, fundus) = match (self.kind, catalog) {
            (FormatKind::HeidelbergE2e, ChunkCatalog::Directory(cat)) => {
                heidelberg::assemble_volumes(&mut reader, cat, &self.options)?
            }
            (FormatKind::TopconFda | FormatKind::TopconFds, ChunkCatalog::Tagged(cat)) => {
                let kind = self.kind.topcon().ok_or_else(|| self.unsupported("tagged catalog"))?;
                topcon::assemble_volumes(&mut reader, cat, kind)?
            }
            (FormatKind::BioptigenOct, ChunkCatalog::Frames(cat)) => (
                bioptigen::assemble_volumes(&mut reader, cat, self.options.buffering, &self.path)?,
                Vec::new(),
            ),
            (FormatKind::OptovueOct, ChunkCatalog::Stream { .. }) => {
                let specs = optovue::read_sidecar(&self.path)?;
                (optovue::assemble_volumes(&mut reader, &specs)?, Vec::new())
            }
            (FormatKind::ZeissImg, ChunkCatalog::Stream { .. }) => {
                (zeiss::assemble_volumes(&mut reader, &self.options)?, Vec::new())
            }
            _ => return Err(self.unsupported("volumes for a catalog of another format")),
        };
        info!(
            "{}: {} volumes, {} fundus images",
            self.path.display(),
            volumes.len(),
            fundus.len()
        );
        Ok((volumes, fundus))
    }

    /// [`Container::catalog`] followed by [`Container::assemble_volumes`].
    pub fn read_volumes(&self) -> Result<(Vec<Volume>, Vec<FundusImage>)> {
        let catalog = self.catalog()?;
        self.assemble_volumes(&catalog)
    }

    pub fn read_fundus(&self) -> Result<Vec<FundusImage>> {
        match self.kind {
            FormatKind::HeidelbergE2e | FormatKind::TopconFda | FormatKind::TopconFds => {
                Ok(self.read_volumes()?.1)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Load a frame-stack file into a 4-D buffer.
    pub fn load_frames(&self, catalog: &ChunkCatalog, buffering: Buffering) -> Result<FrameBuffer> {
        match catalog {
            ChunkCatalog::Frames(cat) => bioptigen::load(&mut self.reader()?, cat, buffering),
            _ => Err(self.unsupported("frame stack")),
        }
    }

    /// Every decodable metadata record of a tagged container, keyed by
    /// record name.
    pub fn read_all_metadata(&self) -> Result<BTreeMap<String, Record>> {
        let kind = self.kind.topcon().ok_or_else(|| self.unsupported("tagged metadata"))?;
        let mut reader = self.reader()?;
        let catalog = topcon::catalog(&mut reader, kind)?;
        topcon::read_all_metadata(&mut reader, &catalog)
    }
}
