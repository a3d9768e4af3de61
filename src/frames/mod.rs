//! Frame/buffer manager for stack-of-frames containers.
//!
//! A file stores one 2-D frame at a time, but the frames form a time series
//! of 3-D volumes: `(time, z, y, x) = (frames, scans, A-scans, depth)`.
//! [`FrameGeometry::fold`] derives that shape from the header, and
//! [`load_frames`] walks the `(time, z)` grid, reading each frame exactly
//! once from the span recorded at catalog time.
//!
//! # Storage
//! [`Buffering::Memory`] holds one contiguous `Array4<u16>`.
//! [`Buffering::Disk`] writes each frame into its own fixed-size slot of a
//! named temporary file, which is removed when the [`FrameBuffer`] drops.
//! Reads go through the same accessors either way.
//!
//! # Partial loads
//! An I/O error mid-walk stops the load.  Frames already placed stay in the
//! buffer; [`FrameBuffer::load_error`] says what stopped it.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, Array4};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{OctError, Result};
use crate::record::{Record, Span};
use crate::volume::{Slice, SliceData, Volume, VolumeMetadata};

// ── Geometry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Linear,
    Rect,
    Radial,
}

impl ScanType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ScanType::Linear),
            1 => Some(ScanType::Rect),
            3 => Some(ScanType::Radial),
            _ => None,
        }
    }
}

/// Logical 4-D shape of a frame stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    pub frames:    usize,
    pub scans:     usize,
    pub ascans:    usize,
    pub depth:     usize,
    pub scan_type: ScanType,
}

impl FrameGeometry {
    /// Linear scans keep their repeats on the frame axis:
    /// `frames *= scans; scans = 1`.  Other scan types are unchanged.
    ///
    /// A shape whose byte size does not fit in a `u64` is an
    /// [`OctError::Format`].
    pub fn fold(frames: usize, scans: usize, ascans: usize, depth: usize, scan_type: ScanType) -> Result<Self> {
        let (frames, scans) = match scan_type {
            ScanType::Linear => {
                let folded = frames.checked_mul(scans).ok_or_else(|| {
                    OctError::Format(format!("{frames} frames x {scans} scans overflows"))
                })?;
                (folded, 1)
            }
            ScanType::Rect | ScanType::Radial => (frames, scans),
        };
        let geometry = Self { frames, scans, ascans, depth, scan_type };
        if geometry.total_bytes().is_none() {
            return Err(OctError::Format(format!("frame stack of shape {:?} overflows", geometry.shape())));
        }
        Ok(geometry)
    }

    /// `(time, z, y, x)`.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.frames, self.scans, self.ascans, self.depth)
    }

    /// Byte size of the whole stack, `None` on overflow.
    pub fn total_bytes(&self) -> Option<u64> {
        let samples = self.frames.checked_mul(self.scans)?.checked_mul(self.frame_samples()?)?;
        u64::try_from(samples).ok()?.checked_mul(2)
    }

    fn frame_samples(&self) -> Option<usize> {
        self.ascans.checked_mul(self.depth)
    }

    /// Number of `(time, z)` cells.
    pub fn cells(&self) -> usize {
        self.frames.saturating_mul(self.scans)
    }

    pub fn frame_len(&self) -> usize {
        self.ascans.saturating_mul(self.depth)
    }

    pub fn frame_bytes(&self) -> u64 {
        (self.frame_len() as u64).saturating_mul(2)
    }

    /// On-disk frame `index` → `(time, z)`.
    pub fn cell(&self, index: usize) -> (usize, usize) {
        (index / self.scans, index % self.scans)
    }

    pub fn index(&self, t: usize, z: usize) -> usize {
        t * self.scans + z
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// One frame as recorded by the catalog pass.  Pixels are not read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameEntry {
    pub pixels:    Span,
    pub lines:     u32,
    pub timestamp: Option<f64>,
    pub acquired:  Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameCatalog {
    pub geometry: FrameGeometry,
    pub frames:   Vec<FrameEntry>,
    pub header:   Record,
}

// ── Buffer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Buffering {
    #[default]
    Memory,
    Disk,
}

enum Store {
    Memory(Array4<u16>),
    Disk(NamedTempFile),
}

pub struct FrameBuffer {
    geometry:      FrameGeometry,
    store:         Store,
    frames_loaded: usize,
    load_error:    Option<io::Error>,
}

impl FrameBuffer {
    /// Allocate zero-filled storage for `geometry`.  A shape too large to
    /// address is [`io::ErrorKind::InvalidInput`].
    pub fn new(geometry: FrameGeometry, buffering: Buffering) -> io::Result<Self> {
        let total = geometry.total_bytes().filter(|&n| n <= isize::MAX as u64).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("frame stack {:?} too large", geometry.shape()))
        })?;
        let store = match buffering {
            Buffering::Memory => Store::Memory(Array4::zeros(geometry.shape())),
            Buffering::Disk => {
                let file = tempfile::Builder::new().prefix("octx-frames-").tempfile()?;
                file.as_file().set_len(total)?;
                debug!("disk frame buffer at {}", file.path().display());
                Store::Disk(file)
            }
        };
        Ok(Self { geometry, store, frames_loaded: 0, load_error: None })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn buffering(&self) -> Buffering {
        match self.store {
            Store::Memory(_) => Buffering::Memory,
            Store::Disk(_) => Buffering::Disk,
        }
    }

    /// Backing file of a disk buffer.
    pub fn backing_path(&self) -> Option<&Path> {
        match &self.store {
            Store::Memory(_) => None,
            Store::Disk(file) => Some(file.path()),
        }
    }

    pub fn frames_loaded(&self) -> usize {
        self.frames_loaded
    }

    pub fn load_error(&self) -> Option<&io::Error> {
        self.load_error.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.load_error.is_none() && self.frames_loaded == self.geometry.cells()
    }

    fn check_cell(&self, t: usize, z: usize) -> io::Result<()> {
        if t >= self.geometry.frames || z >= self.geometry.scans {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cell ({t}, {z}) outside {:?}", self.geometry.shape()),
            ));
        }
        Ok(())
    }

    fn slot_offset(&self, t: usize, z: usize) -> u64 {
        self.geometry.index(t, z) as u64 * self.geometry.frame_bytes()
    }

    /// Store one frame of `ascans × depth` samples, row-major.
    pub fn write_frame(&mut self, t: usize, z: usize, samples: &[u16]) -> io::Result<()> {
        self.check_cell(t, z)?;
        if samples.len() != self.geometry.frame_len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame has {} samples, expected {}", samples.len(), self.geometry.frame_len()),
            ));
        }
        let offset = self.slot_offset(t, z);
        match &mut self.store {
            Store::Memory(arr) => {
                let mut frame = arr.slice_mut(s![t, z, .., ..]);
                for (dst, &src) in frame.iter_mut().zip(samples) {
                    *dst = src;
                }
            }
            Store::Disk(file) => {
                let mut bytes = vec![0u8; samples.len() * 2];
                LittleEndian::write_u16_into(samples, &mut bytes);
                let mut f = file.as_file();
                f.seek(SeekFrom::Start(offset))?;
                f.write_all(&bytes)?;
            }
        }
        Ok(())
    }

    /// One `(ascans, depth)` frame.
    pub fn frame(&self, t: usize, z: usize) -> io::Result<Array2<u16>> {
        self.check_cell(t, z)?;
        let (y, x) = (self.geometry.ascans, self.geometry.depth);
        match &self.store {
            Store::Memory(arr) => Ok(arr.slice(s![t, z, .., ..]).to_owned()),
            Store::Disk(file) => {
                let mut bytes = vec![0u8; self.geometry.frame_bytes() as usize];
                let mut f = file.as_file();
                f.seek(SeekFrom::Start(self.slot_offset(t, z)))?;
                f.read_exact(&mut bytes)?;
                let mut samples = vec![0u16; y * x];
                LittleEndian::read_u16_into(&bytes, &mut samples);
                Array2::from_shape_vec((y, x), samples)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }

    /// The 3-D volume at time `t`, shape `(scans, ascans, depth)`.
    pub fn volume(&self, t: usize) -> io::Result<Array3<u16>> {
        let g = self.geometry;
        let mut out = Array3::zeros((g.scans, g.ascans, g.depth));
        for z in 0..g.scans {
            out.slice_mut(s![z, .., ..]).assign(&self.frame(t, z)?);
        }
        Ok(out)
    }

    /// Copy everything into one in-memory array.
    pub fn to_array(&self) -> io::Result<Array4<u16>> {
        if let Store::Memory(arr) = &self.store {
            return Ok(arr.clone());
        }
        let mut out = Array4::zeros(self.geometry.shape());
        for t in 0..self.geometry.frames {
            out.slice_mut(s![t, .., .., ..]).assign(&self.volume(t)?);
        }
        Ok(out)
    }

    /// One [`Volume`] per time point; slices are the z frames.
    pub fn into_volumes(self, metadata: &VolumeMetadata) -> io::Result<Vec<Volume>> {
        let mut volumes = Vec::with_capacity(self.geometry.frames);
        for t in 0..self.geometry.frames {
            let slices = (0..self.geometry.scans)
                .map(|z| Ok(Slice { position: z, data: SliceData::U16(self.frame(t, z)?) }))
                .collect::<io::Result<Vec<_>>>()?;
            volumes.push(Volume::new(format!("t{t}"), slices, metadata.clone()));
        }
        Ok(volumes)
    }

    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            geometry:      self.geometry,
            buffering:     self.buffering(),
            frames_loaded: self.frames_loaded,
            complete:      self.is_complete(),
            load_error:    self.load_error.as_ref().map(|e| e.to_string()),
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("geometry", &self.geometry)
            .field("buffering", &self.buffering())
            .field("frames_loaded", &self.frames_loaded)
            .field("load_error", &self.load_error)
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct FrameSummary {
    pub geometry:      FrameGeometry,
    pub buffering:     Buffering,
    pub frames_loaded: usize,
    pub complete:      bool,
    pub load_error:    Option<String>,
}

// ── Loading ──────────────────────────────────────────────────────────────────

fn read_frame<R: Read + Seek>(reader: &mut R, span: Span, geometry: &FrameGeometry) -> io::Result<Vec<u16>> {
    let n = geometry.frame_bytes();
    reader.seek(SeekFrom::Start(span.offset))?;
    let mut bytes = vec![0u8; n as usize];
    reader.read_exact(&mut bytes)?;
    let mut samples = vec![0u16; geometry.frame_len()];
    LittleEndian::read_u16_into(&bytes, &mut samples);
    Ok(samples)
}

/// Materialise every frame of `catalog` into a new buffer.
///
/// Fewer catalogued frames than grid cells is a [`OctError::Format`].  A
/// frame whose span is not exactly one frame long is skipped with a warning.
/// An I/O error ends the walk and is kept on the returned buffer.
pub fn load_frames<R: Read + Seek>(
    reader:    &mut R,
    catalog:   &FrameCatalog,
    buffering: Buffering,
) -> Result<FrameBuffer> {
    let geometry = catalog.geometry;
    let cells = geometry.cells();
    if catalog.frames.len() < cells {
        return Err(OctError::Format(format!(
            "{} frames catalogued, geometry {:?} needs {cells}",
            catalog.frames.len(),
            geometry.shape()
        )));
    }
    if catalog.frames.len() > cells {
        warn!("ignoring {} frames beyond the {cells}-frame grid", catalog.frames.len() - cells);
    }

    let mut buffer = FrameBuffer::new(geometry, buffering)?;
    for (index, entry) in catalog.frames.iter().take(cells).enumerate() {
        let (t, z) = geometry.cell(index);
        if entry.pixels.len != geometry.frame_bytes() {
            warn!(
                "frame {index} (t={t}, z={z}) spans {} bytes, expected {}; skipped",
                entry.pixels.len,
                geometry.frame_bytes()
            );
            continue;
        }
        let placed = read_frame(reader, entry.pixels, &geometry).and_then(|s| buffer.write_frame(t, z, &s));
        if let Err(e) = placed {
            warn!("stopping frame load at frame {index} (t={t}, z={z}): {e}");
            buffer.load_error = Some(e);
            break;
        }
        buffer.frames_loaded += 1;
    }
    info!(
        "loaded {}/{cells} frames into {:?} buffer of shape {:?}",
        buffer.frames_loaded,
        buffering,
        geometry.shape()
    );
    Ok(buffer)
}
