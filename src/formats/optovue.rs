//! Optovue `.oct` reader.
//!
//! The `.oct` file is a bare little-endian `f32` stream.  Its layout lives
//! in a sidecar `<stem>.txt` (ISO-8859-1) next to it: every `Window Height`
//! line sets the current A-scan height, and a `Scan Length` line directly
//! followed by a `Scan Usage` line declares one volume of `usage` slices,
//! each `length × height` samples.  Every volume is read from the start of
//! the stream.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use encoding_rs::WINDOWS_1252;
use log::{debug, info, warn};
use ndarray::Array2;
use serde::Serialize;

use crate::catalog::CatalogEntry;
use crate::error::{OctError, Result};
use crate::volume::{Slice, SliceData, Volume, VolumeMetadata};

pub const FORMAT: &str = "Optovue OCT";

const SAMPLE_BYTES: u64 = 4;

/// One volume declared by the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSpec {
    pub height: usize,
    pub length: usize,
    pub number: usize,
}

impl ScanSpec {
    pub fn slice_len(&self) -> usize {
        self.height.saturating_mul(self.length)
    }

    pub fn slice_bytes(&self) -> u64 {
        (self.slice_len() as u64).saturating_mul(SAMPLE_BYTES)
    }

    pub fn volume_bytes(&self) -> u64 {
        self.slice_bytes().saturating_mul(self.number as u64)
    }
}

// ── Sidecar ──────────────────────────────────────────────────────────────────

pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("txt")
}

fn first_number(line: &str) -> Option<usize> {
    line.split_whitespace()
        .find(|t| t.chars().all(|c| c.is_ascii_digit()))
        .and_then(|t| t.parse().ok())
}

pub fn parse_sidecar(text: &str) -> Vec<ScanSpec> {
    let lines: Vec<&str> = text.lines().collect();
    let mut height = None;
    let mut specs = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.contains("Window Height") {
            height = first_number(line);
        }
        let Some(next) = lines.get(i + 1) else { continue };
        if !(line.contains("Scan Length") && next.contains("Scan Usage")) {
            continue;
        }
        match (height, first_number(line), first_number(next)) {
            (Some(height), Some(length), Some(number)) => specs.push(ScanSpec { height, length, number }),
            (None, ..) => warn!("{FORMAT}: scan declared on sidecar line {} before any window height", i + 1),
            _ => warn!("{FORMAT}: sidecar line {} has no scan length or usage count", i + 1),
        }
    }
    specs
}

/// Read and parse `<stem>.txt`.  Absent sidecar → [`OctError::MissingSidecar`].
pub fn read_sidecar(path: &Path) -> Result<Vec<ScanSpec>> {
    let sidecar = sidecar_path(path);
    let bytes = match fs::read(&sidecar) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(OctError::MissingSidecar(sidecar)),
        Err(e) => return Err(e.into()),
    };
    let (text, _, _) = WINDOWS_1252.decode(&bytes);
    let specs = parse_sidecar(&text);
    debug!("{FORMAT}: {} volumes declared in {}", specs.len(), sidecar.display());
    Ok(specs)
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// One entry per declared volume.  Every volume starts at offset 0.
pub fn catalog(specs: &[ScanSpec]) -> Vec<CatalogEntry> {
    specs
        .iter()
        .enumerate()
        .map(|(v, spec)| CatalogEntry { tag: format!("volume{v}"), offset: 0, size: spec.volume_bytes() })
        .collect()
}

/// `(length, height)` row-major → rotated a quarter turn counter-clockwise
/// to `(height, length)`.
fn rotate_slice(samples: &[f32], spec: &ScanSpec) -> Array2<f32> {
    let (h, l) = (spec.height, spec.length);
    Array2::from_shape_fn((h, l), |(i, j)| samples[j * h + (h - 1 - i)])
}

pub fn assemble_volumes<R: Read + Seek>(reader: &mut R, specs: &[ScanSpec]) -> Result<Vec<Volume>> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut volumes = Vec::with_capacity(specs.len());

    for (entry, spec) in catalog(specs).iter().zip(specs) {
        let mut slices = Vec::with_capacity(spec.number);
        for position in 0..spec.number {
            let start = entry.offset.saturating_add((position as u64).saturating_mul(spec.slice_bytes()));
            if start.saturating_add(spec.slice_bytes()) > file_len {
                let err = OctError::Reshape {
                    context:  format!("{} slice {position}", entry.tag),
                    expected: spec.slice_bytes() as usize,
                    found:    file_len.saturating_sub(start) as usize,
                };
                warn!("{err}; slice skipped");
                continue;
            }
            reader.seek(SeekFrom::Start(start))?;
            let mut bytes = vec![0u8; spec.slice_bytes() as usize];
            reader.read_exact(&mut bytes)?;
            let mut samples = vec![0f32; spec.slice_len()];
            LittleEndian::read_f32_into(&bytes, &mut samples);
            slices.push(Slice { position, data: SliceData::F32(rotate_slice(&samples, spec)) });
        }
        if slices.is_empty() {
            warn!("{FORMAT}: {} has no readable slices", entry.tag);
            continue;
        }
        volumes.push(Volume::new(entry.tag.clone(), slices, VolumeMetadata::default()));
    }
    info!("{FORMAT}: {} of {} declared volumes read", volumes.len(), specs.len());
    Ok(volumes)
}
