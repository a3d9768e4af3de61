//! Zeiss `.img` reader.
//!
//! A headerless `u8` stream of `rows × cols` slices, column-major within a
//! slice.  Trailing bytes that do not fill a slice are ignored.  Interlaced
//! acquisitions store two B-scans per slice, one in each half of the rows;
//! de-interlacing splits them apart and turns each a quarter counter-clockwise.
//!
//! # CZM frames
//! Zeiss DICOM exports carry JPEG 2000 frames obfuscated at the byte level.
//! [`unscramble`] undoes it for one frame; locating the frames inside the
//! DICOM dataset is left to the caller.

use std::io::{Read, Seek, SeekFrom};

use log::{debug, info};
use ndarray::Array2;

use crate::catalog::CatalogEntry;
use crate::config::ReadOptions;
use crate::error::{OctError, Result};
use crate::volume::{Slice, SliceData, Volume, VolumeMetadata};

pub const FORMAT: &str = "Zeiss IMG";

fn slice_size(options: &ReadOptions) -> Result<usize> {
    let size = options.zeiss_rows.checked_mul(options.zeiss_cols).unwrap_or(0);
    if size == 0 {
        return Err(OctError::Format(format!("{FORMAT}: slice shape {}x{}", options.zeiss_rows, options.zeiss_cols)));
    }
    if options.zeiss_interlaced && options.zeiss_rows % 2 != 0 {
        return Err(OctError::Format(format!("{FORMAT}: cannot de-interlace {} rows", options.zeiss_rows)));
    }
    Ok(size)
}

pub fn catalog<R: Seek>(reader: &mut R, options: &ReadOptions) -> Result<Vec<CatalogEntry>> {
    let size = slice_size(options)? as u64;
    let file_len = reader.seek(SeekFrom::End(0))?;
    let count = file_len / size;
    if file_len % size != 0 {
        debug!("{FORMAT}: {} trailing bytes ignored", file_len % size);
    }
    Ok((0..count)
        .map(|s| CatalogEntry { tag: format!("slice{s}"), offset: s * size, size })
        .collect())
}

/// Column-major slice → `(rows, cols)`.
fn column_major(raw: &[u8], rows: usize, cols: usize) -> Array2<u8> {
    Array2::from_shape_fn((rows, cols), |(r, c)| raw[c * rows + r])
}

/// Rows `[top, top + half)` of `slice`, turned a quarter counter-clockwise
/// to `(cols, half)`.
fn half_rotated(slice: &Array2<u8>, top: usize, half: usize) -> Array2<u8> {
    let cols = slice.ncols();
    Array2::from_shape_fn((cols, half), |(i, j)| slice[[top + j, cols - 1 - i]])
}

pub fn assemble_volumes<R: Read + Seek>(reader: &mut R, options: &ReadOptions) -> Result<Vec<Volume>> {
    let size = slice_size(options)?;
    let (rows, cols) = (options.zeiss_rows, options.zeiss_cols);

    reader.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let mut slices = Vec::new();
    for raw in data.chunks_exact(size) {
        let slice = column_major(raw, rows, cols);
        if options.zeiss_interlaced {
            let half = rows / 2;
            for top in [0, half] {
                slices.push(Slice { position: slices.len(), data: SliceData::U8(half_rotated(&slice, top, half)) });
            }
        } else {
            slices.push(Slice { position: slices.len(), data: SliceData::U8(slice) });
        }
    }
    info!("{FORMAT}: {} slices of {rows}x{cols}, interlaced={}", slices.len(), options.zeiss_interlaced);

    if slices.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![Volume::new("img", slices, VolumeMetadata::default())])
}

// ── CZM frame unscrambling ───────────────────────────────────────────────────

/// Start of the JP2 signature box.
const JP2_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x0C];
const XOR_KEY: u8 = 0x5A;
const XOR_STRIDE: usize = 7;
/// Fixed block boundaries of the scrambled layout.
const BLOCKS: [usize; 4] = [23, 276, 763, 993];
const HEAD_END: usize = 1016;
const JP2_HEAD: usize = 253;

/// Restore the JPEG 2000 codestream of one scrambled CZM frame.
///
/// Every seventh byte is XORed with `0x5A`, then eight blocks are put back
/// in order around the JP2 signature.  A frame without the signature, or
/// too short for the fixed block layout, is an [`OctError::Format`].
pub fn unscramble(frame: &[u8]) -> Result<Vec<u8>> {
    let mut f = frame.to_vec();
    for b in f.iter_mut().step_by(XOR_STRIDE) {
        *b ^= XOR_KEY;
    }

    let expected = f.len() * 3 / 5;
    let jp2 = f
        .windows(JP2_MARKER.len())
        .position(|w| w == &JP2_MARKER[..])
        .ok_or_else(|| OctError::Format("CZM frame has no JP2 signature".into()))?;
    if jp2 != expected {
        debug!("CZM JP2 signature at {jp2}, expected {expected}");
    }
    if jp2 < HEAD_END || jp2 + JP2_HEAD > f.len() {
        return Err(OctError::Format(format!(
            "CZM frame of {} bytes has its JP2 signature at {jp2}",
            f.len()
        )));
    }

    let [a, b, c, d] = BLOCKS;
    let mut out = Vec::with_capacity(f.len());
    for range in [
        jp2..jp2 + JP2_HEAD,
        d..HEAD_END,
        b..c,
        a..b,
        HEAD_END..jp2,
        0..a,
        c..d,
        jp2 + JP2_HEAD..f.len(),
    ] {
        out.extend_from_slice(&f[range]);
    }
    Ok(out)
}
