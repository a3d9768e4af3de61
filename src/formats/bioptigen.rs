//! Bioptigen `.OCT` reader.
//!
//! The header is a run of self-describing fields:
//!
//! ```text
//! u32 keylength | key (UTF-8) | u32 dataLength | value (dataLength bytes)
//! ```
//!
//! Integer values are little-endian and `dataLength` bytes wide.  The frame
//! stack follows; each frame has its own field header and then
//! `linelength × framelines` u16 samples plus a 4-byte trailer.  Cataloguing
//! records every frame's pixel span without reading it.
//!
//! There is no magic number.  A header that fails to decode (bad UTF-8 in a
//! key, an implausible length, EOF) is reported as a format mismatch so that
//! `.oct` files can fall back to the Optovue reader.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};

use crate::error::{OctError, Result};
use crate::frames::{load_frames, Buffering, FrameBuffer, FrameCatalog, FrameEntry, FrameGeometry, ScanType};
use crate::record::{
    lazy, record, uint_le, utf8, DecodeError, Field, Len, Record, Schema, SchemaTable, Span, F64LE,
    U16LE, U32LE,
};
use crate::volume::{PatientInfo, Volume, VolumeMetadata};

pub const FORMAT: &str = "Bioptigen OCT";

/// Bytes after each frame's pixels.
const FRAME_TRAILER: u64 = 4;

// ── Record layouts ───────────────────────────────────────────────────────────

pub static HEADER_FIELD: Schema = Schema {
    name: "boct_field",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
    ],
};

pub static INT_FIELD: Schema = Schema {
    name: "boct_int",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
        Field::new("value", uint_le(Len::Field("data_length"))),
    ],
};

pub static FLOAT_FIELD: Schema = Schema {
    name: "boct_float",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
        Field::new("value", F64LE),
    ],
};

pub static STR_FIELD: Schema = Schema {
    name: "boct_str",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
        Field::new("value", utf8(Len::Field("data_length"))),
    ],
};

pub static DATE: Schema = Schema {
    name: "boct_date",
    fields: &[
        Field::new("year", U16LE),
        Field::new("month", U16LE),
        Field::new("dow", U16LE),
        Field::new("day", U16LE),
        Field::new("hour", U16LE),
        Field::new("minute", U16LE),
        Field::new("second", U16LE),
        Field::new("millisecond", U16LE),
    ],
};

pub static DATE_FIELD: Schema = Schema {
    name: "boct_date_field",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
        Field::new("value", record(&DATE)),
    ],
};

pub static LAZY_FIELD: Schema = Schema {
    name: "boct_lazy",
    fields: &[
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
        Field::new("value", lazy(Len::Field("data_length"))),
    ],
};

pub static FILE_HEADER: Schema = Schema {
    name: "boct_header",
    fields: &[
        Field::new("magic", U32LE),
        Field::new("version", U16LE),
        Field::new("frameheader", record(&HEADER_FIELD)),
        Field::new("framecount", record(&INT_FIELD)),
        Field::new("linecount", record(&INT_FIELD)),
        Field::new("linelength", record(&INT_FIELD)),
        Field::new("sampleformat", record(&INT_FIELD)),
        Field::new("description", record(&STR_FIELD)),
        Field::new("xmin", record(&FLOAT_FIELD)),
        Field::new("xmax", record(&FLOAT_FIELD)),
        Field::new("xcaption", record(&STR_FIELD)),
        Field::new("ymin", record(&FLOAT_FIELD)),
        Field::new("ymax", record(&FLOAT_FIELD)),
        Field::new("ycaption", record(&STR_FIELD)),
        Field::new("scantype", record(&INT_FIELD)),
        Field::new("scandepth", record(&FLOAT_FIELD)),
        Field::new("scanlength", record(&FLOAT_FIELD)),
        Field::new("azscanlength", record(&FLOAT_FIELD)),
        Field::new("elscanlength", record(&FLOAT_FIELD)),
        Field::new("objectdistance", record(&FLOAT_FIELD)),
        Field::new("scanangle", record(&FLOAT_FIELD)),
        Field::new("scans", record(&INT_FIELD)),
        Field::new("frames", record(&INT_FIELD)),
        Field::new("dopplerflag", record(&INT_FIELD)),
        Field::new("config", record(&LAZY_FIELD)),
        Field::new("trailer", U32LE),
    ],
};

pub static FRAME_HEADER: Schema = Schema {
    name: "boct_frame",
    fields: &[
        Field::new("framedata", record(&HEADER_FIELD)),
        Field::new("framedatetime", record(&DATE_FIELD)),
        Field::new("frametimestamp", record(&FLOAT_FIELD)),
        Field::new("framelines", record(&INT_FIELD)),
        Field::new("keylength", U32LE),
        Field::new("key", utf8(Len::Field("keylength"))),
        Field::new("data_length", U32LE),
    ],
};

pub static SCHEMAS: SchemaTable = SchemaTable::new(&[
    &HEADER_FIELD,
    &INT_FIELD,
    &FLOAT_FIELD,
    &STR_FIELD,
    &DATE,
    &DATE_FIELD,
    &LAZY_FIELD,
    &FILE_HEADER,
    &FRAME_HEADER,
]);

// ── Field access ─────────────────────────────────────────────────────────────

fn int_value(header: &Record, field: &'static str) -> Result<u64> {
    Ok(header.record(field)?.uint("value")?)
}

fn frame_time(date: &Record) -> Result<Option<NaiveDateTime>> {
    let part = |f: &'static str| date.uint(f).map(|v| v as u32);
    let (hour, minute, second, milli) = (part("hour")?, part("minute")?, part("second")?, part("millisecond")?);
    let day = NaiveDate::from_ymd_opt(part("year")? as i32, part("month")?, part("day")?);
    Ok(day.and_then(|d| d.and_hms_milli_opt(hour, minute, second, milli)))
}

/// A decode failure while probing the header means "not this format".
fn header_error(e: DecodeError) -> OctError {
    if e.is_shape_mismatch() {
        OctError::mismatch(FORMAT, format!("header does not decode: {e}"))
    } else {
        e.into()
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Decode the file header from offset 0, leaving the reader at the first
/// frame.  Anything that does not decode is a [`OctError::FormatMismatch`].
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<Record> {
    reader.seek(SeekFrom::Start(0))?;
    FILE_HEADER.decode(reader).map_err(header_error)
}

/// Decode the header and record every frame's pixel span.
pub fn catalog<R: Read + Seek>(reader: &mut R) -> Result<FrameCatalog> {
    let header = read_header(reader)?;
    let first_frame = reader.stream_position()?;
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(first_frame))?;

    let framecount = int_value(&header, "framecount")? as usize;
    let linelength = int_value(&header, "linelength")?;
    let code = int_value(&header, "scantype")?;
    let scan_type = ScanType::from_code(code)
        .ok_or_else(|| OctError::Format(format!("{FORMAT}: unknown scan type {code}")))?;
    let frames_per_volume = int_value(&header, "frames")? as usize;
    let scans = int_value(&header, "scans")? as usize;

    let mut frames = Vec::with_capacity(framecount.min(4096));
    for index in 0..framecount {
        let fh = FRAME_HEADER
            .decode(reader)
            .map_err(|e| OctError::Format(format!("{FORMAT}: frame {index} header: {e}")))?;
        let lines = fh.record("framelines")?.uint("value")?;
        let offset = reader.stream_position()?;
        let len = linelength
            .checked_mul(lines)
            .and_then(|n| n.checked_mul(2))
            .ok_or_else(|| {
                OctError::Format(format!("{FORMAT}: frame {index} of {lines} lines x {linelength} samples overflows"))
            })?;
        let next = offset
            .checked_add(len)
            .and_then(|n| n.checked_add(FRAME_TRAILER))
            .filter(|&n| n <= file_len)
            .ok_or_else(|| OctError::Format(format!("{FORMAT}: frame {index} runs past the end of the file")))?;
        reader.seek(SeekFrom::Start(next))?;
        frames.push(FrameEntry {
            pixels:    Span { offset, len },
            lines:     lines as u32,
            timestamp: fh.record("frametimestamp")?.float("value").ok(),
            acquired:  frame_time(fh.record("framedatetime")?.record("value")?)?,
        });
    }

    let ascans = frames.first().map(|f| f.lines as usize).unwrap_or(0);
    let depth = usize::try_from(linelength)
        .map_err(|_| OctError::Format(format!("{FORMAT}: line length {linelength} too large")))?;
    let geometry = FrameGeometry::fold(frames_per_volume, scans, ascans, depth, scan_type)?;
    info!(
        "{FORMAT}: {} frames, {:?} scan, logical shape {:?}",
        frames.len(),
        scan_type,
        geometry.shape()
    );
    Ok(FrameCatalog { geometry, frames, header })
}

pub fn load<R: Read + Seek>(reader: &mut R, catalog: &FrameCatalog, buffering: Buffering) -> Result<FrameBuffer> {
    load_frames(reader, catalog, buffering)
}

/// One volume per time point.  The file carries no patient identity; the
/// file stem stands in for the patient id.
pub fn assemble_volumes<R: Read + Seek>(
    reader:    &mut R,
    catalog:   &FrameCatalog,
    buffering: Buffering,
    path:      &Path,
) -> Result<Vec<Volume>> {
    let buffer = load(reader, catalog, buffering)?;
    if let Some(e) = buffer.load_error() {
        debug!("{FORMAT}: assembling from a partial load ({e})");
    }
    let metadata = VolumeMetadata {
        patient: PatientInfo {
            patient_id: path.file_stem().map(|s| s.to_string_lossy().into_owned()),
            ..PatientInfo::default()
        },
        acquisition: catalog.frames.first().and_then(|f| f.acquired),
        ..VolumeMetadata::default()
    };
    Ok(buffer.into_volumes(&metadata)?)
}
