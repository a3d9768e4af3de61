//! Heidelberg Engineering `.e2e` reader.
//!
//! The directory walk lives in [`crate::catalog::directory`].  This module
//! decodes the chunks it queues: each starts with a 60-byte header that
//! repeats the directory entry's key and slice id and adds `ind`
//! (0 = fundus, 1 = OCT) and the chunk type.
//!
//! | Type | Payload |
//! |---|---|
//! | 9 | patient identity |
//! | 11 | laterality |
//! | 9001 | device name strings |
//! | 9006 | scan pattern strings |
//! | 10004 | B-scan metadata (acquisition time) |
//! | 10019 | segmentation contour |
//! | 1073741824 | image |

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use log::{debug, trace, warn};
use ndarray::Array2;

use crate::assemble::{MetadataUpdate, VolumeAssembler};
use crate::catalog::{scan_directory, ChunkDescriptor, DirectoryCatalog};
use crate::codec::FloatLut;
use crate::config::ReadOptions;
use crate::error::{OctError, Result};
use crate::record::{
    array, ascii, Field, FieldType, Len, Record, Schema, SchemaTable, TextEncoding, F32LE, I32LE,
    U16LE, U32LE, U64LE, U8,
};
use crate::volume::{
    FundusImage, FundusPixels, Laterality, PatientInfo, Sex, SliceData, Volume, VolumeKey,
};

pub const CHUNK_MAGIC: &str = "MDbData";
pub const CHUNK_HEADER_SIZE: u64 = 60;

pub const CHUNK_PATIENT: u32 = 9;
pub const CHUNK_LATERALITY: u32 = 11;
pub const CHUNK_DEVICE_NAME: u32 = 9001;
pub const CHUNK_SCAN_PATTERN: u32 = 9006;
pub const CHUNK_BSCAN_METADATA: u32 = 10004;
pub const CHUNK_CONTOUR: u32 = 10019;
pub const CHUNK_IMAGE: u32 = 1_073_741_824;

const IND_FUNDUS: u64 = 0;
const IND_OCT: u64 = 1;

/// Julian day of 0001-01-01 minus one, for `NaiveDate::from_num_days_from_ce_opt`.
const JULIAN_CE_OFFSET: i64 = 1_721_425;

// ── Record layouts ───────────────────────────────────────────────────────────

pub static CHUNK_HEADER: Schema = Schema {
    name: "e2e_chunk",
    fields: &[
        Field::new("magic", ascii(12)),
        Field::new("unknown", U32LE),
        Field::new("unknown2", U32LE),
        Field::new("pos", U32LE),
        Field::new("size", U32LE),
        Field::new("unknown3", U32LE),
        Field::new("patient_db_id", U32LE),
        Field::new("study_id", U32LE),
        Field::new("series_id", U32LE),
        Field::new("slice_id", I32LE),
        Field::new("ind", U16LE),
        Field::new("unknown4", U16LE),
        Field::new("type", U32LE),
        Field::new("unknown5", U32LE),
    ],
};

pub static IMAGE_HEADER: Schema = Schema {
    name: "e2e_image",
    fields: &[
        Field::new("size", U32LE),
        Field::new("type", U32LE),
        Field::new("unknown", U32LE),
        Field::new("height", U32LE),
        Field::new("width", U32LE),
    ],
};

pub static PATIENT: Schema = Schema {
    name: "e2e_patient",
    fields: &[
        Field::new("first_name", ascii(31)),
        Field::new("surname", ascii(51)),
        Field::new("title", ascii(15)),
        Field::new("birthdate", U32LE),
        Field::new("sex", ascii(1)),
        Field::new("patient_id", ascii(25)),
    ],
};

pub static LATERALITY: Schema = Schema {
    name: "e2e_laterality",
    fields: &[
        Field::new("unknown", array(Len::Fixed(14), &U8)),
        Field::new("laterality", U8),
        Field::new("unknown2", U8),
        Field::new("unknown3", array(Len::Fixed(4), &U8)),
    ],
};

pub static CONTOUR: Schema = Schema {
    name: "e2e_contour",
    fields: &[
        Field::new("unknown0", U32LE),
        Field::new("id", U32LE),
        Field::new("unknown1", U32LE),
        Field::new("width", U32LE),
        Field::new("values", array(Len::Field("width"), &F32LE)),
    ],
};

pub static BSCAN_METADATA: Schema = Schema {
    name: "e2e_bscan_metadata",
    fields: &[
        Field::new("unknown1", U32LE),
        Field::new("img_size_y", U32LE),
        Field::new("img_size_x", U32LE),
        Field::new("pos_x1", F32LE),
        Field::new("pos_y1", F32LE),
        Field::new("pos_x2", F32LE),
        Field::new("pos_y2", F32LE),
        Field::new("zero1", U32LE),
        Field::new("unknown2", F32LE),
        Field::new("scale_y", F32LE),
        Field::new("unknown3", F32LE),
        Field::new("zero2", U32LE),
        Field::new("unknown4", array(Len::Fixed(2), &F32LE)),
        Field::new("zero3", U32LE),
        Field::new("img_size_width", U32LE),
        Field::new("num_images", U32LE),
        Field::new("akt_image", U32LE),
        Field::new("scan_type", U32LE),
        Field::new("centre_pos_x", F32LE),
        Field::new("centre_pos_y", F32LE),
        Field::new("unknown5", U32LE),
        Field::new("acquisition_time", U64LE),
        Field::new("num_ave", U32LE),
        Field::new("img_quality", F32LE),
    ],
};

/// Layout shared by the 9001–9008 string-list chunks.
pub static STRING_LIST: Schema = Schema {
    name: "e2e_string_list",
    fields: &[
        Field::new("n_strings", U32LE),
        Field::new("string_size", U32LE),
        Field::new(
            "text",
            array(
                Len::Field("n_strings"),
                &FieldType::Text { len: Len::Field("string_size"), encoding: TextEncoding::Utf16Le },
            ),
        ),
    ],
};

pub static SCHEMAS: SchemaTable = SchemaTable::new(&[
    &crate::catalog::directory::FILE_HEADER,
    &crate::catalog::directory::DIRECTORY_PAGE,
    &crate::catalog::directory::DIRECTORY_ENTRY,
    &CHUNK_HEADER,
    &IMAGE_HEADER,
    &PATIENT,
    &LATERALITY,
    &CONTOUR,
    &BSCAN_METADATA,
    &STRING_LIST,
]);

// ── Conversions ──────────────────────────────────────────────────────────────

/// Stored birthdate is a Julian day number times 64, offset by 14558805.
pub fn birth_date(raw: u32) -> Option<NaiveDate> {
    let julian = (raw as f64 / 64.0 - 14_558_805.0).floor() as i64;
    let days = i32::try_from(julian - JULIAN_CE_OFFSET).ok()?;
    NaiveDate::from_num_days_from_ce_opt(days).filter(|d| (1800..=2200).contains(&chrono::Datelike::year(d)))
}

/// Acquisition time is a count of 100 ns ticks since 1600-12-31 23:59.
pub fn acquisition_time(ticks: u64) -> Option<NaiveDateTime> {
    let epoch = NaiveDate::from_ymd_opt(1600, 12, 31)?.and_hms_opt(23, 59, 0)?;
    let micros = i64::try_from(ticks / 10).ok()?;
    epoch.checked_add_signed(Duration::microseconds(micros))
}

fn contour_value(v: f64) -> f64 {
    if v < 1e-9 || v as f32 == f32::MAX {
        f64::NAN
    } else {
        v
    }
}

// ── Chunk decoding ───────────────────────────────────────────────────────────

struct ChunkHeader {
    key:      VolumeKey,
    slice_id: i32,
    ind:      u64,
    kind:     u32,
    size:     u64,
}

impl ChunkHeader {
    fn from_record(rec: &Record) -> Result<Self> {
        let magic = rec.text("magic")?;
        if !magic.starts_with(CHUNK_MAGIC) {
            return Err(OctError::Format(format!("chunk magic {magic:?}")));
        }
        Ok(Self {
            key: VolumeKey::new(
                rec.uint("patient_db_id")? as u32,
                rec.uint("study_id")? as u32,
                rec.uint("series_id")? as u32,
            ),
            slice_id: rec.int("slice_id")? as i32,
            ind:      rec.uint("ind")?,
            kind:     rec.uint("type")? as u32,
            size:     rec.uint("size")?,
        })
    }
}

/// Read `expected` payload bytes, refusing to run past the chunk's size.
fn read_pixels<R: Read>(reader: &mut R, expected: usize, available: u64, context: String) -> Result<Vec<u8>> {
    if (expected as u64) > available {
        return Err(OctError::Reshape { context, expected, found: available as usize });
    }
    let mut buf = vec![0u8; expected];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => OctError::Reshape { context: context.clone(), expected, found: 0 },
        _ => e.into(),
    })?;
    Ok(buf)
}

fn first_text(rec: &Record) -> Result<Option<String>> {
    Ok(rec.texts("text")?.into_iter().map(|s| s.trim().to_owned()).find(|s| !s.is_empty()))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn read_chunk<R: Read + Seek>(
    reader:    &mut R,
    byte_skip: u64,
    desc:      &ChunkDescriptor,
    lut:       &FloatLut,
    asm:       &mut VolumeAssembler,
) -> Result<()> {
    reader.seek(SeekFrom::Start(desc.start as u64 + byte_skip))?;
    let chunk = ChunkHeader::from_record(&CHUNK_HEADER.decode(reader)?)?;
    trace!("chunk type {} for {} slice {}", chunk.kind, chunk.key, chunk.slice_id);

    match chunk.kind {
        CHUNK_PATIENT => match PATIENT.decode(reader) {
            Ok(rec) => {
                let patient = PatientInfo {
                    patient_id: non_empty(rec.text("patient_id")?),
                    first_name: non_empty(rec.text("first_name")?),
                    surname:    non_empty(rec.text("surname")?),
                    sex:        Sex::from_code(rec.text("sex")?),
                    birth_date: birth_date(rec.uint("birthdate")? as u32),
                };
                asm.update_metadata(chunk.key, MetadataUpdate::Patient(patient));
            }
            Err(e) => debug!("patient chunk for {} unreadable: {e}", chunk.key),
        },

        CHUNK_LATERALITY => {
            let rec = LATERALITY.decode(reader)?;
            match rec.uint("laterality")? {
                82 => asm.update_metadata(chunk.key, MetadataUpdate::Laterality(Laterality::Right)),
                76 => asm.update_metadata(chunk.key, MetadataUpdate::Laterality(Laterality::Left)),
                other => debug!("laterality byte {other} for {} not R/L", chunk.key),
            }
        }

        CHUNK_BSCAN_METADATA => {
            let rec = BSCAN_METADATA.decode(reader)?;
            if let Some(t) = acquisition_time(rec.uint("acquisition_time")?) {
                asm.update_metadata(chunk.key, MetadataUpdate::Acquisition(t));
            }
        }

        CHUNK_DEVICE_NAME => {
            if let Some(name) = first_text(&STRING_LIST.decode(reader)?)? {
                asm.update_metadata(chunk.key, MetadataUpdate::Device(name));
            }
        }

        CHUNK_SCAN_PATTERN => {
            if let Some(pattern) = first_text(&STRING_LIST.decode(reader)?)? {
                asm.update_metadata(chunk.key, MetadataUpdate::ScanPattern(pattern));
            }
        }

        CHUNK_CONTOUR => {
            let rec = CONTOUR.decode(reader)?;
            if rec.uint("width")? > 0 {
                let values = rec
                    .get("values")
                    .and_then(|v| v.as_array())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(contour_value)
                    .collect();
                let name = format!("contour{}", rec.uint("id")?);
                asm.add_contour(chunk.key, chunk.slice_id, name, values);
            }
        }

        CHUNK_IMAGE => {
            let image = IMAGE_HEADER.decode(reader)?;
            let height = image.uint("height")? as usize;
            let width = image.uint("width")? as usize;
            let count = height * width;
            if count == 0 {
                debug!("empty image chunk for {} slice {}", chunk.key, chunk.slice_id);
                return Ok(());
            }
            let available = chunk.size.saturating_sub(IMAGE_HEADER.fixed_size().unwrap_or(20));
            let context = format!("image {} slice {} ({height}x{width})", chunk.key, chunk.slice_id);
            match chunk.ind {
                IND_OCT => {
                    let bytes = read_pixels(reader, count * 2, available, context)?;
                    let mut raw = vec![0u16; count];
                    LittleEndian::read_u16_into(&bytes, &mut raw);
                    let pixels = Array2::from_shape_vec((height, width), lut.map_pixels(&raw))
                        .map_err(|e| OctError::Format(e.to_string()))?;
                    asm.place(chunk.key, chunk.slice_id, SliceData::F32(pixels));
                }
                IND_FUNDUS => {
                    let bytes = read_pixels(reader, count, available, context)?;
                    let pixels = Array2::from_shape_vec((height, width), bytes)
                        .map_err(|e| OctError::Format(e.to_string()))?;
                    asm.add_fundus(chunk.key, FundusPixels::Gray(pixels));
                }
                other => debug!("image chunk with ind {other} ignored"),
            }
        }

        other => trace!("chunk type {other} not decoded"),
    }
    Ok(())
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub fn catalog<R: Read + Seek>(reader: &mut R) -> Result<DirectoryCatalog> {
    scan_directory(reader)
}

/// Decode every queued chunk and assemble volumes and fundus images.
///
/// Per-chunk failures are logged and skipped.  Only I/O errors other than a
/// short read abort the pass.
pub fn assemble_volumes<R: Read + Seek>(
    reader:  &mut R,
    catalog: &DirectoryCatalog,
    options: &ReadOptions,
) -> Result<(Vec<Volume>, Vec<FundusImage>)> {
    let lut = FloatLut::new(options.intensity);
    let mut asm = VolumeAssembler::with_extents(&catalog.extents);

    for desc in &catalog.chunks {
        match read_chunk(reader, catalog.byte_skip, desc, &lut, &mut asm) {
            Ok(()) => {}
            Err(OctError::Io(e)) if e.kind() != io::ErrorKind::UnexpectedEof => return Err(e.into()),
            Err(e @ OctError::Reshape { .. }) => warn!("{e}; slice skipped"),
            Err(e) => warn!("chunk at offset {} skipped: {e}", desc.start),
        }
    }
    Ok(asm.finish())
}
