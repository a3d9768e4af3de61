//! Topcon `.fda` / `.fds` reader.
//!
//! Both variants share the tagged-chunk layout of
//! [`crate::catalog::tagged`] and most record layouts.  Chunk tags are
//! `@`-prefixed upper-case names; the record schema for a tag is its name
//! without the `@`, lower-cased (`@PATIENT_INFO_02` → `patient_info_02`).
//!
//! # Pixel chunks
//! | Tag | Variant | Payload after the header |
//! |---|---|---|
//! | `@IMG_JPEG` | FDA | per slice: `i32` length, JPEG bytes |
//! | `@IMG_MOT_COMP_03` | FDA | `u16` stack, slice-major, row-major within a slice |
//! | `@IMG_SCAN_03` | FDS | as `@IMG_MOT_COMP_03` |
//! | `@IMG_FUNDUS` | FDA | colour JPEG |
//! | `@IMG_TRC_02` | both | grayscale JPEG |
//! | `@IMG_OBS` | FDS | interleaved BGR bytes |
//! | `@CONTOUR_INFO` | both | `u16` layer heights, one row per slice |

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use ndarray::{Array2, Array3};
use serde::Serialize;

use crate::catalog::{scan_tagged, TaggedCatalog, TaggedChunk};
use crate::error::{OctError, Result};
use crate::record::{
    array, ascii, Field, Len, Record, RecordFamily, Schema, SchemaTable, Variants, F32LE, F64LE,
    U16LE, U32LE, U8,
};
use crate::volume::{
    Contours, EncodedFormat, FundusImage, FundusPixels, Laterality, PatientInfo, Sex, Slice,
    SliceData, Volume, VolumeMetadata,
};

pub const FILE_CODE: &[u8; 4] = b"FOCT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopconKind {
    Fda,
    Fds,
}

impl TopconKind {
    pub fn name(self) -> &'static str {
        match self {
            TopconKind::Fda => "Topcon FDA",
            TopconKind::Fds => "Topcon FDS",
        }
    }

    /// Candidate OCT chunk tags, in order of preference.
    fn oct_tags(self) -> &'static [&'static str] {
        match self {
            TopconKind::Fda => &["@IMG_JPEG", "@IMG_MOT_COMP_03"],
            TopconKind::Fds => &["@IMG_SCAN_03"],
        }
    }
}

/// Chunks whose payload is pixels; `read_all_metadata` leaves them alone.
const PIXEL_TAGS: &[&str] = &["@IMG_JPEG", "@IMG_FUNDUS", "@IMG_TRC_02", "@CONTOUR_INFO", "@IMG_OBS"];

const LAYER_NAMES: &[(&str, &str)] = &[
    ("MULTILAYERS_1", "ILM"),
    ("MULTILAYERS_2", "RNFL_GCL"),
    ("MULTILAYERS_3", "GCL_IPL"),
    ("MULTILAYERS_4", "IPL_INL"),
    ("MULTILAYERS_5", "MZ_EZ"),
    ("MULTILAYERS_6", "IZ_RPE"),
    ("MULTILAYERS_7", "BM"),
    ("MULTILAYERS_8", "INL_OPL"),
    ("MULTILAYERS_9", "ELM"),
    ("MULTILAYERS_10", "CSI"),
];

// ── Record layouts ───────────────────────────────────────────────────────────

pub static IMG_JPEG: Schema = Schema {
    name: "img_jpeg",
    fields: &[
        Field::new("scan_mode", U8),
        Field::new("unknown1", U32LE),
        Field::new("unknown2", U32LE),
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("number_slices", U32LE),
        Field::new("unknown3", U32LE),
    ],
};

const OCT_STACK_FIELDS: &[Field] = &[
    Field::new("scan_mode", U8),
    Field::new("width", U32LE),
    Field::new("height", U32LE),
    Field::new("bits_per_pixel", U32LE),
    Field::new("number_slices", U32LE),
    Field::new("format", U8),
    Field::new("size", U32LE),
];

pub static IMG_MOT_COMP_03: Schema = Schema { name: "img_mot_comp_03", fields: OCT_STACK_FIELDS };
pub static IMG_SCAN_03: Schema = Schema { name: "img_scan_03", fields: OCT_STACK_FIELDS };

pub static IMG_MOT_COMP_02: Schema = Schema {
    name: "img_mot_comp_02",
    fields: &[
        Field::new("temp", U8),
        Field::new("motion_width", U32LE),
        Field::new("motion_height", U32LE),
        Field::new("motion_depth", U32LE),
        Field::new("motion_number", U32LE),
        Field::new("motion_format", U8),
        Field::new("motion_start_x_pos", U32LE),
        Field::new("motion_start_y_pos", U32LE),
        Field::new("motion_end_x_pos", U32LE),
        Field::new("motion_end_y_pos", U32LE),
        Field::new("size", U32LE),
    ],
};

pub static IMG_MOT_COMP: Schema = Schema {
    name: "img_mot_comp",
    fields: &[
        Field::new("motion_width", U32LE),
        Field::new("motion_height", U32LE),
        Field::new("motion_depth", U32LE),
        Field::new("size", U32LE),
    ],
};

pub static IMG_FUNDUS: Schema = Schema {
    name: "img_fundus",
    fields: &[
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("bits_per_pixel", U32LE),
        Field::new("number_slices", U32LE),
        Field::new("format", ascii(4)),
        Field::new("size", U32LE),
    ],
};

const RASTER_FIELDS: &[Field] = &[
    Field::new("width", U32LE),
    Field::new("height", U32LE),
    Field::new("bits_per_pixel", U32LE),
    Field::new("number_slices", U32LE),
    Field::new("format", U8),
    Field::new("size", U32LE),
];

pub static IMG_TRC_02: Schema = Schema { name: "img_trc_02", fields: RASTER_FIELDS };
pub static IMG_OBS: Schema = Schema { name: "img_obs", fields: RASTER_FIELDS };

pub static IMG_TRC: Schema = Schema {
    name: "img_trc",
    fields: &[
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("bits_per_pixel", U32LE),
        Field::new("size", U32LE),
    ],
};

pub static IMG_PROJECTION: Schema = Schema {
    name: "img_projection",
    fields: &[
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("bits_per_pixel", U32LE),
        Field::new("format", U32LE),
        Field::new("size", U32LE),
    ],
};

pub static HW_INFO_03: Schema = Schema {
    name: "hw_info_03",
    fields: &[
        Field::new("model_name", ascii(16)),
        Field::new("serial_number", ascii(16)),
        Field::new("spect_sn", ascii(16)),
        Field::new("rom_ver", ascii(16)),
        Field::new("unknown", ascii(16)),
        Field::new("eq_calib_date", array(Len::Fixed(5), &U16LE)),
        Field::new("spect_calib_date", array(Len::Fixed(5), &U16LE)),
    ],
};

const HW_INFO_FIELDS: &[Field] = &[
    Field::new("model_name", ascii(16)),
    Field::new("serial_number", ascii(16)),
    Field::new("spect_sn", ascii(16)),
    Field::new("rom_ver", ascii(16)),
    Field::new("eq_calib_date", array(Len::Fixed(3), &U16LE)),
    Field::new("spect_calib_date", array(Len::Fixed(3), &U16LE)),
];

pub static HW_INFO_02: Schema = Schema { name: "hw_info_02", fields: HW_INFO_FIELDS };
pub static HW_INFO_01: Schema = Schema { name: "hw_info_01", fields: HW_INFO_FIELDS };

pub static PATIENT_INFO_02: Schema = Schema {
    name: "patient_info_02",
    fields: &[
        Field::new("patient_id", ascii(32)),
        Field::new("first_name", ascii(32)),
        Field::new("last_name", ascii(32)),
        Field::new("mid_name", ascii(8)),
        Field::new("sex", U8),
        Field::new("birth_date", array(Len::Fixed(3), &U16LE)),
        Field::new("occup_reg", array(Len::Fixed(40), &U8)),
        Field::new("r_date", array(Len::Fixed(3), &U16LE)),
        Field::new("record_id", array(Len::Fixed(16), &U8)),
        Field::new("lv_date", array(Len::Fixed(3), &U16LE)),
        Field::new("physician", array(Len::Fixed(128), &U8)),
        Field::new("zip_code", array(Len::Fixed(12), &U8)),
        Field::new("addr", array(Len::Fixed(96), &U8)),
        Field::new("phones", array(Len::Fixed(32), &U8)),
        Field::new("nx_date", array(Len::Fixed(6), &U16LE)),
        Field::new("multipurpose_field", array(Len::Fixed(60), &U8)),
        Field::new("descp", array(Len::Fixed(64), &U8)),
        Field::new("reserved", array(Len::Fixed(32), &U8)),
    ],
};

pub static FILE_INFO: Schema = Schema {
    name: "file_info",
    fields: &[
        Field::new("unknown1", U32LE),
        Field::new("unknown2", U32LE),
        Field::new("version", ascii(32)),
    ],
};

pub static FDA_FILE_INFO: Schema = Schema {
    name: "fda_file_info",
    fields: &[
        Field::new("unknown1", U32LE),
        Field::new("unknown2", U32LE),
        Field::new("version", array(Len::Fixed(32), &U8)),
    ],
};

pub static CAPTURE_INFO_02: Schema = Schema {
    name: "capture_info_02",
    fields: &[
        Field::new("eye", U8),
        Field::new("scan_mode", U8),
        Field::new("session_id", U32LE),
        Field::new("label", ascii(100)),
        Field::new("cap_date", array(Len::Fixed(6), &U16LE)),
    ],
};

pub static CAPTURE_INFO: Schema = Schema {
    name: "capture_info",
    fields: &[
        Field::new("eye", U8),
        Field::new("cap_date", array(Len::Fixed(6), &U16LE)),
    ],
};

pub static PARAM_SCAN_04: Schema = Schema {
    name: "param_scan_04",
    fields: &[
        Field::new("fixation", U32LE),
        Field::new("mirror_pos", U32LE),
        Field::new("polar", U32LE),
        Field::new("x_dimension_mm", F64LE),
        Field::new("y_dimension_mm", F64LE),
        Field::new("z_resolution_um", F64LE),
        Field::new("comp_eff_2", F64LE),
        Field::new("comp_eff_3", F64LE),
        Field::new("base_pos", U8),
        Field::new("used_calib_data", U8),
    ],
};

pub static PARAM_SCAN_02: Schema = Schema {
    name: "param_scan_02",
    fields: &[
        Field::new("scan_mode", U8),
        Field::new("light_level", U32LE),
        Field::new("fixation", U32LE),
        Field::new("mirror_pos", U32LE),
        Field::new("nd", U32LE),
        Field::new("polar", U32LE),
        Field::new("x_dimension_mm", F64LE),
        Field::new("y_dimension_mm", F64LE),
        Field::new("z_resolution_um", F64LE),
        Field::new("comp_eff_2", F64LE),
        Field::new("comp_eff_3", F64LE),
        Field::new("noise_thresh", F64LE),
        Field::new("range_adj", F64LE),
        Field::new("base_pos", U8),
    ],
};

pub static PARAM_OBS_02: Schema = Schema {
    name: "param_obs_02",
    fields: &[
        Field::new("kind", U16LE),
        Field::new("marker", array(Len::Fixed(2), &U16LE)),
        Field::new("camera_model", ascii(12)),
        Field::new("image_quality", ascii(24)),
        Field::new("unknown1", U16LE),
        Field::new("unknown2", U16LE),
        Field::new("unknown3", U16LE),
        Field::new("color_temp", ascii(24)),
        Field::new("unknown4", U16LE),
        Field::new("zeros", array(Len::Fixed(12), &U8)),
    ],
};

pub static PARAM_OBS_02_SHORT: Schema = Schema {
    name: "param_obs_02_short",
    fields: &[
        Field::new("kind", U16LE),
        Field::new("marker", array(Len::Fixed(2), &U16LE)),
    ],
};

/// `@PARAM_OBS_02` comes in two sizes.
pub static PARAM_OBS: RecordFamily = RecordFamily {
    name:     "param_obs_02",
    variants: Variants::BySize(&[(90, &PARAM_OBS_02), (6, &PARAM_OBS_02_SHORT)]),
};

pub static EFFECTIVE_SCAN_RANGE: Schema = Schema {
    name: "effective_scan_range",
    fields: &[
        Field::new("bounding_box_fundus_pixel", array(Len::Fixed(4), &U32LE)),
        Field::new("bounding_box_trc_pixel", array(Len::Fixed(4), &U32LE)),
    ],
};

pub static REGIST_INFO: Schema = Schema {
    name: "regist_info",
    fields: &[
        Field::new("flag", U8),
        Field::new("unknown", array(Len::Fixed(2), &U32LE)),
        Field::new("bounding_box_in_fundus_pixels", array(Len::Fixed(4), &U32LE)),
        Field::new("version", ascii(32)),
        Field::new("bounding_box_in_trc_pixels", array(Len::Fixed(4), &U32LE)),
    ],
};

pub static REGIST_SCAN_02: Schema = Schema {
    name: "regist_scan_02",
    fields: &[
        Field::new("clr_scan_region", array(Len::Fixed(4), &U32LE)),
        Field::new("obs_scan_region", array(Len::Fixed(4), &U32LE)),
    ],
};

pub static RESULT_CORNEA_CURVE: Schema = Schema {
    name: "result_cornea_curve",
    fields: &[
        Field::new("id", array(Len::Fixed(20), &U8)),
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("version", array(Len::Fixed(32), &U8)),
    ],
};

pub static RESULT_CORNEA_THICKNESS: Schema = Schema {
    name: "result_cornea_thickness",
    fields: &[
        Field::new("version", array(Len::Fixed(32), &U8)),
        Field::new("id", array(Len::Fixed(20), &U8)),
        Field::new("width", U32LE),
        Field::new("height", U32LE),
    ],
};

pub static CONTOUR_INFO: Schema = Schema {
    name: "contour_info",
    fields: &[
        Field::new("id", ascii(20)),
        Field::new("method", U8),
        Field::new("format", U8),
        Field::new("width", U32LE),
        Field::new("height", U32LE),
        Field::new("size", U32LE),
    ],
};

pub static FAST_Q2_INFO: Schema = Schema {
    name: "fast_q2_info",
    fields: &[Field::new("various_quality_statistics", array(Len::Fixed(6), &F32LE))],
};

pub static GLA_LITTMANN_01: Schema = Schema {
    name: "gla_littmann_01",
    fields: &[
        Field::new("unknown1", U32LE),
        Field::new("unknown2", U32LE),
    ],
};

pub static MAIN_MODULE_INFO: Schema = Schema {
    name: "main_module_info",
    fields: &[
        Field::new("software_name", ascii(128)),
        Field::new("file_version", array(Len::Fixed(4), &U16LE)),
        Field::new("string", ascii(128)),
    ],
};

pub static THUMBNAIL: Schema = Schema {
    name: "thumbnail",
    fields: &[Field::new("size", U32LE)],
};

pub static PATIENTEXT_INFO: Schema = Schema {
    name: "patientext_info",
    fields: &[Field::new("unknown", array(Len::Fixed(128), &U8))],
};

pub static SCHEMAS: SchemaTable = SchemaTable::new(&[
    &IMG_JPEG,
    &IMG_MOT_COMP_03,
    &IMG_SCAN_03,
    &IMG_MOT_COMP_02,
    &IMG_MOT_COMP,
    &IMG_FUNDUS,
    &IMG_TRC_02,
    &IMG_OBS,
    &IMG_TRC,
    &IMG_PROJECTION,
    &HW_INFO_03,
    &HW_INFO_02,
    &HW_INFO_01,
    &PATIENT_INFO_02,
    &FILE_INFO,
    &FDA_FILE_INFO,
    &CAPTURE_INFO_02,
    &CAPTURE_INFO,
    &PARAM_SCAN_04,
    &PARAM_SCAN_02,
    &PARAM_OBS_02,
    &PARAM_OBS_02_SHORT,
    &EFFECTIVE_SCAN_RANGE,
    &REGIST_INFO,
    &REGIST_SCAN_02,
    &RESULT_CORNEA_CURVE,
    &RESULT_CORNEA_THICKNESS,
    &CONTOUR_INFO,
    &FAST_Q2_INFO,
    &GLA_LITTMANN_01,
    &MAIN_MODULE_INFO,
    &THUMBNAIL,
    &PATIENTEXT_INFO,
]);

/// `@PARAM_SCAN_04` → `param_scan_04`.
pub fn schema_name(tag: &str) -> String {
    tag.trim_start_matches('@').to_ascii_lowercase()
}

// ── Chunk helpers ────────────────────────────────────────────────────────────

fn decode_chunk<R: Read + Seek>(reader: &mut R, chunk: &TaggedChunk) -> Result<Option<Record>> {
    let tag = chunk.tag_str();
    reader.seek(SeekFrom::Start(chunk.offset))?;
    if tag == "@PARAM_OBS_02" {
        return Ok(Some(PARAM_OBS.decode(reader, chunk.size)?));
    }
    let Some(schema) = SCHEMAS.get(&schema_name(&tag)) else {
        return Ok(None);
    };
    if let Some(need) = schema.fixed_size() {
        if need > chunk.size {
            return Err(OctError::Format(format!("{tag}: {} bytes, layout needs {need}", chunk.size)));
        }
    }
    Ok(Some(schema.decode(reader)?))
}

/// Decode the first chunk tagged `tag`, if any.
fn decode_tag<R: Read + Seek>(reader: &mut R, catalog: &TaggedCatalog, tag: &str) -> Result<Option<Record>> {
    match catalog.first(tag.as_bytes()) {
        Some(chunk) => decode_chunk(reader, chunk),
        None => Ok(None),
    }
}

/// First of `tags` present and decodable; failures are logged.
fn first_record<R: Read + Seek>(reader: &mut R, catalog: &TaggedCatalog, tags: &[&str]) -> Option<Record> {
    for tag in tags {
        match decode_tag(reader, catalog, tag) {
            Ok(Some(rec)) => return Some(rec),
            Ok(None) => {}
            Err(e) => warn!("{tag} unreadable: {e}"),
        }
    }
    None
}

fn date(parts: &[u64]) -> Option<NaiveDate> {
    match parts {
        [y, m, d, ..] => NaiveDate::from_ymd_opt(*y as i32, *m as u32, *d as u32),
        _ => None,
    }
}

fn date_time(parts: &[u64]) -> Option<NaiveDateTime> {
    match parts {
        [_, _, _, h, mi, s, ..] => date(parts)?.and_hms_opt(*h as u32, *mi as u32, *s as u32),
        _ => None,
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn read_u16_payload<R: Read>(reader: &mut R, count: usize) -> io::Result<Vec<u16>> {
    let mut bytes = vec![0u8; count * 2];
    reader.read_exact(&mut bytes)?;
    let mut out = vec![0u16; count];
    LittleEndian::read_u16_into(&bytes, &mut out);
    Ok(out)
}

// ── OCT stack ────────────────────────────────────────────────────────────────

/// Dimensions from whichever OCT chunk header was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OctDims {
    pub width:         usize,
    pub height:        usize,
    pub number_slices: usize,
}

impl OctDims {
    fn from_record(rec: &Record) -> Result<Self> {
        Ok(Self {
            width:         rec.uint("width")? as usize,
            height:        rec.uint("height")? as usize,
            number_slices: rec.uint("number_slices")? as usize,
        })
    }
}

fn read_jpeg_slices<R: Read + Seek>(reader: &mut R, chunk: &TaggedChunk, dims: OctDims) -> Result<Vec<Slice>> {
    let mut slices = Vec::with_capacity(dims.number_slices);
    for position in 0..dims.number_slices {
        let pos = reader.stream_position()?;
        let len = reader.read_i32::<LittleEndian>()?;
        if len < 0 || pos + 4 + len as u64 > chunk.end() {
            warn!("@IMG_JPEG slice {position} declares {len} bytes past the chunk end; remaining slices dropped");
            break;
        }
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes)?;
        slices.push(Slice { position, data: SliceData::Encoded { format: EncodedFormat::Jpeg, bytes } });
    }
    Ok(slices)
}

fn read_raw_slices<R: Read + Seek>(reader: &mut R, chunk: &TaggedChunk, dims: OctDims) -> Result<Vec<Slice>> {
    let per_slice = dims.width * dims.height;
    let data_start = reader.stream_position()?;
    let mut slices = Vec::with_capacity(dims.number_slices);
    for position in 0..dims.number_slices {
        let start = data_start + (position * per_slice * 2) as u64;
        let end = start + (per_slice * 2) as u64;
        if end > chunk.end() {
            let err = OctError::Reshape {
                context:  format!("{} slice {position}", chunk.tag_str()),
                expected: per_slice * 2,
                found:    chunk.end().saturating_sub(start) as usize,
            };
            warn!("{err}; slice skipped");
            continue;
        }
        reader.seek(SeekFrom::Start(start))?;
        let raw = read_u16_payload(reader, per_slice)?;
        let pixels = Array2::from_shape_vec((dims.height, dims.width), raw)
            .map_err(|e| OctError::Format(e.to_string()))?;
        slices.push(Slice { position, data: SliceData::U16(pixels) });
    }
    Ok(slices)
}

/// Read the preferred OCT chunk.  [`OctError::MissingChunk`] if none is present.
pub fn read_oct_slices<R: Read + Seek>(
    reader:  &mut R,
    catalog: &TaggedCatalog,
    kind:    TopconKind,
) -> Result<(String, OctDims, Vec<Slice>)> {
    let chunk = kind
        .oct_tags()
        .iter()
        .find_map(|t| catalog.first(t.as_bytes()))
        .ok_or_else(|| OctError::MissingChunk(kind.oct_tags().join(" or ")))?;
    let tag = chunk.tag_str().into_owned();
    reader.seek(SeekFrom::Start(chunk.offset))?;

    let (dims, slices) = if tag == "@IMG_JPEG" {
        let dims = OctDims::from_record(&IMG_JPEG.decode(reader)?)?;
        (dims, read_jpeg_slices(reader, chunk, dims)?)
    } else {
        let dims = OctDims::from_record(&IMG_MOT_COMP_03.decode(reader)?)?;
        (dims, read_raw_slices(reader, chunk, dims)?)
    };
    debug!("{tag}: {}x{} x {} slices, {} read", dims.height, dims.width, dims.number_slices, slices.len());
    Ok((schema_name(&tag), dims, slices))
}

// ── Metadata ─────────────────────────────────────────────────────────────────

/// `[x, y, z]` spacing in mm.  FDA and FDS order the axes differently.
pub fn pixel_spacing(params: &Record, dims: OctDims, kind: TopconKind) -> Result<Option<[f64; 3]>> {
    let x = params.float("x_dimension_mm")?;
    let y = params.float("y_dimension_mm")?;
    let z = params.float("z_resolution_um")? / 1000.0;
    if dims.width == 0 || dims.height == 0 || dims.number_slices == 0 {
        return Ok(None);
    }
    Ok(Some(match kind {
        TopconKind::Fda => [x / dims.width as f64, y / dims.number_slices as f64, z],
        TopconKind::Fds => [x / dims.height as f64, z, y / dims.width as f64],
    }))
}

/// Segmentation layers as distance from the top of the scan, one entry per
/// slice.
pub fn read_contours<R: Read + Seek>(reader: &mut R, catalog: &TaggedCatalog, oct_height: usize) -> Contours {
    let mut contours = Contours::new();
    for chunk in catalog.get(b"@CONTOUR_INFO") {
        match read_contour(reader, chunk, oct_height) {
            Ok((name, rows)) => {
                contours.insert(name, rows);
            }
            Err(e) => warn!("@CONTOUR_INFO at offset {} unreadable: {e}", chunk.offset),
        }
    }
    contours
}

fn read_contour<R: Read + Seek>(
    reader:     &mut R,
    chunk:      &TaggedChunk,
    oct_height: usize,
) -> Result<(String, Vec<Option<Vec<f64>>>)> {
    reader.seek(SeekFrom::Start(chunk.offset))?;
    let header = CONTOUR_INFO.decode(reader)?;
    let width = header.uint("width")? as usize;
    let height = header.uint("height")? as usize;
    let need = CONTOUR_INFO.fixed_size().unwrap_or(34) + (width * height * 2) as u64;
    if need > chunk.size {
        return Err(OctError::Reshape {
            context:  format!("contour {}", header.text("id")?),
            expected: need as usize,
            found:    chunk.size as usize,
        });
    }
    let values = read_u16_payload(reader, width * height)?;

    // Rows are stored last slice first.
    let rows = values
        .chunks(width.max(1))
        .rev()
        .map(|row| Some(row.iter().map(|&v| oct_height as f64 - v as f64).collect()))
        .collect();

    let id = header.text("id")?;
    let name = LAYER_NAMES
        .iter()
        .find(|(k, _)| *k == id)
        .map(|(_, v)| (*v).to_owned())
        .unwrap_or_else(|| id.to_owned());
    Ok((name, rows))
}

fn patient_from(rec: &Record) -> Result<PatientInfo> {
    let sex = match rec.uint("sex")? {
        1 => Some(Sex::Male),
        2 => Some(Sex::Female),
        3 => Some(Sex::Other),
        _ => None,
    };
    Ok(PatientInfo {
        patient_id: non_empty(rec.text("patient_id")?),
        first_name: non_empty(rec.text("first_name")?),
        surname:    non_empty(rec.text("last_name")?),
        sex,
        birth_date: date(&rec.uints("birth_date")?),
    })
}

/// Volume-independent metadata: patient, capture and device.
pub fn read_volume_metadata<R: Read + Seek>(reader: &mut R, catalog: &TaggedCatalog) -> Result<VolumeMetadata> {
    let mut meta = VolumeMetadata::default();

    if let Some(rec) = first_record(reader, catalog, &["@PATIENT_INFO_02"]) {
        meta.patient = patient_from(&rec)?;
    }
    if let Some(rec) = first_record(reader, catalog, &["@CAPTURE_INFO_02", "@CAPTURE_INFO"]) {
        meta.laterality = match rec.uint("eye")? {
            0 => Some(Laterality::Right),
            1 => Some(Laterality::Left),
            _ => None,
        };
        meta.acquisition = date_time(&rec.uints("cap_date")?);
    }
    if let Some(rec) = first_record(reader, catalog, &["@HW_INFO_03", "@HW_INFO_02", "@HW_INFO_01"]) {
        meta.device = non_empty(rec.text("model_name")?);
    }
    Ok(meta)
}

// ── Fundus ───────────────────────────────────────────────────────────────────

fn read_encoded<R: Read + Seek>(reader: &mut R, chunk: &TaggedChunk, header: &Schema) -> Result<FundusPixels> {
    reader.seek(SeekFrom::Start(chunk.offset))?;
    let rec = header.decode(reader)?;
    let size = rec.uint("size")?;
    let available = chunk.size.saturating_sub(header.fixed_size().unwrap_or(0));
    if size > available {
        return Err(OctError::Reshape {
            context:  format!("{} payload", chunk.tag_str()),
            expected: size as usize,
            found:    available as usize,
        });
    }
    let mut bytes = vec![0u8; size as usize];
    reader.read_exact(&mut bytes)?;
    Ok(FundusPixels::Encoded { format: EncodedFormat::Jpeg, bytes })
}

/// Interleaved BGR → RGB `(rows, cols, 3)`.
fn read_bgr<R: Read + Seek>(reader: &mut R, chunk: &TaggedChunk) -> Result<FundusPixels> {
    reader.seek(SeekFrom::Start(chunk.offset))?;
    let rec = IMG_OBS.decode(reader)?;
    let width = rec.uint("width")? as usize;
    let height = rec.uint("height")? as usize;
    let size = rec.uint("size")? as usize;
    let expected = width * height * 3;
    let available = chunk.size.saturating_sub(IMG_OBS.fixed_size().unwrap_or(21)) as usize;
    if size != expected || expected > available {
        return Err(OctError::Reshape { context: "@IMG_OBS".into(), expected, found: size.min(available) });
    }
    let mut bytes = vec![0u8; expected];
    reader.read_exact(&mut bytes)?;
    let bgr = Array3::from_shape_vec((height, width, 3), bytes).map_err(|e| OctError::Format(e.to_string()))?;
    let rgb = Array3::from_shape_fn((height, width, 3), |(r, c, ch)| bgr[[r, c, 2 - ch]]);
    Ok(FundusPixels::Rgb(rgb))
}

pub fn read_fundus<R: Read + Seek>(
    reader:  &mut R,
    catalog: &TaggedCatalog,
    meta:    &VolumeMetadata,
) -> Vec<FundusImage> {
    let mut images = Vec::new();
    for chunk in catalog.entries() {
        let tag = chunk.tag_str();
        let pixels = match &*tag {
            "@IMG_FUNDUS" => read_encoded(reader, chunk, &IMG_FUNDUS),
            "@IMG_TRC_02" => read_encoded(reader, chunk, &IMG_TRC_02),
            "@IMG_OBS" => read_bgr(reader, chunk),
            _ => continue,
        };
        match pixels {
            Ok(image) => images.push(FundusImage {
                image_id:   schema_name(&tag),
                image,
                laterality: meta.laterality,
                patient_id: meta.patient.patient_id.clone(),
            }),
            Err(e) => warn!("{tag} at offset {} skipped: {e}", chunk.offset),
        }
    }
    images
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub fn catalog<R: Read + Seek>(reader: &mut R, kind: TopconKind) -> Result<TaggedCatalog> {
    scan_tagged(reader, FILE_CODE, kind.name())
}

/// The OCT volume (when present) and every fundus image.
pub fn assemble_volumes<R: Read + Seek>(
    reader:  &mut R,
    catalog: &TaggedCatalog,
    kind:    TopconKind,
) -> Result<(Vec<Volume>, Vec<FundusImage>)> {
    let mut meta = read_volume_metadata(reader, catalog)?;
    let fundus = read_fundus(reader, catalog, &meta);

    let (volume_id, dims, slices) = match read_oct_slices(reader, catalog, kind) {
        Ok(found) => found,
        Err(OctError::MissingChunk(tags)) => {
            info!("{}: no {tags} chunk, no OCT volume", kind.name());
            return Ok((Vec::new(), fundus));
        }
        Err(e) => return Err(e),
    };

    let params = first_record(reader, catalog, &["@PARAM_SCAN_04", "@PARAM_SCAN_02"]);
    meta.pixel_spacing = match params {
        Some(p) => pixel_spacing(&p, dims, kind)?,
        None => None,
    };
    meta.contours = read_contours(reader, catalog, dims.height);

    let volumes = if slices.is_empty() { Vec::new() } else { vec![Volume::new(volume_id, slices, meta)] };
    Ok((volumes, fundus))
}

/// Decode every catalogued chunk that has a record layout, keyed by schema
/// name.  Pixel chunks are left to the dedicated readers; a repeated tag
/// keeps its first occurrence.
pub fn read_all_metadata<R: Read + Seek>(reader: &mut R, catalog: &TaggedCatalog) -> Result<BTreeMap<String, Record>> {
    let mut out = BTreeMap::new();
    for chunk in catalog.entries() {
        let tag = chunk.tag_str();
        if PIXEL_TAGS.contains(&&*tag) {
            continue;
        }
        let name = schema_name(&tag);
        if out.contains_key(&name) {
            debug!("{tag} repeated; keeping the first");
            continue;
        }
        match decode_chunk(reader, chunk) {
            Ok(Some(rec)) => {
                out.insert(name, rec);
            }
            Ok(None) => debug!("{tag}: no record layout, skipped"),
            Err(OctError::Io(e)) if e.kind() != io::ErrorKind::UnexpectedEof => return Err(e.into()),
            Err(e) => warn!("{tag} unreadable: {e}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Write};

    fn container(chunks: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut buf = b"FOCTFDA".to_vec();
        buf.write_u32::<LittleEndian>(8).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        for (tag, payload) in chunks {
            buf.write_u8(tag.len() as u8).unwrap();
            buf.write_all(tag.as_bytes()).unwrap();
            buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            buf.write_all(payload).unwrap();
        }
        buf.write_u8(0).unwrap();
        buf
    }

    fn oct_stack(width: u32, height: u32, slices: u32) -> Vec<u8> {
        let mut p = vec![0u8];
        for v in [width, height, 16, slices] {
            p.write_u32::<LittleEndian>(v).unwrap();
        }
        p.write_u8(0).unwrap();
        p.write_u32::<LittleEndian>(width * height * slices * 2).unwrap();
        for i in 0..width * height * slices {
            p.write_u16::<LittleEndian>(i as u16).unwrap();
        }
        p
    }

    fn param_scan_04(x: f64, y: f64, z: f64) -> Vec<u8> {
        let mut p = Vec::new();
        for v in [0u32, 0, 0] {
            p.write_u32::<LittleEndian>(v).unwrap();
        }
        for v in [x, y, z, 0.0, 0.0] {
            p.write_f64::<LittleEndian>(v).unwrap();
        }
        p.extend_from_slice(&[0, 0]);
        p
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(IMG_JPEG.fixed_size(), Some(25));
        assert_eq!(IMG_MOT_COMP_03.fixed_size(), Some(22));
        assert_eq!(IMG_FUNDUS.fixed_size(), Some(24));
        assert_eq!(IMG_TRC_02.fixed_size(), Some(21));
        assert_eq!(CONTOUR_INFO.fixed_size(), Some(34));
        assert_eq!(PARAM_SCAN_04.fixed_size(), Some(54));
        assert_eq!(PARAM_OBS_02_SHORT.fixed_size(), Some(6));
        assert_eq!(PATIENT_INFO_02.fixed_size(), Some(615));
    }

    #[test]
    fn schema_names_follow_tags() {
        assert_eq!(schema_name("@PARAM_SCAN_04"), "param_scan_04");
        for name in SCHEMAS.names() {
            assert!(SCHEMAS.get(name).is_some());
        }
    }

    #[test]
    fn raw_stack_is_slice_major() {
        let bytes = container(&[("@IMG_MOT_COMP_03", oct_stack(3, 2, 2))]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let (id, dims, slices) = read_oct_slices(&mut cur, &cat, TopconKind::Fda).unwrap();
        assert_eq!(id, "img_mot_comp_03");
        assert_eq!(dims, OctDims { width: 3, height: 2, number_slices: 2 });
        assert_eq!(slices.len(), 2);
        match &slices[1].data {
            SliceData::U16(a) => {
                assert_eq!(a.dim(), (2, 3));
                assert_eq!(a[[0, 0]], 6);
                assert_eq!(a[[1, 2]], 11);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn truncated_stack_keeps_whole_slices() {
        let mut stack = oct_stack(2, 2, 3);
        stack.truncate(stack.len() - 2);
        let bytes = container(&[("@IMG_MOT_COMP_03", stack)]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let (_, _, slices) = read_oct_slices(&mut cur, &cat, TopconKind::Fda).unwrap();
        assert_eq!(slices.iter().map(|s| s.position).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn jpeg_slices_stay_encoded() {
        let mut p = vec![0u8];
        for v in [0u32, 0, 4, 4, 2, 0] {
            p.write_u32::<LittleEndian>(v).unwrap();
        }
        for payload in [&b"\xff\xd8ab"[..], &b"\xff\xd8cde"[..]] {
            p.write_i32::<LittleEndian>(payload.len() as i32).unwrap();
            p.write_all(payload).unwrap();
        }
        let bytes = container(&[("@IMG_JPEG", p), ("@IMG_MOT_COMP_03", oct_stack(1, 1, 1))]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let (id, _, slices) = read_oct_slices(&mut cur, &cat, TopconKind::Fda).unwrap();
        assert_eq!(id, "img_jpeg");
        assert_eq!(slices.len(), 2);
        assert_eq!(
            slices[1].data,
            SliceData::Encoded { format: EncodedFormat::Jpeg, bytes: b"\xff\xd8cde".to_vec() }
        );
    }

    #[test]
    fn spacing_axes_differ_by_variant() {
        let bytes = container(&[("@PARAM_SCAN_04", param_scan_04(6.0, 3.0, 2.6))]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let rec = decode_tag(&mut cur, &cat, "@PARAM_SCAN_04").unwrap().unwrap();
        let dims = OctDims { width: 512, height: 885, number_slices: 128 };
        let fda = pixel_spacing(&rec, dims, TopconKind::Fda).unwrap().unwrap();
        assert!((fda[0] - 6.0 / 512.0).abs() < 1e-12);
        assert!((fda[1] - 3.0 / 128.0).abs() < 1e-12);
        assert!((fda[2] - 0.0026).abs() < 1e-12);
        let fds = pixel_spacing(&rec, dims, TopconKind::Fds).unwrap().unwrap();
        assert!((fds[0] - 6.0 / 885.0).abs() < 1e-12);
        assert!((fds[2] - 3.0 / 512.0).abs() < 1e-12);
    }

    #[test]
    fn contours_are_flipped_and_measured_from_top() {
        let mut p = Vec::new();
        let mut id = b"MULTILAYERS_1".to_vec();
        id.resize(20, 0);
        p.write_all(&id).unwrap();
        p.extend_from_slice(&[0, 0]);
        for v in [2u32, 2, 8] {
            p.write_u32::<LittleEndian>(v).unwrap();
        }
        for v in [10u16, 11, 20, 21] {
            p.write_u16::<LittleEndian>(v).unwrap();
        }
        let bytes = container(&[("@CONTOUR_INFO", p)]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let contours = read_contours(&mut cur, &cat, 100);
        assert_eq!(contours["ILM"], vec![Some(vec![80.0, 79.0]), Some(vec![90.0, 89.0])]);
    }

    #[test]
    fn bgr_becomes_rgb() {
        let mut p = Vec::new();
        for v in [2u32, 1, 24, 1] {
            p.write_u32::<LittleEndian>(v).unwrap();
        }
        p.write_u8(0).unwrap();
        p.write_u32::<LittleEndian>(6).unwrap();
        p.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let bytes = container(&[("@IMG_OBS", p)]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fds).unwrap();
        let images = read_fundus(&mut cur, &cat, &VolumeMetadata::default());
        assert_eq!(images.len(), 1);
        match &images[0].image {
            FundusPixels::Rgb(a) => {
                assert_eq!(a.shape(), &[1, 2, 3]);
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1, 6, 5, 4]);
            }
            other => panic!("unexpected {:?}", other.shape()),
        }
    }

    #[test]
    fn capture_and_patient_metadata() {
        let mut patient = Vec::new();
        for (text, len) in [("P-17", 32), ("Ada", 32), ("Lovelace", 32), ("", 8)] {
            let mut field = text.as_bytes().to_vec();
            field.resize(len, 0);
            patient.extend_from_slice(&field);
        }
        patient.write_u8(2).unwrap();
        for v in [1960u16, 5, 17] {
            patient.write_u16::<LittleEndian>(v).unwrap();
        }
        patient.resize(615, 0);

        let mut capture = vec![1u8];
        for v in [2021u16, 3, 4, 10, 20, 30] {
            capture.write_u16::<LittleEndian>(v).unwrap();
        }

        let bytes = container(&[("@PATIENT_INFO_02", patient), ("@CAPTURE_INFO", capture)]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let meta = read_volume_metadata(&mut cur, &cat).unwrap();
        assert_eq!(meta.patient.patient_id.as_deref(), Some("P-17"));
        assert_eq!(meta.patient.surname.as_deref(), Some("Lovelace"));
        assert_eq!(meta.patient.sex, Some(Sex::Female));
        assert_eq!(meta.patient.birth_date, NaiveDate::from_ymd_opt(1960, 5, 17));
        assert_eq!(meta.laterality, Some(Laterality::Left));
        assert_eq!(
            meta.acquisition,
            NaiveDate::from_ymd_opt(2021, 3, 4).and_then(|d| d.and_hms_opt(10, 20, 30))
        );
    }

    #[test]
    fn missing_oct_chunk_yields_no_volume() {
        let bytes = container(&[("@THUMBNAIL", vec![0, 0, 0, 0])]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fds).unwrap();
        let (volumes, fundus) = assemble_volumes(&mut cur, &cat, TopconKind::Fds).unwrap();
        assert!(volumes.is_empty());
        assert!(fundus.is_empty());
    }

    #[test]
    fn all_metadata_skips_pixels_and_unknown_tags() {
        let bytes = container(&[
            ("@THUMBNAIL", 7u32.to_le_bytes().to_vec()),
            ("@IMG_TRC_02", vec![0; 21]),
            ("@SOMETHING_NEW", vec![1, 2, 3]),
            ("@GLA_LITTMANN_01", vec![0xff, 0xff, 0, 0, 1, 0, 0, 0]),
        ]);
        let mut cur = Cursor::new(bytes);
        let cat = catalog(&mut cur, TopconKind::Fda).unwrap();
        let all = read_all_metadata(&mut cur, &cat).unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["gla_littmann_01", "thumbnail"]);
        assert_eq!(all["thumbnail"].uint("size").unwrap(), 7);
    }
}
