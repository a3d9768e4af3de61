//! Normalised output types shared by every format reader.
//!
//! A [`Volume`] is an ordered list of [`Slice`]s plus [`VolumeMetadata`]; a
//! [`FundusImage`] is a single 2-D (or colour) photograph.  Both are handed
//! to whatever writes files; nothing here knows about any vendor layout.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{Array2, Array3};
use serde::Serialize;

// ── Keys ─────────────────────────────────────────────────────────────────────

/// Identifies one logical volume inside a correlated container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VolumeKey {
    pub patient_db_id: u32,
    pub study_id:      u32,
    pub series_id:     u32,
}

impl VolumeKey {
    pub fn new(patient_db_id: u32, study_id: u32, series_id: u32) -> Self {
        Self { patient_db_id, study_id, series_id }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.patient_db_id, self.study_id, self.series_id)
    }
}

// ── Pixel data ───────────────────────────────────────────────────────────────

/// Compressed payloads kept as-is for the output stage to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodedFormat {
    Jpeg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SliceData {
    U8(Array2<u8>),
    U16(Array2<u16>),
    F32(Array2<f32>),
    Encoded { format: EncodedFormat, bytes: Vec<u8> },
}

impl SliceData {
    /// `(rows, cols)`, unknown for encoded payloads.
    pub fn shape(&self) -> Option<(usize, usize)> {
        match self {
            SliceData::U8(a) => Some(a.dim()),
            SliceData::U16(a) => Some(a.dim()),
            SliceData::F32(a) => Some(a.dim()),
            SliceData::Encoded { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SliceData::U8(_) => "u8",
            SliceData::U16(_) => "u16",
            SliceData::F32(_) => "f32",
            SliceData::Encoded { format: EncodedFormat::Jpeg, .. } => "jpeg",
        }
    }
}

/// One B-scan and its index within the volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub position: usize,
    pub data:     SliceData,
}

// ── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Laterality {
    #[serde(rename = "R")]
    Right,
    #[serde(rename = "L")]
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "O")]
    Other,
}

impl Sex {
    /// Single-letter vendor code (`M`, `F`, `O`), any case.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            "O" => Some(Sex::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatientInfo {
    pub patient_id: Option<String>,
    pub first_name: Option<String>,
    pub surname:    Option<String>,
    pub sex:        Option<Sex>,
    pub birth_date: Option<NaiveDate>,
}

impl PatientInfo {
    pub fn is_empty(&self) -> bool {
        *self == PatientInfo::default()
    }

    fn fill_missing_from(&mut self, other: &PatientInfo) {
        fill(&mut self.patient_id, &other.patient_id);
        fill(&mut self.first_name, &other.first_name);
        fill(&mut self.surname, &other.surname);
        fill(&mut self.sex, &other.sex);
        fill(&mut self.birth_date, &other.birth_date);
    }
}

/// Segmentation layers: layer name → one optional contour per slice.
pub type Contours = BTreeMap<String, Vec<Option<Vec<f64>>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumeMetadata {
    pub laterality:    Option<Laterality>,
    pub patient:       PatientInfo,
    pub acquisition:   Option<NaiveDateTime>,
    /// `[x, y, z]` in millimetres.
    pub pixel_spacing: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub contours:      Contours,
    pub device:        Option<String>,
    pub scan_pattern:  Option<String>,
}

impl VolumeMetadata {
    /// Copy every field that is unset here from `other`.  Contours are never
    /// copied; they belong to exactly one key.
    pub fn fill_missing_from(&mut self, other: &VolumeMetadata) {
        fill(&mut self.laterality, &other.laterality);
        self.patient.fill_missing_from(&other.patient);
        fill(&mut self.acquisition, &other.acquisition);
        fill(&mut self.pixel_spacing, &other.pixel_spacing);
        fill(&mut self.device, &other.device);
        fill(&mut self.scan_pattern, &other.scan_pattern);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

// ── Volumes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub volume_id: String,
    pub key:       Option<VolumeKey>,
    pub slices:    Vec<Slice>,
    pub metadata:  VolumeMetadata,
    /// Built from chunks the directory pre-scan did not predict.
    pub overflow:  bool,
}

impl Volume {
    pub fn new(volume_id: impl Into<String>, slices: Vec<Slice>, metadata: VolumeMetadata) -> Self {
        Self { volume_id: volume_id.into(), key: None, slices, metadata, overflow: false }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Shape of the first decoded slice.
    pub fn slice_shape(&self) -> Option<(usize, usize)> {
        self.slices.iter().find_map(|s| s.data.shape())
    }

    pub fn summary(&self) -> VolumeSummary<'_> {
        VolumeSummary {
            volume_id:   &self.volume_id,
            slices:      self.slices.len(),
            slice_shape: self.slice_shape(),
            pixel_kind:  self.slices.first().map(|s| s.data.kind()),
            overflow:    self.overflow,
            metadata:    &self.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VolumeSummary<'a> {
    pub volume_id:   &'a str,
    pub slices:      usize,
    pub slice_shape: Option<(usize, usize)>,
    pub pixel_kind:  Option<&'static str>,
    pub overflow:    bool,
    pub metadata:    &'a VolumeMetadata,
}

// ── Fundus ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FundusPixels {
    Gray(Array2<u8>),
    /// `(rows, cols, 3)` in RGB order.
    Rgb(Array3<u8>),
    Encoded { format: EncodedFormat, bytes: Vec<u8> },
}

impl FundusPixels {
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            FundusPixels::Gray(a) => Some(a.shape().to_vec()),
            FundusPixels::Rgb(a) => Some(a.shape().to_vec()),
            FundusPixels::Encoded { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundusImage {
    pub image_id:   String,
    pub image:      FundusPixels,
    pub laterality: Option<Laterality>,
    pub patient_id: Option<String>,
}

impl FundusImage {
    pub fn summary(&self) -> FundusSummary<'_> {
        FundusSummary {
            image_id:   &self.image_id,
            shape:      self.image.shape(),
            encoded:    matches!(self.image, FundusPixels::Encoded { .. }),
            laterality: self.laterality,
            patient_id: self.patient_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FundusSummary<'a> {
    pub image_id:   &'a str,
    pub shape:      Option<Vec<usize>>,
    pub encoded:    bool,
    pub laterality: Option<Laterality>,
    pub patient_id: Option<&'a str>,
}
