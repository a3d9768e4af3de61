//! Volume assembler: correlates keyed chunks into ordered volumes.
//!
//! # Slots
//! [`VolumeAssembler::presize`] allocates, per key whose largest slice id is
//! positive, `max_id / 2 + 1` empty slots.  A pixel chunk with slice id `s`
//! lands in slot `floor(s / 2) - 1`.
//!
//! # Overflow
//! A chunk whose key got no slots, or whose slot index is negative or past
//! the end, is appended to that key's overflow list in arrival order.  Each
//! non-empty overflow list becomes its own [`Volume`] with `overflow` set.
//!
//! # Metadata
//! Metadata chunks arrive before the pixels they describe.  Each update is
//! applied to a running "latest" record and to the side-table entry for the
//! chunk's own key.  When pixels are placed for a key, any field that key
//! has not set yet is filled from "latest".  Patient identity is file-wide
//! and is filled into every volume at the end.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use log::{debug, warn};

use crate::catalog::SliceExtents;
use crate::volume::{
    FundusImage, FundusPixels, Laterality, PatientInfo, Slice, SliceData, Volume, VolumeKey,
    VolumeMetadata,
};

/// Slot index for a vendor slice id, `floor(id / 2) - 1`.
pub fn slot_index(slice_id: i32) -> Option<usize> {
    usize::try_from(slice_id.div_euclid(2) - 1).ok()
}

/// One decoded metadata chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataUpdate {
    Laterality(Laterality),
    Patient(PatientInfo),
    Acquisition(NaiveDateTime),
    PixelSpacing([f64; 3]),
    Device(String),
    ScanPattern(String),
}

impl MetadataUpdate {
    pub fn apply(&self, meta: &mut VolumeMetadata) {
        match self {
            MetadataUpdate::Laterality(l) => meta.laterality = Some(*l),
            MetadataUpdate::Patient(p) => meta.patient = p.clone(),
            MetadataUpdate::Acquisition(t) => meta.acquisition = Some(*t),
            MetadataUpdate::PixelSpacing(s) => meta.pixel_spacing = Some(*s),
            MetadataUpdate::Device(d) => meta.device = Some(d.clone()),
            MetadataUpdate::ScanPattern(p) => meta.scan_pattern = Some(p.clone()),
        }
    }
}

/// Where [`VolumeAssembler::place`] put a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Primary(usize),
    Overflow(usize),
}

struct Slots {
    key:   VolumeKey,
    slots: Vec<Option<SliceData>>,
}

#[derive(Default)]
pub struct VolumeAssembler {
    primary:        Vec<Slots>,
    primary_index:  HashMap<VolumeKey, usize>,
    overflow:       Vec<(VolumeKey, Vec<SliceData>)>,
    overflow_index: HashMap<VolumeKey, usize>,
    latest:         VolumeMetadata,
    table:          HashMap<VolumeKey, VolumeMetadata>,
    /// key → layer name → slot position → contour.
    contours:       HashMap<VolumeKey, BTreeMap<String, BTreeMap<usize, Vec<f64>>>>,
    fundus:         Vec<(VolumeKey, FundusPixels)>,
    fundus_index:   HashMap<VolumeKey, usize>,
}

impl VolumeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembler with slots already sized from a directory pre-scan.
    pub fn with_extents(extents: &SliceExtents) -> Self {
        let mut asm = Self::new();
        asm.presize(extents);
        asm
    }

    pub fn presize(&mut self, extents: &SliceExtents) {
        for (key, _) in extents.iter() {
            if self.primary_index.contains_key(&key) {
                continue;
            }
            if let Some(n) = extents.slot_count(&key) {
                self.primary_index.insert(key, self.primary.len());
                self.primary.push(Slots { key, slots: vec![None; n] });
            }
        }
        debug!("presized {} primary volumes", self.primary.len());
    }

    pub fn slot_count(&self, key: &VolumeKey) -> Option<usize> {
        self.primary_index.get(key).map(|&i| self.primary[i].slots.len())
    }

    /// Record a metadata chunk carried under `key`.
    pub fn update_metadata(&mut self, key: VolumeKey, update: MetadataUpdate) {
        update.apply(&mut self.latest);
        update.apply(self.table.entry(key).or_default());
    }

    pub fn latest_metadata(&self) -> &VolumeMetadata {
        &self.latest
    }

    fn capture_latest(&mut self, key: VolumeKey) {
        let latest = &self.latest;
        self.table.entry(key).or_default().fill_missing_from(latest);
    }

    /// Place one decoded slice.
    pub fn place(&mut self, key: VolumeKey, slice_id: i32, data: SliceData) -> Placement {
        self.capture_latest(key);

        if let Some(&v) = self.primary_index.get(&key) {
            let slots = &mut self.primary[v].slots;
            if let Some(i) = slot_index(slice_id).filter(|&i| i < slots.len()) {
                if slots[i].is_some() {
                    debug!("volume {key}: slot {i} replaced by a later chunk");
                }
                slots[i] = Some(data);
                return Placement::Primary(i);
            }
            warn!(
                "volume {key}: slice id {slice_id} outside {} presized slots, kept as overflow",
                slots.len()
            );
        } else {
            warn!("volume {key}: not seen in directory pre-scan, kept as overflow");
        }

        let o = *self.overflow_index.entry(key).or_insert_with(|| {
            self.overflow.push((key, Vec::new()));
            self.overflow.len() - 1
        });
        let list = &mut self.overflow[o].1;
        list.push(data);
        Placement::Overflow(list.len() - 1)
    }

    /// Attach one segmentation line to `key` at the slice's slot position.
    pub fn add_contour(&mut self, key: VolumeKey, slice_id: i32, name: String, values: Vec<f64>) {
        match slot_index(slice_id) {
            Some(pos) => {
                self.contours.entry(key).or_default().entry(name).or_default().insert(pos, values);
            }
            None => warn!("volume {key}: contour {name} has slice id {slice_id} before the first slot; dropped"),
        }
    }

    /// Record a fundus image for `key`.  A later image for the same key
    /// replaces the earlier one.
    pub fn add_fundus(&mut self, key: VolumeKey, pixels: FundusPixels) {
        self.capture_latest(key);
        match self.fundus_index.get(&key) {
            Some(&i) => self.fundus[i].1 = pixels,
            None => {
                self.fundus_index.insert(key, self.fundus.len());
                self.fundus.push((key, pixels));
            }
        }
    }

    fn metadata_for(&self, key: &VolumeKey) -> VolumeMetadata {
        let mut meta = self.table.get(key).cloned().unwrap_or_default();
        if meta.patient.is_empty() {
            meta.patient = self.latest.patient.clone();
        }
        meta
    }

    fn contours_for(&self, key: &VolumeKey) -> BTreeMap<String, Vec<Option<Vec<f64>>>> {
        let Some(layers) = self.contours.get(key) else {
            return BTreeMap::new();
        };
        let presized = self.slot_count(key);
        layers
            .iter()
            .map(|(name, by_pos)| {
                let needed = by_pos.keys().next_back().map_or(0, |&p| p + 1);
                let len = presized.map_or(needed, |n| n.max(needed));
                let mut column = vec![None; len];
                for (&pos, values) in by_pos {
                    column[pos] = Some(values.clone());
                }
                (name.clone(), column)
            })
            .collect()
    }

    /// Drop empty slots and emit primary volumes in presize order, then
    /// overflow volumes in arrival order, then fundus images.  Contours
    /// belong to the primary volume only.
    pub fn finish(self) -> (Vec<Volume>, Vec<FundusImage>) {
        let mut volumes = Vec::new();

        for Slots { key, slots } in &self.primary {
            let slices: Vec<Slice> = slots
                .iter()
                .enumerate()
                .filter_map(|(position, s)| s.as_ref().map(|data| Slice { position, data: data.clone() }))
                .collect();
            if slices.is_empty() {
                continue;
            }
            let mut meta = self.metadata_for(key);
            meta.contours = self.contours_for(key);
            let mut vol = Volume::new(key.to_string(), slices, meta);
            vol.key = Some(*key);
            volumes.push(vol);
        }

        for (key, list) in &self.overflow {
            let slices = list
                .iter()
                .enumerate()
                .map(|(position, data)| Slice { position, data: data.clone() })
                .collect();
            let mut vol = Volume::new(format!("{key}-overflow"), slices, self.metadata_for(key));
            vol.key = Some(*key);
            vol.overflow = true;
            volumes.push(vol);
        }

        let fundus = self
            .fundus
            .iter()
            .map(|(key, pixels)| {
                let meta = self.metadata_for(key);
                FundusImage {
                    image_id:   key.to_string(),
                    image:      pixels.clone(),
                    laterality: meta.laterality,
                    patient_id: meta.patient.patient_id,
                }
            })
            .collect();

        debug!(
            "assembled {} volumes ({} overflow)",
            volumes.len(),
            volumes.iter().filter(|v| v.overflow).count()
        );
        (volumes, fundus)
    }
}
