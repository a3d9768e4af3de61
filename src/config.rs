//! Caller-selected read options.

use serde::Serialize;

use crate::codec::IntensityTransform;
use crate::frames::Buffering;

pub const DEFAULT_ZEISS_ROWS: usize = 1024;
pub const DEFAULT_ZEISS_COLS: usize = 512;

/// Options for [`crate::container::Container`] reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadOptions {
    /// Post-decode mapping for Heidelberg OCT pixels.
    pub intensity:        IntensityTransform,
    /// Storage for Bioptigen frame stacks.
    pub buffering:        Buffering,
    pub zeiss_rows:       usize,
    pub zeiss_cols:       usize,
    pub zeiss_interlaced: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            intensity:        IntensityTransform::Current,
            buffering:        Buffering::Memory,
            zeiss_rows:       DEFAULT_ZEISS_ROWS,
            zeiss_cols:       DEFAULT_ZEISS_COLS,
            zeiss_interlaced: false,
        }
    }
}

impl ReadOptions {
    pub fn with_intensity(mut self, intensity: IntensityTransform) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_buffering(mut self, buffering: Buffering) -> Self {
        self.buffering = buffering;
        self
    }

    pub fn with_zeiss_shape(mut self, rows: usize, cols: usize) -> Self {
        self.zeiss_rows = rows;
        self.zeiss_cols = cols;
        self
    }

    pub fn with_zeiss_interlaced(mut self, interlaced: bool) -> Self {
        self.zeiss_interlaced = interlaced;
        self
    }
}
