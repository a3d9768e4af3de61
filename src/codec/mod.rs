//! Heidelberg 16-bit unsigned float codec and OCT intensity transforms.
//!
//! # Bit layout
//! A raw pixel is two little-endian bytes.  Each byte is bit-reversed on its
//! own and the results are concatenated, low byte first, into a 16-bit
//! string.  The first 10 bits of that string are the mantissa; the last 6,
//! read back in reverse, are the exponent:
//!
//! ```text
//! value = (1 + mantissa / 1024) * 2^(exponent - 63)
//! ```
//!
//! There is no sign bit, so every value is positive and below 2.
//!
//! # Lookup table
//! With only 65,536 possible inputs the whole codec fits in a table.  A
//! [`FloatLut`] is built once per decode session and owned by it; there is
//! no process-wide table.  The table also stores the post-transform
//! intensity so the per-pixel cost of a B-scan is one indexed load.

use serde::Serialize;

/// Number of distinct 16-bit inputs.
pub const LUT_SIZE: usize = 1 << 16;

const MANTISSA_SCALE: f64 = 1024.0;
const EXPONENT_BIAS: i32 = 63;

/// Decode one raw pixel without a table.
pub fn ufloat16(raw: u16) -> f64 {
    let [lo, hi] = raw.to_le_bytes();
    let bits = ((lo.reverse_bits() as u16) << 8) | hi.reverse_bits() as u16;
    let mantissa = bits >> 6;
    let exponent = (bits & 0x3f).reverse_bits() >> 10;
    (1.0 + mantissa as f64 / MANTISSA_SCALE) * 2f64.powi(exponent as i32 - EXPONENT_BIAS)
}

// ── Intensity transforms ─────────────────────────────────────────────────────

/// Post-decode mapping from codec value to display intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntensityTransform {
    /// `256 * v^(1/2.4)`.
    Legacy,
    /// Log mapping of `v <= 1` into `[0, 1]`; `f32::MAX` marks "no data".
    #[default]
    Current,
}

impl IntensityTransform {
    pub fn apply(self, value: f64) -> f32 {
        match self {
            IntensityTransform::Legacy => (256.0 * value.powf(1.0 / 2.4)) as f32,
            IntensityTransform::Current => {
                if value as f32 == f32::MAX {
                    return 0.0;
                }
                let mapped = if value <= 1.0 {
                    ((value + 2.44e-4).ln() + 8.3) / 8.285
                } else {
                    value
                };
                mapped.clamp(0.0, 1.0) as f32
            }
        }
    }
}

// ── Lookup table ─────────────────────────────────────────────────────────────

/// Precomputed decode and intensity for every raw pixel value.
pub struct FloatLut {
    decoded:   Box<[f64]>,
    intensity: Box<[f32]>,
    transform: IntensityTransform,
}

impl FloatLut {
    pub fn new(transform: IntensityTransform) -> Self {
        let decoded: Box<[f64]> = (0..=u16::MAX).map(ufloat16).collect();
        let intensity = decoded.iter().map(|&v| transform.apply(v)).collect();
        Self { decoded, intensity, transform }
    }

    pub fn transform(&self) -> IntensityTransform {
        self.transform
    }

    #[inline]
    pub fn decode(&self, raw: u16) -> f64 {
        self.decoded[raw as usize]
    }

    #[inline]
    pub fn intensity(&self, raw: u16) -> f32 {
        self.intensity[raw as usize]
    }

    /// Decode and transform a run of raw pixels.
    pub fn map_pixels(&self, raw: &[u16]) -> Vec<f32> {
        raw.iter().map(|&p| self.intensity(p)).collect()
    }
}

impl std::fmt::Debug for FloatLut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloatLut").field("transform", &self.transform).finish()
    }
}
