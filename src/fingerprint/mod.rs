//! Perceptual Fingerprints
//!
//! Maps decoded pixel content to a 64-bit vector such that visually similar
//! images land a small Hamming distance apart.
//!
//! # Pipeline
//!
//! ```text
//! ImageFrame (RGB/RGBA/Luma) ──▶ LumaGrid ──▶ area resample ──▶ hasher ──▶ Fingerprint
//! ```
//!
//! Decoding compressed formats happens upstream; the cache only sees the
//! pixel grid plus the original encoded bytes (forwarded to the compute
//! capability untouched).

mod dhash;
mod phash;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub use dhash::DifferenceHasher;
pub use phash::PerceptualHasher;

/// Width of a fingerprint in bits
pub const FINGERPRINT_BITS: u32 = 64;

/// Smallest edge an image may have before it is rejected
pub const MIN_DIMENSION: u32 = 8;

// =============================================================================
// Fingerprint
// =============================================================================

/// Fixed-width perceptual fingerprint.
///
/// Bit 63 is the first hashed cell, so the hex form reads in scan order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Wrap a raw bit vector
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bit vector
    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Number of differing bits
    #[inline]
    pub fn hamming_distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Whether `other` is within `threshold` bits (inclusive)
    #[inline]
    pub fn is_near(&self, other: &Fingerprint, threshold: u32) -> bool {
        self.hamming_distance(other) <= threshold
    }

    /// Extract band `index` of `bands` contiguous bit segments.
    ///
    /// Segment widths differ by at most one bit when 64 is not a multiple of
    /// `bands`.
    pub fn band(&self, index: u32, bands: u32) -> u64 {
        debug_assert!(bands > 0 && bands <= FINGERPRINT_BITS && index < bands);
        let start = index * FINGERPRINT_BITS / bands;
        let end = (index + 1) * FINGERPRINT_BITS / bands;
        let width = end - start;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        (self.0 >> start) & mask
    }

    /// 16-digit lowercase hex
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches("0x");
        if s.is_empty() || s.len() > 16 {
            return Err(Error::Codec(format!("invalid fingerprint: {:?}", s)));
        }
        u64::from_str_radix(s, 16)
            .map(Fingerprint)
            .map_err(|e| Error::Codec(format!("invalid fingerprint {:?}: {}", s, e)))
    }
}

impl From<u64> for Fingerprint {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Image input
// =============================================================================

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale
    Luma8,
    /// 8-bit RGB
    Rgb8,
    /// 8-bit RGBA (alpha ignored)
    Rgba8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A decoded, row-major pixel grid
#[derive(Debug, Clone)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl ImageFrame {
    /// Wrap a decoded buffer. Validation happens when the frame is hashed.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Grayscale frame
    pub fn luma(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self::new(width, height, PixelFormat::Luma8, data)
    }

    /// RGB frame
    pub fn rgb(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Convert to a luminance grid (Rec.601 weights).
    pub fn to_luma_grid(&self) -> Result<LumaGrid> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidImage(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        if self.width < MIN_DIMENSION || self.height < MIN_DIMENSION {
            return Err(Error::InvalidImage(format!(
                "frame {}x{} is smaller than {}x{}",
                self.width, self.height, MIN_DIMENSION, MIN_DIMENSION
            )));
        }

        let pixels = self.width as usize * self.height as usize;
        let channels = self.format.channels();
        let expected = pixels * channels;
        if self.data.len() != expected {
            return Err(Error::InvalidImage(format!(
                "buffer holds {} bytes, {}x{} {:?} needs {}",
                self.data.len(),
                self.width,
                self.height,
                self.format,
                expected
            )));
        }

        let values = match self.format {
            PixelFormat::Luma8 => self.data.iter().map(|&v| v as f64).collect(),
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => self
                .data
                .chunks_exact(channels)
                .map(|px| 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64)
                .collect(),
        };

        Ok(LumaGrid {
            width: self.width as usize,
            height: self.height as usize,
            values,
        })
    }
}

/// What a caller presents to the cache: the encoded upload plus its decoded frame
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// Encoded bytes as uploaded (forwarded to the compute capability)
    pub encoded: Bytes,
    /// Decoded pixels (fingerprinted)
    pub frame: ImageFrame,
}

impl ImageInput {
    pub fn new(encoded: impl Into<Bytes>, frame: ImageFrame) -> Self {
        Self {
            encoded: encoded.into(),
            frame,
        }
    }
}

// =============================================================================
// Luminance grid
// =============================================================================

/// Row-major luminance values
#[derive(Debug, Clone)]
pub struct LumaGrid {
    width: usize,
    height: usize,
    values: Vec<f64>,
}

impl LumaGrid {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f64 {
        self.values[y * self.width + x]
    }

    /// Area-average resample to `width` x `height`.
    ///
    /// Every target cell averages the source box it covers; when upsampling
    /// the box shrinks to the single nearest source pixel.
    pub fn resample(&self, width: usize, height: usize) -> LumaGrid {
        let mut values = Vec::with_capacity(width * height);
        for ty in 0..height {
            let (y0, y1) = source_span(ty, height, self.height);
            for tx in 0..width {
                let (x0, x1) = source_span(tx, width, self.width);
                let mut sum = 0.0;
                for y in y0..y1 {
                    let row = &self.values[y * self.width..(y + 1) * self.width];
                    sum += row[x0..x1].iter().sum::<f64>();
                }
                values.push(sum / ((y1 - y0) * (x1 - x0)) as f64);
            }
        }
        LumaGrid {
            width,
            height,
            values,
        }
    }
}

/// Source range `[start, end)` covered by target index `t`.
fn source_span(t: usize, target: usize, source: usize) -> (usize, usize) {
    let start = t * source / target;
    let end = ((t + 1) * source).div_ceil(target).max(start + 1);
    (start, end.min(source))
}

// =============================================================================
// Fingerprinter
// =============================================================================

/// Deterministic image → fingerprint function
pub trait Fingerprinter: Send + Sync {
    /// Short algorithm name (logged and exported)
    fn name(&self) -> &'static str;

    /// Hash a frame; fails with `Error::InvalidImage` for unusable frames
    fn fingerprint(&self, frame: &ImageFrame) -> Result<Fingerprint>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_hamming_distance() {
        let a = Fingerprint::from_bits(0b1011);
        let b = Fingerprint::from_bits(0b0001);
        assert_eq!(a.hamming_distance(&b), 2);
        assert_eq!(a.hamming_distance(&a), 0);
        assert!(a.is_near(&b, 2));
        assert!(!a.is_near(&b, 1));
        assert_eq!(
            Fingerprint::from_bits(0).hamming_distance(&Fingerprint::from_bits(u64::MAX)),
            64
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::from_bits(0xabcd_0000_1234_ffff);
        assert_eq!(fp.to_string(), "abcd00001234ffff");
        assert_eq!("abcd00001234ffff".parse::<Fingerprint>().unwrap(), fp);
        assert_eq!("0xabcd00001234ffff".parse::<Fingerprint>().unwrap(), fp);
        assert!("".parse::<Fingerprint>().is_err());
        assert!("not-hex".parse::<Fingerprint>().is_err());
        assert!("123456789abcdef01".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let fp = Fingerprint::from_bits(0x1f);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"000000000000001f\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_bands_cover_every_bit() {
        for bands in [1u32, 3, 6, 8, 13, 64] {
            let zero = Fingerprint::from_bits(0);
            for bit in 0..64 {
                let flipped = Fingerprint::from_bits(1u64 << bit);
                let differing = (0..bands)
                    .filter(|&i| zero.band(i, bands) != flipped.band(i, bands))
                    .count();
                assert_eq!(differing, 1, "bit {} with {} bands", bit, bands);
            }
        }
    }

    #[test]
    fn test_frame_validation() {
        assert_matches!(
            ImageFrame::luma(0, 10, Vec::<u8>::new()).to_luma_grid(),
            Err(Error::InvalidImage(_))
        );
        assert_matches!(
            ImageFrame::luma(4, 4, vec![0u8; 16]).to_luma_grid(),
            Err(Error::InvalidImage(_))
        );
        assert_matches!(
            ImageFrame::rgb(8, 8, vec![0u8; 64]).to_luma_grid(),
            Err(Error::InvalidImage(msg)) if msg.contains("needs 192")
        );
        assert!(ImageFrame::rgb(8, 8, vec![0u8; 192]).to_luma_grid().is_ok());
    }

    #[test]
    fn test_rgb_luma_weights() {
        let frame = ImageFrame::new(8, 8, PixelFormat::Rgba8, [255u8, 0, 0, 9].repeat(64));
        let grid = frame.to_luma_grid().unwrap();
        assert!((grid.at(3, 3) - 0.299 * 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_resample_preserves_constant() {
        let grid = ImageFrame::luma(50, 37, vec![77u8; 50 * 37])
            .to_luma_grid()
            .unwrap();
        for (w, h) in [(32, 32), (9, 8), (64, 80)] {
            let small = grid.resample(w, h);
            assert_eq!(small.width(), w);
            assert_eq!(small.height(), h);
            assert!((small.at(w - 1, h - 1) - 77.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_source_span_bounds() {
        assert_eq!(source_span(0, 32, 64), (0, 2));
        assert_eq!(source_span(31, 32, 64), (62, 64));
        assert_eq!(source_span(5, 32, 8), (1, 2));
        assert_eq!(source_span(2, 3, 10), (6, 10));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_hamming_is_a_metric(a in any::<u64>(), b in any::<u64>(), c in any::<u64>()) {
            let (a, b, c) = (Fingerprint::from(a), Fingerprint::from(b), Fingerprint::from(c));
            prop_assert_eq!(a.hamming_distance(&b), b.hamming_distance(&a));
            prop_assert!(a.hamming_distance(&c) <= a.hamming_distance(&b) + b.hamming_distance(&c));
            prop_assert_eq!(a.hamming_distance(&b) == 0, a == b);
        }

        #[test]
        fn prop_hex_parses_back(bits in any::<u64>()) {
            let fp = Fingerprint::from(bits);
            prop_assert_eq!(fp.to_hex().parse::<Fingerprint>().unwrap(), fp);
        }
    }
}
