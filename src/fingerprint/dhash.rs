//! Gradient (difference) hash
//!
//! Cheaper than the DCT hash: resample to 9x8 and record whether each cell
//! is brighter than its right-hand neighbour.

use super::{Fingerprint, Fingerprinter, ImageFrame};
use crate::error::Result;

/// Horizontal-gradient hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct DifferenceHasher;

impl DifferenceHasher {
    pub fn new() -> Self {
        Self
    }
}

impl Fingerprinter for DifferenceHasher {
    fn name(&self) -> &'static str {
        "dhash"
    }

    fn fingerprint(&self, frame: &ImageFrame) -> Result<Fingerprint> {
        let grid = frame.to_luma_grid()?.resample(9, 8);
        let mut bits = 0u64;
        for y in 0..8 {
            for x in 0..8 {
                bits = (bits << 1) | u64::from(grid.at(x, y) > grid.at(x + 1, y));
            }
        }
        Ok(Fingerprint::from_bits(bits))
    }
}
