//! DCT perceptual hash
//!
//! Resample to 32x32, take the 8x8 lowest-frequency DCT-II block and set
//! each bit by comparing the coefficient against the median of the 63 AC
//! coefficients. A uniform brightness offset only moves the DC term, and a
//! contrast change scales every coefficient, so neither changes the bits.

use std::f64::consts::PI;

use super::{Fingerprint, Fingerprinter, ImageFrame, LumaGrid};
use crate::error::Result;

/// Edge of the resampled grid
const GRID: usize = 32;

/// Edge of the retained low-frequency block
const LOW: usize = 8;

/// DCT perceptual hasher (the default fingerprint)
#[derive(Debug, Clone)]
pub struct PerceptualHasher {
    /// cos((2x + 1) u pi / 2N) for u in 0..LOW, x in 0..GRID
    basis: Vec<[f64; GRID]>,
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let basis = (0..LOW)
            .map(|u| {
                let mut row = [0.0; GRID];
                for (x, cell) in row.iter_mut().enumerate() {
                    *cell = ((2 * x + 1) as f64 * u as f64 * PI / (2 * GRID) as f64).cos();
                }
                row
            })
            .collect();
        Self { basis }
    }

    /// Low-frequency DCT block, row-major `[v][u]`
    fn low_frequencies(&self, grid: &LumaGrid) -> [f64; LOW * LOW] {
        // rows first: for every image row y, project onto the u basis
        let mut rows = vec![[0.0; LOW]; GRID];
        for (y, out) in rows.iter_mut().enumerate() {
            for (u, coeff) in out.iter_mut().enumerate() {
                *coeff = (0..GRID).map(|x| grid.at(x, y) * self.basis[u][x]).sum();
            }
        }

        let mut block = [0.0; LOW * LOW];
        for v in 0..LOW {
            for u in 0..LOW {
                block[v * LOW + u] = (0..GRID).map(|y| rows[y][u] * self.basis[v][y]).sum();
            }
        }
        block
    }
}

impl Fingerprinter for PerceptualHasher {
    fn name(&self) -> &'static str {
        "phash-dct"
    }

    fn fingerprint(&self, frame: &ImageFrame) -> Result<Fingerprint> {
        let grid = frame.to_luma_grid()?.resample(GRID, GRID);
        let block = self.low_frequencies(&grid);

        let mut ac: Vec<f64> = block[1..].to_vec();
        ac.sort_by(|a, b| a.total_cmp(b));
        let median = ac[ac.len() / 2];

        let bits = block
            .iter()
            .fold(0u64, |acc, &c| (acc << 1) | u64::from(c > median));
        Ok(Fingerprint::from_bits(bits))
    }
}
