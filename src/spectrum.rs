//! Binned background spectrum
//!
//! Equal-width binning over a fixed mass range and the immutable background
//! template built on it.

use serde::{Deserialize, Serialize};

use crate::StudyError;

/// Equal-width binning over `[x_min, x_max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub n_bins: usize,
    pub x_min: f64,
    pub x_max: f64,
}

impl Binning {
    pub fn new(n_bins: i64, x_min: f64, x_max: f64) -> Result<Self, StudyError> {
        if n_bins <= 0 {
            return Err(StudyError::InvalidSpectrumConfig(format!(
                "n_bins must be greater than zero, got {n_bins}"
            )));
        }
        if !x_min.is_finite() || !x_max.is_finite() {
            return Err(StudyError::InvalidSpectrumConfig(
                "x_min and x_max must be finite".to_string(),
            ));
        }
        if x_min >= x_max {
            return Err(StudyError::InvalidSpectrumConfig(format!(
                "x_min ({x_min}) must be less than x_max ({x_max})"
            )));
        }

        Ok(Self {
            n_bins: n_bins as usize,
            x_min,
            x_max,
        })
    }

    pub fn width(&self) -> f64 {
        (self.x_max - self.x_min) / self.n_bins as f64
    }

    pub fn low_edge(&self, bin: usize) -> f64 {
        self.x_min + bin as f64 * self.width()
    }

    pub fn high_edge(&self, bin: usize) -> f64 {
        if bin + 1 == self.n_bins {
            return self.x_max;
        }
        self.x_min + (bin + 1) as f64 * self.width()
    }

    pub fn center(&self, bin: usize) -> f64 {
        0.5 * (self.low_edge(bin) + self.high_edge(bin))
    }

    /// Bin containing `x`, `None` for underflow/overflow.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.x_min && x < self.x_max) {
            return None;
        }
        let bin = ((x - self.x_min) / self.width()).floor() as usize;
        Some(bin.min(self.n_bins - 1))
    }
}

/// One bin of the background template
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub low_edge: f64,
    pub high_edge: f64,
    /// Sum of fill weights
    pub weight: f64,
    /// Sum of squared fill weights
    pub variance: f64,
}

/// Immutable binned background model
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedSpectrum {
    binning: Binning,
    bins: Vec<Bin>,
}

impl BinnedSpectrum {
    /// Flat template with `per_bin_expected_count` unit-weight fills at every
    /// bin centre. Deterministic.
    pub fn build(
        n_bins: i64,
        x_min: f64,
        x_max: f64,
        per_bin_expected_count: u64,
    ) -> Result<Self, StudyError> {
        let binning = Binning::new(n_bins, x_min, x_max)?;
        let mut bins: Vec<Bin> = (0..binning.n_bins)
            .map(|i| Bin {
                low_edge: binning.low_edge(i),
                high_edge: binning.high_edge(i),
                weight: 0.0,
                variance: 0.0,
            })
            .collect();

        for i in 0..binning.n_bins {
            let center = binning.center(i);
            let target = binning
                .find_bin(center)
                .ok_or_else(|| StudyError::InvariantViolation(format!("bin centre {center} outside range")))?;
            // Unit-weight fills: sum of weights and of squared weights coincide.
            let entries = per_bin_expected_count as f64;
            bins[target].weight += entries;
            bins[target].variance += entries;
        }

        Ok(Self { binning, bins })
    }

    /// Spectrum from explicit per-bin weights, variances equal to weights.
    pub fn from_weights(binning: Binning, weights: &[f64]) -> Result<Self, StudyError> {
        if weights.len() != binning.n_bins {
            return Err(StudyError::InvariantViolation(format!(
                "expected {} weights, got {}",
                binning.n_bins,
                weights.len()
            )));
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(StudyError::InvariantViolation(format!(
                "bin weights must be finite and non-negative, got {bad}"
            )));
        }

        let bins = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Bin {
                low_edge: binning.low_edge(i),
                high_edge: binning.high_edge(i),
                weight: w,
                variance: w,
            })
            .collect();

        Ok(Self { binning, bins })
    }

    pub fn binning(&self) -> Binning {
        self.binning
    }

    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.weight).collect()
    }

    pub fn variances(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.variance).collect()
    }

    pub fn total_weight(&self) -> f64 {
        self.bins.iter().map(|b| b.weight).sum()
    }

    pub fn first_bin_above(&self, threshold: f64) -> Option<usize> {
        self.bins.iter().position(|b| b.weight > threshold)
    }

    pub fn last_bin_above(&self, threshold: f64) -> Option<usize> {
        self.bins.iter().rposition(|b| b.weight > threshold)
    }

    /// Search domain: high edge of the first non-empty bin and low edge of
    /// the last non-empty bin.
    pub fn search_bounds(&self) -> Option<(f64, f64)> {
        let first = self.first_bin_above(0.0)?;
        let last = self.last_bin_above(0.0)?;
        Some((self.bins[first].high_edge, self.bins[last].low_edge))
    }
}
