//! Toy (pseudo-experiment) generation
//!
//! Every bin of a toy gets a Poisson count whose mean is itself drawn from
//! `Uniform(0, UNIFORM_MEAN_CEILING)`. The background spectrum only supplies
//! the grid; its content is not used as the Poisson mean.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson, Uniform};
use serde::Serialize;

use crate::signal::{Injection, InjectionMode};
use crate::spectrum::{BinnedSpectrum, Binning};
use crate::StudyError;

/// Upper edge of the per-bin Poisson mean draw
pub const UNIFORM_MEAN_CEILING: f64 = 100_000.0;

/// One fluctuated realisation on the spectrum grid
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toy {
    pub index: usize,
    pub binning: Binning,
    pub counts: Vec<u64>,
}

impl Toy {
    /// Persisted histogram name
    pub fn name(&self) -> String {
        format!("toy{}_h", self.index)
    }

    pub fn contents(&self) -> Vec<f64> {
        self.counts.iter().map(|&n| n as f64).collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Stream for toy `toy_index` when toys are thrown independently.
pub fn toy_stream(base_seed: u64, toy_index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(base_seed);
    rng.set_stream(toy_index as u64 + 1);
    rng
}

#[derive(Debug, Clone)]
pub struct ToyGenerator {
    mean_dist: Uniform<f64>,
}

impl Default for ToyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToyGenerator {
    pub fn new() -> Self {
        Self {
            mean_dist: Uniform::new(0.0, UNIFORM_MEAN_CEILING),
        }
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        spectrum: &BinnedSpectrum,
        injection: Option<&Injection>,
        rng: &mut R,
        toy_index: usize,
    ) -> Result<Toy, StudyError> {
        let binning = spectrum.binning();
        if let Some(inj) = injection {
            if inj.density.len() != binning.n_bins {
                return Err(StudyError::InvariantViolation(format!(
                    "signal density has {} bins, spectrum has {}",
                    inj.density.len(),
                    binning.n_bins
                )));
            }
        }

        let mut counts = vec![0_u64; binning.n_bins];
        for (bin, count) in counts.iter_mut().enumerate() {
            let mu = self.mean_dist.sample(rng);
            *count = fill(*count, poisson_draw(mu, rng)?, bin)?;

            if let Some(inj) = injection.filter(|inj| inj.is_active()) {
                let expected = inj.expected(bin);
                let extra = match inj.mode {
                    InjectionMode::Expected => expected.round(),
                    InjectionMode::Poisson => poisson_draw(expected, rng)?,
                    InjectionMode::None => 0.0,
                };
                *count = fill(*count, extra, bin)?;
            }
        }

        Ok(Toy {
            index: toy_index,
            binning,
            counts,
        })
    }
}

fn poisson_draw<R: Rng + ?Sized>(mu: f64, rng: &mut R) -> Result<f64, StudyError> {
    if mu == 0.0 {
        return Ok(0.0);
    }
    let dist = Poisson::new(mu)
        .map_err(|e| StudyError::InvariantViolation(format!("poisson mean {mu}: {e}")))?;
    Ok(dist.sample(rng))
}

fn fill(current: u64, entries: f64, bin: usize) -> Result<u64, StudyError> {
    if !entries.is_finite() || entries < 0.0 {
        return Err(StudyError::InvariantViolation(format!(
            "negative fill request {entries} in bin {bin}"
        )));
    }
    Ok(current + entries as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(n_bins: i64) -> BinnedSpectrum {
        BinnedSpectrum::build(n_bins, 0.0, 0.3, 100).unwrap()
    }

    #[test]
    fn test_toy_has_spectrum_grid() {
        let spectrum = flat(600);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let toy = ToyGenerator::new().generate(&spectrum, None, &mut rng, 7).unwrap();
        assert_eq!(toy.index, 7);
        assert_eq!(toy.name(), "toy7_h");
        assert_eq!(toy.counts.len(), 600);
        assert_eq!(toy.binning, spectrum.binning());
    }

    #[test]
    fn test_same_seed_reproduces_sequence() {
        let spectrum = flat(300);
        let generator = ToyGenerator::new();
        let throw = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..4)
                .map(|i| generator.generate(&spectrum, None, &mut rng, i).unwrap())
                .collect::<Vec<_>>()
        };
        let a = throw(0);
        let b = throw(0);
        assert_eq!(a, b);
        assert_ne!(a[0].counts, a[1].counts);

        let c = throw(1);
        assert_ne!(a[0].counts, c[0].counts);
    }

    #[test]
    fn test_mean_follows_uniform_ceiling_not_spectrum() {
        let spectrum = flat(4000);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let toy = ToyGenerator::new().generate(&spectrum, None, &mut rng, 0).unwrap();
        let mean = toy.total() as f64 / toy.counts.len() as f64;
        assert!((mean - 50_000.0).abs() < 2_500.0, "mean was {mean}");
        assert!(toy.counts.iter().any(|&n| n > 1_000));
    }

    #[test]
    fn test_independent_toy_streams_are_deterministic() {
        let spectrum = flat(50);
        let generator = ToyGenerator::new();
        let a = generator.generate(&spectrum, None, &mut toy_stream(3, 2), 2).unwrap();
        let b = generator.generate(&spectrum, None, &mut toy_stream(3, 2), 2).unwrap();
        let c = generator.generate(&spectrum, None, &mut toy_stream(3, 1), 1).unwrap();
        assert_eq!(a.counts, b.counts);
        assert_ne!(a.counts, c.counts);
    }

    #[test]
    fn test_expected_injection_adds_rounded_signal() {
        let spectrum = flat(4);
        let mut density = vec![0.0; 4];
        density[2] = 1.0;
        let injection = Injection {
            mode: InjectionMode::Expected,
            samples: 1_000_000,
            density,
        };
        let generator = ToyGenerator::new();

        let mut rng_a = ChaCha8Rng::seed_from_u64(5);
        let plain = generator.generate(&spectrum, None, &mut rng_a, 0).unwrap();
        let mut rng_b = ChaCha8Rng::seed_from_u64(5);
        let injected = generator.generate(&spectrum, Some(&injection), &mut rng_b, 0).unwrap();

        assert_eq!(injected.counts[0], plain.counts[0]);
        assert_eq!(injected.counts[1], plain.counts[1]);
        assert_eq!(injected.counts[2], plain.counts[2] + 1_000_000);
        assert_eq!(injected.counts[3], plain.counts[3]);
    }

    #[test]
    fn test_poisson_injection_fluctuates_around_expectation() {
        // Signal sits in the last bin so the extra draw cannot shift the
        // stream used by the bins before it.
        let spectrum = flat(6);
        let mut density = vec![0.0; 6];
        density[5] = 1.0;
        let injection = Injection {
            mode: InjectionMode::Poisson,
            samples: 1_000_000,
            density,
        };
        let generator = ToyGenerator::new();

        let mut extras = Vec::new();
        for seed in 0..5 {
            let mut rng_a = ChaCha8Rng::seed_from_u64(seed);
            let plain = generator.generate(&spectrum, None, &mut rng_a, 0).unwrap();
            let mut rng_b = ChaCha8Rng::seed_from_u64(seed);
            let injected = generator.generate(&spectrum, Some(&injection), &mut rng_b, 0).unwrap();

            assert_eq!(injected.counts[..5], plain.counts[..5]);
            let extra = injected.counts[5] - plain.counts[5];
            // Five standard deviations of Poisson(1e6).
            assert!((extra as f64 - 1_000_000.0).abs() < 5_000.0, "extra {extra}");
            extras.push(extra);
        }
        assert!(extras.iter().any(|&e| e != 1_000_000));
    }

    #[test]
    fn test_inactive_injection_is_ignored() {
        let spectrum = flat(8);
        let injection = Injection {
            mode: InjectionMode::None,
            samples: 500,
            density: vec![0.125; 8],
        };
        let generator = ToyGenerator::new();
        let mut rng_a = ChaCha8Rng::seed_from_u64(9);
        let mut rng_b = ChaCha8Rng::seed_from_u64(9);
        let a = generator.generate(&spectrum, None, &mut rng_a, 0).unwrap();
        let b = generator.generate(&spectrum, Some(&injection), &mut rng_b, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mismatched_density_is_invariant_violation() {
        let spectrum = flat(8);
        let injection = Injection {
            mode: InjectionMode::Poisson,
            samples: 10,
            density: vec![0.5; 2],
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let res = ToyGenerator::new().generate(&spectrum, Some(&injection), &mut rng, 0);
        assert!(matches!(res, Err(StudyError::InvariantViolation(_))));
    }

    #[test]
    fn test_negative_fill_rejected() {
        assert!(matches!(fill(3, -1.0, 0), Err(StudyError::InvariantViolation(_))));
        assert_eq!(fill(3, 2.0, 0).unwrap(), 5);
    }
}
