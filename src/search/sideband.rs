//! Reference search engine
//!
//! Fits a polynomial to the sidebands around the mass window, integrates it
//! over the window, and compares with the observed window count using the
//! Poisson likelihood-ratio significance.

use log::debug;
use nalgebra::{DMatrix, DVector};

use super::{mass_resolution, EngineSettings, SearchEngine, SearchError, SearchResult};
use crate::toy::Toy;

/// One-sided 95% quantile used for the asymptotic limit
const LIMIT_Z: f64 = 1.64;

pub struct SidebandSearch {
    settings: EngineSettings,
    bounds: Option<(f64, f64)>,
    debug: bool,
}

impl SidebandSearch {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            bounds: None,
            debug: false,
        }
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    pub fn window(&self, mass: f64) -> (f64, f64) {
        let half = 0.5 * self.settings.win_factor * mass_resolution(mass, self.settings.res_scale);
        (mass - half, mass + half)
    }
}

fn solve_normal_equation(normal: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = normal.clone().cholesky() {
        return Some(chol.solve(&rhs));
    }
    normal.lu().solve(&rhs)
}

fn eval_poly(coefficients: &DVector<f64>, t: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * t + c)
}

fn likelihood_significance(observed: f64, background: f64) -> f64 {
    if observed <= 0.0 {
        return -(2.0 * background).sqrt();
    }
    let term = observed * (observed / background).ln() - (observed - background);
    let z = (2.0 * term.max(0.0)).sqrt();
    if observed >= background {
        z
    } else {
        -z
    }
}

impl SearchEngine for SidebandSearch {
    fn name(&self) -> &'static str {
        "sideband"
    }

    fn set_bounds(&mut self, lower: f64, upper: f64) {
        self.bounds = Some((lower, upper));
    }

    fn enable_debug(&mut self) {
        self.debug = true;
    }

    fn perform_search(
        &mut self,
        toy: &Toy,
        mass_hypothesis: f64,
        inject_signal: bool,
        asymptotic_flag: bool,
    ) -> Result<SearchResult, SearchError> {
        let (lower, upper) = self.bounds.ok_or(SearchError::BoundsNotSet)?;
        if !(mass_hypothesis >= lower && mass_hypothesis <= upper) {
            return Err(SearchError::HypothesisOutOfBounds {
                mass: mass_hypothesis,
                lower,
                upper,
            });
        }

        let (raw_lo, raw_hi) = self.window(mass_hypothesis);
        let window_low = raw_lo.max(lower);
        let window_high = raw_hi.min(upper);
        let span = (upper - lower).max(f64::EPSILON);
        let normalized = |x: f64| 2.0 * (x - lower) / span - 1.0;

        let mut sideband = Vec::new();
        let mut window = Vec::new();
        for (bin, &count) in toy.counts.iter().enumerate() {
            let center = toy.binning.center(bin);
            if center < lower || center > upper {
                continue;
            }
            let point = (normalized(center), count as f64);
            if center >= window_low && center <= window_high {
                window.push(point);
            } else {
                sideband.push(point);
            }
        }

        let n_params = self.settings.poly_order + 1;
        if sideband.len() < n_params + 1 {
            return Err(SearchError::InsufficientSideband {
                needed: n_params + 1,
                got: sideband.len(),
            });
        }

        let mut normal = DMatrix::<f64>::zeros(n_params, n_params);
        let mut rhs = DVector::<f64>::zeros(n_params);
        for &(t, n) in &sideband {
            let w = 1.0 / n.max(1.0);
            let powers: Vec<f64> = (0..n_params).map(|k| t.powi(k as i32)).collect();
            for a in 0..n_params {
                rhs[a] += w * powers[a] * n;
                for b in 0..n_params {
                    normal[(a, b)] += w * powers[a] * powers[b];
                }
            }
        }
        let coefficients = solve_normal_equation(normal, rhs).ok_or(SearchError::SingularFit)?;

        let chi2: f64 = sideband
            .iter()
            .map(|&(t, n)| {
                let r = n - eval_poly(&coefficients, t);
                r * r / n.max(1.0)
            })
            .sum();
        let ndf = sideband.len() - n_params;

        let expected_background: f64 = window.iter().map(|&(t, _)| eval_poly(&coefficients, t)).sum();
        if !(expected_background > 0.0) {
            return Err(SearchError::NonPositiveBackground(expected_background));
        }
        let observed: f64 = window.iter().map(|&(_, n)| n).sum();

        let local_significance = likelihood_significance(observed, expected_background);
        let asymptotic = self.settings.asymptotic_limit || asymptotic_flag;
        let upper_limit = asymptotic
            .then(|| (observed - expected_background).max(0.0) + LIMIT_Z * expected_background.sqrt());

        if self.debug {
            debug!(
                "toy {} m={mass_hypothesis:.5} window=[{window_low:.5}, {window_high:.5}] n={observed} b={expected_background:.3} z={local_significance:.3} chi2/ndf={chi2:.2}/{ndf}",
                toy.index
            );
        }

        Ok(SearchResult {
            engine: self.name().to_string(),
            mass_hypothesis,
            window_low,
            window_high,
            fit_lower: lower,
            fit_upper: upper,
            observed,
            expected_background,
            local_significance,
            upper_limit,
            poly_coefficients: coefficients.iter().copied().collect(),
            chi2,
            ndf,
            fit_valid: chi2.is_finite() && ndf > 0,
            inject_signal,
            asymptotic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::Binning;

    fn settings(poly_order: usize) -> EngineSettings {
        EngineSettings {
            poly_order,
            win_factor: 5.0,
            res_scale: 1.0,
            asymptotic_limit: false,
        }
    }

    fn flat_toy(count: u64) -> Toy {
        let binning = Binning::new(600, 0.0, 0.3).unwrap();
        Toy {
            index: 0,
            binning,
            counts: vec![count; 600],
        }
    }

    #[test]
    fn test_requires_bounds() {
        let mut engine = SidebandSearch::new(settings(2));
        let res = engine.perform_search(&flat_toy(100), 0.15, false, false);
        assert_eq!(res, Err(SearchError::BoundsNotSet));
    }

    #[test]
    fn test_hypothesis_outside_bounds() {
        let mut engine = SidebandSearch::new(settings(2));
        engine.set_bounds(0.01, 0.29);
        let res = engine.perform_search(&flat_toy(100), 0.295, false, false);
        assert!(matches!(res, Err(SearchError::HypothesisOutOfBounds { .. })));
    }

    #[test]
    fn test_flat_toy_has_no_excess() {
        let mut engine = SidebandSearch::new(settings(2));
        engine.set_bounds(0.0005, 0.2995);
        let result = engine.perform_search(&flat_toy(1000), 0.15, false, false).unwrap();
        assert!(result.local_significance.abs() < 1e-3);
        assert!((result.observed - result.expected_background).abs() < 1e-3);
        assert!(result.upper_limit.is_none());
        assert!(result.fit_valid);
        assert_eq!(result.poly_coefficients.len(), 3);
    }

    #[test]
    fn test_bump_gives_positive_significance() {
        let mut toy = flat_toy(1000);
        let bin = toy.binning.find_bin(0.15).unwrap();
        toy.counts[bin] += 2000;
        let mut engine = SidebandSearch::new(settings(1));
        engine.set_bounds(0.0005, 0.2995);
        let result = engine.perform_search(&toy, 0.15, false, true).unwrap();
        assert!(result.local_significance > 3.0);
        assert!(result.asymptotic);
        assert!(result.upper_limit.unwrap() > 2000.0);
    }

    #[test]
    fn test_window_narrower_than_bounds() {
        let engine = SidebandSearch::new(settings(2));
        let (lo, hi) = engine.window(0.15);
        assert!(lo < 0.15 && hi > 0.15);
        assert!((hi - lo - 5.0 * mass_resolution(0.15, 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_too_many_parameters_for_sideband() {
        let binning = Binning::new(6, 0.0, 0.3).unwrap();
        let toy = Toy {
            index: 0,
            binning,
            counts: vec![10; 6],
        };
        let mut engine = SidebandSearch::new(settings(5));
        engine.set_bounds(0.0, 0.3);
        let res = engine.perform_search(&toy, 0.15, false, false);
        assert!(matches!(res, Err(SearchError::InsufficientSideband { .. })));
    }

    #[test]
    fn test_significance_sign() {
        assert!(likelihood_significance(150.0, 100.0) > 0.0);
        assert!(likelihood_significance(50.0, 100.0) < 0.0);
        assert!((likelihood_significance(0.0, 8.0) + 4.0).abs() < 1e-12);
    }
}
