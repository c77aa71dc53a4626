use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spectrum::BinnedSpectrum;
use crate::toy::Toy;

pub mod sideband;

pub use sideband::SidebandSearch;

/// Mass resolution model shared by the search window and the default signal
/// shape.
pub fn mass_resolution(mass: f64, res_scale: f64) -> f64 {
    res_scale * (0.00070 + 0.0389 * mass)
}

/// Construction parameters for a search engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub poly_order: usize,
    pub win_factor: f64,
    pub res_scale: f64,
    pub asymptotic_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub engine: String,
    pub mass_hypothesis: f64,
    pub window_low: f64,
    pub window_high: f64,
    pub fit_lower: f64,
    pub fit_upper: f64,
    pub observed: f64,
    pub expected_background: f64,
    pub local_significance: f64,
    pub upper_limit: Option<f64>,
    pub poly_coefficients: Vec<f64>,
    pub chi2: f64,
    pub ndf: usize,
    pub fit_valid: bool,
    pub inject_signal: bool,
    pub asymptotic: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("search bounds were never set")]
    BoundsNotSet,
    #[error("mass hypothesis {mass} outside search bounds [{lower}, {upper}]")]
    HypothesisOutOfBounds { mass: f64, lower: f64, upper: f64 },
    #[error("sideband fit needs {needed} bins, got {got}")]
    InsufficientSideband { needed: usize, got: usize },
    #[error("sideband fit normal equations are singular")]
    SingularFit,
    #[error("expected background in search window is not positive: {0}")]
    NonPositiveBackground(f64),
    #[error("{0}")]
    Engine(String),
}

/// Excess search run once per toy at a fixed mass hypothesis
pub trait SearchEngine {
    fn name(&self) -> &'static str;
    fn set_bounds(&mut self, lower: f64, upper: f64);
    fn enable_debug(&mut self);
    fn perform_search(
        &mut self,
        toy: &Toy,
        mass_hypothesis: f64,
        inject_signal: bool,
        asymptotic_flag: bool,
    ) -> Result<SearchResult, SearchError>;
}

/// Builds the engine once the background spectrum exists.
pub type EngineFactory =
    Box<dyn Fn(&EngineSettings, &BinnedSpectrum) -> Result<Box<dyn SearchEngine>, SearchError>>;

pub fn sideband_factory() -> EngineFactory {
    Box::new(
        |settings: &EngineSettings,
         _background: &BinnedSpectrum|
         -> Result<Box<dyn SearchEngine>, SearchError> {
            Ok(Box::new(SidebandSearch::new(*settings)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_scales_linearly() {
        let base = mass_resolution(0.1, 1.0);
        assert!((mass_resolution(0.1, 2.0) - 2.0 * base).abs() < 1e-15);
        assert!(mass_resolution(0.2, 1.0) > base);
    }

    #[test]
    fn test_sideband_factory_builds_named_engine() {
        let settings = EngineSettings {
            poly_order: 2,
            win_factor: 5.0,
            res_scale: 1.0,
            asymptotic_limit: false,
        };
        let background = BinnedSpectrum::build(10, 0.0, 1.0, 1).unwrap();
        let engine = sideband_factory()(&settings, &background).unwrap();
        assert_eq!(engine.name(), "sideband");
    }
}
