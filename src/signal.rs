//! Signal shapes for injection into toys
//!
//! A template is either a binned histogram read from a persisted container or
//! the default Gaussian at the mass hypothesis. Either one is turned into a
//! per-bin probability on the background grid before injection.

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::output::HistogramContainer;
use crate::spectrum::Binning;
use crate::StudyError;

/// How an injected signal enters a toy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    #[default]
    None,
    /// Rounded expectation added to every bin
    Expected,
    /// Poisson draw around the expectation
    Poisson,
}

impl InjectionMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "expected" => Some(Self::Expected),
            "poisson" => Some(Self::Poisson),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalTemplate {
    Binned {
        name: String,
        binning: Binning,
        contents: Vec<f64>,
    },
    Gaussian {
        mean: f64,
        sigma: f64,
    },
}

impl SignalTemplate {
    pub fn gaussian(mean: f64, sigma: f64) -> Self {
        Self::Gaussian { mean, sigma }
    }

    pub fn is_binned(&self) -> bool {
        matches!(self, Self::Binned { .. })
    }

    /// Per-bin probability on `target`, summing to one over the range.
    ///
    /// A binned template hands each target bin the share of every template
    /// bin it overlaps, so no template content is dropped or counted twice
    /// whatever the two bin widths are.
    pub fn density_on(&self, target: &Binning) -> Result<Vec<f64>, StudyError> {
        let raw: Vec<f64> = match self {
            Self::Binned {
                name,
                binning,
                contents,
            } => {
                if binning.x_max <= target.x_min || binning.x_min >= target.x_max {
                    return Err(StudyError::SignalTemplateIncompatible(format!(
                        "template '{name}' spans [{}, {}], spectrum spans [{}, {}]",
                        binning.x_min, binning.x_max, target.x_min, target.x_max
                    )));
                }
                if contents.len() != binning.n_bins {
                    return Err(StudyError::InvariantViolation(format!(
                        "template '{name}' declares {} bins but stores {}",
                        binning.n_bins,
                        contents.len()
                    )));
                }
                (0..target.n_bins)
                    .map(|i| overlap_content(binning, contents, target.low_edge(i), target.high_edge(i)))
                    .collect()
            }
            Self::Gaussian { mean, sigma } => {
                if !(*sigma > 0.0) || !sigma.is_finite() {
                    return Err(StudyError::InvariantViolation(format!(
                        "gaussian signal width must be positive, got {sigma}"
                    )));
                }
                let width = target.width();
                (0..target.n_bins)
                    .map(|i| {
                        let z = (target.center(i) - mean) / sigma;
                        (-0.5 * z * z).exp() * width
                    })
                    .collect()
            }
        };

        let sum: f64 = raw.iter().sum();
        if !(sum > 0.0) {
            return Err(StudyError::SignalTemplateIncompatible(
                "signal shape has no support inside the spectrum range".to_string(),
            ));
        }
        Ok(raw.into_iter().map(|v| v / sum).collect())
    }
}

/// Template content falling inside `[low, high)`, each template bin taken
/// in proportion to its overlap with the interval.
fn overlap_content(binning: &Binning, contents: &[f64], low: f64, high: f64) -> f64 {
    let low = low.max(binning.x_min);
    let high = high.min(binning.x_max);
    if high <= low {
        return 0.0;
    }

    // One bin of slack on each side absorbs rounding at shared edges.
    let width = binning.width();
    let first = (((low - binning.x_min) / width).floor() as usize).saturating_sub(1);
    let last = (((high - binning.x_min) / width).ceil() as usize + 1).min(binning.n_bins);
    (first..last)
        .map(|j| {
            let overlap = high.min(binning.high_edge(j)) - low.max(binning.low_edge(j));
            if overlap > 0.0 {
                contents[j].max(0.0) * overlap / width
            } else {
                0.0
            }
        })
        .sum()
}

/// Outcome of resolving the configured signal shape
#[derive(Debug, Clone, PartialEq)]
pub struct SignalResolution {
    pub template: SignalTemplate,
    /// False when the shape specification was partial
    pub injection_allowed: bool,
    pub warning: Option<String>,
}

impl SignalResolution {
    pub fn default_shape(mean: f64, sigma: f64) -> Self {
        Self {
            template: SignalTemplate::gaussian(mean, sigma),
            injection_allowed: true,
            warning: None,
        }
    }

    /// Resolve `(file, name)` into a template. A partial pair falls back to
    /// the Gaussian at `(mean, sigma)` with injection disabled; a full pair
    /// that cannot be loaded is an error.
    pub fn resolve(file: &str, name: &str, mean: f64, sigma: f64) -> Result<Self, StudyError> {
        info!("Signal shape file :: {file}");
        info!("Signal shape hist :: {name}");

        match (file.is_empty(), name.is_empty()) {
            (false, false) => {
                let template = load_template(Path::new(file), name)?;
                Ok(Self {
                    template,
                    injection_allowed: true,
                    warning: None,
                })
            }
            (false, true) => Ok(Self::partial(
                "signal injection file, but no histogram, specified; defaulting to Gaussian",
                mean,
                sigma,
            )),
            (true, false) => Ok(Self::partial(
                "signal injection histogram, but no file, specified; defaulting to Gaussian",
                mean,
                sigma,
            )),
            (true, true) => Ok(Self::default_shape(mean, sigma)),
        }
    }

    fn partial(reason: &str, mean: f64, sigma: f64) -> Self {
        let err = StudyError::SignalTemplateUnavailable(reason.to_string());
        warn!("{err}");
        Self {
            template: SignalTemplate::gaussian(mean, sigma),
            injection_allowed: false,
            warning: Some(err.to_string()),
        }
    }
}

fn load_template(path: &Path, name: &str) -> Result<SignalTemplate, StudyError> {
    let container = HistogramContainer::load(path).map_err(|e| {
        StudyError::SignalTemplateLoad(format!("{}: {e}", path.display()))
    })?;
    let hist = container.histogram(name).ok_or_else(|| {
        StudyError::SignalTemplateLoad(format!(
            "histogram '{name}' not found in {}",
            path.display()
        ))
    })?;
    let binning = hist.binning()?;
    Ok(SignalTemplate::Binned {
        name: name.to_string(),
        binning,
        contents: hist.contents.clone(),
    })
}

/// Signal contribution handed to the toy generator
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub mode: InjectionMode,
    pub samples: u64,
    pub density: Vec<f64>,
}

impl Injection {
    pub fn expected(&self, bin: usize) -> f64 {
        self.samples as f64 * self.density[bin]
    }

    pub fn is_active(&self) -> bool {
        self.mode != InjectionMode::None && self.samples > 0
    }
}
