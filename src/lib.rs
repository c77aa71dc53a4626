//! BhFit sandbox - toy Monte Carlo for bump hunt background studies
//!
//! Builds a flat background mass spectrum, throws Poisson-fluctuated toys on
//! its grid, optionally injects a signal shape, and hands every toy to a
//! [`SearchEngine`] at a fixed mass hypothesis. Toys and search results are
//! collected in toy order and persisted to a single container.

pub mod config;
pub mod output;
pub mod search;
pub mod signal;
pub mod spectrum;
pub mod study;
pub mod toy;

use thiserror::Error;

// Re-export main types
pub use config::{ConfigurationWithDefaults, FieldProvenance, ParameterSet, StudyConfiguration};
pub use search::{EngineFactory, EngineSettings, SearchEngine, SearchError, SearchResult};
pub use signal::{InjectionMode, SignalResolution, SignalTemplate};
pub use spectrum::{Bin, BinnedSpectrum, Binning};
pub use study::{StudyOrchestrator, StudyState, StudySummary, ToyRecord};
pub use toy::{Toy, ToyGenerator};

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid spectrum configuration: {0}")]
    InvalidSpectrumConfig(String),
    #[error("configuration field '{field}': {reason}")]
    ConfigurationParse { field: &'static str, reason: String },
    #[error("signal template unavailable: {0}")]
    SignalTemplateUnavailable(String),
    #[error("failed to load signal template: {0}")]
    SignalTemplateLoad(String),
    #[error("signal template incompatible with spectrum binning: {0}")]
    SignalTemplateIncompatible(String),
    #[error("output sink failure: {0}")]
    OutputSinkFailure(String),
    #[error("search engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("search failed for toy {toy_index}: {reason}")]
    SearchEngineFailure { toy_index: usize, reason: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("invalid study state: expected {expected}, found {actual}")]
    InvalidState {
        expected: StudyState,
        actual: StudyState,
    },
}
