//! Study orchestration
//!
//! Drives one toy study through `Configured → Initialized → GeneratingToys →
//! FittingToys → Finalized`. The orchestrator owns the random stream, the
//! search engine and the output sink for the whole run.

use std::fmt;
use std::path::Path;

use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigurationWithDefaults, ParameterSet, SearchFailurePolicy, StudyConfiguration};
use crate::output::{OutputFiles, OutputSink, PersistedHistogram, SPECTRUM_HIST_NAME};
use crate::search::{mass_resolution, EngineFactory, SearchEngine, SearchResult};
use crate::signal::{Injection, InjectionMode, SignalResolution};
use crate::spectrum::BinnedSpectrum;
use crate::toy::{Toy, ToyGenerator};
use crate::StudyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudyState {
    Configured,
    Initialized,
    GeneratingToys,
    FittingToys,
    Finalized,
}

impl fmt::Display for StudyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configured => "configured",
            Self::Initialized => "initialized",
            Self::GeneratingToys => "generating-toys",
            Self::FittingToys => "fitting-toys",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToyStatus {
    Ok,
    Failed,
}

/// Search outcome for one toy. Failed toys keep their slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyRecord {
    pub toy_index: usize,
    pub status: ToyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchResult>,
}

impl ToyRecord {
    pub fn ok(toy_index: usize, result: SearchResult) -> Self {
        Self {
            toy_index,
            status: ToyStatus::Ok,
            reason: None,
            result: Some(result),
        }
    }

    pub fn failed(toy_index: usize, reason: String) -> Self {
        Self {
            toy_index,
            status: ToyStatus::Failed,
            reason: Some(reason),
            result: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToyStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudySummary {
    pub toys_generated: usize,
    pub results: usize,
    pub failed: usize,
    pub defaulted_fields: Vec<&'static str>,
    pub warnings: Vec<String>,
    pub files: OutputFiles,
}

pub struct StudyOrchestrator {
    settings: ConfigurationWithDefaults,
    state: StudyState,
    generator: ToyGenerator,
    rng: ChaCha8Rng,
    spectrum: Option<BinnedSpectrum>,
    signal: Option<SignalResolution>,
    injection: Option<Injection>,
    engine: Option<Box<dyn SearchEngine>>,
    sink: Option<OutputSink>,
    toys: Vec<Toy>,
    records: Vec<ToyRecord>,
    warnings: Vec<String>,
}

impl StudyOrchestrator {
    /// Lenient: bad fields fall back to defaults, see
    /// [`ConfigurationWithDefaults`].
    pub fn configure(params: &ParameterSet) -> Self {
        info!("Configuring BhFit sandbox");
        Self::from_configuration(ConfigurationWithDefaults::from_parameters(params))
    }

    pub fn from_configuration(settings: ConfigurationWithDefaults) -> Self {
        let warnings = settings
            .defaulted_fields()
            .into_iter()
            .map(|field| format!("parameter '{field}' defaulted"))
            .collect();
        let seed = settings.config.seed;

        Self {
            settings,
            state: StudyState::Configured,
            generator: ToyGenerator::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            spectrum: None,
            signal: None,
            injection: None,
            engine: None,
            sink: None,
            toys: Vec::new(),
            records: Vec::new(),
            warnings,
        }
    }

    pub fn config(&self) -> &StudyConfiguration {
        &self.settings.config
    }

    pub fn settings(&self) -> &ConfigurationWithDefaults {
        &self.settings
    }

    pub fn state(&self) -> StudyState {
        self.state
    }

    pub fn spectrum(&self) -> Option<&BinnedSpectrum> {
        self.spectrum.as_ref()
    }

    pub fn signal(&self) -> Option<&SignalResolution> {
        self.signal.as_ref()
    }

    pub fn injection(&self) -> Option<&Injection> {
        self.injection.as_ref()
    }

    pub fn toys(&self) -> &[Toy] {
        &self.toys
    }

    pub fn records(&self) -> &[ToyRecord] {
        &self.records
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn expect_state(&self, expected: StudyState) -> Result<(), StudyError> {
        if self.state == expected {
            return Ok(());
        }
        Err(StudyError::InvalidState {
            expected,
            actual: self.state,
        })
    }

    /// Builds the spectrum, resolves the signal shape, sets up the search
    /// engine and opens the sink. The random stream is reseeded here.
    pub fn initialize(&mut self, output: &Path, factory: &EngineFactory) -> Result<(), StudyError> {
        self.expect_state(StudyState::Configured)?;
        let cfg = &self.settings.config;

        let spectrum = BinnedSpectrum::build(cfg.n_bins, cfg.x_min, cfg.x_max, cfg.bkg_per_bin)?;
        let (lower, upper) = spectrum.search_bounds().ok_or_else(|| {
            StudyError::InvalidSpectrumConfig("background spectrum has no non-empty bins".to_string())
        })?;

        let sigma = mass_resolution(cfg.mass_hypo, cfg.res_scale);
        let signal = SignalResolution::resolve(
            &cfg.signal_shape_h_file,
            &cfg.signal_shape_h_name,
            cfg.mass_hypo,
            sigma,
        )?;
        if let Some(w) = &signal.warning {
            self.warnings.push(w.clone());
        }

        let injection = match cfg.injection {
            InjectionMode::None => None,
            mode if signal.injection_allowed => {
                let density = signal.template.density_on(&spectrum.binning())?;
                Some(Injection {
                    mode,
                    samples: cfg.toy_sig_samples,
                    density,
                })
            }
            _ => {
                warn!("signal injection requested but disabled by the signal shape configuration");
                None
            }
        };

        // Everything that can fail is settled before the output file is
        // truncated.
        let mut engine = factory(&cfg.engine_settings(), &spectrum)
            .map_err(|e| StudyError::EngineUnavailable(e.to_string()))?;
        engine.set_bounds(lower, upper);
        if cfg.debug > 0 {
            engine.enable_debug();
        }
        info!(
            "{} engine ready, bounds [{lower}, {upper}], poly order {}, window factor {}",
            engine.name(),
            cfg.poly_order,
            cfg.win_factor
        );

        let label = if cfg.mass_spectrum.is_empty() {
            SPECTRUM_HIST_NAME
        } else {
            cfg.mass_spectrum.as_str()
        };
        let mut sink = OutputSink::create(output, label)?;
        sink.write_histogram(PersistedHistogram::from_spectrum(SPECTRUM_HIST_NAME, &spectrum));

        self.rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        self.spectrum = Some(spectrum);
        self.signal = Some(signal);
        self.injection = injection;
        self.sink = Some(sink);
        self.engine = Some(engine);
        self.state = StudyState::Initialized;
        Ok(())
    }

    pub fn generate_toys(&mut self) -> Result<&[Toy], StudyError> {
        self.expect_state(StudyState::Initialized)?;
        self.state = StudyState::GeneratingToys;

        let spectrum = self
            .spectrum
            .as_ref()
            .ok_or_else(|| StudyError::InvariantViolation("spectrum missing after initialize".to_string()))?;

        let n_toys = self.settings.config.n_toys;
        self.toys.reserve(n_toys);
        for toy_index in 0..n_toys {
            info!("Generating toy {toy_index}");
            let toy = self
                .generator
                .generate(spectrum, self.injection.as_ref(), &mut self.rng, toy_index)?;
            self.toys.push(toy);
        }

        Ok(&self.toys)
    }

    /// Searches every toy in index order and persists it. Engine failures
    /// follow `on_search_failure`.
    pub fn fit_toys(&mut self) -> Result<&[ToyRecord], StudyError> {
        self.expect_state(StudyState::GeneratingToys)?;
        self.state = StudyState::FittingToys;

        let cfg = &self.settings.config;
        let (engine, sink) = match (self.engine.as_mut(), self.sink.as_mut()) {
            (Some(engine), Some(sink)) => (engine, sink),
            _ => {
                return Err(StudyError::InvariantViolation(
                    "engine or output sink missing after initialize".to_string(),
                ))
            }
        };

        for toy in &self.toys {
            info!("Fitting toy {}", toy.index);
            let (record, abort) = match engine.perform_search(toy, cfg.mass_hypo, false, false) {
                Ok(result) => (ToyRecord::ok(toy.index, result), false),
                Err(err) => {
                    warn!("search failed for toy {}: {err}", toy.index);
                    let abort = cfg.on_search_failure == SearchFailurePolicy::Abort;
                    (ToyRecord::failed(toy.index, err.to_string()), abort)
                }
            };

            // The failing toy is persisted with its marker even when the run
            // stops on it.
            sink.write_histogram(PersistedHistogram::from_toy(toy));
            sink.write_result(record.clone());
            let reason = record.reason.clone();
            self.records.push(record);

            if abort {
                return Err(StudyError::SearchEngineFailure {
                    toy_index: toy.index,
                    reason: reason.unwrap_or_default(),
                });
            }
        }

        Ok(&self.records)
    }

    /// Writes and closes the output and releases the engine. Accepted from
    /// any state after initialisation so an aborted run still leaves its
    /// partial output behind.
    pub fn finalize(&mut self) -> Result<StudySummary, StudyError> {
        if matches!(self.state, StudyState::Configured | StudyState::Finalized) {
            return Err(StudyError::InvalidState {
                expected: StudyState::FittingToys,
                actual: self.state,
            });
        }

        let sink = self
            .sink
            .take()
            .ok_or_else(|| StudyError::InvariantViolation("output sink already closed".to_string()))?;
        self.engine = None;
        self.state = StudyState::Finalized;
        let files = sink.finish()?;
        info!("wrote study output to {}", files.container_path.display());

        Ok(StudySummary {
            toys_generated: self.toys.len(),
            results: self.records.len(),
            failed: self.records.iter().filter(|r| !r.is_ok()).count(),
            defaulted_fields: self.settings.defaulted_fields(),
            warnings: self.warnings.clone(),
            files,
        })
    }

    /// Generate, fit and finalize an initialised study.
    pub fn run(&mut self) -> Result<StudySummary, StudyError> {
        self.generate_toys()?;
        let fitted = self.fit_toys().map(|records| records.len());
        if let Err(err) = fitted {
            self.finalize()?;
            return Err(err);
        }
        self.finalize()
    }
}
