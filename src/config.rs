//! Study configuration
//!
//! Parameters arrive as a flat TOML table. Parsing is lenient per field: a
//! missing or malformed field is logged, replaced by its default, and marked
//! [`FieldProvenance::Defaulted`] so callers can see which values were not
//! taken from the payload. Binning fields are read the same way but are
//! validated later by the spectrum builder, where a bad range is fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::search::EngineSettings;
use crate::signal::InjectionMode;
use crate::StudyError;

/// Raw key/value payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    values: toml::Table,
}

impl ParameterSet {
    pub fn from_toml_str(raw: &str) -> Result<Self, StudyError> {
        let values: toml::Table = toml::from_str(raw)?;
        Ok(Self { values })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, StudyError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<toml::Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn value(&self, key: &'static str) -> Result<&toml::Value, StudyError> {
        self.values.get(key).ok_or(StudyError::ConfigurationParse {
            field: key,
            reason: "parameter not found".to_string(),
        })
    }

    pub fn get_integer(&self, key: &'static str) -> Result<i64, StudyError> {
        match self.value(key)? {
            toml::Value::Integer(v) => Ok(*v),
            other => Err(type_error(key, "integer", other)),
        }
    }

    /// Integers are accepted for double parameters.
    pub fn get_double(&self, key: &'static str) -> Result<f64, StudyError> {
        match self.value(key)? {
            toml::Value::Float(v) => Ok(*v),
            toml::Value::Integer(v) => Ok(*v as f64),
            other => Err(type_error(key, "double", other)),
        }
    }

    pub fn get_string(&self, key: &'static str) -> Result<String, StudyError> {
        match self.value(key)? {
            toml::Value::String(v) => Ok(v.clone()),
            other => Err(type_error(key, "string", other)),
        }
    }

    pub fn get_boolean(&self, key: &'static str) -> Result<bool, StudyError> {
        match self.value(key)? {
            toml::Value::Boolean(v) => Ok(*v),
            other => Err(type_error(key, "boolean", other)),
        }
    }
}

fn type_error(key: &'static str, expected: &str, got: &toml::Value) -> StudyError {
    StudyError::ConfigurationParse {
        field: key,
        reason: format!("expected {expected}, got {}", got.type_str()),
    }
}

fn out_of_range(key: &'static str, reason: String) -> StudyError {
    StudyError::ConfigurationParse { field: key, reason }
}

/// What happens when the search engine fails on a toy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFailurePolicy {
    /// Keep going; the toy gets a failed record
    #[default]
    Record,
    /// Stop the run at the first failure
    Abort,
}

impl SearchFailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "record" | "skip" => Some(Self::Record),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfiguration {
    pub debug: i64,
    pub mass_spectrum: String,
    pub mass_hypo: f64,
    pub win_factor: u32,
    pub poly_order: usize,
    pub seed: u64,
    pub n_toys: usize,
    pub toy_sig_samples: u64,
    /// Recorded with the study; the reference toy model does not scale with it
    pub toy_bkg_mult: u64,
    pub res_scale: f64,
    pub signal_shape_h_name: String,
    pub signal_shape_h_file: String,
    pub n_bins: i64,
    pub x_min: f64,
    pub x_max: f64,
    pub bkg_per_bin: u64,
    pub asymptotic_limit: bool,
    pub injection: InjectionMode,
    pub on_search_failure: SearchFailurePolicy,
}

impl Default for StudyConfiguration {
    fn default() -> Self {
        Self {
            debug: 0,
            mass_spectrum: String::new(),
            mass_hypo: 0.15,
            win_factor: 5,
            poly_order: 3,
            seed: 0,
            n_toys: 0,
            toy_sig_samples: 0,
            toy_bkg_mult: 1,
            res_scale: 1.0,
            signal_shape_h_name: String::new(),
            signal_shape_h_file: String::new(),
            n_bins: 6000,
            x_min: 0.0,
            x_max: 0.3,
            bkg_per_bin: 100,
            asymptotic_limit: false,
            injection: InjectionMode::None,
            on_search_failure: SearchFailurePolicy::Record,
        }
    }
}

impl StudyConfiguration {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poly_order: self.poly_order,
            win_factor: f64::from(self.win_factor),
            res_scale: self.res_scale,
            asymptotic_limit: self.asymptotic_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldProvenance {
    Explicit,
    /// Optional field absent from the payload
    Unset,
    /// Required field missing, or any field malformed
    Defaulted { reason: String },
}

/// Configuration plus where every field came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationWithDefaults {
    pub config: StudyConfiguration,
    pub provenance: BTreeMap<&'static str, FieldProvenance>,
}

struct FieldReader<'a> {
    params: &'a ParameterSet,
    provenance: BTreeMap<&'static str, FieldProvenance>,
}

impl FieldReader<'_> {
    /// Missing required fields warn; missing optional fields only log at
    /// debug level. Malformed fields always warn.
    fn take<T>(
        &mut self,
        key: &'static str,
        required: bool,
        default: T,
        parse: impl FnOnce(&ParameterSet, &'static str) -> Result<T, StudyError>,
    ) -> T {
        if !required && !self.params.contains(key) {
            debug!("optional parameter '{key}' not set, using default");
            self.provenance.insert(key, FieldProvenance::Unset);
            return default;
        }

        match parse(self.params, key) {
            Ok(value) => {
                self.provenance.insert(key, FieldProvenance::Explicit);
                value
            }
            Err(err) => {
                warn!("{err}; using default");
                self.provenance.insert(
                    key,
                    FieldProvenance::Defaulted {
                        reason: err.to_string(),
                    },
                );
                default
            }
        }
    }
}

fn non_negative(params: &ParameterSet, key: &'static str) -> Result<u64, StudyError> {
    let v = params.get_integer(key)?;
    u64::try_from(v).map_err(|_| out_of_range(key, format!("must be >= 0, got {v}")))
}

fn positive_double(params: &ParameterSet, key: &'static str) -> Result<f64, StudyError> {
    let v = params.get_double(key)?;
    if v > 0.0 && v.is_finite() {
        Ok(v)
    } else {
        Err(out_of_range(key, format!("must be a positive finite number, got {v}")))
    }
}

impl ConfigurationWithDefaults {
    /// Never fails. Every field is read independently, so one bad field does
    /// not hide the fields after it.
    pub fn from_parameters(params: &ParameterSet) -> Self {
        let d = StudyConfiguration::default();
        let mut r = FieldReader {
            params,
            provenance: BTreeMap::new(),
        };

        let config = StudyConfiguration {
            debug: r.take("debug", true, d.debug, |p, k| p.get_integer(k)),
            mass_spectrum: r.take("massSpectrum", true, d.mass_spectrum, |p, k| p.get_string(k)),
            mass_hypo: r.take("mass_hypo", true, d.mass_hypo, |p, k| {
                let v = p.get_double(k)?;
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(out_of_range(k, "must be finite".to_string()))
                }
            }),
            win_factor: r.take("win_factor", true, d.win_factor, |p, k| {
                let v = p.get_integer(k)?;
                u32::try_from(v)
                    .ok()
                    .filter(|w| *w > 0)
                    .ok_or_else(|| out_of_range(k, format!("must be > 0, got {v}")))
            }),
            poly_order: r.take("poly_order", true, d.poly_order, |p, k| {
                non_negative(p, k).map(|v| v as usize)
            }),
            seed: r.take("seed", true, d.seed, non_negative),
            n_toys: r.take("nToys", true, d.n_toys, |p, k| non_negative(p, k).map(|v| v as usize)),
            toy_sig_samples: r.take("toy_sig_samples", true, d.toy_sig_samples, non_negative),
            toy_bkg_mult: r.take("toy_bkg_mult", true, d.toy_bkg_mult, non_negative),
            res_scale: r.take("res_scale", true, d.res_scale, positive_double),
            signal_shape_h_name: r.take("signal_shape_h_name", false, d.signal_shape_h_name, |p, k| {
                p.get_string(k)
            }),
            signal_shape_h_file: r.take("signal_shape_h_file", false, d.signal_shape_h_file, |p, k| {
                p.get_string(k)
            }),
            n_bins: r.take("nBins", false, d.n_bins, |p, k| p.get_integer(k)),
            x_min: r.take("xMin", false, d.x_min, |p, k| p.get_double(k)),
            x_max: r.take("xMax", false, d.x_max, |p, k| p.get_double(k)),
            bkg_per_bin: r.take("bkg_per_bin", false, d.bkg_per_bin, non_negative),
            asymptotic_limit: r.take("asymptoticLimit", false, d.asymptotic_limit, |p, k| {
                p.get_boolean(k)
            }),
            injection: r.take("injection", false, d.injection, |p, k| {
                let raw = p.get_string(k)?;
                InjectionMode::parse(&raw)
                    .ok_or_else(|| out_of_range(k, format!("unknown injection mode '{raw}'")))
            }),
            on_search_failure: r.take("on_search_failure", false, d.on_search_failure, |p, k| {
                let raw = p.get_string(k)?;
                SearchFailurePolicy::parse(&raw)
                    .ok_or_else(|| out_of_range(k, format!("unknown failure policy '{raw}'")))
            }),
        };

        Self {
            config,
            provenance: r.provenance,
        }
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        matches!(self.provenance.get(key), Some(FieldProvenance::Explicit))
    }

    pub fn defaulted_fields(&self) -> Vec<&'static str> {
        self.provenance
            .iter()
            .filter(|(_, p)| matches!(p, FieldProvenance::Defaulted { .. }))
            .map(|(k, _)| *k)
            .collect()
    }
}
