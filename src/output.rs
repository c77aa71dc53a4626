use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};

use crate::spectrum::{BinnedSpectrum, Binning};
use crate::study::{ToyRecord, ToyStatus};
use crate::toy::Toy;
use crate::StudyError;

pub const OUTPUT_SCHEMA_VERSION: &str = "1.0.0";

/// Name of the persisted background histogram
pub const SPECTRUM_HIST_NAME: &str = "mass_spec_h";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedHistogram {
    pub name: String,
    pub n_bins: usize,
    pub x_min: f64,
    pub x_max: f64,
    pub contents: Vec<f64>,
    pub variances: Vec<f64>,
}

impl PersistedHistogram {
    pub fn from_contents(name: &str, binning: Binning, contents: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            n_bins: binning.n_bins,
            x_min: binning.x_min,
            x_max: binning.x_max,
            variances: contents.clone(),
            contents,
        }
    }

    pub fn from_spectrum(name: &str, spectrum: &BinnedSpectrum) -> Self {
        let binning = spectrum.binning();
        Self {
            name: name.to_string(),
            n_bins: binning.n_bins,
            x_min: binning.x_min,
            x_max: binning.x_max,
            contents: spectrum.weights(),
            variances: spectrum.variances(),
        }
    }

    /// Unit-weight fills, so variances equal counts.
    pub fn from_toy(toy: &Toy) -> Self {
        Self::from_contents(&toy.name(), toy.binning, toy.contents())
    }

    pub fn binning(&self) -> Result<Binning, StudyError> {
        let binning = Binning::new(self.n_bins as i64, self.x_min, self.x_max)?;
        if self.contents.len() != self.n_bins {
            return Err(StudyError::InvariantViolation(format!(
                "histogram '{}' declares {} bins but stores {}",
                self.name,
                self.n_bins,
                self.contents.len()
            )));
        }
        Ok(binning)
    }
}

/// Persisted study container: histograms plus per-toy results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramContainer {
    pub schema_version: String,
    pub study: String,
    pub histograms: Vec<PersistedHistogram>,
    #[serde(default)]
    pub results: Vec<ToyRecord>,
}

impl HistogramContainer {
    pub fn new(study: &str) -> Self {
        Self {
            schema_version: OUTPUT_SCHEMA_VERSION.to_string(),
            study: study.to_string(),
            histograms: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, hist: PersistedHistogram) {
        self.histograms.push(hist);
    }

    pub fn histogram(&self, name: &str) -> Option<&PersistedHistogram> {
        self.histograms.iter().find(|h| h.name == name)
    }

    pub fn load(path: &Path) -> Result<Self, StudyError> {
        let raw = fs::read_to_string(path)?;
        let container: HistogramContainer = serde_json::from_str(&raw)?;
        Ok(container)
    }

    pub fn save(&self, path: &Path) -> Result<(), StudyError> {
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(path, payload)?;
        Ok(())
    }
}

/// Paths written by a finished sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFiles {
    pub container_path: PathBuf,
    pub results_csv_path: PathBuf,
}

/// Exclusive writer for one study. The container file is created on open
/// and written in full on [`OutputSink::finish`].
pub struct OutputSink {
    files: OutputFiles,
    writer: BufWriter<File>,
    container: HistogramContainer,
}

pub fn results_csv_path(container_path: &Path) -> PathBuf {
    let stem = container_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "study".to_string());
    container_path.with_file_name(format!("{stem}_results.csv"))
}

impl OutputSink {
    pub fn create(path: &Path, study: &str) -> Result<Self, StudyError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StudyError::OutputSinkFailure(format!(
                    "failed to create output directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let file = File::create(path).map_err(|e| {
            StudyError::OutputSinkFailure(format!("failed to open {}: {e}", path.display()))
        })?;

        Ok(Self {
            files: OutputFiles {
                container_path: path.to_path_buf(),
                results_csv_path: results_csv_path(path),
            },
            writer: BufWriter::new(file),
            container: HistogramContainer::new(study),
        })
    }

    pub fn write_histogram(&mut self, hist: PersistedHistogram) {
        self.container.push(hist);
    }

    pub fn write_result(&mut self, record: ToyRecord) {
        self.container.results.push(record);
    }

    pub fn container(&self) -> &HistogramContainer {
        &self.container
    }

    pub fn finish(mut self) -> Result<OutputFiles, StudyError> {
        serde_json::to_writer_pretty(&mut self.writer, &self.container).map_err(|e| {
            StudyError::OutputSinkFailure(format!(
                "failed to write {}: {e}",
                self.files.container_path.display()
            ))
        })?;
        self.writer.flush().map_err(|e| {
            StudyError::OutputSinkFailure(format!(
                "failed to flush {}: {e}",
                self.files.container_path.display()
            ))
        })?;

        write_results_csv(&self.files.results_csv_path, &self.container.results)?;
        Ok(self.files)
    }
}

fn fmt_f64(v: f64) -> String {
    format!("{v:.10}")
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => fmt_f64(x),
        None => "NA".to_string(),
    }
}

pub fn write_results_csv(path: &Path, rows: &[ToyRecord]) -> Result<(), StudyError> {
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| {
            StudyError::OutputSinkFailure(format!("failed to open {}: {e}", path.display()))
        })?;

    wtr.write_record([
        "toy_index",
        "status",
        "reason",
        "mass_hypothesis",
        "observed",
        "expected_background",
        "local_significance",
        "upper_limit",
        "chi2",
        "ndf",
        "fit_valid",
        "schema_version",
    ])?;

    for row in rows {
        let status = match row.status {
            ToyStatus::Ok => "ok",
            ToyStatus::Failed => "failed",
        };
        let r = row.result.as_ref();
        wtr.write_record([
            row.toy_index.to_string(),
            status.to_string(),
            row.reason.clone().unwrap_or_default(),
            fmt_opt(r.map(|r| r.mass_hypothesis)),
            fmt_opt(r.map(|r| r.observed)),
            fmt_opt(r.map(|r| r.expected_background)),
            fmt_opt(r.map(|r| r.local_significance)),
            fmt_opt(r.and_then(|r| r.upper_limit)),
            fmt_opt(r.map(|r| r.chi2)),
            r.map(|r| r.ndf.to_string()).unwrap_or_else(|| "NA".to_string()),
            r.map(|r| r.fit_valid.to_string()).unwrap_or_else(|| "NA".to_string()),
            OUTPUT_SCHEMA_VERSION.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("bhfit_output_{}_{tag}", std::process::id()))
            .join("study.json")
    }

    #[test]
    fn test_results_csv_sits_next_to_container() {
        let path = Path::new("/tmp/run/toys.json");
        assert_eq!(results_csv_path(path), PathBuf::from("/tmp/run/toys_results.csv"));
    }

    #[test]
    fn test_sink_writes_container_and_csv() {
        let path = temp_path("sink");
        let spectrum = BinnedSpectrum::build(5, 0.0, 1.0, 2).unwrap();
        let mut sink = OutputSink::create(&path, "unit").unwrap();
        sink.write_histogram(PersistedHistogram::from_spectrum(SPECTRUM_HIST_NAME, &spectrum));
        sink.write_result(ToyRecord::failed(0, "no fit".to_string()));
        let files = sink.finish().unwrap();

        let container = HistogramContainer::load(&files.container_path).unwrap();
        assert_eq!(container.schema_version, OUTPUT_SCHEMA_VERSION);
        assert_eq!(container.histograms.len(), 1);
        let hist = container.histogram(SPECTRUM_HIST_NAME).unwrap();
        assert_eq!(hist.contents, vec![2.0; 5]);
        assert_eq!(container.results.len(), 1);

        let csv = fs::read_to_string(&files.results_csv_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("0,failed,no fit,NA"));

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_unwritable_sink_fails() {
        let blocker = std::env::temp_dir().join(format!("bhfit_output_{}_blocker", std::process::id()));
        fs::write(&blocker, b"file, not a directory").unwrap();
        let res = OutputSink::create(&blocker.join("study.json"), "unit");
        assert!(matches!(res, Err(StudyError::OutputSinkFailure(_))));
        fs::remove_file(&blocker).ok();
    }

    #[test]
    fn test_histogram_bin_count_checked() {
        let mut hist = PersistedHistogram::from_contents("h", Binning::new(3, 0.0, 1.0).unwrap(), vec![1.0; 3]);
        assert!(hist.binning().is_ok());
        hist.contents.pop();
        assert!(matches!(hist.binning(), Err(StudyError::InvariantViolation(_))));
    }
}
