use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use bhfit_sandbox::config::ParameterSet;
use bhfit_sandbox::search::sideband_factory;
use bhfit_sandbox::StudyOrchestrator;

#[derive(Debug, Parser)]
#[command(name = "bhfit-sandbox")]
#[command(about = "Throw background-only toys and run a bump hunt search on each one")]
struct Cli {
    /// Study parameters (TOML); built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input file of the processor interface; recorded but not read
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output container (JSON); a `<stem>_results.csv` is written next to it
    #[arg(long)]
    output: PathBuf,
}

fn log_level(debug: i64) -> LevelFilter {
    match debug {
        i64::MIN..=0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let params = match &cli.config {
        Some(path) => ParameterSet::from_toml_file(path)
            .with_context(|| format!("failed to read parameters: {}", path.display()))?,
        None => ParameterSet::default(),
    };

    env_logger::Builder::new()
        .filter_level(log_level(params.get_integer("debug").unwrap_or(0)))
        .format_timestamp(None)
        .init();

    if let Some(input) = &cli.input {
        info!("input file {} is not used by the toy study", input.display());
    }

    let mut study = StudyOrchestrator::configure(&params);
    study
        .initialize(&cli.output, &sideband_factory())
        .context("failed to initialize toy study")?;
    let summary = study.run().context("toy study failed")?;

    println!(
        "Study complete. Toys: {} | Results: {} | Failed: {}",
        summary.toys_generated, summary.results, summary.failed
    );
    for warning in &summary.warnings {
        println!("Warning: {warning}");
    }
    println!("Container: {}", summary.files.container_path.display());
    println!("Results CSV: {}", summary.files.results_csv_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_debug() {
        assert_eq!(log_level(0), LevelFilter::Info);
        assert_eq!(log_level(-3), LevelFilter::Info);
        assert_eq!(log_level(1), LevelFilter::Debug);
        assert_eq!(log_level(4), LevelFilter::Trace);
    }

    #[test]
    fn test_cli_requires_output() {
        assert!(Cli::try_parse_from(["bhfit-sandbox"]).is_err());
        let cli = Cli::try_parse_from(["bhfit-sandbox", "--output", "toys.json"]).unwrap();
        assert_eq!(cli.output, PathBuf::from("toys.json"));
        assert!(cli.config.is_none());
    }
}
