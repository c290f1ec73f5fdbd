//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and initialises logging
//! - parses CLI arguments and resolves the pipeline configuration
//! - runs a fit, an analysis or the synthetic generator
//! - prints reports and writes optional exports

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{AnalyseArgs, Cli, Command, FitArgs, SynthArgs};
use crate::domain::ReportOptions;
use crate::error::AppError;

pub mod pipeline;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "RESFIT_LOG";

/// Entry point for the `resfit` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(cli.config.as_deref(), args),
        Command::Analyse(args) => handle_analyse(cli.config.as_deref(), args),
        Command::Synth(args) => handle_synth(args),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_fit(config_path: Option<&std::path::Path>, args: FitArgs) -> Result<(), AppError> {
    let config = pipeline::load_config(config_path, &args.pipeline)?;
    let run = pipeline::run_fit_file(&args.input.csv, args.input.freq_unit, &config)?;

    let opts = ReportOptions {
        show_uncertainty: args.show_uncertainty,
    };
    println!(
        "{}",
        crate::report::format_fit_report(&run.record, run.fit.as_ref(), &opts)
    );

    // Exports are written even for a failed run so the state can be inspected.
    if let Some(path) = &args.export_json {
        crate::io::write_summary_json(path, &run.summary)?;
    }
    if let Some(path) = &args.export_trace {
        crate::io::write_trace_csv(path, &run.record)?;
    }

    match run.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn handle_analyse(config_path: Option<&std::path::Path>, args: AnalyseArgs) -> Result<(), AppError> {
    let config = pipeline::load_config(config_path, &args.pipeline)?;
    let analysis = pipeline::run_analysis_file(&args.input.csv, args.input.freq_unit, &args.by, &config)?;

    let opts = ReportOptions {
        show_uncertainty: args.show_uncertainty,
    };
    println!("{}", crate::report::format_analysis(&analysis, &opts));

    if let Some(path) = &args.export {
        crate::io::write_slices_csv(path, &analysis)?;
    }
    Ok(())
}

fn handle_synth(args: SynthArgs) -> Result<(), AppError> {
    let rows = pipeline::run_synth(&args)?;
    println!("Wrote {rows} rows to {}", args.out.display());
    Ok(())
}
