//! Command-line parsing for the resonator fitter.
//!
//! The goal of this module is to keep **argument parsing** separate from the fitting
//! code. Pipeline flags are optional overrides layered on top of the defaults or a
//! `--config` file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::data::SyntheticTrace;
use crate::domain::{FrequencyUnit, PhaseModel, PipelineConfig};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "resfit", version, about = "S21 resonator calibration and fit")]
pub struct Cli {
    /// JSON file with pipeline settings; flags override it.
    #[arg(long, global = true, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Log every stage transition (same as RESFIT_LOG=debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Calibrate and fit a single trace, print the result and optionally export it.
    Fit(FitArgs),
    /// Split a combined dataset by a column, fit every slice and correlate the parameters.
    Analyse(AnalyseArgs),
    /// Write a synthetic trace (or a grouped set of traces) to CSV.
    Synth(SynthArgs),
}

/// Input CSV and its frequency unit.
#[derive(Debug, Args, Clone)]
pub struct InputArgs {
    /// CSV whose last three columns are frequency, real and imaginary part.
    #[arg(value_name = "CSV")]
    pub csv: PathBuf,

    /// Unit of the frequency column.
    #[arg(long, value_enum, default_value_t = FrequencyUnit::Hz)]
    pub freq_unit: FrequencyUnit,
}

/// Overrides of [`PipelineConfig`] fields.
#[derive(Debug, Args, Clone, Default)]
pub struct PipelineArgs {
    /// Flat-region threshold of spike isolation (standard deviations).
    #[arg(long)]
    pub isolation_sigma: Option<f64>,

    /// Circle-fit outlier threshold (standard deviations).
    #[arg(long)]
    pub rejection_sigma: Option<f64>,

    /// Ql guess multiplier applied to fr / width.
    #[arg(long)]
    pub ql_guess_multiplier: Option<f64>,

    /// Qc seed multiplier applied to the Ql guess.
    #[arg(long)]
    pub qc_guess_multiplier: Option<f64>,

    /// Largest accepted relative standard error of a magnitude-fit parameter.
    #[arg(long)]
    pub max_relative_stderr: Option<f64>,

    /// Phase model fitted around the circle center.
    #[arg(long, value_enum)]
    pub phase_model: Option<PhaseModel>,

    /// Fit the whole sweep instead of cropping to the resonance window.
    #[arg(long)]
    pub no_isolate: bool,

    /// Keep circle-fit outliers.
    #[arg(long)]
    pub no_reject: bool,
}

impl PipelineArgs {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.isolation_sigma {
            config.isolation_sigma = v;
        }
        if let Some(v) = self.rejection_sigma {
            config.rejection_sigma = v;
        }
        if let Some(v) = self.ql_guess_multiplier {
            config.ql_guess_multiplier = v;
        }
        if let Some(v) = self.qc_guess_multiplier {
            config.qc_guess_multiplier = v;
        }
        if let Some(v) = self.max_relative_stderr {
            config.max_relative_stderr = v;
        }
        if let Some(model) = self.phase_model {
            config.phase_model = model;
        }
        if self.no_isolate {
            config.isolate = false;
        }
        if self.no_reject {
            config.reject_outliers = false;
        }
    }
}

/// Options of `resfit fit`.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print standard errors next to fitted values.
    #[arg(long)]
    pub show_uncertainty: bool,

    /// Write a JSON run summary (config, state, estimates, fit).
    #[arg(long, value_name = "JSON")]
    pub export_json: Option<PathBuf>,

    /// Write the calibrated trace as CSV.
    #[arg(long, value_name = "CSV")]
    pub export_trace: Option<PathBuf>,
}

/// Options of `resfit analyse`.
#[derive(Debug, Args, Clone)]
pub struct AnalyseArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Auxiliary column to split the dataset by.
    #[arg(long, value_name = "COLUMN")]
    pub by: String,

    /// Print standard errors next to fitted values.
    #[arg(long)]
    pub show_uncertainty: bool,

    /// Write the per-slice results as CSV.
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,
}

/// Options of `resfit synth`. Unset trace parameters keep their defaults.
#[derive(Debug, Args, Clone)]
pub struct SynthArgs {
    /// Output CSV (columns `f`, `re`, `im`, preceded by the group column if any).
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    /// Resonance frequency (Hz).
    #[arg(long)]
    pub fr: Option<f64>,

    /// Loaded quality factor.
    #[arg(long)]
    pub ql: Option<f64>,

    /// Coupling quality factor.
    #[arg(long)]
    pub qc: Option<f64>,

    /// Impedance-mismatch angle (rad).
    #[arg(long)]
    pub phi: Option<f64>,

    /// Off-resonant magnitude.
    #[arg(long)]
    pub amplitude: Option<f64>,

    /// Standard deviation of the additive noise on each quadrature.
    #[arg(long)]
    pub noise: Option<f64>,

    /// Linear phase background slope (rad/Hz).
    #[arg(long)]
    pub phase_slope: Option<f64>,

    /// Linear phase background offset (rad).
    #[arg(long)]
    pub phase_offset: Option<f64>,

    /// First swept frequency (Hz).
    #[arg(long)]
    pub f_start: Option<f64>,

    /// Last swept frequency (Hz).
    #[arg(long)]
    pub f_stop: Option<f64>,

    /// Number of sweep points.
    #[arg(long)]
    pub points: Option<usize>,

    /// Random seed (group `i` uses `seed + i`).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Name of a group column; requires `--values`.
    #[arg(long, value_name = "COLUMN", requires = "values")]
    pub group_by: Option<String>,

    /// Group values, comma separated.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub values: Vec<f64>,

    /// Resonance shift (Hz) per unit of the group value.
    #[arg(long, default_value_t = 1e6)]
    pub fr_shift: f64,
}

impl SynthArgs {
    pub fn trace(&self) -> SyntheticTrace {
        let d = SyntheticTrace::default();
        SyntheticTrace {
            fr: self.fr.unwrap_or(d.fr),
            ql: self.ql.unwrap_or(d.ql),
            qc: self.qc.unwrap_or(d.qc),
            phi: self.phi.unwrap_or(d.phi),
            amplitude: self.amplitude.unwrap_or(d.amplitude),
            noise_sigma: self.noise.unwrap_or(d.noise_sigma),
            phase_slope: self.phase_slope.unwrap_or(d.phase_slope),
            phase_offset: self.phase_offset.unwrap_or(d.phase_offset),
            f_start: self.f_start.unwrap_or(d.f_start),
            f_stop: self.f_stop.unwrap_or(d.f_stop),
            n_points: self.points.unwrap_or(d.n_points),
            seed: self.seed.unwrap_or(d.seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_flags_override_config() {
        let cli = Cli::parse_from([
            "resfit",
            "fit",
            "trace.csv",
            "--freq-unit",
            "ghz",
            "--rejection-sigma",
            "1.5",
            "--phase-model",
            "half-angle",
            "--no-isolate",
        ]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.input.freq_unit, FrequencyUnit::Ghz);

        let mut config = PipelineConfig::default();
        args.pipeline.apply(&mut config);
        assert_eq!(config.rejection_sigma, 1.5);
        assert_eq!(config.phase_model, PhaseModel::HalfAngle);
        assert!(!config.isolate);
        assert!(config.reject_outliers);
        assert_eq!(config.isolation_sigma, PipelineConfig::default().isolation_sigma);
    }

    #[test]
    fn synth_keeps_unset_parameters() {
        let cli = Cli::parse_from([
            "resfit", "synth", "--out", "s.csv", "--ql", "5000", "--group-by", "bias", "--values", "0,1,2",
        ]);
        let Command::Synth(args) = cli.command else {
            panic!("expected synth");
        };
        let trace = args.trace();
        assert_eq!(trace.ql, 5000.0);
        assert_eq!(trace.fr, SyntheticTrace::default().fr);
        assert_eq!(args.values, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from(["resfit", "analyse", "d.csv", "--by", "power", "-v", "--config", "c.json"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
    }
}
