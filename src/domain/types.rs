//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - passed by value between pipeline stages
//! - loaded from a JSON config file and overridden on the command line
//! - exported in run summaries

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Lorentzian weighting profile `amplitude / (floor + ((f - center) / width)^2)`.
///
/// Used to emphasise samples near the resonance and down-weight the far wings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LorentzWeight {
    pub amplitude: f64,
    pub floor: f64,
}

impl LorentzWeight {
    /// Weighting of the phase-model fit.
    pub const PHASE: LorentzWeight = LorentzWeight {
        amplitude: 10.0,
        floor: 0.5,
    };

    /// Weighting of the magnitude fit (steeper emphasis for the sharper feature).
    pub const MAGNITUDE: LorentzWeight = LorentzWeight {
        amplitude: 100.0,
        floor: 1.0,
    };

    pub fn weight(&self, f: f64, center: f64, width: f64) -> f64 {
        let x = (f - center) / width;
        self.amplitude / (self.floor + x * x)
    }
}

/// Which resonance phase response the normalizer fits around the circle center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PhaseModel {
    /// Full-angle single-pole all-pass response:
    /// `θ(f) = θ0 + π + 2·atan(2·Ql·(1 - f/fr))`, compared modulo `2π`.
    AllPass,
    /// Half-angle folded response:
    /// `θ(f) = wrap(θ0 + atan(2·Ql·(1 - f/fr)) - π/2, [-π/2, π/2))`, compared modulo `π`.
    HalfAngle,
}

/// Frequency unit of the input frequency column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyUnit {
    Hz,
    Khz,
    Mhz,
    Ghz,
}

impl FrequencyUnit {
    /// Multiplier converting a value in this unit to Hz.
    pub fn to_hz(self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::Khz => 1e3,
            FrequencyUnit::Mhz => 1e6,
            FrequencyUnit::Ghz => 1e9,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrequencyUnit::Hz => "Hz",
            FrequencyUnit::Khz => "kHz",
            FrequencyUnit::Mhz => "MHz",
            FrequencyUnit::Ghz => "GHz",
        }
    }

    /// Parse a units-dictionary label (case-insensitive).
    pub fn from_label(label: &str) -> Option<FrequencyUnit> {
        match label.trim().to_ascii_lowercase().as_str() {
            "hz" => Some(FrequencyUnit::Hz),
            "khz" => Some(FrequencyUnit::Khz),
            "mhz" => Some(FrequencyUnit::Mhz),
            "ghz" => Some(FrequencyUnit::Ghz),
            _ => None,
        }
    }
}

/// Pipeline stages in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BackgroundRemoved,
    Isolated,
    CircleFitted,
    Normalized,
    MagnitudeFitted,
}

/// Why a record was marked as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoResonanceInRange,
    CircleFitDivergence,
    PhaseFitDivergence,
    MagnitudeFitUnreliable,
}

impl FailureKind {
    /// Terminal failures cannot be cleared by retrying a stage.
    pub fn is_terminal(self) -> bool {
        matches!(self, FailureKind::NoResonanceInRange)
    }
}

/// Observable state of a measurement record.
///
/// `Raw → BackgroundRemoved → Isolated | Failed(NoResonance) → CircleFitted | Failed(Divergence)
/// → Normalized → MagnitudeFitted | Failed(Unreliable)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Raw,
    BackgroundRemoved,
    Isolated,
    CircleFitted,
    Normalized,
    MagnitudeFitted,
    Failed(FailureKind),
}

impl From<Stage> for PipelineState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::BackgroundRemoved => PipelineState::BackgroundRemoved,
            Stage::Isolated => PipelineState::Isolated,
            Stage::CircleFitted => PipelineState::CircleFitted,
            Stage::Normalized => PipelineState::Normalized,
            Stage::MagnitudeFitted => PipelineState::MagnitudeFitted,
        }
    }
}

/// A fitted circle in the complex plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircleParams {
    pub xc: f64,
    pub yc: f64,
    pub r: f64,
}

/// Grouping key of a record produced by `split_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    pub column: String,
    pub value: f64,
}

/// Scalars populated progressively by the pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResonanceEstimates {
    /// Resonance frequency guess (Hz): minimum-phase frequency, then the phase-fit value.
    pub guess_freq_res: Option<f64>,
    /// Loaded quality factor guess from the phase fit.
    pub guess_ql: Option<f64>,
    /// Width (Hz) between the flat regions bracketing the dip.
    pub guess_width: Option<f64>,
    /// Off-resonant angle around the circle center from the phase fit.
    pub theta0: Option<f64>,
    /// Normalized circle radius.
    pub r: Option<f64>,
    /// Impedance-mismatch angle `asin(yc / r)`.
    pub phi: Option<f64>,
    /// Normalized circle center y-offset.
    pub yc: Option<f64>,
    pub freq_res: Option<f64>,
    pub ql: Option<f64>,
    pub qc: Option<f64>,
    pub offset: Option<f64>,
}

/// Heuristics and solver limits for the calibration pipeline.
///
/// Every empirical constant lives here so it can be overridden from a config file or the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples within this many standard deviations of the mean magnitude count as flat.
    pub isolation_sigma: f64,
    /// Circle-fit residuals beyond this many standard deviations are rejected (once).
    /// The cut is two-sided, `|residual| <= k·σ`, so samples inside the circle go too.
    pub rejection_sigma: f64,
    /// `Ql` guess = `fr / width * ql_guess_multiplier`.
    pub ql_guess_multiplier: f64,
    /// `Qc` seed of the magnitude fit = `Ql * qc_guess_multiplier`.
    pub qc_guess_multiplier: f64,
    pub phase_weight: LorentzWeight,
    pub magnitude_weight: LorentzWeight,
    /// Maximum allowed relative standard error of any magnitude-fit parameter.
    pub max_relative_stderr: f64,
    pub phase_model: PhaseModel,
    /// Run spike isolation inside `normalize`.
    pub isolate: bool,
    /// Reject circle-fit outliers (applied at most once per record).
    pub reject_outliers: bool,
    pub circle_max_nfev: usize,
    pub phase_max_nfev: usize,
    pub magnitude_max_nfev: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            isolation_sigma: 2.0,
            rejection_sigma: 1.0,
            ql_guess_multiplier: 5.0,
            qc_guess_multiplier: 2.0,
            phase_weight: LorentzWeight::PHASE,
            magnitude_weight: LorentzWeight::MAGNITUDE,
            max_relative_stderr: 1.0,
            phase_model: PhaseModel::AllPass,
            isolate: true,
            reject_outliers: true,
            circle_max_nfev: 2000,
            phase_max_nfev: 10_000,
            magnitude_max_nfev: 5000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("isolation_sigma", self.isolation_sigma),
            ("rejection_sigma", self.rejection_sigma),
            ("ql_guess_multiplier", self.ql_guess_multiplier),
            ("qc_guess_multiplier", self.qc_guess_multiplier),
            ("max_relative_stderr", self.max_relative_stderr),
            ("phase_weight.amplitude", self.phase_weight.amplitude),
            ("phase_weight.floor", self.phase_weight.floor),
            ("magnitude_weight.amplitude", self.magnitude_weight.amplitude),
            ("magnitude_weight.floor", self.magnitude_weight.floor),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::new(
                    2,
                    format!("Invalid {name} setting: {value} (must be finite and > 0)."),
                ));
            }
        }
        if self.circle_max_nfev == 0 || self.phase_max_nfev == 0 || self.magnitude_max_nfev == 0 {
            return Err(AppError::new(2, "Solver evaluation caps must be > 0."));
        }
        Ok(())
    }
}

/// Presentation options for terminal reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Print standard errors next to fitted values.
    pub show_uncertainty: bool,
}
