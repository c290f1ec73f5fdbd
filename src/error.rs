use thiserror::Error;

use crate::domain::{FailureKind, Stage};
use crate::math::LmError;

/// Application-level error carried up to the binary.
///
/// Exit codes:
/// - `2`: input or configuration problems
/// - `3`: not enough data to run the requested work
/// - `4`: a fit failed in a way the caller asked to surface
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Errors raised by the calibration and fit stages.
///
/// Every variant except `OutOfOrder`, `AlreadyFailed` and `TooFewSamples` is a designed
/// local failure: the stage that returns it has already marked the record as failed.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("the resonant frequency does not appear to be in the measured range")]
    NoResonanceInRange,

    #[error("circle fit did not converge: {0}")]
    CircleFitDivergence(LmError),

    #[error("outlier rejection left {remaining} points, circle fit needs at least {required}")]
    EmptyAfterRejection { remaining: usize, required: usize },

    #[error("phase fit did not converge: {0}")]
    PhaseFitDivergence(LmError),

    #[error("magnitude fit is unreliable: {reason}")]
    MagnitudeFitUnreliable { reason: String },

    #[error("cannot run {requested:?} after {completed:?} has completed")]
    OutOfOrder { requested: Stage, completed: Stage },

    #[error("record already failed ({0:?})")]
    AlreadyFailed(FailureKind),

    #[error("need at least {required} samples, record has {actual}")]
    TooFewSamples { required: usize, actual: usize },
}

impl StageError {
    /// Failure kind recorded on the measurement for this error, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StageError::NoResonanceInRange => Some(FailureKind::NoResonanceInRange),
            StageError::CircleFitDivergence(_) | StageError::EmptyAfterRejection { .. } => {
                Some(FailureKind::CircleFitDivergence)
            }
            StageError::PhaseFitDivergence(_) => Some(FailureKind::PhaseFitDivergence),
            StageError::MagnitudeFitUnreliable { .. } => Some(FailureKind::MagnitudeFitUnreliable),
            StageError::OutOfOrder { .. }
            | StageError::AlreadyFailed(_)
            | StageError::TooFewSamples { .. } => None,
        }
    }
}

impl From<StageError> for AppError {
    fn from(err: StageError) -> Self {
        let code = match err {
            StageError::TooFewSamples { .. } => 3,
            _ => 4,
        };
        AppError::new(code, err.to_string())
    }
}
