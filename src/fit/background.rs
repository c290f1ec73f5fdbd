//! Linear phase background removal.
//!
//! Cable delay and electrical length add a phase that grows linearly with frequency.
//! We fit `θ ≈ a·f + b` over the whole sweep (phases unwrapped first) and subtract it.

use tracing::debug;

use crate::data::MeasurementRecord;
use crate::domain::Stage;
use crate::error::StageError;
use crate::math::{Line, fit_line, unwrap};

/// Fit and subtract the linear phase trend. Returns the removed line.
///
/// A record whose background was already removed is left untouched and `Ok(None)` is
/// returned.
pub fn remove_background(record: &mut MeasurementRecord) -> Result<Option<Line>, StageError> {
    record.check_not_terminal()?;
    if record.is_sub_lined() {
        return Ok(None);
    }
    record.check_order(Stage::BackgroundRemoved)?;

    let f = record.frequencies();
    let theta = unwrap(&record.phases());

    let (fx, ty): (Vec<f64>, Vec<f64>) = f
        .iter()
        .zip(theta.iter())
        .filter(|(_, t)| t.is_finite())
        .map(|(&f, &t)| (f, t))
        .unzip();
    let line = fit_line(&fx, &ty).ok_or(StageError::TooFewSamples {
        required: 2,
        actual: fx.len(),
    })?;

    let mut unwrapped = theta.into_iter();
    record.update_polar(|f, _, theta| {
        let t = unwrapped.next().unwrap_or(*theta);
        *theta = t - line.eval(f);
    });
    record.mark_complete(Stage::BackgroundRemoved);

    debug!(slope = line.slope, intercept = line.intercept, "background removed");
    Ok(Some(line))
}
