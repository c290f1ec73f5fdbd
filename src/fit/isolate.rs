//! Resonance window isolation.
//!
//! The magnitude dip (and, for a mismatched resonator, the peak next to it) are the
//! extreme samples of the sweep. Samples within `isolation_sigma` standard deviations of
//! the mean magnitude are "flat". The last flat sample below the feature and the first
//! flat sample above it bracket the resonance; the record is cropped to that bracket
//! plus one bracket width on each side.

use tracing::debug;

use crate::data::MeasurementRecord;
use crate::domain::{PipelineConfig, Stage};
use crate::error::StageError;
use crate::fit::remove_background;
use crate::math::{argmax, argmin, mean, std_dev};

/// Outcome of a successful isolation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsolatedWindow {
    /// Kept index range, in the indices of the record before cropping.
    pub start: usize,
    pub end: usize,
    /// Frequency span between the two bracketing flat samples (Hz).
    pub width: f64,
    /// Frequency of minimum phase inside the window (Hz).
    pub freq_res_guess: f64,
}

/// Crop the record to the resonance window.
///
/// The background is removed first when that has not happened yet. Returns `Ok(None)`
/// when the record was already isolated. When no flat region can be found on both sides
/// of the feature the record is marked `Failed(NoResonanceInRange)` and left uncropped.
pub fn isolate_spike(
    record: &mut MeasurementRecord,
    config: &PipelineConfig,
) -> Result<Option<IsolatedWindow>, StageError> {
    record.check_not_terminal()?;
    if record.is_isolated() {
        return Ok(None);
    }
    record.check_order(Stage::Isolated)?;
    if !record.is_sub_lined() {
        remove_background(record)?;
    }

    match bracket(record, config.isolation_sigma) {
        Some(window) => {
            record.crop(window.start..window.end);

            let estimates = record.estimates_mut();
            estimates.guess_width = Some(window.width);
            estimates.guess_freq_res = Some(window.freq_res_guess);
            record.mark_complete(Stage::Isolated);

            debug!(
                start = window.start,
                end = window.end,
                width = window.width,
                freq_res_guess = window.freq_res_guess,
                "resonance isolated"
            );
            Ok(Some(window))
        }
        None => {
            let err = StageError::NoResonanceInRange;
            record.fail(&err);
            Err(err)
        }
    }
}

/// Run the stages that precede the circle fit: background removal, then isolation when
/// `config.isolate` is set. Stages that already ran are skipped.
pub(crate) fn prepare(record: &mut MeasurementRecord, config: &PipelineConfig) -> Result<(), StageError> {
    if !record.is_sub_lined() {
        remove_background(record)?;
    }
    if config.isolate && !record.is_isolated() {
        isolate_spike(record, config)?;
    }
    Ok(())
}

/// Locate the resonance window without cropping.
pub(crate) fn bracket(record: &MeasurementRecord, sigmas: f64) -> Option<IsolatedWindow> {
    let samples = record.samples();
    let mag = record.magnitudes();
    let avg = mean(&mag)?;
    let threshold = sigmas * std_dev(&mag)?;

    let i_min = argmin(&mag)?;
    let i_max = argmax(&mag)?;

    // A noise maximum somewhere in the wings says nothing about where the feature is;
    // only a significant peak widens the bracketed region.
    let (lo, hi) = if mag[i_max] - avg >= threshold {
        (i_min.min(i_max), i_min.max(i_max))
    } else {
        (i_min, i_min)
    };

    let (f_lo, f_hi) = (samples[lo].f, samples[hi].f);
    let is_flat = |i: usize| (mag[i] - avg).abs() < threshold;

    let x0 = (0..samples.len())
        .filter(|&i| samples[i].f < f_lo && is_flat(i))
        .next_back()?;
    let x1 = (0..samples.len()).find(|&i| samples[i].f > f_hi && is_flat(i))?;

    let span = x1 - x0;
    let (start, end) = (x0.saturating_sub(span), (x1 + span).min(samples.len()));

    // The phase turns fastest at resonance, so its extreme is a sharper marker than
    // the magnitude dip.
    let phases: Vec<f64> = samples[start..end].iter().map(|s| s.theta).collect();
    let freq_res_guess = samples[start + argmin(&phases)?].f;

    Some(IsolatedWindow {
        start,
        end,
        width: samples[x1].f - samples[x0].f,
        freq_res_guess,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticTrace;
    use crate::domain::{FailureKind, PipelineState};

    #[test]
    fn flat_trace_contains_no_resonance() {
        let n = 500;
        let f: Vec<f64> = (0..n).map(|i| 8.4e9 + i as f64 * 1e4).collect();
        let mut record = MeasurementRecord::new(f, vec![0.8; n], vec![0.0; n]).unwrap();

        let err = isolate_spike(&mut record, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, StageError::NoResonanceInRange));
        assert!(!record.contains_resonance());
        assert!(record.failed());
        assert_eq!(record.state(), PipelineState::Failed(FailureKind::NoResonanceInRange));
        assert_eq!(record.len(), n, "failed isolation must not crop");
    }

    #[test]
    fn dip_at_the_sweep_edge_has_no_flat_side() {
        // Resonance below the sweep: the minimum sits on the first sample.
        let trace = SyntheticTrace {
            f_start: 8.43e9,
            f_stop: 8.45e9,
            noise_sigma: 0.0,
            n_points: 400,
            ..SyntheticTrace::default()
        };
        let mut record = trace.to_record().unwrap();
        assert!(isolate_spike(&mut record, &PipelineConfig::default()).is_err());
        assert!(!record.contains_resonance());
    }

    #[test]
    fn crops_around_the_dip() {
        let trace = SyntheticTrace {
            n_points: 3201,
            ..SyntheticTrace::default()
        };
        let mut record = trace.to_record().unwrap();
        crate::fit::remove_background(&mut record).unwrap();

        let window = isolate_spike(&mut record, &PipelineConfig::default())
            .unwrap()
            .unwrap();
        let f = record.frequencies();
        assert!(f[0] < trace.fr && *f.last().unwrap() > trace.fr);
        assert_eq!(record.len(), window.end - window.start);
        assert!(record.len() < trace.n_points);

        // Half-width fr / (2 Ql) is 0.42 MHz; the bracket is of that order.
        assert!(window.width > 2e5 && window.width < 4e6, "width {}", window.width);
        assert!((window.freq_res_guess - trace.fr).abs() < 2e6);
        assert_eq!(record.estimates().guess_width, Some(window.width));
        assert_eq!(record.state(), PipelineState::Isolated);

        // Second call is a no-op.
        let len = record.len();
        assert!(isolate_spike(&mut record, &PipelineConfig::default()).unwrap().is_none());
        assert_eq!(record.len(), len);
    }

    #[test]
    fn raw_record_has_its_background_removed_first() {
        let trace = SyntheticTrace {
            n_points: 3201,
            ..SyntheticTrace::default()
        };
        let mut raw = trace.to_record().unwrap();
        let mut sub_lined = raw.clone();
        crate::fit::remove_background(&mut sub_lined).unwrap();

        let from_raw = isolate_spike(&mut raw, &PipelineConfig::default()).unwrap().unwrap();
        let from_sub_lined = isolate_spike(&mut sub_lined, &PipelineConfig::default())
            .unwrap()
            .unwrap();
        assert!(raw.is_sub_lined());
        assert_eq!(from_raw, from_sub_lined);
        assert_eq!(raw.samples(), sub_lined.samples());
    }

    #[test]
    fn mismatched_resonance_brackets_dip_and_peak() {
        let trace = SyntheticTrace {
            phi: 0.6,
            noise_sigma: 0.002,
            n_points: 3201,
            ..SyntheticTrace::default()
        };
        let mut record = trace.to_record().unwrap();
        crate::fit::remove_background(&mut record).unwrap();
        let window = isolate_spike(&mut record, &PipelineConfig::default())
            .unwrap()
            .unwrap();
        let f = record.frequencies();
        assert!(f[0] < trace.fr && *f.last().unwrap() > trace.fr);
        assert!(window.width < 4e6, "width {}", window.width);
    }
}
