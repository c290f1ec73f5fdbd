//! Measurement record: an S21 sweep plus its pipeline state.
//!
//! A record owns its samples exclusively. Every sample stores both representations of
//! the complex amplitude (`re`/`im` and `mag`/`theta`); mutations go through
//! [`MeasurementRecord::update_polar`] or [`MeasurementRecord::update_cartesian`], which
//! recompute the other representation before returning.

use std::cmp::Ordering;
use std::ops::Range;

use tracing::{debug, warn};

use crate::data::table::Table;
use crate::domain::{FailureKind, GroupKey, PipelineState, ResonanceEstimates, Stage};
use crate::error::{AppError, StageError};

/// Smallest record the pipeline accepts (a line fit needs two points).
pub const MIN_SAMPLES: usize = 2;

/// One frequency point of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Frequency in Hz.
    pub f: f64,
    pub re: f64,
    pub im: f64,
    pub mag: f64,
    /// Phase in radians, `atan2(im, re)` after a cartesian update.
    pub theta: f64,
}

impl Sample {
    pub fn from_cartesian(f: f64, re: f64, im: f64) -> Self {
        Self {
            f,
            re,
            im,
            mag: re.hypot(im),
            theta: im.atan2(re),
        }
    }

    pub fn from_polar(f: f64, mag: f64, theta: f64) -> Self {
        Self {
            f,
            re: mag * theta.cos(),
            im: mag * theta.sin(),
            mag,
            theta,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StageFlags {
    sub_lined: bool,
    isolated: bool,
    rejected: bool,
    circle_fitted: bool,
    normalized: bool,
    magnitude_fitted: bool,
}

/// A swept S21 measurement and everything the pipeline learned about it.
#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    samples: Vec<Sample>,
    /// Auxiliary columns (grouping variables), row-aligned with `samples`.
    aux: Table,
    flags: StageFlags,
    failure: Option<FailureKind>,
    estimates: ResonanceEstimates,
    group: Option<GroupKey>,
}

impl MeasurementRecord {
    /// Build a record from parallel frequency / real / imaginary sequences.
    pub fn new(f: Vec<f64>, re: Vec<f64>, im: Vec<f64>) -> Result<Self, AppError> {
        let mut table = Table::from_columns([("f", f), ("re", re), ("im", im)])?;
        table.give_units([("f", "Hz")]);
        Self::from_table(table)
    }

    /// Build a record from a table holding `f`, `re` and `im` columns.
    ///
    /// The remaining columns become auxiliary columns. Rows are ordered by frequency
    /// (stable, so rows with equal frequency keep their relative order).
    pub fn from_table(mut table: Table) -> Result<Self, AppError> {
        if table.len() < MIN_SAMPLES {
            return Err(StageError::TooFewSamples {
                required: MIN_SAMPLES,
                actual: table.len(),
            }
            .into());
        }
        let trace = table.take_columns(&["f", "re", "im"])?;
        let (f, re, im) = (trace.column("f")?, trace.column("re")?, trace.column("im")?);

        if let Some(i) = f.iter().position(|v| !v.is_finite()) {
            return Err(AppError::new(2, format!("Frequency at row {i} is not finite.")));
        }

        let samples: Vec<Sample> = (0..f.len())
            .map(|i| Sample::from_cartesian(f[i], re[i], im[i]))
            .collect();

        Ok(Self::from_parts(samples, table, None))
    }

    fn from_parts(samples: Vec<Sample>, aux: Table, group: Option<GroupKey>) -> Self {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.sort_by(|&a, &b| samples[a].f.total_cmp(&samples[b].f));
        let sorted = order.iter().enumerate().all(|(i, &j)| i == j);

        let (samples, aux) = if sorted {
            (samples, aux)
        } else {
            debug!(n = samples.len(), "reordering samples by frequency");
            let samples = order.iter().map(|&i| samples[i]).collect();
            let aux = if aux.width() > 0 {
                aux.select_rows(&order)
            } else {
                aux
            };
            (samples, aux)
        };

        Self {
            samples,
            aux,
            flags: StageFlags::default(),
            failure: None,
            estimates: ResonanceEstimates::default(),
            group,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.f).collect()
    }

    pub fn magnitudes(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.mag).collect()
    }

    pub fn phases(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.theta).collect()
    }

    pub fn aux(&self) -> &Table {
        &self.aux
    }

    pub fn group(&self) -> Option<&GroupKey> {
        self.group.as_ref()
    }

    pub fn estimates(&self) -> &ResonanceEstimates {
        &self.estimates
    }

    pub(crate) fn estimates_mut(&mut self) -> &mut ResonanceEstimates {
        &mut self.estimates
    }

    // --- state -------------------------------------------------------------------------

    pub fn is_sub_lined(&self) -> bool {
        self.flags.sub_lined
    }

    pub fn is_isolated(&self) -> bool {
        self.flags.isolated
    }

    pub fn is_rejected(&self) -> bool {
        self.flags.rejected
    }

    pub fn is_circle_fitted(&self) -> bool {
        self.flags.circle_fitted
    }

    pub fn is_normalized(&self) -> bool {
        self.flags.normalized
    }

    pub fn is_magnitude_fitted(&self) -> bool {
        self.flags.magnitude_fitted
    }

    /// False once spike isolation has decided there is no resonance in range.
    pub fn contains_resonance(&self) -> bool {
        self.failure != Some(FailureKind::NoResonanceInRange)
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    /// Latest completed stage, if any.
    pub fn completed_stage(&self) -> Option<Stage> {
        let f = &self.flags;
        [
            (f.magnitude_fitted, Stage::MagnitudeFitted),
            (f.normalized, Stage::Normalized),
            (f.circle_fitted, Stage::CircleFitted),
            (f.isolated, Stage::Isolated),
            (f.sub_lined, Stage::BackgroundRemoved),
        ]
        .into_iter()
        .find_map(|(done, stage)| done.then_some(stage))
    }

    pub fn state(&self) -> PipelineState {
        match (self.failure, self.completed_stage()) {
            (Some(kind), _) => PipelineState::Failed(kind),
            (None, Some(stage)) => stage.into(),
            (None, None) => PipelineState::Raw,
        }
    }

    pub(crate) fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::BackgroundRemoved => self.flags.sub_lined,
            Stage::Isolated => self.flags.isolated,
            Stage::CircleFitted => self.flags.circle_fitted,
            Stage::Normalized => self.flags.normalized,
            Stage::MagnitudeFitted => self.flags.magnitude_fitted,
        }
    }

    pub(crate) fn mark_complete(&mut self, stage: Stage) {
        let flags = &mut self.flags;
        match stage {
            Stage::BackgroundRemoved => flags.sub_lined = true,
            Stage::Isolated => flags.isolated = true,
            Stage::CircleFitted => flags.circle_fitted = true,
            Stage::Normalized => flags.normalized = true,
            Stage::MagnitudeFitted => flags.magnitude_fitted = true,
        }
    }

    pub(crate) fn mark_rejected(&mut self) {
        self.flags.rejected = true;
    }

    /// Record a designed stage failure and emit the warning that goes with it.
    pub(crate) fn fail(&mut self, err: &StageError) {
        if let Some(kind) = err.failure_kind() {
            warn!(group = ?self.group, failure = ?kind, "{err}");
            self.failure = Some(kind);
        }
    }

    /// Errors with `AlreadyFailed` when the record carries a terminal failure.
    pub(crate) fn check_not_terminal(&self) -> Result<(), StageError> {
        match self.failure {
            Some(kind) if kind.is_terminal() => Err(StageError::AlreadyFailed(kind)),
            _ => Ok(()),
        }
    }

    /// Errors with `OutOfOrder` when a stage later than `stage` has already completed.
    pub(crate) fn check_order(&self, stage: Stage) -> Result<(), StageError> {
        match self.completed_stage() {
            Some(completed) if completed > stage => Err(StageError::OutOfOrder {
                requested: stage,
                completed,
            }),
            _ => Ok(()),
        }
    }

    /// Clear a recoverable failure before a retry. Terminal failures stay.
    pub(crate) fn clear_recoverable_failure(&mut self) {
        if let Some(kind) = self.failure.filter(|k| !k.is_terminal()) {
            debug!(failure = ?kind, "retrying after recoverable failure");
            self.failure = None;
        }
    }

    // --- mutation ----------------------------------------------------------------------

    /// Mutate `mag`/`theta` of every sample, then recompute `re`/`im`.
    pub(crate) fn update_polar<F>(&mut self, mut update: F)
    where
        F: FnMut(f64, &mut f64, &mut f64),
    {
        for s in &mut self.samples {
            update(s.f, &mut s.mag, &mut s.theta);
            *s = Sample::from_polar(s.f, s.mag, s.theta);
        }
    }

    /// Mutate `re`/`im` of every sample, then recompute `mag`/`theta`.
    pub(crate) fn update_cartesian<F>(&mut self, mut update: F)
    where
        F: FnMut(f64, &mut f64, &mut f64),
    {
        for s in &mut self.samples {
            update(s.f, &mut s.re, &mut s.im);
            *s = Sample::from_cartesian(s.f, s.re, s.im);
        }
    }

    /// Keep only the samples (and auxiliary rows) in `range`, clamped to the record.
    pub(crate) fn crop(&mut self, range: Range<usize>) {
        let start = range.start.min(self.samples.len());
        let end = range.end.clamp(start, self.samples.len());
        self.samples.truncate(end);
        self.samples.drain(..start);
        self.aux.crop(start..end);
    }

    /// Keep only the samples (and auxiliary rows) whose mask entry is `true`.
    pub(crate) fn retain(&mut self, mask: &[bool]) {
        let mut keep = mask.iter();
        self.samples.retain(|_| keep.next().copied().unwrap_or(false));
        self.aux.retain_rows(mask);
    }

    // --- grouping ----------------------------------------------------------------------

    /// Partition into independent child records, one per distinct value of `column`.
    ///
    /// Children are ordered by group value, start in the raw state, carry their
    /// [`GroupKey`] and no longer have the grouping column. Groups with fewer than
    /// [`MIN_SAMPLES`] samples are skipped with a warning; rows with a NaN key are dropped.
    pub fn split_by(&self, column: &str) -> Result<Vec<MeasurementRecord>, AppError> {
        let keys = self.aux.column(column)?;

        let mut values: Vec<f64> = keys.iter().copied().filter(|v| !v.is_nan()).collect();
        values.sort_by(f64::total_cmp);
        values.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);

        let dropped = keys.len() - keys.iter().filter(|v| !v.is_nan()).count();
        if dropped > 0 {
            warn!(column, dropped, "rows without a group value were dropped");
        }

        let mut children = Vec::with_capacity(values.len());
        for value in values {
            let indices: Vec<usize> = keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.total_cmp(&value) == Ordering::Equal)
                .map(|(i, _)| i)
                .collect();
            if indices.len() < MIN_SAMPLES {
                warn!(column, value, n = indices.len(), "group has too few samples, skipped");
                continue;
            }

            let samples = indices.iter().map(|&i| self.samples[i]).collect();
            let mut aux = self.aux.select_rows(&indices);
            aux.remove_column(column);
            let key = GroupKey {
                column: column.to_string(),
                value,
            };
            children.push(Self::from_parts(samples, aux, Some(key)));
        }

        debug!(column, groups = children.len(), "split record");
        Ok(children)
    }
}
