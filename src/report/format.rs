//! Formatted terminal output for fits and correlation analyses.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use crate::analysis::{Analysis, SliceOutcome};
use crate::data::MeasurementRecord;
use crate::domain::{PipelineState, ReportOptions};
use crate::fit::MagnitudeFit;

/// Format the result of a single-trace run.
///
/// `fit` is `None` when the pipeline stopped early; the record's state and whatever
/// estimates were reached are still printed.
pub fn format_fit_report(record: &MeasurementRecord, fit: Option<&MagnitudeFit>, opts: &ReportOptions) -> String {
    let mut out = String::new();

    out.push_str("=== resfit - S21 resonator fit ===\n");
    if let Some(group) = record.group() {
        out.push_str(&format!("Group: {} = {}\n", group.column, group.value));
    }
    let f = record.frequencies();
    match (f.first(), f.last()) {
        (Some(lo), Some(hi)) => out.push_str(&format!(
            "Samples: n={} | f=[{:.6}, {:.6}] GHz\n",
            record.len(),
            lo / 1e9,
            hi / 1e9
        )),
        _ => out.push_str("Samples: n=0\n"),
    }
    out.push_str(&format!("State: {}\n", state_label(record.state())));

    let est = record.estimates();
    out.push_str("\nCalibration:\n");
    out.push_str(&format!("- guess fr : {}\n", opt_ghz(est.guess_freq_res)));
    out.push_str(&format!("- guess Ql : {}\n", opt(est.guess_ql, 1)));
    out.push_str(&format!("- width    : {}\n", opt_mhz(est.guess_width)));
    out.push_str(&format!("- radius r : {}\n", opt(est.r, 6)));
    out.push_str(&format!("- phi      : {}\n", opt(est.phi, 6)));

    match fit {
        Some(fit) => {
            let e = &fit.stderr;
            out.push_str("\nMagnitude fit:\n");
            out.push_str(&format!(
                "- fr  = {:.6} GHz{}\n",
                fit.freq_res / 1e9,
                pm(opts, e.freq_res / 1e9, 6)
            ));
            out.push_str(&format!("- Ql  = {:.1}{}\n", fit.ql, pm(opts, e.ql, 1)));
            out.push_str(&format!("- Qc  = {:.1}{}\n", fit.qc, pm(opts, e.qc, 1)));
            out.push_str(&format!("- phi = {:.6} rad\n", fit.phi));
            out.push_str(&format!(
                "- phi (model) = {:.6} rad{}\n",
                fit.phi_model,
                pm(opts, e.phi_model, 6)
            ));
            out.push_str(&format!("- offset = {:.6}{}\n", fit.offset, pm(opts, e.offset, 6)));
            out.push_str(&format!(
                "- reduced chi^2 = {:.4e} | nfev = {}\n",
                fit.reduced_chi_square, fit.nfev
            ));
        }
        None => out.push_str("\nMagnitude fit: not available\n"),
    }

    out
}

/// Format the per-slice table and the parameter correlations of an analysis.
pub fn format_analysis(analysis: &Analysis, opts: &ReportOptions) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "=== resfit - correlation against '{}' ===\n",
        analysis.variable
    ));
    out.push_str(&format!(
        "Slices: {} | fitted: {}\n\n",
        analysis.slices.len(),
        analysis.fitted()
    ));

    let var = truncate(&analysis.variable, 12);
    out.push_str(
        format!(
            "{:>12} {:>8} {:<26} {:>24} {:>18} {:>18} {:>10}\n",
            var, "n", "state", "fr [GHz]", "Ql", "Qc", "phi"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<12} {:-<8} {:-<26} {:-<24} {:-<18} {:-<18} {:-<10}\n",
            "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for slice in &analysis.slices {
        out.push_str(format_slice(slice, opts).trim_end());
        out.push('\n');
    }

    out.push_str("\nCorrelations (Pearson, two-sided p):\n");
    for c in &analysis.correlations {
        match &c.correlation {
            Some(corr) => out.push_str(&format!(
                "- {:<4} r={:+.4} p={:.3e} n={}\n",
                c.parameter, corr.r, corr.p_value, corr.n
            )),
            None => out.push_str(&format!("- {:<4} (constant over the fitted slices)\n", c.parameter)),
        }
    }

    for slice in analysis.slices.iter().filter(|s| s.fit.is_none()) {
        if let Some(error) = &slice.error {
            out.push_str(&format!("  (excluded {} = {}) {error}\n", analysis.variable, slice.value));
        }
    }

    out
}

fn format_slice(slice: &SliceOutcome, opts: &ReportOptions) -> String {
    let state = state_label(slice.state);
    match &slice.fit {
        Some(fit) => {
            let e = &fit.stderr;
            format!(
                "{:>12} {:>8} {:<26} {:>24} {:>18} {:>18} {:>10.5}\n",
                fmt_value(slice.value),
                slice.n_samples,
                state,
                format!("{:.6}{}", fit.freq_res / 1e9, pm(opts, e.freq_res / 1e9, 6)),
                format!("{:.1}{}", fit.ql, pm(opts, e.ql, 1)),
                format!("{:.1}{}", fit.qc, pm(opts, e.qc, 1)),
                fit.phi,
            )
        }
        None => format!(
            "{:>12} {:>8} {:<26}\n",
            fmt_value(slice.value),
            slice.n_samples,
            state
        ),
    }
}

fn state_label(state: PipelineState) -> String {
    match state {
        PipelineState::Failed(kind) => format!("failed ({kind:?})"),
        other => format!("{other:?}"),
    }
}

fn pm(opts: &ReportOptions, err: f64, decimals: usize) -> String {
    if opts.show_uncertainty {
        format!(" ± {err:.decimals$}")
    } else {
        String::new()
    }
}

fn opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(v) => format!("{v:.decimals$}"),
        None => "-".to_string(),
    }
}

fn opt_ghz(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{:.6} GHz", v / 1e9))
}

fn opt_mhz(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{:.4} MHz", v / 1e6))
}

fn fmt_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e9 {
        format!("{v:.0}")
    } else {
        format!("{v:.4}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
