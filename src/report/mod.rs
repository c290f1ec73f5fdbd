//! Reporting utilities: formatted terminal output for fits and analyses.

mod format;

pub use format::{format_analysis, format_fit_report};
