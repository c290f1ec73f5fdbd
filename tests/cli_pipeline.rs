use std::path::PathBuf;

use resonator_fit::app::pipeline::{load_config, load_record, run_analysis_file, run_fit_file, run_synth};
use resonator_fit::cli::{PipelineArgs, SynthArgs};
use resonator_fit::domain::{FailureKind, FrequencyUnit, PipelineState};
use resonator_fit::error::StageError;
use resonator_fit::io::{read_summary_json, write_summary_json, write_trace_csv};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("resfit-it-{}-{name}", std::process::id()))
}

fn synth_args(out: PathBuf) -> SynthArgs {
    SynthArgs {
        out,
        fr: None,
        ql: None,
        qc: None,
        phi: None,
        amplitude: None,
        noise: None,
        phase_slope: None,
        phase_offset: None,
        f_start: Some(8.41e9),
        f_stop: Some(8.45e9),
        points: Some(8001),
        seed: Some(100),
        group_by: None,
        values: Vec::new(),
        fr_shift: 1e6,
    }
}

#[test]
fn synthetic_csv_fits_end_to_end() {
    let csv = temp_path("trace.csv");
    let json = temp_path("summary.json");
    let calibrated = temp_path("calibrated.csv");

    assert_eq!(run_synth(&synth_args(csv.clone())).unwrap(), 8001);
    let config = load_config(None, &PipelineArgs::default()).unwrap();
    let run = run_fit_file(&csv, FrequencyUnit::Hz, &config).unwrap();

    assert!(run.error.is_none(), "{:?}", run.error);
    let fit = run.fit.as_ref().unwrap();
    assert!((fit.freq_res / 8.43e9 - 1.0).abs() < 1e-4, "fr {}", fit.freq_res);
    assert!((fit.ql / 1e4 - 1.0).abs() < 0.03, "Ql {}", fit.ql);
    assert!((fit.qc / 2e4 - 1.0).abs() < 0.03, "Qc {}", fit.qc);
    assert_eq!(run.record.state(), PipelineState::MagnitudeFitted);

    write_summary_json(&json, &run.summary).unwrap();
    let summary = read_summary_json(&json).unwrap();
    assert_eq!(summary.state, PipelineState::MagnitudeFitted);
    let stored = summary.fit.as_ref().unwrap();
    assert!((stored.freq_res / fit.freq_res - 1.0).abs() < 1e-12);
    assert!((stored.stderr.ql / fit.stderr.ql - 1.0).abs() < 1e-12);
    assert_eq!(summary.source, Some(csv.display().to_string()));

    // The calibrated trace is re-ingestable.
    write_trace_csv(&calibrated, &run.record).unwrap();
    let reloaded = load_record(&calibrated, FrequencyUnit::Hz).unwrap();
    assert_eq!(reloaded.len(), run.record.len());

    for path in [&csv, &json, &calibrated] {
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn flat_trace_reports_failure_without_erroring() {
    let csv = temp_path("flat.csv");
    let mut text = String::from("f,re,im\n");
    for i in 0..500 {
        text.push_str(&format!("{},0.8,0\n", 8.4e9 + i as f64 * 1e4));
    }
    std::fs::write(&csv, text).unwrap();

    let config = load_config(None, &PipelineArgs::default()).unwrap();
    let run = run_fit_file(&csv, FrequencyUnit::Hz, &config).unwrap();
    let _ = std::fs::remove_file(&csv);

    assert!(matches!(run.error, Some(StageError::NoResonanceInRange)));
    assert!(run.fit.is_none());
    assert_eq!(run.summary.state, PipelineState::Failed(FailureKind::NoResonanceInRange));
    assert!(run.summary.error.is_some());
}

#[test]
fn grouped_csv_correlates_resonance_with_the_group() {
    let csv = temp_path("grouped.csv");
    let args = SynthArgs {
        group_by: Some("bias".to_string()),
        values: vec![0.0, 1.0, 2.0, 3.0],
        ..synth_args(csv.clone())
    };
    assert_eq!(run_synth(&args).unwrap(), 4 * 8001);

    let config = load_config(None, &PipelineArgs::default()).unwrap();
    let analysis = run_analysis_file(&csv, FrequencyUnit::Hz, "bias", &config).unwrap();
    let _ = std::fs::remove_file(&csv);

    assert_eq!(analysis.slices.len(), 4);
    assert_eq!(analysis.fitted(), 4);
    let fr = analysis.correlation("fr").unwrap();
    assert!(fr.r > 0.9, "r {}", fr.r);
}

#[test]
fn config_file_is_layered_under_flags() {
    let path = temp_path("config.json");
    std::fs::write(&path, r#"{ "rejection_sigma": 1.5, "isolation_sigma": 3.0 }"#).unwrap();

    let flags = PipelineArgs {
        isolation_sigma: Some(2.5),
        ..PipelineArgs::default()
    };
    let config = load_config(Some(&path), &flags).unwrap();
    assert_eq!(config.rejection_sigma, 1.5);
    assert_eq!(config.isolation_sigma, 2.5);
    assert!(config.isolate);

    std::fs::write(&path, r#"{ "rejection_sigma": -1.0 }"#).unwrap();
    let err = load_config(Some(&path), &PipelineArgs::default()).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let _ = std::fs::remove_file(&path);
}
