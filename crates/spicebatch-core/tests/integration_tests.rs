//! Integration tests for the raw waveform codec
//!
//! - Writing and reading back in both storage layouts
//! - Stepped files and their companion log
//! - Hand-built files exercising reader-only paths
//! - Error cases

use spicebatch_core::{
    read, write_raw, Complex64, Encoding, ParamValue, PlotKind, RawRead, RawWriter, ReadOptions,
    SpiceError, StepInfo, StorageLayout, Trace, TraceKind, VectorData,
};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =============================================================================
// Test helpers
// =============================================================================

const POINTS: usize = 1000;
const STOP: f64 = 1e-3;

fn scratch() -> TempDir {
    tempfile::tempdir().expect("create temp dir")
}

fn time_axis(n: usize, stop: f64) -> Vec<f64> {
    (0..n).map(|i| stop * i as f64 / n as f64).collect()
}

fn sine(axis: &[f64], freq: f64) -> Vec<f64> {
    axis.iter().map(|t| (2.0 * PI * freq * t).sin()).collect()
}

fn sine_traces() -> Vec<Trace> {
    let time = time_axis(POINTS, STOP);
    let vout = sine(&time, 1e3);
    let iin: Vec<f64> = vout.iter().map(|v| v * 1e-3).collect();
    vec![
        Trace::new("time", TraceKind::Time, time),
        Trace::new("V(out)", TraceKind::Voltage, vout),
        Trace::new("I(R1)", TraceKind::DeviceCurrent, iin),
    ]
}

fn write_sine(dir: &Path, layout: StorageLayout) -> PathBuf {
    let path = dir.join(match layout {
        StorageLayout::Interleaved => "sine.raw",
        StorageLayout::Columnar => "sine_fast.raw",
    });
    let mut writer = RawWriter::new("* sine test", PlotKind::Transient).layout(layout);
    for trace in sine_traces() {
        writer.add_trace(trace).unwrap();
    }
    writer.write(&path).unwrap();
    path
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "sample {}: {} vs {}", i, x, y);
    }
}

fn stepped_writer(steps: usize) -> RawWriter {
    let time: Vec<VectorData> = (0..steps)
        .map(|_| VectorData::from(time_axis(50, STOP)))
        .collect();
    let vout: Vec<VectorData> = (0..steps)
        .map(|s| VectorData::from(vec![s as f64; 50]))
        .collect();
    let mut writer = RawWriter::new("* stepped", PlotKind::Transient);
    writer
        .add_trace(Trace::stepped("time", TraceKind::Time, time))
        .unwrap();
    writer
        .add_trace(Trace::stepped("V(out)", TraceKind::Voltage, vout))
        .unwrap();
    writer
}

// =============================================================================
// Test: Round trips
// =============================================================================

#[test]
fn test_sine_scenario() {
    let dir = scratch();
    let path = write_sine(dir.path(), StorageLayout::Interleaved);

    let raw = read(&path).unwrap();
    assert_eq!(raw.len(0).unwrap(), POINTS);
    assert_eq!(raw.total_points(), POINTS);
    assert_eq!(raw.step_count(), 1);

    let axis = raw.axis(0).unwrap();
    assert_eq!(axis.len(), POINTS);
    assert_eq!(axis[0], 0.0);
    assert_close(&axis, &time_axis(POINTS, STOP), 0.0);

    assert_eq!(raw.trace("time").unwrap().kind, TraceKind::Time);
    assert_eq!(raw.trace("V(out)").unwrap().kind, TraceKind::Voltage);
    assert_eq!(raw.trace("I(R1)").unwrap().kind, TraceKind::DeviceCurrent);

    let vout = raw.wave("V(out)", 0).unwrap().as_real().unwrap().to_vec();
    assert_close(&vout, &sine(&axis, 1e3), 1e-6);
}

#[test]
fn test_columnar_matches_interleaved() {
    let dir = scratch();
    let normal = read(write_sine(dir.path(), StorageLayout::Interleaved)).unwrap();
    let fast = read(write_sine(dir.path(), StorageLayout::Columnar)).unwrap();

    assert_eq!(normal.layout(), StorageLayout::Interleaved);
    assert_eq!(fast.layout(), StorageLayout::Columnar);
    assert_eq!(normal.trace_names(), fast.trace_names());
    for name in normal.trace_names() {
        assert_eq!(
            normal.wave(name, 0).unwrap(),
            fast.wave(name, 0).unwrap(),
            "trace {} differs between layouts",
            name
        );
    }
}

#[test]
fn test_double_precision_is_exact() {
    let dir = scratch();
    let path = dir.path().join("double.raw");
    let values = vec![0.1, 1.0 / 3.0, std::f64::consts::E, -1e-300];

    let mut writer = RawWriter::new("* double", PlotKind::Transient).double_precision(true);
    writer
        .add_trace(Trace::new("time", TraceKind::Time, vec![0.0, 1.0, 2.0, 3.0]))
        .unwrap();
    writer
        .add_trace(Trace::new("V(x)", TraceKind::Voltage, values.clone()))
        .unwrap();
    writer.write(&path).unwrap();

    let raw = read(&path).unwrap();
    assert!(raw.flags().is_double());
    assert_eq!(raw.wave("V(x)", 0).unwrap().as_real().unwrap(), &values[..]);
}

#[test]
fn test_ac_complex_round_trip() {
    let dir = scratch();
    let path = dir.path().join("ac.raw");
    let freq: Vec<f64> = (0..20).map(|i| 10f64.powf(1.0 + i as f64 * 0.25)).collect();
    let gain: Vec<Complex64> = freq
        .iter()
        .map(|f| Complex64::new(1.0, 0.0) / Complex64::new(1.0, f / 1e3))
        .collect();

    let mut writer = RawWriter::new("* ac", PlotKind::Ac).log_scale(true);
    writer
        .add_trace(Trace::new("frequency", TraceKind::Frequency, freq.clone()))
        .unwrap();
    writer
        .add_trace(Trace::new("V(out)", TraceKind::Voltage, gain.clone()))
        .unwrap();
    writer.write(&path).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.plot(), &PlotKind::Ac);
    assert!(raw.flags().is_complex());
    assert!(raw.flags().is_log());
    assert_eq!(raw.axis(0).unwrap(), freq);
    assert_eq!(
        raw.wave("V(out)", 0).unwrap().as_complex().unwrap(),
        &gain[..]
    );
}

#[test]
fn test_utf16_header_round_trip() {
    let dir = scratch();
    let path = dir.path().join("utf16.raw");
    let mut writer = RawWriter::new("* wide", PlotKind::Transient)
        .encoding(Encoding::Utf16Le)
        .date("Mon Jan 01 00:00:00 2024");
    for trace in sine_traces() {
        writer.add_trace(trace).unwrap();
    }
    writer.write(&path).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert!(bytes.starts_with(b"T\0i\0t\0"));

    let raw = read(&path).unwrap();
    assert_eq!(raw.encoding(), Encoding::Utf16Le);
    assert_eq!(raw.property("Title").unwrap(), "* wide");
    assert_eq!(raw.property("Date").unwrap(), "Mon Jan 01 00:00:00 2024");
    assert_eq!(raw.len(0).unwrap(), POINTS);
}

// =============================================================================
// Test: Header
// =============================================================================

#[test]
fn test_header_counts_match() {
    let dir = scratch();
    let raw = read(write_sine(dir.path(), StorageLayout::Interleaved)).unwrap();

    let declared: usize = raw.property("No. Variables").unwrap().parse().unwrap();
    assert_eq!(declared, raw.trace_names().len());
    assert_eq!(declared, raw.header().variables.len());

    let points: usize = raw.property("No. Points").unwrap().parse().unwrap();
    assert_eq!(points, POINTS);

    let keys: Vec<&str> = raw.properties().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "Title",
            "Date",
            "Plotname",
            "Flags",
            "No. Variables",
            "No. Points",
            "Offset",
            "Command"
        ]
    );
}

#[test]
fn test_trace_lookup() {
    let dir = scratch();
    let raw = read(write_sine(dir.path(), StorageLayout::Interleaved)).unwrap();

    assert_eq!(raw.trace("v(OUT)").unwrap().name, "V(out)");
    assert_eq!(raw.trace_at(2).unwrap().name, "I(R1)");
    assert!(matches!(raw.trace("V(missing)"), Err(SpiceError::NotFound(_))));
    assert!(matches!(raw.trace_at(3), Err(SpiceError::NotFound(_))));
    assert!(matches!(raw.wave("V(out)", 1), Err(SpiceError::NotFound(_))));
    assert!(matches!(raw.property("Backannotation"), Err(SpiceError::NotFound(_))));
    assert!(matches!(raw.step_info(1), Err(SpiceError::NotFound(_))));
}

#[test]
fn test_read_selected_traces() {
    let dir = scratch();
    let path = write_sine(dir.path(), StorageLayout::Columnar);

    let raw = RawRead::open_with(&path, ReadOptions::only(["V(out)"])).unwrap();
    assert!(raw.trace("V(out)").is_ok());
    assert_eq!(raw.axis(0).unwrap().len(), POINTS);
    let err = raw.trace("I(R1)").unwrap_err();
    assert!(err.to_string().contains("not loaded"));

    let header = RawRead::open_with(&path, ReadOptions::header_only()).unwrap();
    assert_eq!(header.trace_names().len(), 3);
    assert!(header.trace("V(out)").is_err());
}

#[test]
fn test_value_at_interpolates() {
    let dir = scratch();
    let path = dir.path().join("ramp.raw");
    write_raw(
        &path,
        "* ramp",
        PlotKind::Transient,
        vec![
            Trace::new("time", TraceKind::Time, vec![0.0, 1.0, 2.0]),
            Trace::new("V(r)", TraceKind::Voltage, vec![0.0, 10.0, 30.0]),
        ],
    )
    .unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.value_at("V(r)", 0.5, 0).unwrap(), 5.0);
    assert_eq!(raw.value_at("V(r)", 1.5, 0).unwrap(), 20.0);
    assert_eq!(raw.value_at("V(r)", -1.0, 0).unwrap(), 0.0);
    assert_eq!(raw.value_at("V(r)", 9.0, 0).unwrap(), 30.0);
}

// =============================================================================
// Test: Stepped files
// =============================================================================

#[test]
fn test_stepped_round_trip_with_log() {
    let dir = scratch();
    let path = dir.path().join("stepped.raw");
    let info = (0..3)
        .map(|i| {
            StepInfo::new(i)
                .with_param("r1", 1000.0 * (i + 1) as f64)
                .with_param("temp", "25°C")
        })
        .collect();
    stepped_writer(3).step_info(info).write(&path).unwrap();
    assert!(path.with_extension("log").exists());

    let raw = read(&path).unwrap();
    assert!(raw.flags().is_stepped());
    assert_eq!(raw.step_count(), 3);
    assert_eq!(raw.total_points(), 150);
    for step in 0..3 {
        assert_eq!(raw.len(step).unwrap(), 50);
        assert_eq!(raw.axis(step).unwrap()[0], 0.0);
        let v = raw.wave("V(out)", step).unwrap().as_real().unwrap();
        assert!(v.iter().all(|&x| x == step as f64));
    }

    assert_eq!(raw.find_steps(&[("r1", 2000.0.into())]), vec![1]);
    assert_eq!(
        raw.step_info(2).unwrap().get("temp"),
        Some(&ParamValue::Text("25°C".into()))
    );
}

#[test]
fn test_stepped_default_run_numbers() {
    let dir = scratch();
    let path = dir.path().join("runs.raw");
    stepped_writer(2).write(&path).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.step_count(), 2);
    assert_eq!(raw.find_steps(&[("run", 2.0.into())]), vec![1]);
}

#[test]
fn test_stepped_without_log_is_single_step() {
    let dir = scratch();
    let path = dir.path().join("nolog.raw");
    stepped_writer(3).write(&path).unwrap();
    fs::remove_file(path.with_extension("log")).unwrap();

    let raw = read(&path).unwrap();
    assert!(raw.flags().is_stepped());
    assert_eq!(raw.step_count(), 1);
    assert_eq!(raw.len(0).unwrap(), 150);
    assert_eq!(raw.wave("V(out)", 0).unwrap().len(), 150);
}

#[test]
fn test_stepped_log_mismatch_is_single_step() {
    let dir = scratch();
    let path = dir.path().join("mismatch.raw");
    stepped_writer(3).write(&path).unwrap();
    fs::write(path.with_extension("log"), ".step a=1\n.step a=2\n").unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.step_count(), 1);
    assert_eq!(raw.len(0).unwrap(), 150);
}

#[test]
fn test_stepped_operating_point() {
    let dir = scratch();
    let path = dir.path().join("op.raw");
    let mut writer = RawWriter::new("* op", PlotKind::OperatingPoint);
    writer
        .add_trace(Trace::stepped(
            "V(a)",
            TraceKind::Voltage,
            vec![vec![1.5].into(), vec![2.5].into()],
        ))
        .unwrap();
    writer.write(&path).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.step_count(), 2);
    assert_eq!(raw.wave("V(a)", 1).unwrap().as_real().unwrap(), &[2.5]);
    assert!(matches!(raw.axis(0), Err(SpiceError::NotFound(_))));
}

// =============================================================================
// Test: Hand-built files
// =============================================================================

fn header(flags: &str, vars: usize, points: usize, marker: &str) -> String {
    let mut text = format!(
        "Title: * hand\nDate: Mon Jan 01 00:00:00 2024\nPlotname: Transient Analysis\nFlags: {}\nNo. Variables: {}\nNo. Points: {}\nOffset: 0.0\nVariables:\n\t0\ttime\ttime\n",
        flags, vars, points
    );
    for i in 1..vars {
        text.push_str(&format!("\t{}\tV(n{})\tvoltage\n", i, i));
    }
    text.push_str(marker);
    text.push('\n');
    text
}

#[test]
fn test_negative_time_points_are_absolute() {
    let dir = scratch();
    let path = dir.path().join("neg.raw");
    let mut bytes = header("real forward", 2, 3, "Binary:").into_bytes();
    for (t, v) in [(0.0f64, 1.0f32), (-1e-3, 2.0), (2e-3, 3.0)] {
        bytes.extend_from_slice(&t.to_le_bytes());
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(&path, bytes).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.axis(0).unwrap(), vec![0.0, 1e-3, 2e-3]);
    assert_eq!(
        raw.wave("V(n1)", 0).unwrap().as_real().unwrap(),
        &[1.0, 2.0, 3.0]
    );
}

#[test]
fn test_ascii_values_section() {
    let dir = scratch();
    let path = dir.path().join("ascii.raw");
    let text = header("real forward", 3, 2, "Values:")
        + "0\t0.000000e+000\n\t1.0\n\t-1.0\n1\t1.0e-003\n\t2.0\n\t-2.0\n";
    fs::write(&path, text).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.axis(0).unwrap(), vec![0.0, 1e-3]);
    assert_eq!(raw.wave("V(n2)", 0).unwrap().as_real().unwrap(), &[-1.0, -2.0]);
}

#[test]
fn test_backannotation_lines() {
    let dir = scratch();
    let path = dir.path().join("annot.raw");
    let text = header("real", 1, 1, "Values:").replace(
        "Variables:\n",
        "Backannotation: u1 1 2\nBackannotation: u2 3 4\nVariables:\n",
    ) + "0\t0.0\n";
    fs::write(&path, text).unwrap();

    let raw = read(&path).unwrap();
    assert_eq!(raw.header().backannotations, vec!["u1 1 2", "u2 3 4"]);
}

// =============================================================================
// Test: Errors
// =============================================================================

#[test]
fn test_truncated_body_is_error() {
    let dir = scratch();
    let path = write_sine(dir.path(), StorageLayout::Interleaved);
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - (POINTS as u64 * 16) / 2).unwrap();
    drop(file);

    assert!(matches!(read(&path), Err(SpiceError::Parse(_))));
}

#[test]
fn test_oversized_point_count_is_error() {
    let dir = scratch();

    let binary = dir.path().join("huge_binary.raw");
    let mut bytes = header("real forward", 2, usize::MAX, "Binary:").into_bytes();
    bytes.extend_from_slice(&0.0f64.to_le_bytes());
    bytes.extend_from_slice(&1.0f32.to_le_bytes());
    fs::write(&binary, bytes).unwrap();
    assert!(matches!(read(&binary), Err(SpiceError::Parse(_))));

    let values = dir.path().join("huge_values.raw");
    let text = header("real forward", 2, 1_000_000_000_000_000_000, "Values:")
        + "0\t0.0\n\t1.0\n";
    fs::write(&values, text).unwrap();
    assert!(matches!(read(&values), Err(SpiceError::Parse(_))));
}

#[test]
fn test_unrecognized_file_is_error() {
    let dir = scratch();
    let path = dir.path().join("junk.raw");
    fs::write(&path, b"\x00\x01garbage").unwrap();
    assert!(matches!(read(&path), Err(SpiceError::Parse(_))));
    assert!(matches!(
        read(dir.path().join("absent.raw")),
        Err(SpiceError::Io(_))
    ));
}

#[test]
fn test_writer_validation() {
    let dir = scratch();
    let path = dir.path().join("invalid.raw");

    let empty = write_raw(&path, "* empty", PlotKind::Transient, vec![]);
    assert!(matches!(empty, Err(SpiceError::Validation(_))));

    let backwards = write_raw(
        &path,
        "* backwards",
        PlotKind::Transient,
        vec![Trace::new("time", TraceKind::Time, vec![0.0, 2.0, 1.0])],
    );
    assert!(matches!(backwards, Err(SpiceError::Validation(_))));

    let negative = write_raw(
        &path,
        "* negative",
        PlotKind::Transient,
        vec![Trace::new("time", TraceKind::Time, vec![-2e-3, -1e-3, 0.0, 1e-3])],
    );
    assert!(matches!(negative, Err(SpiceError::Validation(_))));

    let two_steps = stepped_writer(2);
    let mut writer = RawWriter::new("* restart", PlotKind::Transient);
    writer
        .add_trace(Trace::stepped(
            "time",
            TraceKind::Time,
            vec![vec![0.0, 1.0].into(), vec![0.5, 1.0].into()],
        ))
        .unwrap();
    assert!(matches!(writer.write(&path), Err(SpiceError::Validation(_))));

    let wrong_info = two_steps.step_info(vec![StepInfo::new(0)]);
    assert!(matches!(wrong_info.write(&path), Err(SpiceError::Validation(_))));
    assert!(!path.exists());
}
