//! Raw file writer
//!
//! Traces are collected with [`RawWriter::add_trace`] and written once by
//! [`RawWriter::write`]. The output follows the layout the reader decodes:
//! an f64 axis followed by f32 traces, all f64 in double precision mode, or
//! two f64 per value when any trace is complex.

use super::header::{Flags, RawHeader, TraceDescriptor};
use super::steps::{log_path_for, render_step_log, StepInfo};
use crate::types::{
    DataSection, Encoding, PlotKind, Result, SpiceError, StorageLayout, Trace, TraceKind,
    VectorData, FLAG_COMPLEX, FLAG_DOUBLE, FLAG_FAST_ACCESS, FLAG_FORWARD, FLAG_LOG, FLAG_REAL,
    FLAG_STEPPED,
};
use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, instrument};

const DATE_FORMAT: &str = "%a %b %d %H:%M:%S %Y";
const OFFSET: &str = "0.0000000000000000e+000";

/// Sample encoding of one column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    F64,
    F32,
    Complex,
}

/// Builder for a raw file
#[derive(Debug, Clone)]
pub struct RawWriter {
    title: String,
    plot: PlotKind,
    layout: StorageLayout,
    encoding: Encoding,
    double_precision: bool,
    log_scale: bool,
    date: Option<String>,
    command: String,
    step_info: Vec<StepInfo>,
    traces: Vec<Trace>,
}

impl RawWriter {
    pub fn new(title: impl Into<String>, plot: PlotKind) -> Self {
        Self {
            title: title.into(),
            plot,
            layout: StorageLayout::Interleaved,
            encoding: Encoding::Utf8,
            double_precision: false,
            log_scale: false,
            date: None,
            command: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            step_info: Vec::new(),
            traces: Vec::new(),
        }
    }

    pub fn layout(mut self, layout: StorageLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Write every real column as f64
    pub fn double_precision(mut self, on: bool) -> Self {
        self.double_precision = on;
        self
    }

    /// Mark the axis as logarithmic (AC sweeps by decade or octave)
    pub fn log_scale(mut self, on: bool) -> Self {
        self.log_scale = on;
        self
    }

    /// Fixed `Date:` value instead of the current local time
    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Parameters recorded in the companion log of a stepped file
    pub fn step_info(mut self, steps: Vec<StepInfo>) -> Self {
        self.step_info = steps;
        self
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn step_count(&self) -> usize {
        self.traces.first().map_or(0, Trace::step_count)
    }

    /// Add a trace after checking it against the traces already present
    pub fn add_trace(&mut self, trace: Trace) -> Result<()> {
        if trace.steps.is_empty() {
            return Err(SpiceError::Validation(format!(
                "trace '{}' has no data",
                trace.name
            )));
        }
        let complex = trace.is_complex();
        if trace.steps.iter().any(|s| s.is_complex() != complex) {
            return Err(SpiceError::Validation(format!(
                "trace '{}' mixes real and complex steps",
                trace.name
            )));
        }
        if self.traces.iter().any(|t| t.name == trace.name) {
            return Err(SpiceError::Validation(format!(
                "duplicate trace name '{}'",
                trace.name
            )));
        }
        if let Some(first) = self.traces.first() {
            if first.step_count() != trace.step_count() {
                return Err(SpiceError::Validation(format!(
                    "trace '{}' has {} steps, expected {}",
                    trace.name,
                    trace.step_count(),
                    first.step_count()
                )));
            }
            for (step, (a, b)) in first.steps.iter().zip(&trace.steps).enumerate() {
                if a.len() != b.len() {
                    return Err(SpiceError::Validation(format!(
                        "trace '{}' has {} points in step {}, expected {}",
                        trace.name,
                        b.len(),
                        step,
                        a.len()
                    )));
                }
            }
        }

        debug!(name = %trace.name, kind = %trace.kind, steps = trace.step_count(), "Trace added");
        self.traces.push(trace);
        Ok(())
    }

    fn is_complex(&self) -> bool {
        self.plot == PlotKind::Ac || self.traces.iter().any(Trace::is_complex)
    }

    fn validate(&self) -> Result<()> {
        let axis = self
            .traces
            .first()
            .ok_or_else(|| SpiceError::Validation("no traces to write".into()))?;
        let n_steps = axis.step_count();

        if !self.step_info.is_empty() && self.step_info.len() != n_steps {
            return Err(SpiceError::Validation(format!(
                "{} step descriptions for {} steps",
                self.step_info.len(),
                n_steps
            )));
        }

        if !self.plot.has_axis() {
            if n_steps > 1 && axis.steps.iter().any(|s| s.len() != 1) {
                return Err(SpiceError::Validation(format!(
                    "stepped '{}' data must have one point per step",
                    self.plot
                )));
            }
            return Ok(());
        }
        if !axis.kind.is_sweep_axis() {
            return Ok(());
        }

        let start = axis.steps[0].real_parts().first().copied();
        for (step, wave) in axis.steps.iter().enumerate() {
            let values = wave.real_parts();
            // the reader takes |t| of every time point
            if axis.kind == TraceKind::Time && values.iter().any(|t| *t < 0.0) {
                return Err(SpiceError::Validation(format!(
                    "time axis '{}' has negative values in step {}",
                    axis.name, step
                )));
            }
            if values.windows(2).any(|w| w[1] <= w[0]) {
                return Err(SpiceError::Validation(format!(
                    "axis '{}' is not strictly increasing in step {}",
                    axis.name, step
                )));
            }
            if values.first().copied() != start {
                return Err(SpiceError::Validation(format!(
                    "axis '{}' step {} does not start at {:?}",
                    axis.name, step, start
                )));
            }
        }
        Ok(())
    }

    fn samples(&self) -> Vec<Sample> {
        if self.is_complex() {
            return vec![Sample::Complex; self.traces.len()];
        }
        if self.double_precision {
            return vec![Sample::F64; self.traces.len()];
        }
        let mut samples = vec![Sample::F32; self.traces.len()];
        samples[0] = Sample::F64;
        samples
    }

    fn flags(&self) -> Flags {
        let mut flags = Flags::default();
        flags.insert(if self.is_complex() {
            FLAG_COMPLEX
        } else {
            FLAG_REAL
        });
        if self.plot.has_axis() {
            flags.insert(FLAG_FORWARD);
        }
        if self.log_scale {
            flags.insert(FLAG_LOG);
        }
        if self.step_count() > 1 {
            flags.insert(FLAG_STEPPED);
        }
        if self.layout == StorageLayout::Columnar {
            flags.insert(FLAG_FAST_ACCESS);
        }
        if self.double_precision && !self.is_complex() {
            flags.insert(FLAG_DOUBLE);
        }
        flags
    }

    fn header(&self) -> RawHeader {
        let flags = self.flags();
        let num_points = self.traces.first().map_or(0, Trace::total_len);
        let date = self
            .date
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format(DATE_FORMAT).to_string());

        let mut properties = IndexMap::new();
        properties.insert("Title".to_string(), self.title.clone());
        properties.insert("Date".to_string(), date);
        properties.insert("Plotname".to_string(), self.plot.to_string());
        properties.insert("Flags".to_string(), flags.to_string());
        properties.insert("No. Variables".to_string(), self.traces.len().to_string());
        properties.insert("No. Points".to_string(), num_points.to_string());
        properties.insert("Offset".to_string(), OFFSET.to_string());
        properties.insert("Command".to_string(), self.command.clone());

        let variables = self
            .traces
            .iter()
            .enumerate()
            .map(|(ordinal, t)| TraceDescriptor {
                ordinal,
                name: t.name.clone(),
                kind: t.kind.clone(),
            })
            .collect();

        RawHeader {
            properties,
            backannotations: Vec::new(),
            flags,
            plot: self.plot.clone(),
            num_points,
            num_variables: self.traces.len(),
            variables,
            encoding: self.encoding,
            section: DataSection::Binary,
            data_offset: 0,
        }
    }

    /// Write the raw file, plus a companion `.log` when there is more than one step
    #[instrument(skip_all, fields(output = %path.as_ref().display()))]
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Writing raw file");
        self.validate()?;

        let header = self.header();
        let samples = self.samples();
        debug!(
            points = header.num_points,
            variables = header.num_variables,
            steps = self.step_count(),
            layout = ?self.layout,
            "Data info"
        );

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.encoding.encode(&header.render()))?;

        match self.layout {
            StorageLayout::Interleaved => {
                for step in 0..self.step_count() {
                    let n = self.traces[0].steps[step].len();
                    for i in 0..n {
                        for (trace, sample) in self.traces.iter().zip(&samples) {
                            write_sample(&mut writer, &trace.steps[step], i, *sample)?;
                        }
                    }
                }
            }
            StorageLayout::Columnar => {
                for (trace, sample) in self.traces.iter().zip(&samples) {
                    for wave in &trace.steps {
                        for i in 0..wave.len() {
                            write_sample(&mut writer, wave, i, *sample)?;
                        }
                    }
                }
            }
        }
        writer.flush()?;

        if self.step_count() > 1 {
            let steps: Vec<StepInfo> = if self.step_info.is_empty() {
                (0..self.step_count()).map(StepInfo::run).collect()
            } else {
                self.step_info.clone()
            };
            let log = log_path_for(path);
            fs::write(&log, render_step_log(&self.title, &steps))?;
            debug!(log = %log.display(), steps = steps.len(), "Step log written");
        }

        let bytes_written = fs::metadata(path)?.len();
        info!(bytes = bytes_written, "Write complete");

        Ok(())
    }
}

fn write_sample<W: Write>(
    writer: &mut W,
    data: &VectorData,
    i: usize,
    sample: Sample,
) -> Result<()> {
    let value = data.get(i).unwrap_or_default();
    match sample {
        Sample::F64 => writer.write_f64::<LittleEndian>(value.re)?,
        Sample::F32 => writer.write_f32::<LittleEndian>(value.re as f32)?,
        Sample::Complex => {
            writer.write_f64::<LittleEndian>(value.re)?;
            writer.write_f64::<LittleEndian>(value.im)?;
        }
    }
    Ok(())
}

/// Write a set of traces in one call
pub fn write_raw<P: AsRef<Path>>(
    path: P,
    title: &str,
    plot: PlotKind,
    traces: Vec<Trace>,
) -> Result<()> {
    let mut writer = RawWriter::new(title, plot);
    for trace in traces {
        writer.add_trace(trace)?;
    }
    writer.write(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraceKind;

    fn time(values: Vec<f64>) -> Trace {
        Trace::new("time", TraceKind::Time, values)
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut w = RawWriter::new("t", PlotKind::Transient);
        w.add_trace(time(vec![0.0, 1.0])).unwrap();
        let err = w
            .add_trace(Trace::new("V(a)", TraceKind::Voltage, vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, SpiceError::Validation(_)));
    }

    #[test]
    fn test_rejects_duplicate_name() {
        let mut w = RawWriter::new("t", PlotKind::Transient);
        w.add_trace(time(vec![0.0, 1.0])).unwrap();
        assert!(w.add_trace(time(vec![0.0, 1.0])).is_err());
    }

    #[test]
    fn test_rejects_non_monotonic_axis() {
        let mut w = RawWriter::new("t", PlotKind::Transient);
        w.add_trace(time(vec![0.0, 2.0, 1.0])).unwrap();
        assert!(matches!(w.validate(), Err(SpiceError::Validation(_))));
    }

    #[test]
    fn test_rejects_empty() {
        let w = RawWriter::new("t", PlotKind::Transient);
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_flags_and_samples() {
        let mut w = RawWriter::new("t", PlotKind::Transient).layout(StorageLayout::Columnar);
        w.add_trace(Trace::stepped(
            "time",
            TraceKind::Time,
            vec![vec![0.0, 1.0].into(), vec![0.0, 1.0].into()],
        ))
        .unwrap();
        w.add_trace(Trace::stepped(
            "V(a)",
            TraceKind::Voltage,
            vec![vec![3.0, 4.0].into(), vec![5.0, 6.0].into()],
        ))
        .unwrap();

        assert_eq!(w.flags().to_string(), "real forward stepped FastAccess");
        assert_eq!(w.samples(), vec![Sample::F64, Sample::F32]);
        assert_eq!(w.header().num_points, 4);
    }
}
