//! Raw file reader
//!
//! The file is memory-mapped, the header is decoded by [`parse_header`], and
//! the body is decoded into one [`Trace`] per declared variable. Stepped runs
//! are split using the companion log file; a missing or inconsistent log
//! degrades to a single step instead of failing the read.

use super::header::{parse_header, Flags, RawHeader};
use super::steps::{self, detect_step_offsets, log_path_for, read_step_log, ParamValue, StepInfo};
use crate::types::{
    DataSection, Encoding, PlotKind, Result, SpiceError, StorageLayout, Trace, TraceKind,
    VectorData, COMPLEX_WIDTH, F32_WIDTH, F64_WIDTH,
};
use byteorder::{LittleEndian, ReadBytesExt};
use indexmap::IndexMap;
use memmap2::Mmap;
use num_complex::Complex64;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Read Options
// ============================================================================

/// Which traces to decode from the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TraceSelection {
    #[default]
    All,
    /// Only the named traces (the axis is always kept)
    Only(Vec<String>),
    /// Header only, the body is not decoded
    HeaderOnly,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub traces: TraceSelection,
}

impl ReadOptions {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            traces: TraceSelection::Only(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn header_only() -> Self {
        Self {
            traces: TraceSelection::HeaderOnly,
        }
    }
}

// ============================================================================
// Body decoding
// ============================================================================

/// On-disk format of one column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnFormat {
    F64,
    F32,
    Complex,
}

impl ColumnFormat {
    fn width(self) -> usize {
        match self {
            ColumnFormat::F64 => F64_WIDTH,
            ColumnFormat::F32 => F32_WIDTH,
            ColumnFormat::Complex => COMPLEX_WIDTH,
        }
    }

    fn empty(self, capacity: usize) -> VectorData {
        match self {
            ColumnFormat::Complex => VectorData::Complex(Vec::with_capacity(capacity)),
            _ => VectorData::Real(Vec::with_capacity(capacity)),
        }
    }
}

/// Column formats derived from the body size
///
/// The record width is the body length divided by the point count; each
/// element is then that width divided by the variable count. Complex data
/// always uses two f64 per value. Otherwise an element width of 8 or more
/// (or the `double` flag) means every column is f64, and anything smaller
/// means an f64 axis followed by f32 traces.
fn column_formats(header: &RawHeader, body_len: usize) -> Vec<ColumnFormat> {
    let n_vars = header.num_variables;
    if header.is_complex() {
        return vec![ColumnFormat::Complex; n_vars];
    }
    let block = body_len / header.num_points.max(1);
    let data_size = block / n_vars.max(1);
    if data_size >= F64_WIDTH || header.flags.is_double() {
        return vec![ColumnFormat::F64; n_vars];
    }
    let mut formats = vec![ColumnFormat::F32; n_vars];
    if let Some(first) = formats.first_mut() {
        *first = ColumnFormat::F64;
    }
    formats
}

fn read_value(buf: &mut &[u8], format: ColumnFormat, out: &mut VectorData) -> Result<()> {
    match (format, out) {
        (ColumnFormat::F64, VectorData::Real(v)) => v.push(buf.read_f64::<LittleEndian>()?),
        (ColumnFormat::F32, VectorData::Real(v)) => {
            v.push(f64::from(buf.read_f32::<LittleEndian>()?))
        }
        (ColumnFormat::Complex, VectorData::Complex(v)) => {
            let re = buf.read_f64::<LittleEndian>()?;
            let im = buf.read_f64::<LittleEndian>()?;
            v.push(Complex64::new(re, im));
        }
        _ => {
            return Err(SpiceError::Parse(
                "column format does not match its buffer".into(),
            ))
        }
    }
    Ok(())
}

fn decode_binary(
    header: &RawHeader,
    body: &[u8],
    selected: &[bool],
) -> Result<Vec<Option<VectorData>>> {
    let n_points = header.num_points;
    let formats = column_formats(header, body.len());
    let record: usize = formats.iter().map(|f| f.width()).sum();
    let expected = record.checked_mul(n_points).ok_or_else(|| {
        SpiceError::Parse(format!(
            "No. Points {} overflows the binary body size ({} bytes per point)",
            n_points, record
        ))
    })?;

    if body.len() < expected {
        return Err(SpiceError::Parse(format!(
            "Binary body is truncated: expected {} bytes ({} points x {} bytes), found {}",
            expected,
            n_points,
            record,
            body.len()
        )));
    }
    if body.len() > expected {
        debug!(
            trailing = body.len() - expected,
            "Ignoring trailing bytes after binary body"
        );
    }

    let layout = header.flags.layout();
    debug!(?layout, record, ?formats, "Decoding binary body");

    let mut columns: Vec<Option<VectorData>> = formats
        .iter()
        .zip(selected)
        .map(|(f, &keep)| keep.then(|| f.empty(n_points)))
        .collect();

    match layout {
        StorageLayout::Interleaved => {
            let mut buf = &body[..expected];
            for _ in 0..n_points {
                for (format, column) in formats.iter().zip(columns.iter_mut()) {
                    match column {
                        Some(out) => read_value(&mut buf, *format, out)?,
                        None => buf = &buf[format.width()..],
                    }
                }
            }
        }
        StorageLayout::Columnar => {
            let mut start = 0;
            for (format, column) in formats.iter().zip(columns.iter_mut()) {
                let len = format.width() * n_points;
                if let Some(out) = column {
                    let mut buf = &body[start..start + len];
                    for _ in 0..n_points {
                        read_value(&mut buf, *format, out)?;
                    }
                }
                start += len;
            }
        }
    }

    Ok(columns)
}

/// Parse `re,im` (optionally parenthesised) or a plain real value
fn parse_complex_value(s: &str) -> Result<Complex64> {
    let bad = || SpiceError::Parse(format!("Invalid value '{}'", s));
    let trimmed = s.trim_matches(|c| c == '(' || c == ')');
    match trimmed.split_once(',') {
        Some((re, im)) => Ok(Complex64::new(
            re.trim().parse().map_err(|_| bad())?,
            im.trim().parse().map_err(|_| bad())?,
        )),
        None => Ok(Complex64::new(trimmed.parse().map_err(|_| bad())?, 0.0)),
    }
}

fn decode_values(
    header: &RawHeader,
    body: &[u8],
    selected: &[bool],
) -> Result<Vec<Option<VectorData>>> {
    let text = match header.encoding {
        Encoding::Utf8 => String::from_utf8_lossy(body).into_owned(),
        Encoding::Utf16Le => {
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    };

    let complex = header.is_complex();
    let n_points = header.num_points;
    // each value needs at least a digit and a separator
    let capacity = n_points.min(body.len() / 2);
    let mut columns: Vec<Option<VectorData>> = selected
        .iter()
        .map(|&keep| {
            keep.then(|| {
                if complex {
                    VectorData::Complex(Vec::with_capacity(capacity))
                } else {
                    VectorData::Real(Vec::with_capacity(capacity))
                }
            })
        })
        .collect();

    let mut tokens = text.split_whitespace();
    let truncated = |point: usize| {
        SpiceError::Parse(format!(
            "Values section ends at point {} of {}",
            point, n_points
        ))
    };

    for point in 0..n_points {
        let index = tokens.next().ok_or_else(|| truncated(point))?;
        index
            .parse::<usize>()
            .map_err(|_| SpiceError::Parse(format!("Invalid point index '{}'", index)))?;

        for column in columns.iter_mut() {
            let token = tokens.next().ok_or_else(|| truncated(point))?;
            match column {
                Some(VectorData::Real(v)) => v.push(
                    token
                        .parse()
                        .map_err(|_| SpiceError::Parse(format!("Invalid value '{}'", token)))?,
                ),
                Some(VectorData::Complex(v)) => v.push(parse_complex_value(token)?),
                None => {}
            }
        }
    }

    Ok(columns)
}

// ============================================================================
// RawRead
// ============================================================================

/// A decoded raw file
#[derive(Debug)]
pub struct RawRead {
    path: PathBuf,
    header: RawHeader,
    /// One slot per declared variable, `None` when not selected
    traces: Vec<Option<Trace>>,
    steps: Vec<StepInfo>,
    /// Point count of each step
    step_lens: Vec<usize>,
}

impl RawRead {
    /// Read every trace of a raw file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ReadOptions::default())
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_with<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading raw file");

        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = parse_header(&mmap)?;
        let n_points = header.num_points;

        let selected = selection_mask(&header, &options.traces);
        if options.traces == TraceSelection::HeaderOnly {
            let traces = vec![None; header.num_variables];
            return Ok(Self {
                path: path.to_path_buf(),
                header,
                traces,
                steps: vec![StepInfo::new(0)],
                step_lens: vec![n_points],
            });
        }

        let body = &mmap[header.data_offset..];
        let mut columns = match header.section {
            DataSection::Binary => decode_binary(&header, body, &selected)?,
            DataSection::Values => decode_values(&header, body, &selected)?,
        };

        // compressed time points are stored negated
        if let Some(Some(VectorData::Real(axis))) = columns.first_mut() {
            if header.variables.first().map(|v| &v.kind) == Some(&TraceKind::Time) {
                axis.iter_mut().for_each(|t| *t = t.abs());
            }
        }

        let (steps, mut bounds) = resolve_steps(path, &header, &columns);
        bounds.push(n_points);
        let step_lens: Vec<usize> = bounds.windows(2).map(|w| w[1] - w[0]).collect();

        let traces = columns
            .into_iter()
            .zip(&header.variables)
            .map(|(column, var)| {
                column.map(|data| {
                    let waves = bounds.windows(2).map(|w| data.slice(w[0], w[1])).collect();
                    Trace::stepped(var.name.clone(), var.kind.clone(), waves)
                })
            })
            .collect();

        debug!(
            points = n_points,
            variables = header.num_variables,
            steps = steps.len(),
            "Raw file decoded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            traces,
            steps,
            step_lens,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &RawHeader {
        &self.header
    }

    pub fn plot(&self) -> &PlotKind {
        &self.header.plot
    }

    pub fn flags(&self) -> &Flags {
        &self.header.flags
    }

    pub fn layout(&self) -> StorageLayout {
        self.header.flags.layout()
    }

    pub fn encoding(&self) -> Encoding {
        self.header.encoding
    }

    /// Trace names in declared order
    pub fn trace_names(&self) -> Vec<&str> {
        self.header
            .variables
            .iter()
            .map(|v| v.name.as_str())
            .collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let vars = &self.header.variables;
        vars.iter()
            .position(|v| v.name == name)
            .or_else(|| vars.iter().position(|v| v.name.eq_ignore_ascii_case(name)))
    }

    /// Trace by name: exact match first, then case-insensitive
    pub fn trace(&self, name: &str) -> Result<&Trace> {
        let index = self
            .position(name)
            .ok_or_else(|| SpiceError::NotFound(format!("trace '{}'", name)))?;
        self.trace_at(index)
    }

    /// Trace by declared index
    pub fn trace_at(&self, index: usize) -> Result<&Trace> {
        match self.traces.get(index) {
            Some(Some(trace)) => Ok(trace),
            Some(None) => Err(SpiceError::NotFound(format!(
                "trace '{}' was not loaded",
                self.header.variables[index].name
            ))),
            None => Err(SpiceError::NotFound(format!(
                "trace index {} ({} traces)",
                index,
                self.traces.len()
            ))),
        }
    }

    /// Data of one step of a trace
    pub fn wave(&self, name: &str, step: usize) -> Result<&VectorData> {
        self.trace(name)?.wave(step)
    }

    /// Axis values of a step (real parts)
    pub fn axis(&self, step: usize) -> Result<Vec<f64>> {
        if !self.header.has_axis() {
            return Err(SpiceError::NotFound(format!(
                "axis of '{}' plot",
                self.header.plot
            )));
        }
        Ok(self.trace_at(0)?.wave(step)?.real_parts())
    }

    /// Point count of a step
    pub fn len(&self, step: usize) -> Result<usize> {
        self.step_lens.get(step).copied().ok_or_else(|| {
            SpiceError::NotFound(format!("step {} ({} steps)", step, self.step_lens.len()))
        })
    }

    /// Total point count over all steps
    pub fn total_points(&self) -> usize {
        self.header.num_points
    }

    pub fn steps(&self) -> &[StepInfo] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step_info(&self, step: usize) -> Result<&StepInfo> {
        self.steps.get(step).ok_or_else(|| {
            SpiceError::NotFound(format!("step {} ({} steps)", step, self.steps.len()))
        })
    }

    /// Indices of the steps matching every `(parameter, value)` pair
    pub fn find_steps(&self, query: &[(&str, ParamValue)]) -> Vec<usize> {
        steps::find_steps(&self.steps, query)
    }

    pub fn property(&self, key: &str) -> Result<&str> {
        self.header
            .property(key)
            .ok_or_else(|| SpiceError::NotFound(format!("header property '{}'", key)))
    }

    pub fn properties(&self) -> &IndexMap<String, String> {
        &self.header.properties
    }

    /// Value of a real trace at axis position `t`, linearly interpolated
    ///
    /// Positions outside the axis range clamp to the first or last sample.
    pub fn value_at(&self, name: &str, t: f64, step: usize) -> Result<f64> {
        let axis = self.axis(step)?;
        let wave = self.wave(name, step)?;
        let values = wave.as_real().ok_or_else(|| {
            SpiceError::Validation(format!(
                "trace '{}' is complex, interpolation needs real data",
                name
            ))
        })?;

        let (Some(&first), Some(&last)) = (axis.first(), axis.last()) else {
            return Err(SpiceError::NotFound(format!("samples in step {}", step)));
        };
        if t <= first {
            return Ok(values[0]);
        }
        if t >= last {
            return Ok(values[values.len() - 1]);
        }

        let hi = axis.partition_point(|&x| x < t);
        let lo = hi - 1;
        let span = axis[hi] - axis[lo];
        if span == 0.0 {
            return Ok(values[hi]);
        }
        let frac = (t - axis[lo]) / span;
        Ok(values[lo] + (values[hi] - values[lo]) * frac)
    }
}

fn selection_mask(header: &RawHeader, selection: &TraceSelection) -> Vec<bool> {
    match selection {
        TraceSelection::All => vec![true; header.num_variables],
        TraceSelection::HeaderOnly => vec![false; header.num_variables],
        TraceSelection::Only(names) => header
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (i == 0 && header.has_axis())
                    || names.iter().any(|n| n.eq_ignore_ascii_case(&v.name))
            })
            .collect(),
    }
}

/// Step information and the start offset of each step
fn resolve_steps(
    path: &Path,
    header: &RawHeader,
    columns: &[Option<VectorData>],
) -> (Vec<StepInfo>, Vec<usize>) {
    let single = || (vec![StepInfo::new(0)], vec![0]);
    if !header.flags.is_stepped() || header.num_points == 0 {
        return single();
    }

    let offsets = if header.has_axis() {
        match columns.first() {
            Some(Some(axis)) => detect_step_offsets(&axis.real_parts()),
            _ => return single(),
        }
    } else {
        // one value per step
        (0..header.num_points).collect()
    };

    let log = log_path_for(path);
    match read_step_log(&log) {
        Ok(steps) if steps.len() == offsets.len() => (steps, offsets),
        Ok(steps) => {
            warn!(
                log = %log.display(),
                logged = steps.len(),
                detected = offsets.len(),
                "Step count mismatch, treating data as a single step"
            );
            single()
        }
        Err(e) => {
            warn!(
                log = %log.display(),
                error = %e,
                "Step log unavailable, treating data as a single step"
            );
            single()
        }
    }
}
