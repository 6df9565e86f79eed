//! Common types, errors, and constants for raw file and simulation operations

use num_complex::Complex64;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Header tags recognised before the data section
pub const HEADER_TAGS: &[&str] = &[
    "Title",
    "Date",
    "Plotname",
    "Output",
    "Flags",
    "No. Variables",
    "No. Points",
    "Offset",
    "Command",
    "Variables",
    "Backannotation",
];

pub const BINARY_MARKER: &str = "Binary:";
pub const VALUES_MARKER: &str = "Values:";

pub const FLAG_REAL: &str = "real";
pub const FLAG_COMPLEX: &str = "complex";
pub const FLAG_FORWARD: &str = "forward";
pub const FLAG_LOG: &str = "log";
pub const FLAG_STEPPED: &str = "stepped";
pub const FLAG_FAST_ACCESS: &str = "FastAccess";
pub const FLAG_DOUBLE: &str = "double";

/// Width of an axis sample or of a double precision trace sample
pub const F64_WIDTH: usize = 8;
/// Width of a single precision trace sample
pub const F32_WIDTH: usize = 4;
/// Width of a complex sample (real and imaginary f64)
pub const COMPLEX_WIDTH: usize = 16;

// ============================================================================
// Enums
// ============================================================================

/// Text encoding of the header section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// LTspice XVII and later write UTF-16 little endian headers
    Utf16Le,
}

impl Encoding {
    /// Bytes per code unit
    pub fn unit_size(self) -> usize {
        match self {
            Encoding::Utf8 => 1,
            Encoding::Utf16Le => 2,
        }
    }

    /// Encode a piece of header text
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Utf16Le => text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect(),
        }
    }
}

/// Kind of body following the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSection {
    Binary,
    Values,
}

/// Storage order of the binary body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLayout {
    /// One record per point holding every trace ("normal" access)
    #[default]
    Interleaved,
    /// All samples of a trace stored contiguously ("FastAccess")
    Columnar,
}

/// Physical quantity carried by a trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    Time,
    Frequency,
    Voltage,
    Current,
    DeviceCurrent,
    SubcktCurrent,
    Parameter,
    Other(String),
}

impl TraceKind {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "time" => TraceKind::Time,
            "frequency" => TraceKind::Frequency,
            "voltage" => TraceKind::Voltage,
            "current" => TraceKind::Current,
            "device_current" => TraceKind::DeviceCurrent,
            "subckt_current" => TraceKind::SubcktCurrent,
            "param" => TraceKind::Parameter,
            _ => TraceKind::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TraceKind::Time => "time",
            TraceKind::Frequency => "frequency",
            TraceKind::Voltage => "voltage",
            TraceKind::Current => "current",
            TraceKind::DeviceCurrent => "device_current",
            TraceKind::SubcktCurrent => "subckt_current",
            TraceKind::Parameter => "param",
            TraceKind::Other(s) => s,
        }
    }

    /// Whether the axis of this kind must grow monotonically within a step
    pub fn is_sweep_axis(&self) -> bool {
        matches!(self, TraceKind::Time | TraceKind::Frequency)
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simulation kind named by the `Plotname:` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlotKind {
    Transient,
    Ac,
    Dc,
    OperatingPoint,
    TransferFunction,
    Noise,
    Other(String),
}

impl PlotKind {
    pub fn parse(plotname: &str) -> Self {
        let lower = plotname.trim().to_lowercase();
        if lower.starts_with("transient") {
            PlotKind::Transient
        } else if lower.starts_with("ac analysis") {
            PlotKind::Ac
        } else if lower.starts_with("dc transfer") {
            PlotKind::Dc
        } else if lower.starts_with("operating point") {
            PlotKind::OperatingPoint
        } else if lower.starts_with("transfer function") {
            PlotKind::TransferFunction
        } else if lower.starts_with("noise") {
            PlotKind::Noise
        } else {
            PlotKind::Other(plotname.trim().to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PlotKind::Transient => "Transient Analysis",
            PlotKind::Ac => "AC Analysis",
            PlotKind::Dc => "DC transfer characteristic",
            PlotKind::OperatingPoint => "Operating Point",
            PlotKind::TransferFunction => "Transfer Function",
            PlotKind::Noise => "Noise Spectral Density",
            PlotKind::Other(s) => s,
        }
    }

    /// Operating point and transfer function plots have one value per step and no axis
    pub fn has_axis(&self) -> bool {
        !matches!(self, PlotKind::OperatingPoint | PlotKind::TransferFunction)
    }
}

impl fmt::Display for PlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vector data - either real or complex
#[derive(Debug, Clone, PartialEq)]
pub enum VectorData {
    Real(Vec<f64>),
    Complex(Vec<Complex64>),
}

impl VectorData {
    pub fn len(&self) -> usize {
        match self {
            VectorData::Real(v) => v.len(),
            VectorData::Complex(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, VectorData::Complex(_))
    }

    pub fn as_real(&self) -> Option<&[f64]> {
        match self {
            VectorData::Real(v) => Some(v),
            VectorData::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&[Complex64]> {
        match self {
            VectorData::Complex(v) => Some(v),
            VectorData::Real(_) => None,
        }
    }

    /// Real parts of the samples
    pub fn real_parts(&self) -> Vec<f64> {
        match self {
            VectorData::Real(v) => v.clone(),
            VectorData::Complex(v) => v.iter().map(|c| c.re).collect(),
        }
    }

    /// Sample `n` widened to complex
    pub fn get(&self, n: usize) -> Option<Complex64> {
        match self {
            VectorData::Real(v) => v.get(n).map(|&re| Complex64::new(re, 0.0)),
            VectorData::Complex(v) => v.get(n).copied(),
        }
    }

    pub(crate) fn slice(&self, start: usize, end: usize) -> VectorData {
        match self {
            VectorData::Real(v) => VectorData::Real(v[start..end].to_vec()),
            VectorData::Complex(v) => VectorData::Complex(v[start..end].to_vec()),
        }
    }
}

impl From<Vec<f64>> for VectorData {
    fn from(v: Vec<f64>) -> Self {
        VectorData::Real(v)
    }
}

impl From<Vec<Complex64>> for VectorData {
    fn from(v: Vec<Complex64>) -> Self {
        VectorData::Complex(v)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for raw file and simulation operations
#[derive(Debug, Error)]
pub enum SpiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Simulator process error: {0}")]
    Process(String),
    #[error("Simulation exceeded {0:?}")]
    Timeout(Duration),
    #[error("All {0} simulation slots are busy")]
    Saturated(usize),
}

pub type Result<T> = std::result::Result<T, SpiceError>;

// ============================================================================
// Data Structures
// ============================================================================

/// One named trace, split into the steps of the run
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub name: String,
    pub kind: TraceKind,
    pub steps: Vec<VectorData>,
}

impl Trace {
    /// Single-step trace
    pub fn new(name: impl Into<String>, kind: TraceKind, data: impl Into<VectorData>) -> Self {
        Self {
            name: name.into(),
            kind,
            steps: vec![data.into()],
        }
    }

    /// Trace holding one vector per step
    pub fn stepped(name: impl Into<String>, kind: TraceKind, steps: Vec<VectorData>) -> Self {
        Self {
            name: name.into(),
            kind,
            steps,
        }
    }

    /// Data of one step
    pub fn wave(&self, step: usize) -> Result<&VectorData> {
        self.steps.get(step).ok_or_else(|| {
            SpiceError::NotFound(format!(
                "step {} of trace '{}' ({} steps)",
                step,
                self.name,
                self.steps.len()
            ))
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Points over all steps
    pub fn total_len(&self) -> usize {
        self.steps.iter().map(VectorData::len).sum()
    }

    pub fn is_complex(&self) -> bool {
        self.steps.first().is_some_and(VectorData::is_complex)
    }
}
