//! # spicebatch - Core Library
//!
//! Batch automation for LTspice-style circuit simulators.
//!
//! ## Components
//!
//! - Raw waveform files: binary and ASCII, interleaved and FastAccess
//!   layouts, UTF-8 and UTF-16 headers, stepped runs
//! - Simulator backends: LTspice, ngspice, QSPICE, Xyce, or any type
//!   implementing [`Simulator`]
//! - A parallel run orchestrator with per-job timeouts and completion
//!   callbacks
//! - Structured logging via `tracing`, configured with [`LogConfig`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spicebatch_core::RawRead;
//!
//! let raw = RawRead::open("rc.raw").unwrap();
//! println!("Plot: {}", raw.plot());
//!
//! for name in raw.trace_names() {
//!     println!("{}", name);
//! }
//!
//! let time = raw.axis(0).unwrap();
//! let vout = raw.wave("V(out)", 0).unwrap();
//! println!("{} points, {} samples", time.len(), vout.len());
//! ```
//!
//! ## Running Simulations
//!
//! ```rust,no_run
//! use spicebatch_core::{Job, NgSpice, RawRead, RunnerConfig, SimRunner};
//!
//! let config = RunnerConfig::default().parallel_sims(2);
//! let mut runner: SimRunner = SimRunner::new(NgSpice::default(), config).unwrap();
//!
//! for netlist in ["a.net", "b.net", "c.net"] {
//!     runner.run(Job::new(netlist)).unwrap();
//! }
//!
//! for outcome in runner.completed() {
//!     if let Ok(files) = &outcome.result {
//!         let raw = RawRead::open(&files.raw).unwrap();
//!         println!("{}: {} steps", outcome.run_name, raw.step_count());
//!     }
//! }
//! ```
//!
//! ## Enabling Logging
//!
//! ```rust,ignore
//! use spicebatch_core::LogConfig;
//! use tracing::Level;
//!
//! LogConfig::new(Level::INFO).component("sim", Level::DEBUG).init();
//! ```

mod logging;
pub mod raw;
pub mod sim;
mod types;

// Re-export public types
pub use types::{
    // Data
    DataSection,
    Encoding,
    PlotKind,
    // Errors
    Result,
    SpiceError,
    StorageLayout,
    Trace,
    TraceKind,
    VectorData,
    // Constants
    BINARY_MARKER,
    COMPLEX_WIDTH,
    F32_WIDTH,
    F64_WIDTH,
    FLAG_COMPLEX,
    FLAG_DOUBLE,
    FLAG_FAST_ACCESS,
    FLAG_FORWARD,
    FLAG_LOG,
    FLAG_REAL,
    FLAG_STEPPED,
    HEADER_TAGS,
    VALUES_MARKER,
};

pub use logging::LogConfig;

pub use raw::{
    write_raw, Flags, ParamValue, RawHeader, RawRead, RawWriter, ReadOptions, StepInfo,
    TraceDescriptor, TraceSelection,
};

pub use sim::{
    CallbackMode, CommandLine, Job, JobHandle, JobId, JobOutcome, JobState, LtSpice, NgSpice,
    OutputFiles, QSpice, RunnerConfig, RunnerStats, SimRunner, Simulator, Xyce,
};

// Re-export so callers can build `Complex64` values without a direct dependency
pub use num_complex::Complex64;

// ============================================================================
// Public API Functions
// ============================================================================

/// Read a raw waveform file.
///
/// # Arguments
/// * `path` - Path to the `.raw` file
///
/// # Returns
/// * `Ok(RawRead)` - Decoded traces, steps and header
/// * `Err(SpiceError)` - If the file cannot be read or parsed
///
/// # Example
/// ```rust,no_run
/// let raw = spicebatch_core::read("rc.raw").unwrap();
/// let vout = raw.trace("V(out)").unwrap();
/// println!("{}: {} points", vout.name, vout.total_len());
/// ```
pub fn read<P: AsRef<std::path::Path>>(path: P) -> Result<RawRead> {
    RawRead::open(path)
}
