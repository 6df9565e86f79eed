//! Python bindings for spicebatch
//!
//! This crate provides PyO3 bindings to expose spicebatch-core to Python:
//! raw file reading and writing, and the parallel simulation runner.

use numpy::ndarray::Array1;
use numpy::{IntoPyArray, PyReadonlyArray1};
use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use spicebatch_core::{
    self, CallbackMode, Complex64, Job, JobOutcome, LogConfig, LtSpice, NgSpice, OutputFiles,
    ParamValue, PlotKind, QSpice, RawRead, RawWriter, ReadOptions, RunnerConfig, SimRunner,
    Simulator, SpiceError, StorageLayout, Trace, TraceKind, VectorData, Xyce,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Helper Functions
// ============================================================================

fn to_py_err(e: SpiceError) -> PyErr {
    let msg = e.to_string();
    match e {
        SpiceError::Io(_) => PyIOError::new_err(msg),
        SpiceError::NotFound(_) => PyKeyError::new_err(msg),
        SpiceError::Parse(_) | SpiceError::Validation(_) => PyValueError::new_err(msg),
        SpiceError::Timeout(_) => PyTimeoutError::new_err(msg),
        SpiceError::Process(_) | SpiceError::Saturated(_) => PyRuntimeError::new_err(msg),
    }
}

fn vector_to_numpy(py: Python, vector: &VectorData) -> Py<PyAny> {
    match vector {
        VectorData::Real(v) => Array1::from_vec(v.clone())
            .into_pyarray(py)
            .into_any()
            .unbind(),
        VectorData::Complex(v) => Array1::from_vec(v.clone())
            .into_pyarray(py)
            .into_any()
            .unbind(),
    }
}

/// One wave from a float or complex numpy array
fn extract_wave(obj: &Bound<'_, PyAny>) -> PyResult<VectorData> {
    if let Ok(arr) = obj.extract::<PyReadonlyArray1<f64>>() {
        return Ok(VectorData::Real(arr.as_array().to_vec()));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArray1<Complex64>>() {
        return Ok(VectorData::Complex(arr.as_array().to_vec()));
    }
    if let Ok(values) = obj.extract::<Vec<f64>>() {
        return Ok(VectorData::Real(values));
    }
    Err(PyValueError::new_err(
        "expected a 1-D float64 or complex128 array",
    ))
}

fn debug_level(debug: i32) -> tracing::Level {
    match debug {
        i32::MIN..=0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    }
}

// ============================================================================
// Python Classes
// ============================================================================

/// Python wrapper for RawRead
#[pyclass(name = "RawRead")]
pub struct PyRawRead {
    inner: RawRead,
}

#[pymethods]
impl PyRawRead {
    #[new]
    #[pyo3(signature = (filename, traces=None, header_only=false))]
    fn new(filename: &str, traces: Option<Vec<String>>, header_only: bool) -> PyResult<Self> {
        let options = match (header_only, traces) {
            (true, _) => ReadOptions::header_only(),
            (false, Some(names)) => ReadOptions::only(names),
            (false, None) => ReadOptions::default(),
        };
        let inner = RawRead::open_with(filename, options).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn plot(&self) -> String {
        self.inner.plot().to_string()
    }

    #[getter]
    fn flags(&self) -> String {
        self.inner.flags().to_string()
    }

    /// Get all trace names in declared order
    fn trace_names(&self) -> Vec<String> {
        self.inner.trace_names().into_iter().map(String::from).collect()
    }

    /// Get the kind of a trace (`time`, `voltage`, ...)
    fn trace_kind(&self, name: &str) -> PyResult<String> {
        let trace = self.inner.trace(name).map_err(to_py_err)?;
        Ok(trace.kind.as_str().to_string())
    }

    /// Get trace data of one step as a numpy array
    #[pyo3(signature = (name, step=0))]
    fn get_trace(&self, py: Python<'_>, name: &str, step: usize) -> PyResult<Py<PyAny>> {
        let wave = self.inner.wave(name, step).map_err(to_py_err)?;
        Ok(vector_to_numpy(py, wave))
    }

    /// Get axis values (time or frequency) of one step
    #[pyo3(signature = (step=0))]
    fn get_axis(&self, py: Python<'_>, step: usize) -> PyResult<Py<PyAny>> {
        let axis = self.inner.axis(step).map_err(to_py_err)?;
        Ok(Array1::from_vec(axis).into_pyarray(py).into_any().unbind())
    }

    /// Get indices of the steps matching every keyword, e.g. `get_steps(r1=1000)`
    #[pyo3(signature = (**query))]
    fn get_steps(&self, query: Option<&Bound<'_, PyDict>>) -> PyResult<Vec<usize>> {
        let mut pairs: Vec<(String, ParamValue)> = Vec::new();
        if let Some(query) = query {
            for (key, value) in query.iter() {
                let key: String = key.extract()?;
                let value = match value.extract::<f64>() {
                    Ok(v) => ParamValue::Number(v),
                    Err(_) => ParamValue::Text(value.extract::<String>()?),
                };
                pairs.push((key, value));
            }
        }
        let query: Vec<(&str, ParamValue)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        Ok(self.inner.find_steps(&query))
    }

    /// Get the parameters of one step as a dict
    fn step_info<'py>(&self, py: Python<'py>, step: usize) -> PyResult<Bound<'py, PyDict>> {
        let info = self.inner.step_info(step).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        for (key, value) in &info.params {
            match value {
                ParamValue::Number(v) => dict.set_item(key, v)?,
                ParamValue::Text(s) => dict.set_item(key, s)?,
            }
        }
        Ok(dict)
    }

    /// Get a header property
    fn get_property(&self, key: &str) -> PyResult<String> {
        self.inner
            .property(key)
            .map(str::to_string)
            .map_err(to_py_err)
    }

    fn step_count(&self) -> usize {
        self.inner.step_count()
    }

    /// Get number of points of one step
    #[pyo3(signature = (step=0))]
    fn num_points(&self, step: usize) -> PyResult<usize> {
        self.inner.len(step).map_err(to_py_err)
    }

    fn __len__(&self) -> usize {
        self.inner.total_points()
    }

    fn __repr__(&self) -> String {
        format!(
            "RawRead(plot='{}', traces={}, points={}, steps={})",
            self.inner.plot(),
            self.inner.trace_names().len(),
            self.inner.total_points(),
            self.inner.step_count()
        )
    }
}

/// Python wrapper for RawWriter
#[pyclass(name = "RawWrite")]
pub struct PyRawWrite {
    inner: RawWriter,
}

#[pymethods]
impl PyRawWrite {
    #[new]
    #[pyo3(signature = (title, plot="Transient Analysis", fast_access=false, double=false, log_scale=false))]
    fn new(title: &str, plot: &str, fast_access: bool, double: bool, log_scale: bool) -> Self {
        let layout = if fast_access {
            StorageLayout::Columnar
        } else {
            StorageLayout::Interleaved
        };
        let inner = RawWriter::new(title, PlotKind::parse(plot))
            .layout(layout)
            .double_precision(double)
            .log_scale(log_scale);
        Self { inner }
    }

    /// Add a trace: one array, or a list of arrays for a stepped trace
    fn add_trace(&mut self, name: &str, kind: &str, data: &Bound<'_, PyAny>) -> PyResult<()> {
        let steps = match extract_wave(data) {
            Ok(wave) => vec![wave],
            Err(e) => {
                let list = data.downcast::<PyList>().map_err(|_| e)?;
                list.iter()
                    .map(|item| extract_wave(&item))
                    .collect::<PyResult<Vec<_>>>()?
            }
        };
        self.inner
            .add_trace(Trace::stepped(name, TraceKind::parse(kind), steps))
            .map_err(to_py_err)
    }

    /// Write the raw file
    fn save(&self, py: Python<'_>, filename: &str) -> PyResult<()> {
        py.allow_threads(|| self.inner.write(filename))
            .map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "RawWrite(traces={}, steps={})",
            self.inner.traces().len(),
            self.inner.step_count()
        )
    }
}

/// Python wrapper for SimRunner
///
/// Callbacks receive the raw and log paths of a successful run; their return
/// value is reported in the `callback_output` field of the outcome.
#[pyclass(name = "SimRunner")]
pub struct PySimRunner {
    inner: Mutex<SimRunner<PyObject>>,
}

fn simulator_for(name: &str, executable: Option<String>) -> PyResult<Arc<dyn Simulator>> {
    let sim: Arc<dyn Simulator> = match name.to_lowercase().as_str() {
        "ltspice" => match executable {
            Some(exe) => Arc::new(LtSpice::new(vec![exe])),
            None => Arc::new(LtSpice::detect().map_err(to_py_err)?),
        },
        "ngspice" => Arc::new(executable.map_or_else(NgSpice::default, NgSpice::new)),
        "qspice" => match executable {
            Some(exe) => Arc::new(QSpice::new(exe)),
            None => Arc::new(QSpice::detect().map_err(to_py_err)?),
        },
        "xyce" => Arc::new(executable.map_or_else(Xyce::default, Xyce::new)),
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown simulator '{}'",
                other
            )))
        }
    };
    Ok(sim)
}

fn outcome_to_dict<'py>(
    py: Python<'py>,
    outcome: JobOutcome<PyObject>,
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("id", outcome.id.0)?;
    dict.set_item("run_name", &outcome.run_name)?;
    dict.set_item("netlist", outcome.netlist.to_string_lossy())?;
    dict.set_item("state", outcome.state.to_string())?;
    dict.set_item("exit_code", outcome.exit_code)?;
    dict.set_item("elapsed", outcome.elapsed.as_secs_f64())?;
    match &outcome.result {
        Ok(OutputFiles { raw, log }) => {
            dict.set_item("raw", raw.to_string_lossy())?;
            dict.set_item("log", log.to_string_lossy())?;
            dict.set_item("error", py.None())?;
        }
        Err(e) => {
            dict.set_item("raw", py.None())?;
            dict.set_item("log", py.None())?;
            dict.set_item("error", e.to_string())?;
        }
    }
    dict.set_item("callback_output", outcome.callback_output)?;
    Ok(dict)
}

impl PySimRunner {
    fn lock(&self) -> PyResult<std::sync::MutexGuard<'_, SimRunner<PyObject>>> {
        self.inner
            .lock()
            .map_err(|_| PyRuntimeError::new_err("runner lock poisoned"))
    }
}

#[pymethods]
impl PySimRunner {
    #[new]
    #[pyo3(signature = (simulator="ngspice", executable=None, parallel_sims=4, timeout=Some(600.0), output_folder=None, switches=None, isolated_callbacks=false))]
    fn new(
        simulator: &str,
        executable: Option<String>,
        parallel_sims: usize,
        timeout: Option<f64>,
        output_folder: Option<String>,
        switches: Option<Vec<String>>,
        isolated_callbacks: bool,
    ) -> PyResult<Self> {
        let mut config = RunnerConfig::default()
            .parallel_sims(parallel_sims)
            .timeout(timeout.map(Duration::from_secs_f64))
            .switches(switches.unwrap_or_default());
        if let Some(folder) = output_folder {
            config = config.output_folder(folder);
        }
        if isolated_callbacks {
            config = config.callback_mode(CallbackMode::Isolated);
        }
        let runner =
            SimRunner::with_simulator(simulator_for(simulator, executable)?, config)
                .map_err(to_py_err)?;
        Ok(Self {
            inner: Mutex::new(runner),
        })
    }

    /// Submit a netlist; returns the job id
    #[pyo3(signature = (netlist, run_name=None, callback=None, wait_resource=true))]
    fn run(
        &self,
        py: Python<'_>,
        netlist: &str,
        run_name: Option<String>,
        callback: Option<PyObject>,
        wait_resource: bool,
    ) -> PyResult<u64> {
        let mut job = Job::new(netlist).wait_resource(wait_resource);
        if let Some(name) = run_name {
            job = job.run_name(name);
        }
        if let Some(cb) = callback {
            job = job.callback(move |files: &OutputFiles| {
                Python::with_gil(|py| {
                    let raw = files.raw.to_string_lossy().into_owned();
                    let log = files.log.to_string_lossy().into_owned();
                    cb.call1(py, (raw, log)).unwrap_or_else(|e| {
                        e.print(py);
                        py.None()
                    })
                })
            });
        }
        let handle = py.allow_threads(|| self.lock()?.run(job).map_err(to_py_err))?;
        Ok(handle.id.0)
    }

    /// Block until all jobs finish; `False` on timeout or when any job failed
    #[pyo3(signature = (timeout=None, abort_on_timeout=false))]
    fn wait_completion(
        &self,
        py: Python<'_>,
        timeout: Option<f64>,
        abort_on_timeout: bool,
    ) -> PyResult<bool> {
        let timeout = timeout.map(Duration::from_secs_f64);
        py.allow_threads(|| Ok(self.lock()?.wait_completion(timeout, abort_on_timeout)))
    }

    /// Collect the outcomes of all outstanding jobs, blocking until they finish
    fn completed<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        let outcomes: Vec<JobOutcome<PyObject>> =
            py.allow_threads(|| Ok::<_, PyErr>(self.lock()?.completed().collect()))?;
        let list = PyList::empty(py);
        for outcome in outcomes {
            list.append(outcome_to_dict(py, outcome)?)?;
        }
        Ok(list)
    }

    /// Get job counters as a dict
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = py.allow_threads(|| self.lock().map(|runner| runner.stats()))?;
        let dict = PyDict::new(py);
        dict.set_item("submitted", stats.submitted)?;
        dict.set_item("succeeded", stats.succeeded)?;
        dict.set_item("failed", stats.failed)?;
        dict.set_item("timed_out", stats.timed_out)?;
        dict.set_item("running", stats.running)?;
        dict.set_item("peak_running", stats.peak_running)?;
        Ok(dict)
    }

    fn __repr__(&self) -> PyResult<String> {
        let runner = self.lock()?;
        Ok(format!(
            "SimRunner(simulator='{}', parallel_sims={})",
            runner.simulator().name(),
            runner.config().parallel_sims
        ))
    }
}

// ============================================================================
// Python Functions
// ============================================================================

/// Enable log output
///
/// Args:
///     debug: Debug level (0=warnings, 1=info, 2=verbose)
#[pyfunction]
#[pyo3(signature = (debug=1))]
pub fn init_logging(debug: i32) -> bool {
    LogConfig::new(debug_level(debug)).ansi(false).init()
}

/// Read a raw waveform file
///
/// Args:
///     filename: Path to the .raw file
///     debug: Debug level (0=quiet, 1=info, 2=verbose)
///
/// Returns:
///     RawRead object or None if failed
#[pyfunction]
#[pyo3(signature = (filename, debug=0))]
pub fn read(py: Python<'_>, filename: &str, debug: i32) -> PyResult<Option<PyRawRead>> {
    if debug > 0 {
        init_logging(debug);
    }
    match py.allow_threads(|| spicebatch_core::read(filename)) {
        Ok(inner) => Ok(Some(PyRawRead { inner })),
        Err(e) => {
            warn!(file = filename, error = %e, "Read failed");
            Ok(None)
        }
    }
}

// ============================================================================
// Module Definition
// ============================================================================

#[pymodule]
pub fn spicebatch(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Functions
    m.add_function(wrap_pyfunction!(read, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    // Classes
    m.add_class::<PyRawRead>()?;
    m.add_class::<PyRawWrite>()?;
    m.add_class::<PySimRunner>()?;

    Ok(())
}
