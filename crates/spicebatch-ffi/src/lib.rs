//! C Foreign Function Interface (FFI) for spicebatch
//!
//! This module provides a C-compatible API for reading and writing raw
//! waveform files from C, C++, and other languages that support C FFI.
//!
//! Handles returned by `*_open` / `*_new` must be released with the matching
//! `*_free` function. Strings returned by accessors stay valid until the
//! handle is freed.

use spicebatch_core::{
    Complex64, LogConfig, PlotKind, RawRead, RawWriter, StorageLayout, Trace, TraceKind,
    VectorData,
};
use std::ffi::{c_char, c_double, c_int, CStr, CString};
use std::ptr;
use std::slice;
use tracing::warn;

// ============================================================================
// Opaque Types for C
// ============================================================================

/// Opaque handle to a decoded raw file
pub struct CRawFile {
    inner: Box<RawRead>,
    cached_title: CString,
    cached_plot: CString,
    cached_var_names: Vec<CString>,
    cached_properties: Vec<(String, CString)>,
}

/// Opaque handle to a raw file under construction
pub struct CRawWriter {
    inner: RawWriter,
}

unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

fn init_logging(debug: c_int) {
    if debug > 0 {
        let level = if debug > 1 {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        LogConfig::new(level).ansi(false).init();
    }
}

/// Counts past `c_int::MAX` are clamped
fn count_to_c(n: usize) -> c_int {
    c_int::try_from(n).unwrap_or(c_int::MAX)
}

fn kind_code(kind: &TraceKind) -> c_int {
    match kind {
        TraceKind::Time => 0,
        TraceKind::Frequency => 1,
        TraceKind::Voltage => 2,
        TraceKind::Current => 3,
        TraceKind::DeviceCurrent => 4,
        TraceKind::SubcktCurrent => 5,
        TraceKind::Parameter => 6,
        TraceKind::Other(_) => -1,
    }
}

// ============================================================================
// Reader Creation and Destruction
// ============================================================================

/// Read a raw file and return a handle, or NULL on failure.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_open(
    filename: *const c_char,
    debug: c_int,
) -> *mut CRawFile {
    let Some(filename) = str_arg(filename) else {
        return ptr::null_mut();
    };
    init_logging(debug);

    match RawRead::open(filename) {
        Ok(raw) => {
            let cached_title = CString::new(raw.header().title()).unwrap_or_default();
            let cached_plot = CString::new(raw.plot().to_string()).unwrap_or_default();
            let cached_var_names: Vec<CString> = raw
                .trace_names()
                .into_iter()
                .map(|n| CString::new(n).unwrap_or_default())
                .collect();
            let cached_properties = raw
                .properties()
                .iter()
                .filter_map(|(k, v)| CString::new(v.as_str()).ok().map(|c| (k.clone(), c)))
                .collect();

            Box::into_raw(Box::new(CRawFile {
                inner: Box::new(raw),
                cached_title,
                cached_plot,
                cached_var_names,
                cached_properties,
            }))
        }
        Err(e) => {
            warn!(file = filename, error = %e, "spicebatch_raw_open failed");
            ptr::null_mut()
        }
    }
}

/// Free a raw file handle.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_free(raw: *mut CRawFile) {
    if !raw.is_null() {
        drop(Box::from_raw(raw));
    }
}

// ============================================================================
// Metadata Accessors
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_title(raw: *const CRawFile) -> *const c_char {
    if raw.is_null() {
        return ptr::null();
    }
    (*raw).cached_title.as_ptr()
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_plot(raw: *const CRawFile) -> *const c_char {
    if raw.is_null() {
        return ptr::null();
    }
    (*raw).cached_plot.as_ptr()
}

/// Header property value, or NULL when the file has no such property.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_property(
    raw: *const CRawFile,
    key: *const c_char,
) -> *const c_char {
    let Some(key) = str_arg(key) else {
        return ptr::null();
    };
    if raw.is_null() {
        return ptr::null();
    }
    (*raw)
        .cached_properties
        .iter()
        .find(|(k, _)| k == key)
        .map_or(ptr::null(), |(_, v)| v.as_ptr())
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_var_count(raw: *const CRawFile) -> c_int {
    if raw.is_null() {
        return 0;
    }
    count_to_c((*raw).cached_var_names.len())
}

/// Total point count over all steps
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_point_count(raw: *const CRawFile) -> c_int {
    if raw.is_null() {
        return 0;
    }
    count_to_c((*raw).inner.total_points())
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_step_count(raw: *const CRawFile) -> c_int {
    if raw.is_null() {
        return 0;
    }
    count_to_c((*raw).inner.step_count())
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_step_length(
    raw: *const CRawFile,
    step: c_int,
) -> c_int {
    if raw.is_null() || step < 0 {
        return -1;
    }
    (*raw).inner.len(step as usize).map_or(-1, count_to_c)
}

// ============================================================================
// Variable Accessors
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_var_name(
    raw: *const CRawFile,
    index: c_int,
) -> *const c_char {
    if raw.is_null() || index < 0 {
        return ptr::null();
    }
    (&(*raw).cached_var_names)
        .get(index as usize)
        .map_or(ptr::null(), |n| n.as_ptr())
}

/// Index of a variable by name (case-insensitive fallback), or -1.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_find_var(
    raw: *const CRawFile,
    name: *const c_char,
) -> c_int {
    let Some(name) = str_arg(name) else {
        return -1;
    };
    if raw.is_null() {
        return -1;
    }
    let names = (*raw).inner.trace_names();
    names
        .iter()
        .position(|n| *n == name)
        .or_else(|| names.iter().position(|n| n.eq_ignore_ascii_case(name)))
        .map_or(-1, count_to_c)
}

/// Kind code: 0 time, 1 frequency, 2 voltage, 3 current,
/// 4 device current, 5 subcircuit current, 6 parameter, -1 other
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_var_kind(
    raw: *const CRawFile,
    index: c_int,
) -> c_int {
    if raw.is_null() || index < 0 {
        return -1;
    }
    (*raw)
        .inner
        .header()
        .variables
        .get(index as usize)
        .map_or(-1, |v| kind_code(&v.kind))
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_is_complex(raw: *const CRawFile) -> c_int {
    if raw.is_null() {
        return -1;
    }
    if (*raw).inner.header().is_complex() {
        1
    } else {
        0
    }
}

// ============================================================================
// Data Accessors
// ============================================================================

unsafe fn wave<'a>(
    raw: *const CRawFile,
    step: c_int,
    var_index: c_int,
) -> Option<&'a VectorData> {
    if raw.is_null() || step < 0 || var_index < 0 {
        return None;
    }
    let trace = (*raw).inner.trace_at(var_index as usize).ok()?;
    trace.wave(step as usize).ok()
}

/// Copy the real data of one step of a variable; returns the count copied or -1.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_real_data(
    raw: *const CRawFile,
    step: c_int,
    var_index: c_int,
    out_buffer: *mut c_double,
    max_count: c_int,
) -> c_int {
    if out_buffer.is_null() || max_count <= 0 {
        return -1;
    }
    match wave(raw, step, var_index) {
        Some(VectorData::Real(vec)) => {
            let count = std::cmp::min(vec.len(), max_count as usize);
            ptr::copy_nonoverlapping(vec.as_ptr(), out_buffer, count);
            count as c_int
        }
        _ => -1,
    }
}

/// Copy the complex data of one step of a variable; returns the count copied or -1.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_raw_get_complex_data(
    raw: *const CRawFile,
    step: c_int,
    var_index: c_int,
    out_real: *mut c_double,
    out_imag: *mut c_double,
    max_count: c_int,
) -> c_int {
    if out_real.is_null() || out_imag.is_null() || max_count <= 0 {
        return -1;
    }
    match wave(raw, step, var_index) {
        Some(VectorData::Complex(vec)) => {
            let count = std::cmp::min(vec.len(), max_count as usize);
            for (i, c) in vec.iter().take(count).enumerate() {
                *out_real.add(i) = c.re;
                *out_imag.add(i) = c.im;
            }
            count as c_int
        }
        _ => -1,
    }
}

// ============================================================================
// Writer API
// ============================================================================

/// Start a raw file; `plot` is a plot name such as "Transient Analysis".
#[no_mangle]
pub unsafe extern "C" fn spicebatch_writer_new(
    title: *const c_char,
    plot: *const c_char,
    fast_access: c_int,
) -> *mut CRawWriter {
    let (Some(title), Some(plot)) = (str_arg(title), str_arg(plot)) else {
        return ptr::null_mut();
    };
    let layout = if fast_access != 0 {
        StorageLayout::Columnar
    } else {
        StorageLayout::Interleaved
    };
    let inner = RawWriter::new(title, PlotKind::parse(plot)).layout(layout);
    Box::into_raw(Box::new(CRawWriter { inner }))
}

#[no_mangle]
pub unsafe extern "C" fn spicebatch_writer_free(writer: *mut CRawWriter) {
    if !writer.is_null() {
        drop(Box::from_raw(writer));
    }
}

unsafe fn add_trace(
    writer: *mut CRawWriter,
    name: *const c_char,
    kind: *const c_char,
    data: VectorData,
) -> c_int {
    let (Some(name), Some(kind)) = (str_arg(name), str_arg(kind)) else {
        return -1;
    };
    match (*writer)
        .inner
        .add_trace(Trace::new(name, TraceKind::parse(kind), data))
    {
        Ok(()) => 0,
        Err(e) => {
            warn!(trace = name, error = %e, "spicebatch_writer_add failed");
            -1
        }
    }
}

/// Add a real trace; `kind` is a variable type such as "voltage". Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_writer_add_real(
    writer: *mut CRawWriter,
    name: *const c_char,
    kind: *const c_char,
    data: *const c_double,
    count: c_int,
) -> c_int {
    if writer.is_null() || data.is_null() || count <= 0 {
        return -1;
    }
    let values = slice::from_raw_parts(data, count as usize).to_vec();
    add_trace(writer, name, kind, VectorData::Real(values))
}

/// Add a complex trace from separate real and imaginary arrays. Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_writer_add_complex(
    writer: *mut CRawWriter,
    name: *const c_char,
    kind: *const c_char,
    real: *const c_double,
    imag: *const c_double,
    count: c_int,
) -> c_int {
    if writer.is_null() || real.is_null() || imag.is_null() || count <= 0 {
        return -1;
    }
    let re = slice::from_raw_parts(real, count as usize);
    let im = slice::from_raw_parts(imag, count as usize);
    let values = re
        .iter()
        .zip(im)
        .map(|(&r, &i)| Complex64::new(r, i))
        .collect();
    add_trace(writer, name, kind, VectorData::Complex(values))
}

/// Write the file. Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn spicebatch_writer_save(
    writer: *const CRawWriter,
    filename: *const c_char,
) -> c_int {
    let Some(filename) = str_arg(filename) else {
        return -1;
    };
    if writer.is_null() {
        return -1;
    }
    match (*writer).inner.write(filename) {
        Ok(()) => 0,
        Err(e) => {
            warn!(file = filename, error = %e, "spicebatch_writer_save failed");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_clamp_to_c_int() {
        assert_eq!(count_to_c(42), 42);
        assert_eq!(count_to_c(c_int::MAX as usize), c_int::MAX);
        assert_eq!(count_to_c(usize::MAX), c_int::MAX);
    }

    #[test]
    fn test_write_then_read_through_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("ffi.raw").to_string_lossy().as_ref()).unwrap();
        let time = [0.0, 1e-6, 2e-6];
        let vout = [0.5, 1.5, 2.5];

        unsafe {
            let title = CString::new("* ffi").unwrap();
            let plot = CString::new("Transient Analysis").unwrap();
            let writer = spicebatch_writer_new(title.as_ptr(), plot.as_ptr(), 0);
            assert!(!writer.is_null());

            let kind = CString::new("time").unwrap();
            let name = CString::new("time").unwrap();
            assert_eq!(
                spicebatch_writer_add_real(writer, name.as_ptr(), kind.as_ptr(), time.as_ptr(), 3),
                0
            );
            let kind = CString::new("voltage").unwrap();
            let name = CString::new("V(out)").unwrap();
            assert_eq!(
                spicebatch_writer_add_real(writer, name.as_ptr(), kind.as_ptr(), vout.as_ptr(), 3),
                0
            );
            assert_eq!(spicebatch_writer_save(writer, path.as_ptr()), 0);
            spicebatch_writer_free(writer);

            let raw = spicebatch_raw_open(path.as_ptr(), 0);
            assert!(!raw.is_null());
            assert_eq!(spicebatch_raw_get_var_count(raw), 2);
            assert_eq!(spicebatch_raw_get_point_count(raw), 3);
            assert_eq!(spicebatch_raw_get_step_count(raw), 1);
            assert_eq!(spicebatch_raw_find_var(raw, name.as_ptr()), 1);
            assert_eq!(spicebatch_raw_get_var_kind(raw, 1), 2);
            assert_eq!(spicebatch_raw_is_complex(raw), 0);

            let title_out = CStr::from_ptr(spicebatch_raw_get_title(raw));
            assert_eq!(title_out.to_str().unwrap(), "* ffi");
            let key = CString::new("No. Points").unwrap();
            let points = CStr::from_ptr(spicebatch_raw_get_property(raw, key.as_ptr()));
            assert_eq!(points.to_str().unwrap(), "3");

            let mut out = [0.0f64; 8];
            assert_eq!(spicebatch_raw_get_real_data(raw, 0, 1, out.as_mut_ptr(), 8), 3);
            assert_eq!(&out[..3], &vout);
            assert_eq!(spicebatch_raw_get_real_data(raw, 1, 1, out.as_mut_ptr(), 8), -1);

            spicebatch_raw_free(raw);
        }
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert!(spicebatch_raw_open(ptr::null(), 0).is_null());
            assert_eq!(spicebatch_raw_get_var_count(ptr::null()), 0);
            assert!(spicebatch_raw_get_var_name(ptr::null(), 0).is_null());
            assert!(spicebatch_writer_new(ptr::null(), ptr::null(), 0).is_null());
            spicebatch_raw_free(ptr::null_mut());
        }
    }
}
