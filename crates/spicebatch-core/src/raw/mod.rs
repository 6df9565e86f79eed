//! Raw waveform files: header, body codec and step log

mod header;
mod reader;
mod steps;
mod writer;

pub use header::{parse_header, Flags, RawHeader, TraceDescriptor};
pub use reader::{RawRead, ReadOptions, TraceSelection};
pub use steps::{
    detect_step_offsets, find_steps, log_path_for, parse_step_log, read_step_log,
    render_step_log, ParamValue, StepInfo,
};
pub use writer::{write_raw, RawWriter};
