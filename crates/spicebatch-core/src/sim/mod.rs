//! Simulator backends and the parallel run orchestrator

mod callback;
mod job;
mod runner;
mod simulator;

pub use callback::CallbackMode;
pub use job::{Callback, Job, JobHandle, JobId, JobOutcome, JobState};
pub use runner::{
    Completed, RunnerConfig, RunnerStats, SimRunner, StateHook, DEFAULT_PARALLEL_SIMS,
    DEFAULT_TIMEOUT,
};
pub use simulator::{CommandLine, LtSpice, NgSpice, OutputFiles, QSpice, Simulator, Xyce};
