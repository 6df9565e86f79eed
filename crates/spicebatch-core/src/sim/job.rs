//! Jobs, their life cycle and their outcomes

use super::simulator::OutputFiles;
use crate::types::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Completion callback, run for successful jobs only
pub type Callback<T> = Arc<dyn Fn(&OutputFiles) -> T + Send + Sync>;

/// Runner-assigned job number, unique per runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `Queued -> Running -> {Completed, Failed, TimedOut}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// A netlist submission
pub struct Job<T = ()> {
    pub(crate) netlist: PathBuf,
    pub(crate) run_name: Option<String>,
    pub(crate) callback: Option<Callback<T>>,
    pub(crate) wait_resource: bool,
}

impl<T> Job<T> {
    pub fn new(netlist: impl Into<PathBuf>) -> Self {
        Self {
            netlist: netlist.into(),
            run_name: None,
            callback: None,
            wait_resource: true,
        }
    }

    /// Name of the run copy of the netlist (without extension)
    pub fn run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputFiles) -> T + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }

    /// Block while every slot is busy (default), or fail with `Saturated`
    pub fn wait_resource(mut self, wait: bool) -> Self {
        self.wait_resource = wait;
        self
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("netlist", &self.netlist)
            .field("run_name", &self.run_name)
            .field("callback", &self.callback.is_some())
            .field("wait_resource", &self.wait_resource)
            .finish()
    }
}

/// Final record of a job
#[derive(Debug)]
pub struct JobOutcome<T = ()> {
    pub id: JobId,
    pub run_name: String,
    /// Netlist actually simulated (the run copy when one was made)
    pub netlist: PathBuf,
    pub state: JobState,
    pub result: Result<OutputFiles>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub callback_output: Option<T>,
}

impl<T> JobOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// Caller-side view of a submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub run_name: String,
    pub(crate) state: watch::Receiver<JobState>,
    pub(crate) runtime: Handle,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Block until the job reaches a terminal state
    ///
    /// Must not be called from inside an async context.
    pub fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        let done = self
            .runtime
            .block_on(rx.wait_for(JobState::is_terminal))
            .map(|s| *s);
        done.unwrap_or_else(|_| *rx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
    }

    #[test]
    fn test_job_builder() {
        let job: Job<usize> = Job::new("a.net").run_name("first").wait_resource(false);
        assert_eq!(job.run_name.as_deref(), Some("first"));
        assert!(!job.wait_resource);
        assert!(job.callback.is_none());
        assert_eq!(JobId(3).to_string(), "#3");
    }
}
