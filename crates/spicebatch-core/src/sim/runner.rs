//! Simulation run orchestrator
//!
//! [`SimRunner`] launches one simulator process per job on its own tokio
//! runtime. A semaphore caps the number of running processes; a job holds
//! its permit from the moment it is submitted until its outcome has been
//! recorded. Finished jobs are delivered through an unbounded channel
//! (drained by [`SimRunner::completed`]) and counted on a watch channel so
//! that [`SimRunner::wait_completion`] can re-arm its deadline on progress.

use super::callback::{CallbackDispatch, CallbackMode};
use super::job::{Callback, Job, JobHandle, JobId, JobOutcome, JobState};
use super::simulator::{OutputFiles, Simulator};
use crate::types::{Result, SpiceError};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_PARALLEL_SIMS: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Instrumentation hook called on every job state transition
pub type StateHook = Arc<dyn Fn(JobId, JobState) + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
pub struct RunnerConfig {
    pub parallel_sims: usize,
    /// Per-job limit, `None` to let jobs run forever
    pub timeout: Option<Duration>,
    /// Folder receiving the run copies of the netlists
    pub output_folder: Option<PathBuf>,
    /// Extra command-line switches passed to every run
    pub switches: Vec<String>,
    pub callback_mode: CallbackMode,
    pub state_hook: Option<StateHook>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel_sims: DEFAULT_PARALLEL_SIMS,
            timeout: Some(DEFAULT_TIMEOUT),
            output_folder: None,
            switches: Vec::new(),
            callback_mode: CallbackMode::Inline,
            state_hook: None,
        }
    }
}

impl RunnerConfig {
    pub fn parallel_sims(mut self, n: usize) -> Self {
        self.parallel_sims = n.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = Some(folder.into());
        self
    }

    pub fn switch(mut self, switch: impl Into<String>) -> Self {
        self.switches.push(switch.into());
        self
    }

    pub fn switches(mut self, switches: Vec<String>) -> Self {
        self.switches = switches;
        self
    }

    pub fn callback_mode(mut self, mode: CallbackMode) -> Self {
        self.callback_mode = mode;
        self
    }

    pub fn state_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(JobId, JobState) + Send + Sync + 'static,
    {
        self.state_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("parallel_sims", &self.parallel_sims)
            .field("timeout", &self.timeout)
            .field("output_folder", &self.output_folder)
            .field("switches", &self.switches)
            .field("callback_mode", &self.callback_mode)
            .field("state_hook", &self.state_hook.is_some())
            .finish()
    }
}

/// Job counters over the lifetime of a runner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub running: usize,
    /// Highest number of simultaneously running jobs seen
    pub peak_running: usize,
}

impl RunnerStats {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    /// Jobs submitted but not yet terminal
    pub fn active(&self) -> usize {
        self.submitted - self.finished()
    }
}

// ============================================================================
// Shared job state
// ============================================================================

enum Exit {
    Status(ExitStatus),
    Error(io::Error),
    TimedOut(Duration),
    Aborted,
}

struct Finished {
    state: JobState,
    result: Result<OutputFiles>,
    exit_code: Option<i32>,
}

struct Shared<T> {
    simulator: Arc<dyn Simulator>,
    config: RunnerConfig,
    semaphore: Arc<Semaphore>,
    stats: Mutex<RunnerStats>,
    finished: watch::Sender<usize>,
    abort: watch::Sender<bool>,
    outcomes: mpsc::UnboundedSender<JobOutcome<T>>,
    callbacks: CallbackDispatch<T>,
}

async fn wait_child(child: &mut Child, timeout: Option<Duration>) -> Exit {
    let exit = |r: io::Result<ExitStatus>| r.map_or_else(Exit::Error, Exit::Status);
    match timeout {
        None => exit(child.wait().await),
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => exit(status),
            Err(_) => Exit::TimedOut(limit),
        },
    }
}

/// Rename the log of a failed run to `.fail`
fn mark_failed_log(log: &Path) {
    if !log.exists() {
        return;
    }
    let fail = log.with_extension("fail");
    if let Err(e) = fs::rename(log, &fail) {
        warn!(log = %log.display(), error = %e, "Could not rename failed log");
    }
}

impl<T: Send + 'static> Shared<T> {
    fn lock_stats(&self) -> MutexGuard<'_, RunnerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, id: JobId, state: JobState, tx: &watch::Sender<JobState>) {
        tx.send_replace(state);
        if let Some(hook) = &self.config.state_hook {
            hook(id, state);
        }
    }

    fn start(&self, id: JobId, tx: &watch::Sender<JobState>) {
        {
            let mut stats = self.lock_stats();
            stats.running += 1;
            stats.peak_running = stats.peak_running.max(stats.running);
        }
        self.transition(id, JobState::Running, tx);
    }

    /// Terminal transition first, so a job that no longer counts as active is visibly terminal
    fn finish(&self, id: JobId, state: JobState, tx: &watch::Sender<JobState>) {
        self.transition(id, state, tx);
        {
            let mut stats = self.lock_stats();
            stats.running = stats.running.saturating_sub(1);
            match state {
                JobState::Completed => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
                JobState::TimedOut => stats.timed_out += 1,
                JobState::Queued | JobState::Running => {}
            }
        }
        self.finished.send_modify(|n| *n += 1);
    }

    /// Run the simulator on `netlist` and classify the result
    async fn simulate(&self, id: JobId, netlist: &Path, started: Instant) -> Finished {
        let files = self.simulator.output_files(netlist);
        let cmd = self.simulator.command_line(netlist, &self.config.switches);
        info!(job = %id, command = %cmd, "Starting simulation");

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(job = %id, error = %e, "Could not start simulator");
                return Finished {
                    state: JobState::Failed,
                    result: Err(SpiceError::Process(format!(
                        "failed to start '{}': {}",
                        cmd, e
                    ))),
                    exit_code: None,
                };
            }
        };

        let mut abort = self.abort.subscribe();
        let exit = tokio::select! {
            exit = wait_child(&mut child, self.config.timeout) => exit,
            Ok(_) = abort.wait_for(|&aborted| aborted) => Exit::Aborted,
        };

        if matches!(exit, Exit::TimedOut(_) | Exit::Aborted) {
            // kill() also reaps the process
            if let Err(e) = child.kill().await {
                warn!(job = %id, error = %e, "Could not kill simulator");
            }
        }

        match exit {
            Exit::Status(status) if status.success() && files.raw.exists() => {
                info!(job = %id, elapsed = ?started.elapsed(), "Simulation completed");
                Finished {
                    state: JobState::Completed,
                    result: Ok(files),
                    exit_code: status.code(),
                }
            }
            Exit::Status(status) => {
                let reason = if status.success() {
                    format!("no raw file at {}", files.raw.display())
                } else {
                    format!("simulator exited with {}", status)
                };
                warn!(job = %id, %reason, "Simulation failed");
                mark_failed_log(&files.log);
                Finished {
                    state: JobState::Failed,
                    result: Err(SpiceError::Process(reason)),
                    exit_code: status.code(),
                }
            }
            Exit::Error(e) => {
                warn!(job = %id, error = %e, "Lost track of simulator process");
                Finished {
                    state: JobState::Failed,
                    result: Err(SpiceError::Io(e)),
                    exit_code: None,
                }
            }
            Exit::TimedOut(limit) => {
                warn!(job = %id, ?limit, "Simulation timed out and was killed");
                Finished {
                    state: JobState::TimedOut,
                    result: Err(SpiceError::Timeout(limit)),
                    exit_code: None,
                }
            }
            Exit::Aborted => {
                warn!(job = %id, "Simulation aborted");
                Finished {
                    state: JobState::TimedOut,
                    result: Err(SpiceError::Timeout(started.elapsed())),
                    exit_code: None,
                }
            }
        }
    }

    async fn execute(
        &self,
        id: JobId,
        run_name: String,
        netlist: PathBuf,
        callback: Option<Callback<T>>,
        state: watch::Sender<JobState>,
    ) {
        self.start(id, &state);
        let started = Instant::now();
        let finished = self.simulate(id, &netlist, started).await;

        let callback_output = match (&finished.result, callback) {
            (Ok(files), Some(cb)) => self.callbacks.run(cb, files.clone()).await,
            _ => None,
        };

        let terminal = finished.state;
        let outcome = JobOutcome {
            id,
            run_name,
            netlist,
            state: terminal,
            result: finished.result,
            exit_code: finished.exit_code,
            elapsed: started.elapsed(),
            callback_output,
        };
        // queued before the job stops counting as active, so `completed` never misses it
        if self.outcomes.send(outcome).is_err() {
            debug!(job = %id, "Outcome dropped, runner is gone");
        }
        self.finish(id, terminal, &state);
    }
}

// ============================================================================
// SimRunner
// ============================================================================

/// Runs simulations in parallel, up to `parallel_sims` at a time
pub struct SimRunner<T = ()> {
    runtime: Runtime,
    shared: Arc<Shared<T>>,
    outcomes: mpsc::UnboundedReceiver<JobOutcome<T>>,
    next_id: AtomicU64,
    run_number: AtomicUsize,
}

impl<T: Send + 'static> SimRunner<T> {
    pub fn new<S: Simulator + 'static>(simulator: S, config: RunnerConfig) -> Result<Self> {
        Self::with_simulator(Arc::new(simulator), config)
    }

    pub fn with_simulator(simulator: Arc<dyn Simulator>, config: RunnerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("spicebatch-runner")
            .build()?;
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (finished, _) = watch::channel(0usize);
        let (abort, _) = watch::channel(false);
        let callbacks = CallbackDispatch::new(config.callback_mode)?;

        info!(
            simulator = simulator.name(),
            parallel = config.parallel_sims,
            timeout = ?config.timeout,
            "Simulation runner ready"
        );

        let shared = Shared {
            simulator,
            semaphore: Arc::new(Semaphore::new(config.parallel_sims.max(1))),
            config,
            stats: Mutex::new(RunnerStats::default()),
            finished,
            abort,
            outcomes: outcome_tx,
            callbacks,
        };

        Ok(Self {
            runtime,
            shared: Arc::new(shared),
            outcomes: outcome_rx,
            next_id: AtomicU64::new(1),
            run_number: AtomicUsize::new(1),
        })
    }

    pub fn simulator(&self) -> &dyn Simulator {
        self.shared.simulator.as_ref()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }

    fn acquire(&self, wait: bool) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.shared.semaphore);
        let closed = || SpiceError::Process("runner is shut down".into());
        if wait {
            self.runtime
                .block_on(semaphore.acquire_owned())
                .map_err(|_| closed())
        } else {
            semaphore.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits => {
                    SpiceError::Saturated(self.shared.config.parallel_sims)
                }
                TryAcquireError::Closed => closed(),
            })
        }
    }

    /// Netlist to simulate and run name; copies the netlist when a run name or output folder is set
    fn prepare(&self, netlist: &Path, run_name: Option<&str>) -> Result<(PathBuf, String)> {
        if !netlist.is_file() {
            return Err(SpiceError::NotFound(format!(
                "netlist {}",
                netlist.display()
            )));
        }
        let run_no = self.run_number.fetch_add(1, Ordering::SeqCst);
        let stem = netlist
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let output_folder = self.shared.config.output_folder.as_ref();
        if output_folder.is_none() && run_name.is_none() {
            return Ok((netlist.to_path_buf(), stem));
        }

        let folder = output_folder
            .cloned()
            .or_else(|| netlist.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        if !folder.as_os_str().is_empty() {
            fs::create_dir_all(&folder)?;
        }

        let name = run_name.map_or_else(|| format!("{}_{}", stem, run_no), str::to_string);
        let file_name = match netlist.extension() {
            Some(ext) => format!("{}.{}", name, ext.to_string_lossy()),
            None => name.clone(),
        };
        let run_netlist = folder.join(file_name);
        if run_netlist != netlist {
            fs::copy(netlist, &run_netlist)?;
            debug!(from = %netlist.display(), to = %run_netlist.display(), "Netlist copied");
        }
        Ok((run_netlist, name))
    }

    fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Submit a job
    ///
    /// Blocks while every slot is busy unless the job was built with
    /// `wait_resource(false)`, in which case `SpiceError::Saturated` is returned.
    #[instrument(skip_all, fields(netlist = %job.netlist.display()))]
    pub fn run(&self, job: Job<T>) -> Result<JobHandle> {
        let permit = self.acquire(job.wait_resource)?;
        let (netlist, run_name) = self.prepare(&job.netlist, job.run_name.as_deref())?;
        let id = self.next_id();

        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        self.shared.lock_stats().submitted += 1;
        self.shared.transition(id, JobState::Queued, &state_tx);
        info!(job = %id, run = %run_name, "Job queued");

        let shared = Arc::clone(&self.shared);
        let callback = job.callback;
        let name = run_name.clone();
        self.runtime.spawn(async move {
            let _permit = permit;
            shared
                .execute(id, name, netlist, callback, state_tx)
                .await;
        });

        Ok(JobHandle {
            id,
            run_name,
            state: state_rx,
            runtime: self.runtime.handle().clone(),
        })
    }

    /// Run one netlist synchronously and return its output files
    #[instrument(skip_all, fields(netlist = %netlist.as_ref().display()))]
    pub fn run_now<P: AsRef<Path>>(&self, netlist: P) -> Result<OutputFiles> {
        let _permit = self.acquire(true)?;
        let (netlist, run_name) = self.prepare(netlist.as_ref(), None)?;
        let id = self.next_id();

        let (state_tx, _state_rx) = watch::channel(JobState::Queued);
        self.shared.lock_stats().submitted += 1;
        self.shared.transition(id, JobState::Queued, &state_tx);

        let shared = &self.shared;
        let finished = self.runtime.block_on(async {
            shared.start(id, &state_tx);
            let finished = shared.simulate(id, &netlist, Instant::now()).await;
            shared.finish(id, finished.state, &state_tx);
            finished
        });
        debug!(job = %id, run = %run_name, state = %finished.state, "Run finished");
        finished.result
    }

    /// Block until every submitted job is terminal
    ///
    /// `timeout` bounds the wait between two completions: the deadline is
    /// re-armed each time a job finishes. On expiry `false` is returned, and
    /// with `abort_on_timeout` every running simulator is killed first.
    /// Returns `true` when all jobs finished and none failed or timed out.
    /// Failures count over the runner's lifetime, so once any job has failed
    /// every later call returns `false`; use [`SimRunner::completed`] for
    /// per-batch results.
    #[instrument(skip(self))]
    pub fn wait_completion(&self, timeout: Option<Duration>, abort_on_timeout: bool) -> bool {
        let mut finished = self.shared.finished.subscribe();
        let all_done = self.runtime.block_on(async {
            loop {
                if self.shared.lock_stats().active() == 0 {
                    return true;
                }
                let changed = finished.changed();
                let progressed = match timeout {
                    None => changed.await.is_ok(),
                    Some(limit) => {
                        matches!(tokio::time::timeout(limit, changed).await, Ok(Ok(())))
                    }
                };
                if !progressed {
                    return false;
                }
            }
        });

        if !all_done {
            warn!(active = self.shared.lock_stats().active(), "Timed out waiting for simulations");
            if abort_on_timeout {
                self.shared.abort.send_replace(true);
                self.runtime.block_on(async {
                    while self.shared.lock_stats().active() > 0 {
                        if finished.changed().await.is_err() {
                            break;
                        }
                    }
                });
                self.shared.abort.send_replace(false);
            }
            return false;
        }

        let stats = self.stats();
        stats.failed == 0 && stats.timed_out == 0
    }

    /// Iterate over job outcomes as jobs finish
    ///
    /// Every outcome is yielded once. The iterator ends when no job is
    /// outstanding and every outcome has been taken.
    pub fn completed(&mut self) -> Completed<'_, T> {
        Completed { runner: self }
    }

    pub fn stats(&self) -> RunnerStats {
        *self.shared.lock_stats()
    }

    pub fn run_count(&self) -> usize {
        self.stats().submitted
    }

    pub fn ok_count(&self) -> usize {
        self.stats().succeeded
    }

    pub fn fail_count(&self) -> usize {
        let stats = self.stats();
        stats.failed + stats.timed_out
    }
}

impl<T> fmt::Debug for SimRunner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimRunner")
            .field("simulator", &self.shared.simulator)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Iterator returned by [`SimRunner::completed`]
pub struct Completed<'a, T> {
    runner: &'a mut SimRunner<T>,
}

impl<T: Send + 'static> Iterator for Completed<'_, T> {
    type Item = JobOutcome<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let runner = &mut *self.runner;
        loop {
            // sampled before draining: outcomes are queued before a job stops being active
            let idle = runner.shared.lock_stats().active() == 0;
            if let Ok(outcome) = runner.outcomes.try_recv() {
                return Some(outcome);
            }
            if idle {
                return None;
            }
            let polled = runner
                .runtime
                .block_on(tokio::time::timeout(POLL_INTERVAL, runner.outcomes.recv()));
            if let Ok(Some(outcome)) = polled {
                return Some(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.parallel_sims, 4);
        assert_eq!(config.timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.callback_mode, CallbackMode::Inline);
        assert_eq!(RunnerConfig::default().parallel_sims(0).parallel_sims, 1);
    }

    #[test]
    fn test_stats_active() {
        let stats = RunnerStats {
            submitted: 5,
            succeeded: 2,
            failed: 1,
            timed_out: 1,
            running: 1,
            peak_running: 2,
        };
        assert_eq!(stats.finished(), 4);
        assert_eq!(stats.active(), 1);
    }
}
