//! Completion callback execution
//!
//! `Inline` callbacks run on the runner's blocking pool. `Isolated` callbacks
//! are shipped over a channel to a dedicated worker thread that owns nothing
//! but the request it is handed, and the result comes back on a oneshot.

use super::job::Callback;
use super::simulator::OutputFiles;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Where completion callbacks run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallbackMode {
    #[default]
    Inline,
    Isolated,
}

struct CallbackRequest<T> {
    callback: Callback<T>,
    files: OutputFiles,
    reply: oneshot::Sender<Option<T>>,
}

fn call_guarded<T>(callback: &Callback<T>, files: &OutputFiles) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(files))) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(raw = %files.raw.display(), "Completion callback panicked");
            None
        }
    }
}

pub(crate) struct CallbackWorker<T> {
    tx: Option<mpsc::UnboundedSender<CallbackRequest<T>>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> CallbackWorker<T> {
    fn spawn() -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackRequest<T>>();
        let thread = thread::Builder::new()
            .name("spicebatch-callback".into())
            .spawn(move || {
                while let Some(req) = rx.blocking_recv() {
                    let output = call_guarded(&req.callback, &req.files);
                    // the job may have been dropped during shutdown
                    let _ = req.reply.send(output);
                }
                debug!("Callback worker stopped");
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }
}

impl<T> Drop for CallbackWorker<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Callback worker thread panicked");
            }
        }
    }
}

pub(crate) enum CallbackDispatch<T> {
    Inline,
    Isolated(CallbackWorker<T>),
}

impl<T: Send + 'static> CallbackDispatch<T> {
    pub(crate) fn new(mode: CallbackMode) -> std::io::Result<Self> {
        Ok(match mode {
            CallbackMode::Inline => CallbackDispatch::Inline,
            CallbackMode::Isolated => CallbackDispatch::Isolated(CallbackWorker::spawn()?),
        })
    }

    /// Run `callback` on `files`; `None` when it panicked or could not be delivered
    pub(crate) async fn run(&self, callback: Callback<T>, files: OutputFiles) -> Option<T> {
        match self {
            CallbackDispatch::Inline => {
                tokio::task::spawn_blocking(move || call_guarded(&callback, &files))
                    .await
                    .ok()
                    .flatten()
            }
            CallbackDispatch::Isolated(worker) => {
                let tx = worker.tx.as_ref()?;
                let (reply, rx) = oneshot::channel();
                tx.send(CallbackRequest {
                    callback,
                    files,
                    reply,
                })
                .ok()?;
                rx.await.ok().flatten()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    fn files() -> OutputFiles {
        OutputFiles::for_netlist(Path::new("x.net"))
    }

    #[tokio::test]
    async fn test_inline_callback() {
        let dispatch = CallbackDispatch::new(CallbackMode::Inline).unwrap();
        let cb: Callback<usize> = Arc::new(|f: &OutputFiles| f.raw.as_os_str().len());
        assert_eq!(dispatch.run(cb, files()).await, Some(5));
    }

    #[tokio::test]
    async fn test_isolated_callback_panic_is_contained() {
        let dispatch = CallbackDispatch::new(CallbackMode::Isolated).unwrap();
        let bad: Callback<u8> = Arc::new(|_: &OutputFiles| -> u8 { panic!("boom") });
        assert_eq!(dispatch.run(bad, files()).await, None);

        let good: Callback<u8> = Arc::new(|_: &OutputFiles| -> u8 { 7 });
        assert_eq!(dispatch.run(good, files()).await, Some(7));
    }
}
