//! Periodic background workers
//!
//! A worker sleeps on a shutdown channel between runs, so `stop()` wakes it
//! immediately instead of waiting out the interval. Workers hold only `Weak`
//! references to what they service and exit once it is gone.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::Result;

/// What a periodic job tells its worker after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    /// The serviced object is gone
    Exit,
}

pub struct BackgroundTask {
    name: &'static str,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `job` every `interval` until stopped or the job returns `Exit`.
    /// Job errors are logged and the loop carries on.
    pub fn spawn_periodic<F>(name: &'static str, interval: Duration, mut job: F) -> Result<Self>
    where
        F: FnMut() -> Result<TaskControl> + Send + 'static,
    {
        let (tx, rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("minikv-{}", name))
            .spawn(move || {
                debug!(task = name, "Background task started");
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match job() {
                            Ok(TaskControl::Continue) => {}
                            Ok(TaskControl::Exit) => break,
                            Err(e) => error!(task = name, error = %e, "Background task failed"),
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(task = name, "Background task stopped");
            })?;

        Ok(Self {
            name,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the worker and wait for it. Safe to call twice.
    pub fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            // A job running on this very thread cannot join itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(task = self.name, "Background task panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
