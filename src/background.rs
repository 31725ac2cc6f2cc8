//! Detached best-effort work.
//!
//! Some outward calls need no answer (stopping the container of a deleted
//! agent, for one). They run on their own thread so the town keeps serving;
//! failures are logged. `drain` joins whatever is still running.

use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

#[derive(Default)]
pub struct BackgroundTasks {
    running: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.reap();
        let spawned = thread::Builder::new()
            .name(format!("bg-{name}"))
            .spawn(move || {
                if let Err(e) = task() {
                    warn!(task = name, error = %format!("{e:#}"), "background task failed");
                }
            });
        match spawned {
            Ok(handle) => self.running.push((name, handle)),
            Err(e) => warn!(task = name, error = %e, "could not spawn background task"),
        }
    }

    /// Drops handles of tasks that already finished.
    pub fn reap(&mut self) {
        self.running.retain(|(_, handle)| !handle.is_finished());
    }

    pub fn len(&mut self) -> usize {
        self.reap();
        self.running.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Blocks until every task has finished.
    pub fn drain(&mut self) {
        for (name, handle) in self.running.drain(..) {
            if handle.join().is_err() {
                warn!(task = name, "background task panicked");
            } else {
                debug!(task = name, "background task joined");
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drain_waits_for_tasks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tasks = BackgroundTasks::new();
        for _ in 0..3 {
            let hits = hits.clone();
            tasks.spawn("count", move || {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tasks.drain();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[test]
    fn failures_do_not_propagate() {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn("fail", || anyhow::bail!("runtime unreachable"));
        tasks.drain();
    }
}
