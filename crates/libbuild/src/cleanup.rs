//! Process wide list of scoped resources released on every exit path: normal
//! return, error propagation and SIGINT/SIGTERM.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::signal::{SigSet, Signal};

type CleanupFn = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to block termination signals: {0}")]
    SignalMask(nix::Error),
    #[error("failed to spawn signal handler thread: {0}")]
    Spawn(std::io::Error),
}

/// Token returned by [`CleanupList::push`] to release or forget a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupHandle(u64);

#[derive(Clone, Default)]
pub struct CleanupList {
    items: Arc<Mutex<Vec<(u64, String, CleanupFn)>>>,
    next: Arc<AtomicU64>,
}

impl std::fmt::Debug for CleanupList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupList")
            .field("pending", &self.labels())
            .finish()
    }
}

impl CleanupList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, label: impl Into<String>, f: F) -> CleanupHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let label = label.into();
        tracing::trace!(id, %label, "registered cleanup");
        self.lock().push((id, label, Box::new(f)));
        CleanupHandle(id)
    }

    /// Runs one resource's cleanup now.
    pub fn release(&self, handle: CleanupHandle) {
        if let Some(f) = self.take(handle) {
            f();
        }
    }

    /// Drops a registration without running it, for resources handed off
    /// to a new owner.
    pub fn forget(&self, handle: CleanupHandle) {
        let _ = self.take(handle);
    }

    /// Runs every pending cleanup, most recent first.
    pub fn run_all(&self) {
        loop {
            let next = self.lock().pop();
            let Some((id, label, f)) = next else {
                break;
            };
            tracing::debug!(id, %label, "running cleanup");
            f();
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.lock().iter().map(|(_, label, _)| label.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Blocks SIGINT and SIGTERM in the calling thread, which threads spawned
    /// later inherit, and waits for them on a dedicated thread. On delivery
    /// every pending cleanup runs and the process exits with status 1. Must be
    /// called before other threads are started.
    pub fn install_signal_handler(&self) -> Result<(), CleanupError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().map_err(CleanupError::SignalMask)?;

        let list = self.clone();
        thread::Builder::new()
            .name("cleanup-signals".into())
            .spawn(move || match mask.wait() {
                Ok(signal) => {
                    tracing::warn!("received {signal}, cleaning up");
                    list.run_all();
                    std::process::exit(1);
                }
                Err(err) => tracing::error!("sigwait failed: {err}"),
            })
            .map_err(CleanupError::Spawn)?;
        Ok(())
    }

    fn take(&self, handle: CleanupHandle) -> Option<CleanupFn> {
        let mut items = self.lock();
        let pos = items.iter().position(|(id, _, _)| *id == handle.0)?;
        Some(items.remove(pos).2)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, String, CleanupFn)>> {
        // a panicking cleanup must not keep the others from running
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, CleanupList) {
        (Arc::new(Mutex::new(Vec::new())), CleanupList::new())
    }

    #[test]
    fn test_run_all_in_reverse_order() {
        let (log, list) = recorder();
        for name in ["bundle", "cache staging", "session file"] {
            let log = log.clone();
            list.push(name, move || log.lock().unwrap().push(name));
        }
        list.run_all();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["session file", "cache staging", "bundle"]
        );
        assert!(list.is_empty());
    }

    #[test]
    fn test_release_and_forget() {
        let (log, list) = recorder();
        let l1 = log.clone();
        let first = list.push("first", move || l1.lock().unwrap().push("first"));
        let l2 = log.clone();
        let second = list.push("second", move || l2.lock().unwrap().push("second"));

        list.release(first);
        list.forget(second);
        // releasing twice is harmless
        list.release(first);
        list.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_labels() {
        let list = CleanupList::new();
        list.push("a", || {});
        list.push("b", || {});
        assert_eq!(list.labels(), vec!["a".to_owned(), "b".to_owned()]);
    }
}
