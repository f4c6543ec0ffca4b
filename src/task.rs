use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum number of loop iterations a per-sequence worker may run between
/// cancellation checks.
pub const CANCEL_CHECK_INTERVAL: usize = 128;

/// The caller-facing execution handle: abort polling, suspension, and
/// progress/status reporting. Implementations must be cheap to call from
/// worker threads.
pub trait TaskMonitor: Send + Sync {
    fn is_aborted(&self) -> bool {
        false
    }

    /// Blocks while execution is paused by the caller. The default does
    /// nothing.
    fn check_suspend(&self) {}

    fn set_progress(&self, _done: usize, _total: usize) {}

    fn set_status_message(&self, _text: &str) {}
}

/// Monitor for unattended runs: never aborts, discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl TaskMonitor for NullMonitor {}

/// A shareable monitor with an abort latch and observable progress, for
/// callers that drive execution from another thread.
#[derive(Debug, Default)]
pub struct TaskHandle {
    aborted: AtomicBool,
    progress: Mutex<(usize, usize)>,
    status: Mutex<String>,
}

impl TaskHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> (usize, usize) {
        *lock_unpoisoned(&self.progress)
    }

    pub fn status(&self) -> String {
        lock_unpoisoned(&self.status).clone()
    }
}

impl TaskMonitor for TaskHandle {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn set_progress(&self, done: usize, total: usize) {
        *lock_unpoisoned(&self.progress) = (done, total);
    }

    fn set_status_message(&self, text: &str) {
        *lock_unpoisoned(&self.status) = text.to_string();
    }
}

/// Cancellation latch shared by all workers of one driver invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Locks a mutex, recovering the data if another worker panicked while
/// holding it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
