use rayon::prelude::*;
use std::sync::Mutex;

use crate::error::EngineError;
use crate::task::{lock_unpoisoned, CancelToken, TaskMonitor, CANCEL_CHECK_INTERVAL};

/// Lifecycle of one transform invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Resolving,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    started: usize,
    completed: usize,
    total: usize,
}

/// Per-worker view of the driver: cancellation polling for long loops.
pub struct WorkerContext<'a> {
    cancel: &'a CancelToken,
    monitor: &'a dyn TaskMonitor,
}

impl WorkerContext<'_> {
    /// Cheap periodic check. Call once per loop iteration with the running
    /// iteration count; the actual poll happens every
    /// `CANCEL_CHECK_INTERVAL` iterations.
    pub fn checkpoint(&self, iteration: usize) -> Result<(), EngineError> {
        if iteration % CANCEL_CHECK_INTERVAL == 0 {
            self.check_now()?;
        }
        Ok(())
    }

    pub fn check_now(&self) -> Result<(), EngineError> {
        self.monitor.check_suspend();
        if self.cancel.is_cancelled() || self.monitor.is_aborted() {
            return Err(EngineError::Interrupted);
        }
        Ok(())
    }
}

/// Runs one task per sequence over a bounded worker pool.
///
/// Each task owns a disjoint target slot, so workers share nothing mutable
/// except the progress counters behind one mutex. The first failing task
/// cancels all siblings and its error is re-raised, wrapped with the
/// operation name; cancellation surfaces as `Interrupted` and is never
/// wrapped. A completed-count mismatch with no captured failure is reported
/// as an internal error.
pub fn run_sequence_tasks<S, F>(
    operation: &str,
    slots: Vec<(String, S)>,
    monitor: &dyn TaskMonitor,
    work: F,
) -> Result<Vec<(String, S)>, EngineError>
where
    S: Send,
    F: Fn(&str, &mut S, &WorkerContext) -> Result<(), EngineError> + Sync,
{
    let total = slots.len();
    let cancel = CancelToken::new();
    let progress = Mutex::new(Progress {
        total,
        ..Progress::default()
    });
    let failure: Mutex<Option<EngineError>> = Mutex::new(None);

    let mut slots = slots;
    slots.par_iter_mut().for_each(|(name, slot)| {
        if cancel.is_cancelled() || monitor.is_aborted() {
            cancel.cancel();
            return;
        }
        monitor.check_suspend();
        {
            let mut p = lock_unpoisoned(&progress);
            p.started += 1;
            monitor.set_status_message(&format!("Executing {operation}: {name}"));
        }
        let ctx = WorkerContext {
            cancel: &cancel,
            monitor,
        };
        match work(name, slot, &ctx) {
            Ok(()) => {
                let mut p = lock_unpoisoned(&progress);
                p.completed += 1;
                monitor.set_progress(p.completed, p.total);
            }
            Err(EngineError::Interrupted) => {
                cancel.cancel();
            }
            Err(err) => {
                cancel.cancel();
                let mut first = lock_unpoisoned(&failure);
                if first.is_none() {
                    *first = Some(err);
                }
            }
        }
    });

    let first = lock_unpoisoned(&failure).take();
    if let Some(err) = first {
        return Err(EngineError::Task {
            operation: operation.to_string(),
            source: Box::new(err),
        });
    }
    if cancel.is_cancelled() || monitor.is_aborted() {
        return Err(EngineError::Interrupted);
    }
    let completed = lock_unpoisoned(&progress).completed;
    if completed != total {
        log::error!(
            "operation {operation}: {completed} of {total} sequence tasks registered completion"
        );
        return Err(EngineError::Invariant(format!(
            "unexpected failure during operation {operation}"
        )));
    }
    Ok(slots)
}
