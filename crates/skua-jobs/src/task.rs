//! Bootstrap plumbing for in-process tasks and operations.
//!
//! Worker functions run on the blocking pool with the owning job installed
//! in a thread-local slot, so helpers deep inside the function can report
//! errors into that job's buffer instead of raising a dialog from the wrong
//! thread.

use std::cell::RefCell;
use std::sync::Arc;

use crate::job::BgJob;

thread_local! {
    static CURRENT_JOB: RefCell<Option<Arc<BgJob>>> = const { RefCell::new(None) };
}

/// Installs a job as the thread's current job for the guard's lifetime.
///
/// Blocking-pool threads are reused, so the slot must never outlive the
/// function it was installed for; the guard clears it on every exit path.
pub(crate) struct CurrentJobGuard;

impl CurrentJobGuard {
    pub(crate) fn install(job: Arc<BgJob>) -> Self {
        CURRENT_JOB.with(|slot| *slot.borrow_mut() = Some(job));
        Self
    }
}

impl Drop for CurrentJobGuard {
    fn drop(&mut self) {
        CURRENT_JOB.with(|slot| *slot.borrow_mut() = None);
    }
}

/// The job the calling thread is working for, when it is a worker thread.
pub(crate) fn current_job() -> Option<Arc<BgJob>> {
    CURRENT_JOB.with(|slot| slot.borrow().clone())
}

/// Marks the job finished when the bootstrap unwinds, whatever the reason.
///
/// A worker function that panics still leaves its job finished, with exit
/// code 1, instead of stuck running forever.
pub(crate) struct FinishGuard {
    job: Arc<BgJob>,
    exit_code: i32,
}

impl FinishGuard {
    pub(crate) fn new(job: Arc<BgJob>) -> Self {
        Self { job, exit_code: 1 }
    }

    /// The worker function ran to completion.
    pub(crate) fn completed(&mut self) {
        self.exit_code = 0;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.job.mark_finished(self.exit_code);
    }
}
