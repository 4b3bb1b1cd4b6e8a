//! Collaborator interfaces the engine calls back into.
//!
//! The engine never draws anything itself: prompts, the job bar, the
//! `v:jobcount` variable and repaint scheduling all live behind [`UiHooks`].
//! Hooks are invoked from the foreground thread only, with the exception of
//! [`UiHooks::job_bar_changed`], which progress updates may fire from a
//! worker.

use std::sync::Arc;

use crate::op::BgOp;

/// UI-side collaborators of the job engine.
pub trait UiHooks: Send + Sync {
    /// Modal prompt showing captured error output of a job. Returns `true`
    /// when the user asked to skip this job's errors from now on.
    fn prompt_error(&self, title: &str, text: &str) -> bool;

    /// Non-prompting error display for foreground failures.
    fn error_msg(&self, title: &str, text: &str);

    /// A job with a progress record appeared on the job bar.
    fn job_bar_add(&self, op: Arc<BgOp>);

    /// The job left the job bar.
    fn job_bar_remove(&self, op: &BgOp);

    /// Displayed progress or description of a job on the bar changed.
    fn job_bar_changed(&self, op: &BgOp);

    /// The number of running menu-visible jobs changed.
    fn set_job_count(&self, count: usize);

    /// Ask the UI to repaint status widgets when convenient.
    fn request_redraw(&self);

    /// Optional command-line expansion applied by
    /// [`crate::JobManager::run_external`] when
    /// [`crate::ShellConfig::fast_run`] is set. `None` leaves the command
    /// line as typed.
    fn fast_run_complete(&self, cmd: &str) -> Option<String> {
        let _ = cmd;
        None
    }
}

/// Cooperative cancellation source consumed by blocking helpers.
pub trait Cancellation: Send + Sync {
    /// True once the surrounding operation should stop.
    fn requested(&self) -> bool;
}

/// Cancellation source that never triggers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCancellation;

impl Cancellation for NoCancellation {
    fn requested(&self) -> bool {
        false
    }
}

/// Hook implementation that swallows everything.
///
/// Used by tests and headless embedders that want the engine without a UI.
#[derive(Debug, Default)]
pub struct NullUi;

impl UiHooks for NullUi {
    fn prompt_error(&self, _title: &str, _text: &str) -> bool {
        false
    }

    fn error_msg(&self, _title: &str, _text: &str) {}

    fn job_bar_add(&self, _op: Arc<BgOp>) {}

    fn job_bar_remove(&self, _op: &BgOp) {}

    fn job_bar_changed(&self, _op: &BgOp) {}

    fn set_job_count(&self, _count: usize) {}

    fn request_redraw(&self) {}
}
