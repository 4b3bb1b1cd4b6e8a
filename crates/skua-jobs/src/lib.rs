//! skua-jobs: the background job engine of the skua file manager.
//!
//! This crate provides:
//!
//! - **Registry**: every live job in one foreground-owned list, swept by
//!   [`JobManager::check`] from the UI loop
//! - **Spawn layer**: external commands through `<shell> <flag> <cmd>` with
//!   precise stdio wiring (pipes, merged streams, null device)
//! - **Error drain**: a single worker task reading every command's error
//!   stream until EOF
//! - **Tasks & operations**: in-process workers with progress records and
//!   cooperative cancellation
//! - **Job controls**: cancel, terminate, wait, refcounting, exit callbacks
//!
//! Three kinds of work are tracked uniformly: external applications
//! ([`JobKind::Command`]), auxiliary in-process work such as directory size
//! scans ([`JobKind::Task`]) and important in-process work such as copying
//! files ([`JobKind::Operation`]). All jobs can be listed in the jobs menu;
//! operations additionally appear on the job bar.
//!
//! The UI is reached only through [`UiHooks`]; nothing here draws or blocks
//! the foreground beyond the documented prompt and wait points.

pub mod config;
mod drain;
pub mod error;
pub mod hooks;
pub mod job;
pub mod manager;
pub mod op;
mod spawn;
mod task;

pub use config::ShellConfig;
pub use error::JobError;
pub use hooks::{Cancellation, NoCancellation, NullUi, UiHooks};
pub use job::{BgJob, ExitCallback};
pub use manager::JobManager;
pub use op::{BgOp, OpState};

// Data types re-exported from skua-types.
pub use skua_types::{JobFlags, JobInfo, JobKind, ShellRequester};
