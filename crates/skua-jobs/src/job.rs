//! A single tracked unit of background work.
//!
//! A job is shared between the foreground (which registers, sweeps and
//! unlinks it), the error-drain worker (which appends to its error buffers
//! and holds one `use_count` reference) and, for in-process jobs, the worker
//! running the actual function. Shared state is split across three small
//! locks that guard disjoint fields and never nest: status, errors and the
//! optional progress record.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::process::{Child, ChildStdin, ChildStdout};

use skua_types::{JobInfo, JobKind};

use crate::hooks::UiHooks;
use crate::op::BgOp;

/// Exit code recorded before the real one is known.
pub(crate) const EXIT_CODE_UNSET: i32 = -1;

/// Callback the sweep runs once after the job stops, before unlinking it.
pub type ExitCallback = Box<dyn FnOnce(&BgJob) + Send>;

/// Status words shared across the foreground and the workers.
#[derive(Debug)]
struct Status {
    /// The job has not finished yet.
    running: bool,
    /// Exit code, meaningful only when `!running`.
    exit_code: i32,
    /// Holders beyond the registry; the job may only be unlinked at zero.
    use_count: i32,
    /// The drain worker still references the job's error stream.
    erroring: bool,
}

/// Captured error-stream output.
#[derive(Debug, Default)]
struct ErrorBuf {
    /// Everything the command ever wrote to its error stream.
    full: Vec<u8>,
    /// Bytes not yet shown; the sweep takes the buffer out wholesale.
    fresh: Option<Vec<u8>>,
}

/// A tracked unit of background work: an external command, an auxiliary
/// task or an important operation.
pub struct BgJob {
    kind: JobKind,
    cmd: String,
    pid: Option<u32>,
    has_err_stream: bool,

    /// Listed in the jobs menu. Foreground only.
    pub(crate) in_menu: AtomicBool,
    /// Currently shown on the job bar. Foreground only.
    pub(crate) on_job_bar: AtomicBool,
    /// The user asked to stop prompting about this job's errors.
    pub(crate) skip_errors: AtomicBool,
    /// Soft cancel was delivered to an external command.
    cancelled: AtomicBool,

    /// Run once by the sweep after the job stops.
    pub(crate) exit_cb: Mutex<Option<ExitCallback>>,

    status: Mutex<Status>,
    errors: Mutex<ErrorBuf>,

    proc: Mutex<Option<Child>>,
    input: Mutex<Option<ChildStdin>>,
    output: Mutex<Option<ChildStdout>>,

    op: Option<Arc<BgOp>>,
}

impl BgJob {
    pub(crate) fn new(
        kind: JobKind,
        cmd: &str,
        pid: Option<u32>,
        has_err_stream: bool,
        with_bg_op: bool,
        hooks: &Arc<dyn UiHooks>,
    ) -> Self {
        Self {
            kind,
            cmd: cmd.to_string(),
            pid,
            has_err_stream,
            in_menu: AtomicBool::new(true),
            on_job_bar: AtomicBool::new(false),
            skip_errors: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            exit_cb: Mutex::new(None),
            status: Mutex::new(Status {
                running: true,
                exit_code: EXIT_CODE_UNSET,
                use_count: 0,
                erroring: false,
            }),
            errors: Mutex::new(ErrorBuf::default()),
            proc: Mutex::new(None),
            input: Mutex::new(None),
            output: Mutex::new(None),
            op: with_bg_op.then(|| Arc::new(BgOp::new(Arc::clone(hooks)))),
        }
    }

    /// What kind of job this is.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Command line or description the job was created with.
    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// OS process ID for external commands.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Progress record; present for tasks, operations and bar-visible
    /// commands.
    pub fn op(&self) -> Option<&Arc<BgOp>> {
        self.op.as_ref()
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn errors_buf(&self) -> MutexGuard<'_, ErrorBuf> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn proc_guard(&self) -> MutexGuard<'_, Option<Child>> {
        self.proc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn input_guard(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output_guard(&self) -> MutexGuard<'_, Option<ChildStdout>> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the spawned child and the pipe ends the caller asked for.
    pub(crate) fn install_process(
        &self,
        child: Child,
        input: Option<ChildStdin>,
        output: Option<ChildStdout>,
    ) {
        *self.proc_guard() = Some(child);
        *self.input_guard() = input;
        *self.output_guard() = output;
    }

    /// Whether the job is still running, polling the OS for external
    /// commands.
    pub fn is_running(&self) -> bool {
        if !self.status().running {
            return false;
        }
        self.update_status();
        self.status().running
    }

    /// Whether the job finished with a recorded exit code.
    ///
    /// Note the shape of this predicate: it holds for every normally-exited
    /// job, while deaths by signal record no code and read as not killed.
    pub fn was_killed(&self) -> bool {
        let status = self.status();
        !status.running && status.exit_code >= 0
    }

    /// Exit code of a stopped job; -1 while running or when the child died
    /// to a signal.
    pub fn exit_code(&self) -> i32 {
        self.status().exit_code
    }

    pub(crate) fn mark_finished(&self, exit_code: i32) {
        let mut status = self.status();
        status.running = false;
        status.exit_code = exit_code;
    }

    /// Poll the OS for the exit status of an external command.
    ///
    /// Jobs without a process (tasks and operations) finish only through
    /// their worker bootstrap and are not touched here.
    pub(crate) fn update_status(&self) {
        if !self.status().running {
            return;
        }

        let mut proc = self.proc_guard();
        let finished = match proc.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(exit_code_of(&status)),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(pid = ?self.pid, "failed to poll child status: {err}");
                    None
                }
            },
            None => None,
        };

        if let Some(code) = finished {
            *proc = None;
            drop(proc);
            self.mark_finished(code);
        }
    }

    /// Politely ask the job to stop.
    ///
    /// External commands get SIGINT; everything else has its progress
    /// record's cancellation flag raised for the worker to honor. Returns
    /// whether this call newly requested cancellation.
    pub fn cancel(&self) -> bool {
        if self.kind != JobKind::Command {
            return self.op.as_ref().map(|op| op.cancel()).unwrap_or(false);
        }

        let was = self.cancelled.load(Ordering::Relaxed);
        #[cfg(unix)]
        match self.signal(nix::sys::signal::Signal::SIGINT) {
            Ok(()) => self.cancelled.store(true, Ordering::Relaxed),
            Err(err) => {
                tracing::warn!(pid = ?self.pid, "failed to send SIGINT: {err}");
            }
        }
        !was
    }

    /// Whether cancellation has been requested for this job.
    pub fn cancelled(&self) -> bool {
        if self.kind != JobKind::Command {
            return self.op.as_ref().map(|op| op.cancelled()).unwrap_or(false);
        }
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Forcefully kill a running external command. Never waits; the sweep
    /// picks up the death on its next pass.
    pub fn terminate(&self) {
        if self.kind != JobKind::Command || !self.is_running() {
            return;
        }

        #[cfg(unix)]
        if let Err(err) = self.signal(nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(pid = ?self.pid, "failed to send SIGKILL: {err}");
        }
    }

    #[cfg(unix)]
    fn signal(&self, sig: nix::sys::signal::Signal) -> nix::Result<()> {
        let pid = self.pid.ok_or(nix::errno::Errno::ESRCH)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
    }

    /// Block until an external command exits and record its exit code.
    ///
    /// Streams owned by this side are closed first so the child cannot stay
    /// blocked reading its stdin or writing its stdout.
    pub async fn wait(&self) -> io::Result<i32> {
        debug_assert_eq!(
            self.kind,
            JobKind::Command,
            "only external commands can be waited for"
        );

        if !self.is_running() {
            return Ok(self.exit_code());
        }

        *self.input_guard() = None;
        *self.output_guard() = None;

        let child = self.proc_guard().take();
        let Some(mut child) = child else {
            return Ok(self.exit_code());
        };

        let status = child.wait().await?;
        self.mark_finished(exit_code_of(&status));
        Ok(self.exit_code())
    }

    /// Take an extra reference that keeps the job registered after it
    /// stops. Must be paired with exactly one [`BgJob::decref`].
    pub fn incref(&self) {
        self.status().use_count += 1;
    }

    /// Release a reference taken with [`BgJob::incref`].
    pub fn decref(&self) {
        let mut status = self.status();
        status.use_count -= 1;
        debug_assert!(status.use_count >= 0, "excessive decref call");
    }

    /// Install a callback the sweep runs once after the job stops.
    pub fn set_exit_cb<F>(&self, cb: F)
    where
        F: FnOnce(&BgJob) + Send + 'static,
    {
        *self.exit_cb.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(cb));
    }

    pub(crate) fn take_exit_cb(&self) -> Option<ExitCallback> {
        self.exit_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Complete error-stream output captured so far.
    pub fn errors(&self) -> Vec<u8> {
        self.errors_buf().full.clone()
    }

    fn has_errors(&self) -> bool {
        !self.errors_buf().full.is_empty()
    }

    /// Append a chunk read from the error stream. Drain worker only.
    pub(crate) fn append_error(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut buf = self.errors_buf();
        buf.full.extend_from_slice(chunk);
        buf.fresh
            .get_or_insert_with(Vec::new)
            .extend_from_slice(chunk);
    }

    /// Take the not-yet-shown part of the error output, if any.
    pub(crate) fn take_fresh_errors(&self) -> Option<Vec<u8>> {
        self.errors_buf().fresh.take()
    }

    /// Whether the job was spawned with a separate error stream.
    pub(crate) fn has_err_stream(&self) -> bool {
        self.has_err_stream
    }

    /// Whether the drain worker still holds the job's error stream.
    pub(crate) fn is_erroring(&self) -> bool {
        self.status().erroring
    }

    /// Record the drain worker's hold before handing the stream over.
    pub(crate) fn begin_erroring(&self) {
        let mut status = self.status();
        status.erroring = true;
        status.use_count += 1;
    }

    /// Drop the drain worker's hold once the stream is exhausted.
    pub(crate) fn release_drain_hold(&self) {
        let mut status = self.status();
        status.erroring = false;
        status.use_count -= 1;
        debug_assert!(status.use_count >= 0, "drain hold released twice");
    }

    /// Claim the writable stdin handle created with `supply_input`.
    pub fn take_input(&self) -> Option<ChildStdin> {
        self.input_guard().take()
    }

    /// Claim the readable stdout handle created with `capture_output`.
    pub fn take_output(&self) -> Option<ChildStdout> {
        self.output_guard().take()
    }

    /// Running/removable pair read in one locked section by the sweep.
    pub(crate) fn sweep_state(&self) -> (bool, bool) {
        let status = self.status();
        (status.running, !status.running && status.use_count == 0)
    }

    /// Snapshot for the jobs menu.
    pub fn info(&self) -> JobInfo {
        let (running, exit_code) = {
            let status = self.status();
            (status.running, status.exit_code)
        };
        JobInfo {
            kind: self.kind,
            command: self.cmd.clone(),
            running,
            exit_code,
            pid: self.pid,
            menu_visible: self.in_menu.load(Ordering::Relaxed),
            has_errors: self.has_errors(),
        }
    }
}

impl fmt::Debug for BgJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BgJob")
            .field("kind", &self.kind)
            .field("cmd", &self.cmd)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Maps an OS exit status onto the job's exit code. Deaths by signal carry
/// no code and map to the unset sentinel.
fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_CODE_UNSET)
}
