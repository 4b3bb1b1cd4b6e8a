//! The job registry and its foreground sweep.
//!
//! One [`JobManager`] tracks every live job. The registry itself belongs to
//! the foreground: jobs are registered, swept and unlinked only from the
//! thread driving [`JobManager::check`], while workers touch nothing but
//! per-job shared state under its locks.
//!
//! ```text
//!   UI loop ──check()──▶ JobManager ──(job, stderr)──▶ drain worker
//!      │                     │
//!      │                     └──spawn_blocking──▶ task / operation workers
//!      └── prompt_error, job bar, v:jobcount hooks
//! ```

use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;

use skua_types::{JobFlags, JobInfo, JobKind, ShellRequester};

use crate::config::ShellConfig;
use crate::drain::{self, DrainEntry, ERR_CHUNK};
use crate::error::JobError;
use crate::hooks::{Cancellation, UiHooks};
use crate::job::BgJob;
use crate::op::BgOp;
use crate::spawn::{self, SpawnedCommand};
use crate::task::{current_job, CurrentJobGuard, FinishGuard};

/// Title of the prompt showing captured error output.
const ERROR_PROMPT_TITLE: &str = "Background Process Error";

/// The background job engine.
///
/// Owns the registry of live jobs and the error-drain worker. Created once
/// per process; the UI keeps it in an `Arc` and drives [`JobManager::check`]
/// from its event loop.
pub struct JobManager {
    cfg: ShellConfig,
    hooks: Arc<dyn UiHooks>,
    runtime: Handle,

    /// Registry of live jobs, newest first. Foreground only.
    jobs: Mutex<Vec<Arc<BgJob>>>,
    /// Non-reentrancy guard for [`JobManager::check`].
    checking: AtomicBool,
    /// Last job count pushed to the UI.
    job_count: AtomicI64,

    /// Hand-off of freshly spawned commands to the drain worker.
    err_handoff: UnboundedSender<DrainEntry>,
    /// Nudges the drain worker to refresh its list.
    drain_wake: Arc<Notify>,
}

impl JobManager {
    /// Starts the engine: captures the ambient tokio runtime and launches
    /// the error-drain worker.
    pub fn new(cfg: ShellConfig, hooks: Arc<dyn UiHooks>) -> Result<Arc<Self>, JobError> {
        let runtime = Handle::try_current().map_err(|_| JobError::NoRuntime)?;

        let (err_handoff, err_rx) = mpsc::unbounded_channel();
        let drain_wake = Arc::new(Notify::new());
        // The worker lives for as long as the sender side does; its handle
        // is not needed.
        let _drain = runtime.spawn(drain::drain_error_streams(err_rx, Arc::clone(&drain_wake)));

        Ok(Arc::new(Self {
            cfg,
            hooks,
            runtime,
            jobs: Mutex::new(Vec::new()),
            checking: AtomicBool::new(false),
            job_count: AtomicI64::new(0),
            err_handoff,
            drain_wake,
        }))
    }

    fn jobs_guard(&self) -> MutexGuard<'_, Vec<Arc<BgJob>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new job and, when it has an error stream, hands that
    /// stream to the drain worker.
    fn add_job(
        &self,
        kind: JobKind,
        cmd: &str,
        pid: Option<u32>,
        err_stream: Option<ChildStderr>,
        with_bg_op: bool,
    ) -> Arc<BgJob> {
        let job = Arc::new(BgJob::new(
            kind,
            cmd,
            pid,
            err_stream.is_some(),
            with_bg_op,
            &self.hooks,
        ));

        if let Some(stream) = err_stream {
            job.begin_erroring();
            // The worker outlives every job registration; it only exits
            // when this sender is dropped.
            let _ = self
                .err_handoff
                .send(DrainEntry::new(Arc::clone(&job), stream));
        }

        self.jobs_guard().insert(0, Arc::clone(&job));
        job
    }

    /// Foreground maintenance sweep: polls job status, surfaces captured
    /// errors, runs exit callbacks and unlinks finished jobs.
    ///
    /// Driven periodically by the UI loop. Not re-entrant; a nested call
    /// (say, from inside the error prompt) is a no-op.
    pub fn check(&self, show_errors: bool) {
        if self.checking.swap(true, Ordering::Acquire) {
            return;
        }

        self.maybe_wake_drain();

        // Detach the list for the duration of the walk; the prompt below
        // can spin a nested event loop.
        let head = mem::take(&mut *self.jobs_guard());

        let mut survivors = Vec::with_capacity(head.len());
        let mut active = 0usize;

        for job in head {
            if show_errors {
                self.show_job_errors(&job);
            }

            job.update_status();

            let (running, can_remove) = job.sweep_state();
            if running && job.in_menu.load(Ordering::Relaxed) {
                active += 1;
            }

            if !running {
                if job.on_job_bar.load(Ordering::Relaxed) {
                    if let Some(op) = job.op() {
                        self.hooks.job_bar_remove(op);
                    }
                    job.on_job_bar.store(false, Ordering::Relaxed);
                }
                if let Some(cb) = job.take_exit_cb() {
                    cb(job.as_ref());
                }
            }

            if !can_remove {
                survivors.push(job);
            }
        }

        {
            let mut jobs = self.jobs_guard();
            debug_assert!(jobs.is_empty(), "job list shouldn't be used by anyone");
            jobs.extend(survivors);
        }

        self.update_job_count(active);

        self.checking.store(false, Ordering::Release);
    }

    /// Surfaces freshly captured error output through the modal prompt,
    /// repeating while the prompt itself lets more output accumulate.
    fn show_job_errors(&self, job: &Arc<BgJob>) {
        loop {
            let Some(fresh) = job.take_fresh_errors() else {
                break;
            };
            if job.skip_errors.load(Ordering::Relaxed) {
                continue;
            }
            let text = String::from_utf8_lossy(&fresh);
            if self.hooks.prompt_error(ERROR_PROMPT_TITLE, &text) {
                job.skip_errors.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Wakes the drain worker, but only when it has something to look at.
    fn maybe_wake_drain(&self) {
        let erroring = self.jobs_guard().iter().any(|job| job.is_erroring());
        if erroring {
            self.drain_wake.notify_one();
        }
    }

    /// Pushes the number of running menu-visible jobs to the UI when it
    /// changed since the last sweep.
    fn update_job_count(&self, count: usize) {
        let previous = self.job_count.swap(count as i64, Ordering::Relaxed);
        if previous != count as i64 {
            self.hooks.set_job_count(count);
            self.hooks.request_redraw();
        }
    }

    /// Fire-and-forget external command.
    pub fn run_external(
        &self,
        cmd: &str,
        keep_in_fg: bool,
        skip_errors: bool,
        by: ShellRequester,
    ) -> Result<(), JobError> {
        self.run_external_impl(cmd, keep_in_fg, skip_errors, by, false)
            .map(|_| ())
    }

    /// Like [`JobManager::run_external`], but pipes the child's stdin and
    /// returns the writable end to the caller.
    pub fn run_external_with_input(
        &self,
        cmd: &str,
        keep_in_fg: bool,
        skip_errors: bool,
        by: ShellRequester,
    ) -> Result<ChildStdin, JobError> {
        let input = self.run_external_impl(cmd, keep_in_fg, skip_errors, by, true)?;
        input.ok_or_else(|| {
            JobError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child stdin pipe was not created",
            ))
        })
    }

    fn run_external_impl(
        &self,
        cmd: &str,
        keep_in_fg: bool,
        skip_errors: bool,
        by: ShellRequester,
        supply_input: bool,
    ) -> Result<Option<ChildStdin>, JobError> {
        let command = if self.cfg.fast_run {
            self.hooks
                .fast_run_complete(cmd)
                .unwrap_or_else(|| cmd.to_string())
        } else {
            cmd.to_string()
        };

        let flags = JobFlags {
            keep_in_fg,
            supply_input,
            ..JobFlags::none()
        };
        let job = self.launch(&command, None, flags, by)?;
        job.skip_errors.store(skip_errors, Ordering::Relaxed);
        Ok(job.take_input())
    }

    /// Starts an external command and hands back a refcounted job handle.
    ///
    /// Error prompting is off for such jobs; the caller inspects the
    /// captured output itself. The handle must be released with
    /// [`BgJob::decref`] for the job to be reaped after it finishes.
    pub fn run_external_job(
        &self,
        cmd: &str,
        flags: JobFlags,
        descr: Option<&str>,
        pwd: Option<&Path>,
    ) -> Result<Arc<BgJob>, JobError> {
        let job = self.launch(cmd, pwd, flags, ShellRequester::App)?;
        job.incref();
        job.skip_errors.store(true, Ordering::Relaxed);

        if flags.job_bar_visible {
            // Description goes in first so the bar's first repaint already
            // shows it.
            if let (Some(descr), Some(op)) = (descr, job.op()) {
                op.set_descr(descr);
            }
            self.place_on_job_bar(&job);
        }

        job.in_menu.store(flags.menu_visible, Ordering::Relaxed);
        Ok(job)
    }

    /// Spawns an external command and registers it.
    fn launch(
        &self,
        cmd: &str,
        pwd: Option<&Path>,
        flags: JobFlags,
        by: ShellRequester,
    ) -> Result<Arc<BgJob>, JobError> {
        let _rt = self.runtime.enter();
        let SpawnedCommand {
            child,
            pid,
            stderr,
            stdin,
            stdout,
        } = spawn::launch_external(&self.cfg, cmd, pwd, flags, by)?;

        let job = self.add_job(JobKind::Command, cmd, pid, stderr, flags.job_bar_visible);
        job.install_process(child, stdin, stdout);
        Ok(job)
    }

    fn place_on_job_bar(&self, job: &Arc<BgJob>) {
        if let Some(op) = job.op() {
            debug_assert!(
                !job.on_job_bar.load(Ordering::Relaxed),
                "job is already on the bar"
            );
            self.hooks.job_bar_add(Arc::clone(op));
            job.on_job_bar.store(true, Ordering::Relaxed);
        }
    }

    /// Runs `func` on a worker thread as an auxiliary task
    /// (`important == false`) or an operation shown on the job bar
    /// (`important == true`).
    ///
    /// `func` receives the job's progress record and is expected to poll
    /// its cancellation flag. The job finishes with exit code 0 when `func`
    /// returns, and with exit code 1 when the bootstrap cannot run it to
    /// completion.
    pub fn execute<F>(
        &self,
        descr: &str,
        op_descr: &str,
        total: i32,
        important: bool,
        func: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(&BgOp) + Send + 'static,
    {
        let kind = if important {
            JobKind::Operation
        } else {
            JobKind::Task
        };
        let job = self.add_job(kind, descr, None, None, true);

        let Some(op) = job.op().cloned() else {
            job.mark_finished(1);
            return Err(JobError::WorkerSpawn(
                "job is missing its progress record".to_string(),
            ));
        };

        {
            let mut state = op.lock();
            state.descr = Some(op_descr.to_string());
            state.total = total;
        }

        if kind == JobKind::Operation {
            self.place_on_job_bar(&job);
        }

        let worker_job = Arc::clone(&job);
        self.runtime.spawn_blocking(move || {
            let mut finish = FinishGuard::new(Arc::clone(&worker_job));
            let _slot = CurrentJobGuard::install(Arc::clone(&worker_job));
            func(op.as_ref());
            finish.completed();
        });

        Ok(())
    }

    /// Buffers an error message into the job the calling worker belongs
    /// to, or shows it immediately when called from the foreground.
    pub fn report_error(&self, title: &str, text: &str) {
        match current_job() {
            Some(job) => job.append_error(text.as_bytes()),
            None => self.hooks.error_msg(title, text),
        }
    }

    /// Runs `cmd` through the shell and collects everything it writes to
    /// stderr, without registering a job.
    ///
    /// Any error output is surfaced through [`JobManager::report_error`]
    /// and reported as -1; clean runs return the exit code. `cancellation`
    /// is polled while the command runs and asks it to stop with SIGINT.
    pub async fn run_and_wait_for_errors(
        &self,
        cmd: &str,
        cancellation: &dyn Cancellation,
    ) -> Result<i32, JobError> {
        let mut child = {
            let _rt = self.runtime.enter();
            let mut command = Command::new(&self.cfg.shell);
            command.arg("-c").arg(cmd);
            command.stdin(std::process::Stdio::null());
            command.stderr(std::process::Stdio::piped());
            command.spawn().map_err(|source| JobError::Spawn {
                shell: self.cfg.shell.clone(),
                source,
            })?
        };

        let mut collected = Vec::new();
        if let Some(mut stream) = child.stderr.take() {
            use tokio::io::AsyncReadExt;

            let mut buf = [0u8; ERR_CHUNK];
            loop {
                if cancellation.requested() {
                    // Ask the child to stop, then keep draining so it can
                    // exit. Re-sent every round until the stream closes.
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGINT,
                        );
                    }
                }

                match tokio::time::timeout(Duration::from_millis(250), stream.read(&mut buf))
                    .await
                {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => {} // timeout; poll cancellation again
                }
            }
        }

        let status = child.wait().await?;

        if !collected.is_empty() {
            let text = String::from_utf8_lossy(&collected);
            let text: String = text
                .lines()
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            self.report_error(ERROR_PROMPT_TITLE, &text);
            return Ok(-1);
        }

        Ok(status.code().unwrap_or(-1))
    }

    /// Spawns `cmd` with stdout/stderr piped for the caller, without
    /// registering a job. The caller owns the child and its streams.
    ///
    /// `input` is a file the caller has just finished writing; it is
    /// rewound and becomes the child's stdin.
    pub fn run_and_capture(
        &self,
        cmd: &str,
        user_sh: bool,
        input: Option<std::fs::File>,
        want_out: bool,
        want_err: bool,
    ) -> Result<Child, JobError> {
        let _rt = self.runtime.enter();
        spawn::run_and_capture(&self.cfg, cmd, user_sh, input, want_out, want_err)
    }

    /// Waits (bounded) for the drain worker to finish reading a stopped
    /// job's error stream. Returns `false` when the stream is still live at
    /// the deadline, which indicates either heavy load or a stuck pipe.
    pub fn wait_errors(&self, job: &BgJob) -> bool {
        const SLEEP: Duration = Duration::from_micros(50);
        const MAX_WAIT: Duration = Duration::from_millis(50);

        if !job.has_err_stream() || job.is_running() {
            return true;
        }

        // Active polling with a short sleep instead of a condition variable
        // per job; this path is rare and the cap keeps the UI responsive.
        let rounds = (MAX_WAIT.as_micros() / SLEEP.as_micros()) as u32;
        for _ in 0..rounds {
            if !job.is_erroring() {
                return true;
            }
            self.drain_wake.notify_one();
            std::thread::sleep(SLEEP);
        }

        !job.is_erroring()
    }

    /// Whether any in-process work is still running; with `important_only`
    /// only operations count.
    pub fn has_active_jobs(&self, important_only: bool) -> bool {
        let jobs = self.jobs_guard().clone();
        jobs.iter().any(|job| {
            let relevant = if important_only {
                job.kind() == JobKind::Operation
            } else {
                job.kind() != JobKind::Command
            };
            relevant && job.is_running()
        })
    }

    /// Snapshot of every registered job for the jobs menu.
    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs_guard().iter().map(|job| job.info()).collect()
    }

    /// Handles of every registered job, newest first.
    ///
    /// The jobs menu uses this to cancel or inspect entries; a caller that
    /// keeps a handle across sweeps must pin it with [`BgJob::incref`].
    pub fn jobs(&self) -> Vec<Arc<BgJob>> {
        self.jobs_guard().clone()
    }

    /// Number of registered jobs; mostly useful to tests and assertions.
    pub fn job_count(&self) -> usize {
        self.jobs_guard().len()
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.job_count())
            .finish()
    }
}
