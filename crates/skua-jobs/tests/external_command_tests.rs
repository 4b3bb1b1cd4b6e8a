//! Integration tests for external command execution.
//!
//! These tests verify the spawn layer end to end:
//! - stderr capture through the drain worker
//! - merged streams bypassing the drain worker
//! - stdin supply and stdout capture
//! - working directory validation
//! - exit code propagation, including deaths by signal

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use skua_jobs::{
    BgOp, JobFlags, JobManager, NullUi, ShellConfig, ShellRequester, UiHooks,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn engine() -> Arc<JobManager> {
    JobManager::new(ShellConfig::default(), Arc::new(NullUi)).expect("engine should start")
}

fn drive(bg: &JobManager, show_errors: bool, timeout: Duration, done: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        bg.check(show_errors);
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn scratch_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("skua-{}-{}", name, std::process::id()))
}

/// Hook double recording error prompts and dialogs.
#[derive(Default)]
struct PromptRecorder {
    prompts: Mutex<Vec<String>>,
    dialogs: Mutex<Vec<String>>,
}

impl UiHooks for PromptRecorder {
    fn prompt_error(&self, _title: &str, text: &str) -> bool {
        self.prompts.lock().unwrap().push(text.to_string());
        false
    }

    fn error_msg(&self, _title: &str, text: &str) {
        self.dialogs.lock().unwrap().push(text.to_string());
    }
    fn job_bar_add(&self, _op: Arc<BgOp>) {}
    fn job_bar_remove(&self, _op: &BgOp) {}
    fn job_bar_changed(&self, _op: &BgOp) {}
    fn set_job_count(&self, _count: usize) {}
    fn request_redraw(&self) {}
}

// ============================================================================
// Error stream capture
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_is_captured_in_order_with_the_exit_code() {
    let bg = engine();
    let job = bg
        .run_external_job(
            "printf hello 1>&2; exit 3",
            JobFlags::none(),
            Some("t"),
            None,
        )
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());
    assert!(bg.wait_errors(&job), "drain worker should reach EOF quickly");

    assert_eq!(job.errors(), b"hello");
    assert_eq!(job.exit_code(), 3);
    assert!(job.was_killed(), "recorded exit code makes this read as killed");

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiple_stderr_writes_concatenate_in_order() {
    let bg = engine();
    let job = bg
        .run_external_job(
            "printf one 1>&2; printf two 1>&2; printf three 1>&2",
            JobFlags::none(),
            None,
            None,
        )
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());
    assert!(bg.wait_errors(&job));

    assert_eq!(job.errors(), b"onetwothree");

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prompts_show_captured_errors_unless_skipped() {
    let ui = Arc::new(PromptRecorder::default());
    let bg = JobManager::new(ShellConfig::default(), ui.clone()).unwrap();

    bg.run_external("printf loud 1>&2", false, false, ShellRequester::App)
        .expect("spawn failed");
    drive(&bg, true, Duration::from_secs(2), || bg.job_count() == 0);
    let shown = ui.prompts.lock().unwrap().join("");
    assert!(shown.contains("loud"), "expected a prompt with 'loud': {shown:?}");

    bg.run_external("printf quiet 1>&2", false, true, ShellRequester::App)
        .expect("spawn failed");
    drive(&bg, true, Duration::from_secs(2), || bg.job_count() == 0);
    let shown = ui.prompts.lock().unwrap().join("");
    assert!(
        !shown.contains("quiet"),
        "skip_errors job must not prompt: {shown:?}"
    );
}

// ============================================================================
// Merged streams
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merged_streams_share_the_output_pipe() {
    let bg = engine();
    let flags = JobFlags {
        capture_output: true,
        merge_streams: true,
        ..JobFlags::none()
    };
    let job = bg
        .run_external_job("echo out; echo err 1>&2", flags, None, None)
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());

    let mut output = String::new();
    let mut stdout = job.take_output().expect("stdout was captured");
    stdout
        .read_to_string(&mut output)
        .await
        .expect("read failed");
    assert!(output.contains("out"), "stdout line missing: {output:?}");
    assert!(output.contains("err"), "stderr line missing: {output:?}");

    // No separate error stream exists, so nothing was drained.
    assert!(job.errors().is_empty());
    assert!(bg.wait_errors(&job), "no error stream to wait for");

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

// ============================================================================
// Stdin and stdout wiring
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supplied_input_reaches_the_child() {
    let bg = engine();
    let marker = scratch_file("input");
    let cmd = format!("cat > {}", marker.display());

    let mut stdin = bg
        .run_external_with_input(&cmd, false, true, ShellRequester::App)
        .expect("spawn failed");
    stdin.write_all(b"ping").await.expect("write failed");
    stdin.shutdown().await.expect("shutdown failed");
    drop(stdin);

    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);

    let contents = std::fs::read(&marker).expect("child never wrote the file");
    assert_eq!(contents, b"ping");
    let _ = std::fs::remove_file(&marker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn captured_output_reflects_the_working_directory() {
    let bg = engine();
    let dir = std::env::temp_dir()
        .canonicalize()
        .expect("temp dir exists");

    let flags = JobFlags {
        capture_output: true,
        ..JobFlags::none()
    };
    let job = bg
        .run_external_job("pwd", flags, None, Some(dir.as_path()))
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());

    let mut output = String::new();
    let mut stdout = job.take_output().expect("stdout was captured");
    stdout
        .read_to_string(&mut output)
        .await
        .expect("read failed");
    assert_eq!(output.trim(), dir.to_string_lossy());

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

// ============================================================================
// Spawn validation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_working_directory_registers_nothing() {
    let bg = engine();
    let err = bg
        .run_external_job(
            "true",
            JobFlags::none(),
            None,
            Some(std::path::Path::new("/definitely/not/there")),
        )
        .expect_err("spawn should have been refused");

    assert!(matches!(err, skua_jobs::JobError::BadWorkingDir(_)));
    assert_eq!(bg.job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_shell_registers_nothing() {
    let cfg = ShellConfig {
        shell: "/definitely/not/a/shell".to_string(),
        ..ShellConfig::default()
    };
    let bg = JobManager::new(cfg, Arc::new(NullUi)).unwrap();

    let err = bg
        .run_external("true", false, true, ShellRequester::App)
        .expect_err("spawn should have failed");
    assert!(matches!(err, skua_jobs::JobError::Spawn { .. }));
    assert_eq!(bg.job_count(), 0);
}

// ============================================================================
// Exit codes
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn specific_exit_codes_are_preserved() {
    let bg = engine();
    let job = bg
        .run_external_job("exit 42", JobFlags::none(), None, None)
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());
    assert_eq!(job.exit_code(), 42);

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_blocks_until_exit_and_returns_the_code() -> anyhow::Result<()> {
    let bg = engine();
    let job = bg
        .run_external_job("sleep 0.1; exit 5", JobFlags::none(), None, None)?;

    assert_eq!(job.wait().await?, 5);
    assert!(!job.is_running());

    // Waiting again just reports the recorded code.
    assert_eq!(job.wait().await?, 5);

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn death_by_signal_leaves_the_exit_code_undetermined() {
    let bg = engine();
    let job = bg
        .run_external_job("kill -9 $$", JobFlags::none(), None, None)
        .expect("spawn failed");

    drive(&bg, false, Duration::from_secs(2), || !job.is_running());
    assert_eq!(job.exit_code(), -1);
    assert!(!job.was_killed(), "signal deaths record no exit code");

    job.decref();
    drive(&bg, false, Duration::from_secs(2), || bg.job_count() == 0);
}

// ============================================================================
// Blocking helpers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_errors_returns_the_exit_code_on_clean_runs() -> anyhow::Result<()> {
    let bg = engine();
    let code = bg
        .run_and_wait_for_errors("exit 7", &skua_jobs::NoCancellation)
        .await?;
    assert_eq!(code, 7);
    assert_eq!(bg.job_count(), 0, "helper must not register a job");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_errors_surfaces_stderr_output() -> anyhow::Result<()> {
    let ui = Arc::new(PromptRecorder::default());
    let bg = JobManager::new(ShellConfig::default(), ui.clone())?;

    let code = bg
        .run_and_wait_for_errors("printf broken 1>&2; exit 0", &skua_jobs::NoCancellation)
        .await?;
    assert_eq!(code, -1, "stderr output is reported as failure");
    assert_eq!(ui.dialogs.lock().unwrap().as_slice(), ["broken"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_and_capture_pipes_both_streams() -> anyhow::Result<()> {
    let bg = engine();
    let mut child = bg.run_and_capture("echo out; echo err 1>&2", false, None, true, true)?;

    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("stdout piped")
        .read_to_string(&mut out)
        .await?;
    let mut err = String::new();
    child
        .stderr
        .take()
        .expect("stderr piped")
        .read_to_string(&mut err)
        .await?;

    assert_eq!(out.trim(), "out");
    assert_eq!(err.trim(), "err");
    assert!(child.wait().await?.success());
    assert_eq!(bg.job_count(), 0, "helper must not register a job");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_and_capture_rewinds_the_input_file() -> anyhow::Result<()> {
    use std::io::Write;

    let bg = engine();
    let path = scratch_file("capture-input");
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(b"from the top")?;
    // The cursor sits at EOF now; the helper hands the file over rewound.

    let mut child = bg.run_and_capture("cat", false, Some(file), true, false)?;

    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("stdout piped")
        .read_to_string(&mut out)
        .await?;
    assert_eq!(out, "from the top");
    assert!(child.wait().await?.success());

    let _ = std::fs::remove_file(&path);
    Ok(())
}

// ============================================================================
// Cancellation of blocking helpers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_errors_honors_cancellation() -> anyhow::Result<()> {
    struct AfterFirstPoll(std::sync::atomic::AtomicBool);

    impl skua_jobs::Cancellation for AfterFirstPoll {
        fn requested(&self) -> bool {
            self.0.swap(true, Ordering::Relaxed)
        }
    }

    let bg = engine();
    let started = Instant::now();
    // Without cancellation this would block for a minute.
    let _ = bg
        .run_and_wait_for_errors(
            "sleep 60",
            &AfterFirstPoll(std::sync::atomic::AtomicBool::new(false)),
        )
        .await?;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "cancellation did not interrupt the helper"
    );
    Ok(())
}
