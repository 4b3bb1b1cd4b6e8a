//! Platform spawn layer for external commands.
//!
//! Wires the child's stdio exactly as requested — piped, merged or bound to
//! the null device — and detaches the child from the controlling terminal
//! unless it must stay interactive. Everything runs through
//! `<shell> <flag> <cmd>`.

use std::io::{Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use skua_types::{JobFlags, ShellRequester};

use crate::config::ShellConfig;
use crate::error::JobError;

/// Everything the registry needs from a fresh child.
#[derive(Debug)]
pub(crate) struct SpawnedCommand {
    pub(crate) child: Child,
    pub(crate) pid: Option<u32>,
    /// Separate error stream for the drain worker; absent when merged.
    pub(crate) stderr: Option<ChildStderr>,
    /// Writable stdin end when `supply_input` was set.
    pub(crate) stdin: Option<ChildStdin>,
    /// Readable stdout end when `capture_output` was set.
    pub(crate) stdout: Option<ChildStdout>,
}

/// Starts `<shell> <flag> <cmd>` with the stdio wiring requested by
/// `flags`.
///
/// `pwd`, when given, must be a traversable directory; it is validated
/// before the OS is asked to do anything. Pipe ends the caller never sees
/// die with the failed spawn.
pub(crate) fn launch_external(
    cfg: &ShellConfig,
    cmd: &str,
    pwd: Option<&Path>,
    flags: JobFlags,
    by: ShellRequester,
) -> Result<SpawnedCommand, JobError> {
    let merge_streams = flags.capture_output && flags.merge_streams;

    if let Some(dir) = pwd {
        if !is_traversable_dir(dir) {
            return Err(JobError::BadWorkingDir(dir.to_path_buf()));
        }
    }

    let mut command = Command::new(&cfg.shell);
    command.arg(cfg.flag_for(by)).arg(cmd);

    if let Some(dir) = pwd {
        command.current_dir(dir);
    }

    // Stdio the caller did not ask for goes to the null device so children
    // never inherit UI descriptors.
    command.stdin(if flags.supply_input {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(if flags.capture_output {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stderr(if merge_streams {
        Stdio::null()
    } else {
        Stdio::piped()
    });

    #[cfg(unix)]
    configure_unix(&mut command, flags.keep_in_fg, merge_streams);

    let mut child = command.spawn().map_err(|source| JobError::Spawn {
        shell: cfg.shell.clone(),
        source,
    })?;

    let stderr = child.stderr.take();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let pid = child.id();

    Ok(SpawnedCommand {
        child,
        pid,
        stderr,
        stdin,
        stdout,
    })
}

/// Bare spawn-with-pipes helper: runs `cmd` through the shell with stdout
/// and stderr piped as requested and no job registered. The caller owns the
/// child and its streams completely.
///
/// A supplied input file is one the caller has just finished writing; it is
/// rewound here so the child reads it from the top.
pub(crate) fn run_and_capture(
    cfg: &ShellConfig,
    cmd: &str,
    user_sh: bool,
    input: Option<std::fs::File>,
    want_out: bool,
    want_err: bool,
) -> Result<Child, JobError> {
    let by = if user_sh {
        ShellRequester::User
    } else {
        ShellRequester::App
    };

    let mut command = Command::new(&cfg.shell);
    command.arg(cfg.flag_for(by)).arg(cmd);

    command.stdin(match input {
        Some(mut file) => {
            file.seek(SeekFrom::Start(0))?;
            Stdio::from(file)
        }
        None => Stdio::inherit(),
    });
    command.stdout(if want_out {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    command.stderr(if want_err {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });

    command.spawn().map_err(|source| JobError::Spawn {
        shell: cfg.shell.clone(),
        source,
    })
}

/// Puts the child into its own session unless it must stay in the
/// foreground, and merges stderr onto stdout when requested.
///
/// The hook runs between fork and exec, after stdio is already in place;
/// only async-signal-safe calls are allowed there.
#[cfg(unix)]
fn configure_unix(command: &mut Command, keep_in_fg: bool, merge_streams: bool) {
    unsafe {
        command.as_std_mut().pre_exec(move || {
            if !keep_in_fg && libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if merge_streams && libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// A directory the child could actually start in: exists, is a directory
/// and carries the execute bit.
fn is_traversable_dir(dir: &Path) -> bool {
    #[cfg(unix)]
    {
        dir.is_dir() && nix::unistd::access(dir, nix::unistd::AccessFlags::X_OK).is_ok()
    }
    #[cfg(not(unix))]
    {
        dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_and_non_directory_paths() {
        assert!(!is_traversable_dir(Path::new("/definitely/not/there")));
        assert!(is_traversable_dir(Path::new("/")));

        let file = std::env::temp_dir().join(format!("skua-not-a-dir-{}", std::process::id()));
        std::fs::write(&file, b"x").expect("failed to create scratch file");
        assert!(!is_traversable_dir(&file));
        let _ = std::fs::remove_file(&file);
    }

    #[tokio::test]
    async fn plain_command_gets_an_error_stream_only() {
        let spawned = launch_external(
            &ShellConfig::default(),
            "true",
            None,
            JobFlags::none(),
            ShellRequester::App,
        )
        .expect("spawn failed");

        assert!(spawned.pid.is_some());
        assert!(spawned.stderr.is_some());
        assert!(spawned.stdin.is_none());
        assert!(spawned.stdout.is_none());
    }

    #[tokio::test]
    async fn merged_streams_leave_no_error_stream() {
        let flags = JobFlags {
            capture_output: true,
            merge_streams: true,
            ..JobFlags::none()
        };
        let spawned = launch_external(
            &ShellConfig::default(),
            "true",
            None,
            flags,
            ShellRequester::App,
        )
        .expect("spawn failed");

        assert!(spawned.stderr.is_none());
        assert!(spawned.stdout.is_some());
    }

    #[tokio::test]
    async fn bad_working_directory_is_rejected_before_spawning() {
        let err = launch_external(
            &ShellConfig::default(),
            "true",
            Some(Path::new("/definitely/not/there")),
            JobFlags::none(),
            ShellRequester::App,
        )
        .expect_err("spawn should have been refused");

        assert!(matches!(err, JobError::BadWorkingDir(_)));
    }

    #[tokio::test]
    async fn unknown_shell_reports_spawn_failure() {
        let cfg = ShellConfig {
            shell: "/definitely/not/a/shell".to_string(),
            ..ShellConfig::default()
        };
        let err = launch_external(&cfg, "true", None, JobFlags::none(), ShellRequester::App)
            .expect_err("spawn should have failed");

        assert!(matches!(err, JobError::Spawn { .. }));
    }
}
