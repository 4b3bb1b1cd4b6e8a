//! Job identification and description types.

/// What kind of work a background job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// An external application run through the shell.
    Command,
    /// An in-process worker doing auxiliary work, like counting directory
    /// sizes. Not shown on the job bar.
    Task,
    /// An in-process worker doing important work, like copying or deleting
    /// files. Shown on the job bar.
    Operation,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Command => write!(f, "command"),
            JobKind::Task => write!(f, "task"),
            JobKind::Operation => write!(f, "operation"),
        }
    }
}

/// Which party asked for a command to be run through the shell.
///
/// Picks the flag inserted in front of the command line: the user's shell
/// gets its configured flag, application-generated commands always get the
/// portable `-c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellRequester {
    /// The command line was typed by the user.
    User,
    /// The command line was produced by the application itself.
    App,
}

/// Stdio wiring and visibility switches for launching an external command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// Keep the child attached to the controlling terminal, for interactive
    /// children. Everything else is detached into its own session.
    pub keep_in_fg: bool,
    /// Pipe the child's stdin and hand the writable end to the caller.
    pub supply_input: bool,
    /// Pipe the child's stdout and keep the readable end on the job.
    pub capture_output: bool,
    /// Duplicate the child's stderr onto its stdout pipe. Only meaningful
    /// together with `capture_output`; the job then has no error stream.
    pub merge_streams: bool,
    /// Show the job on the progress bar.
    pub job_bar_visible: bool,
    /// List the job in the jobs menu.
    pub menu_visible: bool,
}

impl JobFlags {
    /// No redirections, detached, invisible.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Snapshot of a single job for listing in the jobs menu.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// What kind of job this is.
    pub kind: JobKind,
    /// Human-readable command line or description.
    pub command: String,
    /// Whether the job was still running when the snapshot was taken.
    pub running: bool,
    /// Exit code of a stopped job; -1 while running or undetermined.
    pub exit_code: i32,
    /// OS process ID for external commands.
    pub pid: Option<u32>,
    /// Whether the jobs menu should list this job.
    pub menu_visible: bool,
    /// Whether the job's error stream produced anything so far.
    pub has_errors: bool,
}
