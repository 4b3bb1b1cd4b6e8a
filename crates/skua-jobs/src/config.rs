//! Shell configuration consumed by the spawn layer.

use skua_types::ShellRequester;

/// How external commands reach the operating system.
///
/// The engine never interprets command lines itself; everything is delegated
/// to `<shell> <flag> <cmd>`.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell binary, e.g. `/bin/sh`.
    pub shell: String,
    /// Flag the user's shell expects in front of a command line.
    pub shell_cmd_flag: String,
    /// Expand user commands through [`crate::UiHooks::fast_run_complete`]
    /// before spawning.
    pub fast_run: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            shell_cmd_flag: "-c".to_string(),
            fast_run: false,
        }
    }
}

impl ShellConfig {
    /// Flag to put in front of the command line for the given requester.
    ///
    /// Application-generated commands always use the portable `-c` so they
    /// keep working whatever shell the user configured.
    pub(crate) fn flag_for(&self, by: ShellRequester) -> &str {
        match by {
            ShellRequester::User => &self.shell_cmd_flag,
            ShellRequester::App => "-c",
        }
    }
}
