//! Errors reported at the engine boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the job engine.
#[derive(Debug, Error)]
pub enum JobError {
    /// Engine construction and spawning need an ambient tokio runtime.
    #[error("no tokio runtime is available")]
    NoRuntime,

    /// A requested working directory is missing or not traversable.
    #[error("not a traversable directory: {0}")]
    BadWorkingDir(PathBuf),

    /// Spawning the shell failed.
    #[error("failed to launch `{shell}`: {source}")]
    Spawn {
        /// Shell binary that refused to start.
        shell: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// A worker could not be started for a task or operation.
    #[error("failed to start background worker: {0}")]
    WorkerSpawn(String),

    /// Plain I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
