//! Error types for benchbox operations.
//!
//! The split follows the backend's contract: configuration and registration
//! failures are typed errors the caller must handle, while everything that
//! can go wrong during a run (timeout, OOM kill, engine hiccups during
//! teardown) is encoded in the returned execution result and never raised.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating a backend configuration.
///
/// All of these are construction-time failures: fatal to the backend
/// instance being built and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("\"image\" must be a non-empty string")]
    EmptyImage,

    #[error("\"{option}\" must be an absolute path, got '{path}'")]
    RelativePath { option: &'static str, path: PathBuf },

    #[error("\"program_path\" ('{0}') has no file name")]
    InvalidProgramPath(PathBuf),

    #[error("'{0}' is not a valid username")]
    InvalidUser(String),

    #[error("could not find the exit-stats shim at '{0}'")]
    ShimNotFound(PathBuf),

    #[error("failed to register the exit-stats shim: {0}")]
    ShimRegistration(#[from] RegistrationError),

    #[error("extra mount host path '{0}' must be absolute")]
    MountHostPathNotAbsolute(PathBuf),

    #[error("container mount point '{0}' must be absolute")]
    MountTargetNotAbsolute(PathBuf),

    #[error("container mount point '{target}' cannot be based in '{work_dir}'")]
    MountInsideWorkDir { target: PathBuf, work_dir: PathBuf },

    #[error("container mount point '{0}' is declared more than once")]
    DuplicateMountTarget(PathBuf),

    #[error("could not find docker image with name '{0}'")]
    ImageNotFound(String),

    #[error("found {count} docker images tagged '{image}', expected exactly one")]
    AmbiguousImage { image: String, count: usize },

    #[error("failed to connect to the Docker daemon: {0}")]
    DaemonUnavailable(String),

    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// Errors raised when registering files with the backend.
///
/// Fatal to the call, not to the backend: a failed registration leaves the
/// existing mount table untouched and the instance usable.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("path '{0}' must be absolute")]
    RelativePath(PathBuf),

    #[error("path '{0}' has no file name")]
    NoFileName(PathBuf),

    #[error("file '{0}' does not exist")]
    FileNotFound(PathBuf),

    #[error("a file named '{0}' is already mapped into the sandbox")]
    DuplicateFileName(String),

    #[error("sandbox path '{0}' is already in use by an extra mount")]
    TargetInUse(PathBuf),

    #[error("'{0}' was never registered with add_file()")]
    NotRegistered(PathBuf),
}

/// Errors raised while driving an execution.
///
/// These cover the few paths where `run()` cannot produce a result at all
/// (no daemon, container creation refused) and the tool-existence probe.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to connect to the Docker daemon: {0}")]
    DaemonUnavailable(String),

    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("an execution is already in progress on this backend")]
    AlreadyRunning,

    #[error("path '{0}' must be absolute")]
    RelativePath(PathBuf),

    #[error("tool '{tool}' does not exist in the image (ls exited with {exit_code})")]
    ToolMissing { tool: PathBuf, exit_code: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading the exit-stats side channel.
///
/// The execution controller logs and swallows these; they only surface as
/// absent CPU-time fields in the result.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stats document: {0}")]
    Json(#[from] serde_json::Error),
}
