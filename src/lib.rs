//! benchbox: Docker-backed sandboxed execution for benchmarking harnesses.
//!
//! Runs a caller-supplied program inside a resource-constrained, isolated
//! container and returns a structured record of how the run terminated:
//! exit code, wall time, CPU time, and out-of-memory/out-of-time flags.
//! Built for harnesses that need many independent, repeatable,
//! resource-bounded executions of untrusted or instrumented binaries.
//!
//! The public contract is small: construct a [`DockerBackend`] once with an
//! immutable [`BackendConfig`], register side files with
//! [`DockerBackend::add_file`], then call [`DockerBackend::run`] per
//! execution and read the returned [`ExecutionResult`]. Construction and
//! registration failures are typed errors; everything that goes wrong during
//! a run is encoded in the result.

pub mod error;
pub mod sandbox;

pub use error::{ConfigError, RegistrationError, SandboxError, StatsError};
pub use sandbox::{
    BackendConfig, ContextToken, DockerBackend, DockerClientPool, ExecutionResult, MountEntry,
    PoolMode, ResourceLimits, UserSpec,
};
