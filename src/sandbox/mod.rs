//! Sandboxed execution backend.
//!
//! This module turns abstract run requests (command line, environment,
//! time/memory/stack limits, extra files) into isolated Docker executions
//! and guarantees cleanup on every exit path.
//!
//! # Architecture
//!
//! Each run moves through this lifecycle:
//! ```text
//! Idle → Created → Started → {Completed | TimedOut | EngineError}
//!      → Killing → LogsCaptured → Inspected → Removed → Idle
//! ```
//! The teardown half of the diagram runs unconditionally: completion,
//! timeout, engine error, and explicit kill all funnel into the same
//! sequence, serialized by a per-backend lock.
//!
//! # Example
//!
//! ```ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use benchbox::{BackendConfig, ContextToken, DockerBackend, DockerClientPool, PoolMode, ResourceLimits};
//!
//! let pool = Arc::new(DockerClientPool::new(PoolMode::Reuse));
//! let config = BackendConfig::new("alpine:latest", "/path/to/prog.bc", "/tmp/run-0")
//!     .with_limits(ResourceLimits::new(300, 2048));
//!
//! let backend = DockerBackend::new(pool, ContextToken::new(0), config).await?;
//! let result = backend
//!     .run(&["sh".into(), "-c".into(), "true".into()], "/tmp/run-0.log".as_ref(), &HashMap::new())
//!     .await?;
//! assert_eq!(result.exit_code, Some(0));
//! ```

pub mod backend;
pub mod config;
pub mod limits;
pub mod mounts;
pub mod pool;
pub mod result;
pub mod stats;

pub use backend::DockerBackend;
pub use config::{BackendConfig, UserSpec, DEFAULT_IMAGE_WORK_DIR};
pub use limits::ResourceLimits;
pub use mounts::{MountEntry, MountTable, FILE_MOUNT_DIR};
pub use pool::{ContextToken, DockerClientPool, PoolMode};
pub use result::ExecutionResult;
pub use stats::STATS_LOG_FILE_NAME;
