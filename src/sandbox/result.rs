//! Outcome record for one sandboxed execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a single sandboxed run terminated.
///
/// One of these is produced per `run()` call and returned by value. Runtime
/// failures are encoded here rather than raised: a timeout shows up as
/// [`out_of_time`](Self::out_of_time) with an absent exit code, an OOM kill
/// as [`out_of_memory`](Self::out_of_memory), and a container the engine
/// lost track of as an absent exit code with both flags clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code of the program. Absent when the run timed out or the exit
    /// could not be observed.
    pub exit_code: Option<i64>,
    /// Wall-clock time from container start to teardown.
    pub wall_time: Duration,
    /// The run exceeded its wall-clock limit.
    pub out_of_time: bool,
    /// The kernel OOM-killed the container.
    pub out_of_memory: bool,
    /// User-mode CPU seconds reported by the exit-stats shim, when enabled.
    pub user_cpu_time: Option<f64>,
    /// Kernel-mode CPU seconds reported by the exit-stats shim, when enabled.
    pub sys_cpu_time: Option<f64>,
}

impl ExecutionResult {
    /// True when the program ran to completion within its limits.
    pub fn completed(&self) -> bool {
        self.exit_code.is_some() && !self.out_of_time
    }
}
