//! Abstract resource limits and their translation to engine constraints.

use std::time::Duration;

use bollard::models::ResourcesUlimits;
use serde::{Deserialize, Serialize};
use tracing::warn;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Resource limits applied to every run of a backend instance.
///
/// Zero means "unlimited" for the time and memory limits. The stack limit
/// is in bytes; `Some(0)` asks for an unlimited stack, which Docker cannot
/// express and is therefore emulated, and `None` leaves the engine default
/// in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit in seconds, 0 = unlimited.
    pub time_limit: u64,
    /// Memory ceiling in MiB, 0 = unlimited.
    pub memory_limit: u64,
    /// Stack ulimit in bytes; `Some(0)` = unlimited (emulated).
    pub stack_limit: Option<u64>,
}

impl ResourceLimits {
    /// Creates limits with the given wall-clock and memory ceilings and no
    /// stack ulimit.
    pub fn new(time_limit: u64, memory_limit: u64) -> Self {
        Self {
            time_limit,
            memory_limit,
            stack_limit: None,
        }
    }

    /// Sets the stack ulimit in bytes (0 requests the unlimited emulation).
    pub fn with_stack_limit(mut self, bytes: u64) -> Self {
        self.stack_limit = Some(bytes);
        self
    }

    /// Hard timeout for the engine's wait-for-exit call.
    pub fn wait_timeout(&self) -> Option<Duration> {
        if self.time_limit > 0 {
            Some(Duration::from_secs(self.time_limit))
        } else {
            None
        }
    }

    /// Memory ceiling in bytes. The same value is used for the memory+swap
    /// ceiling, so the container gets no extra swap.
    pub fn memory_bytes(&self) -> Option<i64> {
        if self.memory_limit > 0 {
            Some((self.memory_limit * BYTES_PER_MIB) as i64)
        } else {
            None
        }
    }

    /// Resolved stack ulimit in bytes, or `None` when no ulimit should be
    /// set.
    ///
    /// Docker has no notion of an unlimited stack, so a requested limit of 0
    /// is approximated by the memory ceiling when one is set, and by total
    /// system RAM+swap otherwise. This is best-effort, not a verified bound.
    pub(crate) fn stack_limit_bytes(&self) -> Option<i64> {
        let requested = self.stack_limit?;
        if requested > 0 {
            return Some(requested as i64);
        }
        warn!("trying to emulate unlimited stack; docker does not support setting it");
        match self.memory_bytes() {
            Some(bytes) => Some(bytes),
            None => total_system_memory_bytes(),
        }
    }

    /// Ulimits for the container's host configuration.
    ///
    /// Setting a stack ulimit under Docker has a history of breakage, so
    /// every use logs a warning: drop the stack limit if programs start
    /// crashing on startup.
    pub(crate) fn ulimits(&self) -> Vec<ResourcesUlimits> {
        match self.stack_limit_bytes() {
            Some(bytes) => {
                warn!(
                    bytes,
                    "setting a stack size ulimit is unreliable under docker; \
                     if you get crashes don't set it"
                );
                vec![ResourcesUlimits {
                    name: Some("stack".to_string()),
                    soft: Some(bytes),
                    hard: Some(bytes),
                }]
            }
            None => Vec::new(),
        }
    }
}

/// Total RAM+swap on this machine, used as the upper bound when emulating an
/// unlimited stack with no memory ceiling configured.
fn total_system_memory_bytes() -> Option<i64> {
    match nix::sys::sysinfo::sysinfo() {
        Ok(info) => Some((info.ram_total() + info.swap_total()) as i64),
        Err(err) => {
            warn!(%err, "could not read total system memory; leaving the stack ulimit unset");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_time_limit_means_no_wait_timeout() {
        assert_eq!(ResourceLimits::new(0, 0).wait_timeout(), None);
        assert_eq!(
            ResourceLimits::new(5, 0).wait_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_memory_limit_converts_mib_to_bytes() {
        assert_eq!(ResourceLimits::new(0, 0).memory_bytes(), None);
        assert_eq!(
            ResourceLimits::new(0, 16).memory_bytes(),
            Some(16 * 1024 * 1024)
        );
    }

    #[test]
    fn test_no_stack_limit_sets_no_ulimit() {
        assert!(ResourceLimits::new(60, 512).ulimits().is_empty());
    }

    #[test]
    fn test_explicit_stack_limit_is_used_verbatim() {
        let limits = ResourceLimits::new(60, 512).with_stack_limit(8 * 1024 * 1024);
        assert_eq!(limits.stack_limit_bytes(), Some(8 * 1024 * 1024));

        let ulimits = limits.ulimits();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("stack"));
        assert_eq!(ulimits[0].soft, Some(8 * 1024 * 1024));
        assert_eq!(ulimits[0].hard, Some(8 * 1024 * 1024));
    }

    #[test]
    fn test_unlimited_stack_falls_back_to_memory_ceiling() {
        let limits = ResourceLimits::new(60, 16).with_stack_limit(0);
        assert_eq!(limits.stack_limit_bytes(), Some(16 * 1024 * 1024));
    }

    #[test]
    fn test_unlimited_stack_without_memory_ceiling_uses_system_total() {
        let limits = ResourceLimits::new(60, 0).with_stack_limit(0);
        // Whatever the machine reports, it is strictly more than any
        // realistic memory ceiling and never negative.
        if let Some(bytes) = limits.stack_limit_bytes() {
            assert!(bytes > 0);
        }
    }
}
