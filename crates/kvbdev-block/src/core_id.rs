//! Current-core lookup for per-core queue selection.
//!
//! The engine keeps one submission/completion queue per core. Submissions
//! and completion draining both pick the queue of the core they run on.
//! When the core cannot be determined the configured fallback core is used
//! and a warning is logged; this never fails the I/O.

use kvbdev_common::QueueId;
use tracing::warn;

/// Source of the id of the core the caller is running on
pub trait CoreIdSource: Send + Sync {
    /// Current core, or `None` if it cannot be determined
    fn current_core(&self) -> Option<u32>;
}

/// Asks the OS scheduler which CPU the calling thread is on
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedCore;

impl CoreIdSource for SchedCore {
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn current_core(&self) -> Option<u32> {
        // SAFETY: sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        u32::try_from(cpu).ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn current_core(&self) -> Option<u32> {
        None
    }
}

/// Always reports the same answer. `FixedCore(None)` forces the fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCore(pub Option<u32>);

impl CoreIdSource for FixedCore {
    fn current_core(&self) -> Option<u32> {
        self.0
    }
}

/// Resolve the current core, falling back to `fallback` with a warning
pub fn resolve_core(source: &dyn CoreIdSource, fallback: u32) -> u32 {
    source.current_core().unwrap_or_else(|| {
        warn!("Could not get the CPU core id, using default {fallback}");
        fallback
    })
}

/// Queue for the current core
pub fn resolve_queue(source: &dyn CoreIdSource, fallback: u32) -> QueueId {
    QueueId::for_core(resolve_core(source, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_core() {
        assert_eq!(resolve_core(&FixedCore(Some(3)), 0), 3);
        assert_eq!(resolve_queue(&FixedCore(Some(3)), 0), QueueId::for_core(3));
    }

    #[test]
    fn test_fallback_when_unknown() {
        assert_eq!(resolve_core(&FixedCore(None), 0), 0);
        assert_eq!(resolve_core(&FixedCore(None), 7), 7);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sched_core_reports_a_cpu() {
        assert!(SchedCore.current_core().is_some());
    }
}
