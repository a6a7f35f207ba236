//! Per-core completion poller
//!
//! ```text
//!   Stopped ── start() ──▶ Running { core }
//!      ▲                       │
//!      └─────── stop() ────────┘
//! ```
//!
//! While running, every [`Poller::tick`] drains all completions queued for
//! the controller on the core the tick runs on. The core is looked up again
//! on every tick; when it cannot be determined the fallback core is used.

use std::sync::Arc;

use kvbdev_common::DeviceHandle;
use tracing::{debug, trace};

use crate::translate::IoContext;

/// Poller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    /// Registered on `core`, the core active when it was started
    Running { core: u32 },
}

/// Drains one controller's completions for the calling core
#[derive(Debug)]
pub struct Poller {
    handle: DeviceHandle,
    ctx: Arc<IoContext>,
    state: PollerState,
}

impl Poller {
    /// Create a stopped poller for a controller
    #[must_use]
    pub const fn new(handle: DeviceHandle, ctx: Arc<IoContext>) -> Self {
        Self {
            handle,
            ctx,
            state: PollerState::Stopped,
        }
    }

    /// Bind to the current core and start draining
    pub fn start(&mut self) {
        if let PollerState::Running { core } = self.state {
            debug!("Poller for {} already running on core {}", self.handle, core);
            return;
        }
        let core = self.ctx.current_core();
        self.state = PollerState::Running { core };
        debug!("Poller for {} started on core {}", self.handle, core);
    }

    /// Stop draining. Later ticks do nothing.
    pub fn stop(&mut self) {
        if self.is_running() {
            debug!("Poller for {} stopped", self.handle);
        }
        self.state = PollerState::Stopped;
    }

    #[must_use]
    pub const fn state(&self) -> PollerState {
        self.state
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, PollerState::Running { .. })
    }

    /// Drain completions for the current core; returns how many completed
    pub fn tick(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let queue = self.ctx.queue();
        let drained = self.ctx.engine().drain_completions(self.handle, queue);
        if drained > 0 {
            trace!("Drained {} completions for {} on {}", drained, self.handle, queue);
        }
        drained
    }
}
