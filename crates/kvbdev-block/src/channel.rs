//! Per-core I/O channel
//!
//! An [`IoChannel`] is what the host opens on each core that issues I/O to
//! a block device. There is one channel per (controller, core): opening it
//! again on the same core hands out another reference to the same channel
//! and the same [`Poller`]. The first open starts the poller; dropping the
//! last reference stops it. Requests go in through [`IoChannel::submit`]
//! and complete from [`IoChannel::poll`] on the same core.
//!
//! `IoChannel` is `!Send` and `!Sync`: it stays on the thread that opened
//! it, which keeps every in-flight request on one core from submission to
//! completion.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use kvbdev_common::DeviceHandle;
use tracing::debug;

use crate::io::BdevIo;
use crate::poller::{Poller, PollerState};
use crate::registry::KvBdev;
use crate::translate::{self, IoContext};

/// Module context address, controller handle, core
type ChannelKey = (usize, DeviceHandle, u32);

thread_local! {
    static CHANNELS: RefCell<HashMap<ChannelKey, Weak<ChannelInner>>> =
        RefCell::new(HashMap::new());
}

#[derive(Debug)]
struct ChannelInner {
    key: ChannelKey,
    bdev: Arc<KvBdev>,
    ctx: Arc<IoContext>,
    poller: Poller,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.poller.stop();
        // The table may already be gone during thread teardown
        let _ = CHANNELS.try_with(|channels| {
            if let Ok(mut channels) = channels.try_borrow_mut()
                && channels
                    .get(&self.key)
                    .is_some_and(|weak| weak.strong_count() == 0)
            {
                channels.remove(&self.key);
            }
        });
        debug!("Closed channel to {} on core {}", self.bdev.name(), self.key.2);
    }
}

/// Per-core handle for submitting I/O to one block device
#[derive(Debug, Clone)]
pub struct IoChannel {
    inner: Rc<ChannelInner>,
}

impl IoChannel {
    /// Get the calling core's channel to `bdev`, creating it on first use
    pub(crate) fn open(bdev: Arc<KvBdev>, ctx: Arc<IoContext>) -> Self {
        let core = ctx.current_core();
        let key = (Arc::as_ptr(&ctx).addr(), bdev.handle(), core);

        CHANNELS.with(|channels| {
            let mut channels = channels.borrow_mut();
            if let Some(inner) = channels.get(&key).and_then(Weak::upgrade) {
                return Self { inner };
            }

            let mut poller = Poller::new(bdev.handle(), Arc::clone(&ctx));
            poller.start();
            debug!("Opened channel to {} on core {}", bdev.name(), core);
            let inner = Rc::new(ChannelInner {
                key,
                bdev,
                ctx,
                poller,
            });
            channels.insert(key, Rc::downgrade(&inner));
            Self { inner }
        })
    }

    /// Submit a block request. The callback runs exactly once: right away
    /// if the request fails or finishes synchronously, otherwise from a
    /// later [`poll`](Self::poll).
    pub fn submit(&self, io: BdevIo) {
        translate::submit_request(&self.inner.ctx, &self.inner.bdev, io);
    }

    /// Drain this core's completions; returns how many requests finished
    pub fn poll(&self) -> usize {
        self.inner.poller.tick()
    }

    /// Core the channel's poller was bound to, if still running
    #[must_use]
    pub fn core(&self) -> Option<u32> {
        match self.inner.poller.state() {
            PollerState::Running { core } => Some(core),
            PollerState::Stopped => None,
        }
    }

    /// Open references to this channel on its core
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Check whether two handles share one channel and poller
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn bdev(&self) -> &Arc<KvBdev> {
        &self.inner.bdev
    }
}
