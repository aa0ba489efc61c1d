//! Per-upstream chain head tracking.
//!
//! Each EVM upstream gets one [`BlockTracker`], written by its state poller and read by the
//! eligibility filter when deciding whether a full node still holds a requested block.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::trace;

/// Source of the latest block number an upstream has reported.
///
/// `0` means the head is not known yet, in which case block-availability checks are skipped.
pub trait StatePoller: Send + Sync + std::fmt::Debug {
    fn latest_block(&self) -> u64;
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Monotonic latest-block holder. Lower numbers reported by a lagging poll are ignored.
#[derive(Debug, Default)]
pub struct BlockTracker {
    latest_block: AtomicU64,
    last_update: AtomicU64,
}

impl BlockTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts at `block`. Used by tests and by upstreams whose head is known up front.
    #[must_use]
    pub fn with_latest(block: u64) -> Self {
        let tracker = Self::new();
        tracker.update(block);
        tracker
    }

    /// Records a reported head. Returns `true` if it advanced the tracked head.
    pub fn update(&self, block: u64) -> bool {
        let previous = self.latest_block.fetch_max(block, Ordering::AcqRel);
        self.last_update.store(current_unix_timestamp(), Ordering::Release);
        if block > previous {
            trace!(previous, block, "latest block advanced");
            true
        } else {
            false
        }
    }

    /// Seconds since the last poll result, or `None` before the first one.
    #[must_use]
    pub fn seconds_since_update(&self) -> Option<u64> {
        match self.last_update.load(Ordering::Acquire) {
            0 => None,
            at => Some(current_unix_timestamp().saturating_sub(at)),
        }
    }
}

impl StatePoller for BlockTracker {
    #[inline]
    fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::Acquire)
    }
}
