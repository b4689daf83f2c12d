//! Buffer reclamation policy for serial connections
//!
//! Every connection calls [`ReclaimPolicy::apply`] at four hook points
//! around its hardware I/O. The policy decides whether the connection's
//! (empty) buffer is dropped and replaced by a fresh one at baseline
//! capacity, returning the grown allocation to the allocator.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use serialbridge_core::MemoryMode;
use tracing::{debug, info};

/// Buffers above this capacity are reclaimed in `default` mode
pub const HIGH_WATER_MARK: usize = 64 * 1024;

/// Where in the I/O cycle a connection consults the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoHook {
    PreSend,
    PostSend,
    PreReceive,
    PostReceive,
}

/// Per-buffer record of the last manual request that was honoured
#[derive(Debug, Clone, Copy)]
pub struct ReclaimTracker {
    seen: u64,
}

/// Reclamation strategy selected at startup from [`MemoryMode`]
#[derive(Debug)]
pub struct ReclaimPolicy {
    mode: MemoryMode,
    high_water: usize,
    /// Bumped by every manual `gc` request
    requested: AtomicU64,
    reclaims: AtomicU64,
}

impl ReclaimPolicy {
    pub fn new(mode: MemoryMode) -> Self {
        Self::with_high_water(mode, HIGH_WATER_MARK)
    }

    pub fn with_high_water(mode: MemoryMode, high_water: usize) -> Self {
        Self {
            mode,
            high_water,
            requested: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Log what the selected mode does, once at startup
    pub fn describe(&self) {
        match self.mode {
            MemoryMode::Default => info!(
                "Memory mode: default (buffers above {} KiB are released)",
                self.high_water / 1024
            ),
            MemoryMode::Aggressive => {
                info!("Memory mode: aggressive (buffers released around every send and receive)")
            }
            MemoryMode::Disabled => {
                info!("Memory mode: disabled (buffers grow until a client sends 'gc')")
            }
        }
    }

    /// Start tracking a new buffer
    pub fn tracker(&self) -> ReclaimTracker {
        ReclaimTracker {
            seen: self.requested.load(Ordering::SeqCst),
        }
    }

    /// Ask every connection to reclaim at its next hook, whatever the mode
    pub fn request(&self) {
        let generation = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Manual buffer reclamation requested (#{})", generation);
    }

    /// Total reclamations performed since startup
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    /// Run the policy on `buf` at `hook`
    ///
    /// Buffers holding unsent or undelivered bytes are never touched; a
    /// pending manual request then stays pending until the next hook.
    /// Returns `true` when the buffer was replaced.
    pub fn apply(
        &self,
        hook: IoHook,
        buf: &mut BytesMut,
        baseline: usize,
        tracker: &mut ReclaimTracker,
    ) -> bool {
        let requested = self.requested.load(Ordering::SeqCst);
        let manual = requested != tracker.seen;

        if !manual && !self.wants(hook, buf.capacity()) {
            return false;
        }
        if !buf.is_empty() {
            return false;
        }

        tracker.seen = requested;
        *buf = BytesMut::with_capacity(baseline);
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn wants(&self, hook: IoHook, capacity: usize) -> bool {
        match self.mode {
            MemoryMode::Aggressive => true,
            MemoryMode::Default => {
                matches!(hook, IoHook::PostSend | IoHook::PostReceive) && capacity > self.high_water
            }
            MemoryMode::Disabled => false,
        }
    }
}
