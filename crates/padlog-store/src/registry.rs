//! Owned registry of per-channel runtime state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use padlog_shared::{ChannelId, ChannelMetadata};

use crate::index::ChannelIndex;
use crate::queue::{lock, SerialQueue};

/// Metadata as last read from line 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSlot {
    Unknown,
    Missing,
    Present(Arc<ChannelMetadata>),
}

/// Everything the node keeps in memory for one channel.
#[derive(Debug)]
pub struct ChannelState {
    pub(crate) write_queue: SerialQueue,
    pub(crate) validation_queue: SerialQueue,
    pub(crate) index: Mutex<Option<ChannelIndex>>,
    pub(crate) metadata: Mutex<MetadataSlot>,
    /// Bumped on invalidation so in-flight scans do not install stale results.
    pub(crate) epoch: AtomicU64,
    last_used: Mutex<Instant>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            write_queue: SerialQueue::new(),
            validation_queue: SerialQueue::new(),
            index: Mutex::new(None),
            metadata: Mutex::new(MetadataSlot::Unknown),
            epoch: AtomicU64::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Drop derived state; the log itself is left alone.
    pub(crate) fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *lock(&self.index) = None;
        *lock(&self.metadata) = MetadataSlot::Unknown;
    }

    pub(crate) fn cached_index(&self) -> Option<ChannelIndex> {
        lock(&self.index).clone()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_used))
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, Arc<ChannelState>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `channel`, created on first use.
    pub fn get(&self, channel: &ChannelId) -> Arc<ChannelState> {
        let state = lock(&self.channels)
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(ChannelState::new()))
            .clone();
        state.touch();
        state
    }

    pub fn peek(&self, channel: &ChannelId) -> Option<Arc<ChannelState>> {
        lock(&self.channels).get(channel).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }

    /// Forget channels unused for at least `max_idle`. Channels with a
    /// queued write, a pending validation or an outstanding handle stay.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<ChannelId> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        lock(&self.channels).retain(|id, state| {
            let keep = Arc::strong_count(state) > 1 || state.idle_for(now) < max_idle;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        evicted
    }
}
