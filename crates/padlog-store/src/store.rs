//! The [`ChannelStore`] handle: durable appends, cached metadata and
//! coalesced index computation for every channel a node owns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use padlog_shared::{ChannelId, ChannelMetadata, LogLine, LogMessage};
use tracing::{debug, error, info, warn};

use crate::batch::BatchRead;
use crate::error::{Result, StoreError};
use crate::index::{ChannelIndex, IndexBuilder, IndexLimits};
use crate::log::{self, LogPaths, LogReader};
use crate::offset::ResumeOffset;
use crate::queue::{lock, Ticket, Turn};
use crate::registry::{ChannelRegistry, ChannelState, MetadataSlot};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding the two-character bucket directories.
    pub root: PathBuf,
    pub limits: IndexLimits,
    /// `sync_data` after every append.
    pub fsync: bool,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: IndexLimits::default(),
            fsync: true,
        }
    }
}

/// A message as it was durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendAck {
    pub offset: u64,
    pub len: u64,
    /// The stored message, server timestamp included.
    pub message: LogMessage,
}

/// Shared handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct ChannelStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    paths: LogPaths,
    limits: IndexLimits,
    fsync: bool,
    registry: ChannelRegistry,
    /// Keyed by epoch so a scan started before an invalidation is never
    /// shared with callers that arrive after it.
    index_reads: BatchRead<(ChannelId, u64), Result<ChannelIndex>>,
}

impl ChannelStore {
    /// Open a store rooted at `config.root`, creating the directory.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        info!(path = %config.root.display(), fsync = config.fsync, "Channel store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                paths: LogPaths::new(config.root),
                limits: config.limits,
                fsync: config.fsync,
                registry: ChannelRegistry::new(),
                index_reads: BatchRead::new(),
            }),
        })
    }

    pub fn paths(&self) -> &LogPaths {
        &self.inner.paths
    }

    pub fn limits(&self) -> &IndexLimits {
        &self.inner.limits
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    pub(crate) fn ensure_persistent(channel: &ChannelId) -> Result<()> {
        if channel.kind().is_persistent() {
            Ok(())
        } else {
            Err(StoreError::NotPersistent(channel.to_string()))
        }
    }

    // ----- write path -----

    /// Take the next slot in the channel's write queue.
    pub fn enqueue_write(&self, channel: &ChannelId) -> WriteTicket {
        let state = self.inner.registry.get(channel);
        let ticket = state.write_queue.enqueue();
        WriteTicket {
            channel: channel.clone(),
            state,
            ticket,
        }
    }

    /// Append `message` while holding the channel's write turn.
    ///
    /// The server timestamp is stamped here unless already present. The
    /// index, if cached, is updated only after the write is durable.
    pub async fn append_in(&self, turn: &WriteTurn, mut message: LogMessage) -> Result<AppendAck> {
        let channel = &turn.channel;
        Self::ensure_persistent(channel)?;

        if message.time.is_none() {
            message.time = Some(chrono::Utc::now().timestamp_millis());
        }
        let line = message.to_line()?;
        let path = self.inner.paths.log(channel);

        let ack = match log::append_line(&path, &line, self.inner.fsync).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    channel = %channel,
                    error = %e,
                    "CRITICAL: failed to persist message"
                );
                *lock(&turn.state.index) = None;
                return Err(e);
            }
        };

        let mut cached = lock(&turn.state.index);
        let stale = match cached.as_mut() {
            Some(index) if index.total_size == ack.offset => {
                index.record_append(
                    &message,
                    channel.kind(),
                    ack.offset,
                    ack.len,
                    &self.inner.limits,
                );
                false
            }
            Some(index) => {
                warn!(
                    channel = %channel,
                    indexed = index.total_size,
                    offset = ack.offset,
                    "Cached index does not end where the append began; dropping it"
                );
                true
            }
            None => false,
        };
        if stale {
            *cached = None;
        }
        drop(cached);

        debug!(channel = %channel, offset = ack.offset, len = ack.len, "Message persisted");
        Ok(AppendAck {
            offset: ack.offset,
            len: ack.len,
            message,
        })
    }

    /// Queue and append a single message.
    pub async fn append(&self, channel: &ChannelId, message: LogMessage) -> Result<AppendAck> {
        let turn = self.enqueue_write(channel).wait().await;
        self.append_in(&turn, message).await
    }

    /// Create a channel whose log starts with `metadata` as line 0.
    /// Returns `false` if the log already exists.
    pub async fn create_with_metadata(
        &self,
        channel: &ChannelId,
        metadata: &ChannelMetadata,
    ) -> Result<bool> {
        Self::ensure_persistent(channel)?;
        let line = metadata.to_line()?;
        let turn = self.enqueue_write(channel).wait().await;

        let created = log::create_log(&self.inner.paths.log(channel), &line, self.inner.fsync).await?;
        if created {
            *lock(&turn.state.index) = None;
            *lock(&turn.state.metadata) = MetadataSlot::Present(Arc::new(metadata.clone()));
            info!(channel = %channel, "Channel created with metadata");
        }
        Ok(created)
    }

    // ----- validation queue and duplicate checkpoints -----

    /// Take the next slot in the channel's validation queue.
    pub fn enqueue_validation(&self, channel: &ChannelId) -> ValidationTicket {
        let state = self.inner.registry.get(channel);
        let ticket = state.validation_queue.enqueue();
        ValidationTicket { state, ticket }
    }

    /// Embedded id of the newest checkpoint in the log.
    pub async fn last_checkpoint(&self, channel: &ChannelId) -> Result<Option<String>> {
        Ok(self.get_index(channel).await?.last_checkpoint_id)
    }

    /// Like [`last_checkpoint`](Self::last_checkpoint), for a caller that
    /// already holds the write turn. Nothing can land between this answer
    /// and the caller's own append.
    pub async fn last_checkpoint_in(&self, turn: &WriteTurn) -> Result<Option<String>> {
        if !turn.channel.kind().is_persistent() {
            return Ok(None);
        }
        if let Some(index) = turn.state.cached_index() {
            return Ok(index.last_checkpoint_id);
        }
        let epoch = turn.state.epoch();
        let index = self
            .compute_index(&turn.channel, &turn.state, epoch, TailAccess::Held)
            .await?;
        Ok(index.last_checkpoint_id)
    }

    // ----- metadata -----

    /// Channel metadata from line 0, cached after the first read.
    pub async fn metadata(&self, channel: &ChannelId) -> Result<Option<Arc<ChannelMetadata>>> {
        if !channel.kind().is_persistent() {
            return Ok(None);
        }
        let state = self.inner.registry.get(channel);
        match &*lock(&state.metadata) {
            MetadataSlot::Present(meta) => return Ok(Some(meta.clone())),
            MetadataSlot::Missing => return Ok(None),
            MetadataSlot::Unknown => {}
        }

        let epoch = state.epoch();
        let path = self.inner.paths.log(channel);
        let first = match LogReader::open(&path, 0, 0).await? {
            Some(mut reader) => reader.next_line().await?,
            None => None,
        };
        let slot = match first.map(|raw| LogLine::parse(&raw.text)) {
            Some(Ok(LogLine::Metadata(meta))) => MetadataSlot::Present(Arc::new(meta)),
            _ => MetadataSlot::Missing,
        };

        let mut current = lock(&state.metadata);
        if *current == MetadataSlot::Unknown && state.epoch() == epoch {
            *current = slot.clone();
        }
        Ok(match slot {
            MetadataSlot::Present(meta) => Some(meta),
            _ => None,
        })
    }

    // ----- index -----

    /// Index for `channel`: cached, or computed once for all concurrent
    /// callers.
    pub async fn get_index(&self, channel: &ChannelId) -> Result<ChannelIndex> {
        Self::ensure_persistent(channel)?;
        let state = self.inner.registry.get(channel);
        let epoch = state.epoch();
        if let Some(index) = state.cached_index() {
            return Ok(index);
        }

        let store = self.clone();
        let key = channel.clone();
        self.inner
            .index_reads
            .run((channel.clone(), epoch), move || async move {
                store
                    .compute_index(&key, &state, epoch, TailAccess::Queue)
                    .await
            })
            .await
            .unwrap_or(Err(StoreError::Interrupted))
    }

    /// Drop the cached index and metadata after an out-of-band change to
    /// the log. The log is not touched.
    pub fn invalidate(&self, channel: &ChannelId) {
        if let Some(state) = self.inner.registry.peek(channel) {
            state.invalidate();
            debug!(channel = %channel, "Channel index invalidated");
        }
    }

    /// Forget in-memory state of channels idle for at least `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted = self.inner.registry.evict_idle(max_idle);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted idle channels");
        }
        evicted.len()
    }

    /// Scan the log and install the result, unless the channel was
    /// invalidated after `epoch` was read.
    async fn compute_index(
        &self,
        channel: &ChannelId,
        state: &ChannelState,
        epoch: u64,
        tail: TailAccess,
    ) -> Result<ChannelIndex> {
        let scanned = match self.scan_index(channel, state, tail).await {
            Err(StoreError::OffsetConsistency { offset }) => {
                warn!(
                    channel = %channel,
                    offset,
                    "Offset consistency fault; rescanning channel from byte 0"
                );
                ResumeOffset::clear(&self.inner.paths.resume_offset(channel)).await?;
                match self.scan_index(channel, state, tail).await {
                    Err(StoreError::OffsetConsistency { offset }) => {
                        error!(
                            channel = %channel,
                            offset,
                            "ALERT: channel log is corrupt; index cannot be built"
                        );
                        return Err(StoreError::CorruptLog {
                            channel: channel.to_string(),
                            offset,
                        });
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        let (index, _turn) = scanned;
        if state.epoch() == epoch {
            *lock(&state.index) = Some(index.clone());
        } else {
            debug!(channel = %channel, "Channel invalidated during scan; result not cached");
        }
        debug!(
            channel = %channel,
            lines = index.line_count,
            checkpoints = index.checkpoints.len(),
            hashes = index.hash_count(),
            "Channel index computed"
        );
        Ok(index)
    }

    /// Scan from the resume offset to the end of the log. With
    /// [`TailAccess::Queue`] the tail is read under a freshly taken write
    /// turn, returned so the caller can install the index before any
    /// further append lands.
    async fn scan_index(
        &self,
        channel: &ChannelId,
        state: &ChannelState,
        tail: TailAccess,
    ) -> Result<(ChannelIndex, Option<Turn>)> {
        let log_path = self.inner.paths.log(channel);
        let offset_path = self.inner.paths.resume_offset(channel);

        let resume = ResumeOffset::load(&offset_path).await?;
        if resume.start > log::log_len(&log_path).await? {
            return Err(StoreError::OffsetConsistency {
                offset: resume.start,
            });
        }

        let mut builder = IndexBuilder::new(channel.kind(), self.inner.limits, resume);
        let mut reader = LogReader::open(&log_path, resume.start, resume.line).await?;
        if let Some(reader) = reader.as_mut() {
            while let Some(raw) = reader.next_line().await? {
                builder.feed(&raw)?;
            }
        }

        let turn = match tail {
            TailAccess::Queue => Some(state.write_queue.enqueue().wait().await),
            TailAccess::Held => None,
        };
        if reader.is_none() {
            reader = LogReader::open(&log_path, resume.start, resume.line).await?;
        }
        if let Some(reader) = reader.as_mut() {
            while let Some(raw) = reader.next_line().await? {
                builder.feed(&raw)?;
            }
        }

        let (index, candidate) = builder.finish();
        if let Some(candidate) = candidate {
            match candidate.store(&offset_path).await {
                Ok(()) => debug!(channel = %channel, start = candidate.start, "Resume offset advanced"),
                Err(e) => warn!(channel = %channel, error = %e, "Failed to persist resume offset"),
            }
        }
        Ok((index, turn))
    }
}

/// How an index scan gets exclusive access to the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailAccess {
    /// Wait for a write turn of its own.
    Queue,
    /// The caller already holds the write turn.
    Held,
}

/// A position in a channel's write queue.
#[derive(Debug)]
pub struct WriteTicket {
    channel: ChannelId,
    state: Arc<ChannelState>,
    ticket: Ticket,
}

impl WriteTicket {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub async fn wait(self) -> WriteTurn {
        let turn = self.ticket.wait().await;
        WriteTurn {
            channel: self.channel,
            state: self.state,
            _turn: turn,
        }
    }
}

/// Exclusive write access to one channel; released on drop.
#[derive(Debug)]
pub struct WriteTurn {
    channel: ChannelId,
    state: Arc<ChannelState>,
    _turn: Turn,
}

impl WriteTurn {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}

/// A position in a channel's validation queue.
#[derive(Debug)]
pub struct ValidationTicket {
    state: Arc<ChannelState>,
    ticket: Ticket,
}

impl ValidationTicket {
    pub async fn wait(self) -> ValidationTurn {
        let turn = self.ticket.wait().await;
        ValidationTurn {
            _state: self.state,
            _turn: turn,
        }
    }
}

#[derive(Debug)]
pub struct ValidationTurn {
    _state: Arc<ChannelState>,
    _turn: Turn,
}
