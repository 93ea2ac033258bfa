//! History resolution: turning a client cursor into a log offset and
//! streaming messages from there.

use std::collections::VecDeque;
use std::path::PathBuf;

use futures::stream::{self, Stream, TryStreamExt};
use padlog_shared::{ChannelId, ChannelMetadata, LogLine, LogMessage};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::log::LogReader;
use crate::store::ChannelStore;

/// Where a reconnecting client wants history from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Everything from the start of the log.
    Full,
    /// Everything after the message with this hash.
    Hash(String),
    /// No cursor: recent history only.
    Recent,
}

impl Cursor {
    /// An absent or empty cursor means recent history.
    pub fn from_query(hash: Option<&str>) -> Self {
        match hash {
            Some(h) if !h.is_empty() => Cursor::Hash(h.to_string()),
            _ => Cursor::Recent,
        }
    }
}

/// A message together with the offset of its line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub offset: u64,
    pub message: LogMessage,
}

/// How far back an older-history page reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBound {
    /// At most this many messages.
    Messages(usize),
    /// Back to the n-th most recent checkpoint.
    Checkpoints(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRange {
    /// Hash of the first message to include.
    pub from: Option<String>,
    /// Hash of the message to stop before (the oldest one the client has).
    pub to: Option<String>,
    pub bound: Option<HistoryBound>,
}

enum ReadState {
    Closed { path: PathBuf, from: u64 },
    Open(LogReader),
}

async fn next_message(
    state: ReadState,
    before: Option<u64>,
) -> Result<Option<(StoredMessage, ReadState)>> {
    let mut reader = match state {
        ReadState::Closed { path, from } => match LogReader::open(&path, from, 0).await? {
            Some(reader) => reader,
            None => return Ok(None),
        },
        ReadState::Open(reader) => reader,
    };

    loop {
        let Some(raw) = reader.next_line().await? else {
            return Ok(None);
        };
        if before.is_some_and(|bound| raw.offset >= bound) {
            return Ok(None);
        }
        match LogLine::parse(&raw.text) {
            Ok(LogLine::Message(message)) => {
                let stored = StoredMessage {
                    offset: raw.offset,
                    message,
                };
                return Ok(Some((stored, ReadState::Open(reader))));
            }
            Ok(LogLine::Metadata(_)) => {}
            Err(e) => debug!(offset = raw.offset, error = %e, "Skipping unparseable log line"),
        }
    }
}

fn unknown_cursor(channel: &ChannelId, hash: &str) -> StoreError {
    debug!(channel = %channel, cursor = hash, "EUNKNOWN: cursor outside retained history");
    StoreError::UnknownCursor
}

impl ChannelStore {
    /// Lazily stream messages starting at `from`, a line-start offset.
    /// With `before`, stops at the first line at or past that offset.
    pub fn read_messages(
        &self,
        channel: &ChannelId,
        from: u64,
        before: Option<u64>,
    ) -> impl Stream<Item = Result<StoredMessage>> + Send + 'static {
        let init = ReadState::Closed {
            path: self.paths().log(channel),
            from,
        };
        stream::try_unfold(init, move |state| next_message(state, before))
    }

    /// Messages strictly older than `offset`.
    pub fn read_messages_before(
        &self,
        channel: &ChannelId,
        offset: u64,
    ) -> impl Stream<Item = Result<StoredMessage>> + Send + 'static {
        self.read_messages(channel, 0, Some(offset))
    }

    /// Offset of the first message whose hash is `hash`, by linear scan.
    async fn scan_for_hash(&self, channel: &ChannelId, hash: &str) -> Result<Option<u64>> {
        let messages = self.read_messages(channel, 0, None);
        futures::pin_mut!(messages);
        while let Some(stored) = messages.try_next().await? {
            if stored.message.hash() == hash {
                return Ok(Some(stored.offset));
            }
        }
        Ok(None)
    }

    /// Offset of the message whose hash is `hash`.
    ///
    /// The index answers first. A hash older than the earliest retained
    /// checkpoint, or missing from the index of a channel that has
    /// checkpoints, is unknown. Only a checkpoint-free channel falls back to
    /// scanning the log.
    async fn resolve_hash(&self, channel: &ChannelId, hash: &str) -> Result<u64> {
        let index = self.get_index(channel).await?;
        if let Some(offset) = index.hashes.get(hash) {
            if index.checkpoints.len() >= 2 && offset < index.checkpoints[0].offset {
                return Err(unknown_cursor(channel, hash));
            }
            return Ok(offset);
        }
        if !index.checkpoints.is_empty() {
            return Err(unknown_cursor(channel, hash));
        }
        match self.scan_for_hash(channel, hash).await? {
            Some(offset) => Ok(offset),
            None => Err(unknown_cursor(channel, hash)),
        }
    }

    /// Resolve a cursor to the offset history should be streamed from.
    ///
    /// Fails with [`StoreError::UnknownCursor`] when the cursor cannot be
    /// placed in retained history; the client must then request the full
    /// history instead.
    pub async fn resolve_offset(&self, channel: &ChannelId, cursor: &Cursor) -> Result<u64> {
        match cursor {
            Cursor::Full => Ok(0),
            Cursor::Recent => {
                let index = self.get_index(channel).await?;
                let n = index.checkpoints.len();
                if n < 2 {
                    Ok(0)
                } else {
                    Ok(index.checkpoints[n - 2].offset)
                }
            }
            Cursor::Hash(hash) => self.resolve_hash(channel, hash).await,
        }
    }

    /// History after `cursor`. The cursor's own message is not repeated.
    pub async fn get_history(
        &self,
        channel: &ChannelId,
        cursor: &Cursor,
    ) -> Result<Vec<StoredMessage>> {
        if !channel.kind().is_persistent() {
            return Ok(Vec::new());
        }
        let offset = self.resolve_offset(channel, cursor).await?;

        let messages = self.read_messages(channel, offset, None);
        futures::pin_mut!(messages);
        let mut out = Vec::new();
        while let Some(stored) = messages.try_next().await? {
            if let Cursor::Hash(hash) = cursor {
                if stored.offset == offset && stored.message.hash() == hash {
                    continue;
                }
            }
            out.push(stored);
        }
        Ok(out)
    }

    /// Like [`get_history`](Self::get_history), but a channel without a log
    /// is created with `metadata` as its first line.
    pub async fn get_history_or_create(
        &self,
        channel: &ChannelId,
        cursor: &Cursor,
        metadata: &ChannelMetadata,
    ) -> Result<Vec<StoredMessage>> {
        if channel.kind().is_persistent() && self.create_with_metadata(channel, metadata).await? {
            return Ok(Vec::new());
        }
        self.get_history(channel, cursor).await
    }

    pub async fn get_full_history(&self, channel: &ChannelId) -> Result<Vec<StoredMessage>> {
        self.get_history(channel, &Cursor::Full).await
    }

    /// Older history between two known hashes, bounded by a message count
    /// or a number of checkpoints.
    pub async fn get_history_range(
        &self,
        channel: &ChannelId,
        range: &HistoryRange,
    ) -> Result<Vec<StoredMessage>> {
        if !channel.kind().is_persistent() {
            return Ok(Vec::new());
        }

        let start = match &range.from {
            Some(hash) => self.resolve_hash(channel, hash).await?,
            None => 0,
        };
        let end = match &range.to {
            Some(hash) => Some(self.resolve_hash(channel, hash).await?),
            None => None,
        };
        if end.is_some_and(|end| end <= start) {
            return Ok(Vec::new());
        }

        let messages = self.read_messages(channel, start, end);
        futures::pin_mut!(messages);

        let checkpoints = channel.kind().supports_checkpoints();
        let mut page = Page::new(range.bound);
        while let Some(stored) = messages.try_next().await? {
            let is_checkpoint = checkpoints && stored.message.is_checkpoint();
            page.push(stored, is_checkpoint);
        }
        Ok(page.finish())
    }
}

/// Accumulates the tail of a range read according to its bound.
struct Page {
    bound: Option<HistoryBound>,
    /// Messages before the first checkpoint seen.
    head: Vec<StoredMessage>,
    /// One entry per checkpoint, each starting with that checkpoint.
    segments: VecDeque<Vec<StoredMessage>>,
    flat: VecDeque<StoredMessage>,
}

impl Page {
    fn new(bound: Option<HistoryBound>) -> Self {
        Self {
            bound,
            head: Vec::new(),
            segments: VecDeque::new(),
            flat: VecDeque::new(),
        }
    }

    fn push(&mut self, stored: StoredMessage, is_checkpoint: bool) {
        match self.bound {
            None => self.flat.push_back(stored),
            Some(HistoryBound::Messages(n)) => {
                self.flat.push_back(stored);
                while self.flat.len() > n {
                    self.flat.pop_front();
                }
            }
            Some(HistoryBound::Checkpoints(n)) => {
                if is_checkpoint {
                    self.segments.push_back(vec![stored]);
                    if self.segments.len() > n.max(1) {
                        self.segments.pop_front();
                        self.head.clear();
                    }
                } else if let Some(segment) = self.segments.back_mut() {
                    segment.push(stored);
                } else {
                    self.head.push(stored);
                }
            }
        }
    }

    fn finish(self) -> Vec<StoredMessage> {
        match self.bound {
            Some(HistoryBound::Checkpoints(_)) => self
                .head
                .into_iter()
                .chain(self.segments.into_iter().flatten())
                .collect(),
            _ => self.flat.into_iter().collect(),
        }
    }
}
