//! Derived per-channel index: checkpoint positions and recent hash offsets.
//!
//! The index is never authoritative. It summarizes a complete prefix of the
//! log and can always be rebuilt by scanning.

use std::collections::{HashMap, VecDeque};

use padlog_shared::constants::{CHECKPOINT_WINDOW, TAIL_KEEP, UNCONVENTIONAL_THRESHOLD};
use padlog_shared::{ChannelKind, LogLine, LogMessage};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::log::RawLine;
use crate::offset::ResumeOffset;

/// Retention limits applied while indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLimits {
    /// Hash entries past which a checkpoint-less channel gets truncated.
    pub unconventional_threshold: usize,
    /// Entries kept after truncation.
    pub tail_keep: usize,
    /// Older checkpoints survive only within this many trailing lines.
    pub checkpoint_window: u64,
}

impl Default for IndexLimits {
    fn default() -> Self {
        Self {
            unconventional_threshold: UNCONVENTIONAL_THRESHOLD,
            tail_keep: TAIL_KEEP,
            checkpoint_window: CHECKPOINT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointPos {
    pub offset: u64,
    pub line: u64,
}

/// Keep the last two checkpoints, plus earlier ones whose line falls inside
/// the trailing `window` lines of a log of `line_count` lines.
pub fn slice_checkpoints(
    checkpoints: &[CheckpointPos],
    line_count: u64,
    window: u64,
) -> Vec<CheckpointPos> {
    let min_line = line_count.saturating_sub(window);
    let split = checkpoints.len().saturating_sub(2);
    let (older, last_two) = checkpoints.split_at(split);

    older
        .iter()
        .filter(|cp| cp.line > min_line)
        .chain(last_two.iter())
        .copied()
        .collect()
}

/// Hash to offset map that remembers insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashIndex {
    offsets: HashMap<String, u64>,
    order: VecDeque<String>,
}

impl HashIndex {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<u64> {
        self.offsets.get(hash).copied()
    }

    /// Record `hash` unless it is already present.
    pub fn insert_if_absent(&mut self, hash: &str, offset: u64) -> bool {
        if self.offsets.contains_key(hash) {
            return false;
        }
        self.offsets.insert(hash.to_string(), offset);
        self.order.push_back(hash.to_string());
        true
    }

    /// Drop every entry located before `offset`.
    pub fn retain_from(&mut self, offset: u64) {
        self.offsets.retain(|_, off| *off >= offset);
        let offsets = &self.offsets;
        self.order.retain(|h| offsets.contains_key(h));
    }

    /// Whether offsets increase strictly in insertion order.
    pub fn is_monotonic(&self) -> bool {
        let mut prev = None;
        for hash in &self.order {
            let Some(&off) = self.offsets.get(hash) else {
                return false;
            };
            if prev.is_some_and(|p| off <= p) {
                return false;
            }
            prev = Some(off);
        }
        true
    }

    /// Keep only the `keep` most recently inserted entries.
    pub fn trim_oldest(&mut self, keep: usize) {
        while self.order.len() > keep {
            if let Some(hash) = self.order.pop_front() {
                self.offsets.remove(&hash);
            }
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.order
            .iter()
            .filter_map(|h| self.offsets.get(h).map(|off| (h.as_str(), *off)))
    }
}

/// Cached summary of one channel log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelIndex {
    pub checkpoints: Vec<CheckpointPos>,
    pub hashes: HashIndex,
    /// Bytes covered by the index (offset just past the last complete line).
    pub total_size: u64,
    pub line_count: u64,
    /// Set once a checkpoint-less channel outgrew the retention threshold.
    pub unconventional: bool,
    /// Unparseable lines skipped after the first checkpoint.
    pub skipped_lines: u64,
    /// Embedded id of the newest checkpoint, for duplicate suppression.
    pub last_checkpoint_id: Option<String>,
}

impl ChannelIndex {
    pub fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    /// Fold a durably appended message into the index.
    ///
    /// `offset` and `len` describe the line as written; `kind` decides
    /// whether checkpoint markers are honoured.
    pub fn record_append(
        &mut self,
        message: &LogMessage,
        kind: ChannelKind,
        offset: u64,
        len: u64,
        limits: &IndexLimits,
    ) {
        let line = self.line_count;

        if kind.supports_checkpoints() {
            if let Some(cp) = message.checkpoint() {
                self.checkpoints =
                    slice_checkpoints(&self.checkpoints, line, limits.checkpoint_window);
                if let Some(first) = self.checkpoints.first() {
                    self.hashes.retain_from(first.offset);
                }
                self.checkpoints.push(CheckpointPos { offset, line });
                self.last_checkpoint_id = cp.id.map(str::to_string);
            }
        }

        self.hashes.insert_if_absent(message.hash(), offset);

        if self.hashes.len() > limits.unconventional_threshold && self.checkpoints.is_empty() {
            if self.hashes.is_monotonic() {
                self.hashes.trim_oldest(limits.tail_keep);
                self.unconventional = true;
            } else {
                tracing::warn!(
                    channel = %message.channel,
                    hashes = self.hashes.len(),
                    "Hash offsets are not monotonic; leaving index untrimmed"
                );
            }
        }

        self.line_count = line + 1;
        self.total_size = offset + len;
    }
}

/// Incremental index computation over a forward scan.
#[derive(Debug)]
pub struct IndexBuilder {
    kind: ChannelKind,
    limits: IndexLimits,
    start: ResumeOffset,
    checkpoints: Vec<CheckpointPos>,
    buffer: Vec<(String, CheckpointPos)>,
    line_count: u64,
    total_size: u64,
    unconventional: bool,
    skipped_lines: u64,
    last_checkpoint_id: Option<String>,
}

impl IndexBuilder {
    pub fn new(kind: ChannelKind, limits: IndexLimits, start: ResumeOffset) -> Self {
        Self {
            kind,
            limits,
            start,
            checkpoints: Vec::new(),
            buffer: Vec::new(),
            line_count: start.line,
            total_size: start.start,
            unconventional: false,
            skipped_lines: 0,
            last_checkpoint_id: None,
        }
    }

    /// Account for one complete line.
    pub fn feed(&mut self, raw: &RawLine) -> Result<()> {
        self.line_count = raw.line + 1;
        self.total_size = raw.end();

        let message = match LogLine::parse(&raw.text) {
            Ok(LogLine::Message(message)) => message,
            Ok(LogLine::Metadata(_)) if raw.offset == 0 => return Ok(()),
            Ok(LogLine::Metadata(_)) | Err(_) => {
                if self.checkpoints.is_empty() {
                    return Err(StoreError::OffsetConsistency { offset: raw.offset });
                }
                self.skipped_lines += 1;
                return Ok(());
            }
        };

        if self.kind.supports_checkpoints() {
            if let Some(cp) = message.checkpoint() {
                self.buffer.clear();
                self.checkpoints.push(CheckpointPos {
                    offset: raw.offset,
                    line: raw.line,
                });
                self.last_checkpoint_id = cp.id.map(str::to_string);
            }
        }

        self.buffer.push((
            message.hash().to_string(),
            CheckpointPos {
                offset: raw.offset,
                line: raw.line,
            },
        ));

        if self.checkpoints.is_empty() && self.buffer.len() > self.limits.unconventional_threshold
        {
            self.unconventional = true;
            let excess = self.buffer.len().saturating_sub(self.limits.tail_keep);
            self.buffer.drain(..excess);
        }
        Ok(())
    }

    /// Finish the scan. Also returns the earliest retained position when it
    /// lies past the offset the scan started from.
    pub fn finish(self) -> (ChannelIndex, Option<ResumeOffset>) {
        let checkpoints = slice_checkpoints(
            &self.checkpoints,
            self.line_count,
            self.limits.checkpoint_window,
        );

        let mut hashes = HashIndex::default();
        for (hash, pos) in &self.buffer {
            hashes.insert_if_absent(hash, pos.offset);
        }

        let resume = checkpoints
            .first()
            .or_else(|| self.buffer.first().map(|(_, pos)| pos))
            .map(|pos| ResumeOffset::new(pos.offset, pos.line))
            .filter(|r| r.start > self.start.start);

        let index = ChannelIndex {
            checkpoints,
            hashes,
            total_size: self.total_size,
            line_count: self.line_count,
            unconventional: self.unconventional,
            skipped_lines: self.skipped_lines,
            last_checkpoint_id: self.last_checkpoint_id,
        };
        (index, resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAN: &str = "0123456789abcdef0123456789abcdef";

    /// Lay out message lines the way the log would, returning raw lines.
    fn lines(payloads: &[String]) -> Vec<RawLine> {
        let mut offset = 0;
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                let mut msg = LogMessage::new(Some("u".into()), CHAN, payload.clone());
                msg.time = Some(1);
                let text = msg.to_line().unwrap();
                let raw = RawLine {
                    offset,
                    line: i as u64,
                    len: text.len() as u64 + 1,
                    text,
                };
                offset += raw.len;
                raw
            })
            .collect()
    }

    fn build(raw: &[RawLine], kind: ChannelKind) -> (ChannelIndex, Option<ResumeOffset>) {
        let mut builder = IndexBuilder::new(kind, IndexLimits::default(), ResumeOffset::default());
        for line in raw {
            builder.feed(line).unwrap();
        }
        builder.finish()
    }

    fn payloads(n: usize, checkpoints_at: &[usize]) -> Vec<String> {
        (0..n)
            .map(|i| {
                if checkpoints_at.contains(&i) {
                    format!("cp|id{i}|state-{i}")
                } else {
                    format!("msg-{i}")
                }
            })
            .collect()
    }

    #[test]
    fn test_slice_keeps_last_two_and_window() {
        let cps: Vec<_> = [10u64, 40, 90]
            .iter()
            .map(|&line| CheckpointPos { offset: line * 10, line })
            .collect();
        let sliced = slice_checkpoints(&cps, 120, 100);
        assert_eq!(sliced.iter().map(|c| c.line).collect::<Vec<_>>(), vec![40, 90]);

        let sliced = slice_checkpoints(&cps, 100, 100);
        assert_eq!(sliced.len(), 3);

        let sliced = slice_checkpoints(&cps, 10_000, 100);
        assert_eq!(sliced.len(), 2);
        assert!(slice_checkpoints(&[], 5, 100).is_empty());
    }

    #[test]
    fn test_checkpoints_and_hashes() {
        let raw = lines(&payloads(120, &[10, 40, 90]));
        let (index, resume) = build(&raw, ChannelKind::Standard);

        assert_eq!(index.line_count, 120);
        assert_eq!(index.total_size, raw.last().unwrap().end());
        assert_eq!(
            index.checkpoints,
            vec![
                CheckpointPos { offset: raw[40].offset, line: 40 },
                CheckpointPos { offset: raw[90].offset, line: 90 },
            ]
        );
        // Buffer restarts at the newest checkpoint, which stays resolvable.
        assert_eq!(index.hash_count(), 30);
        assert_eq!(index.hashes.get("cp|id90|state-90"), Some(raw[90].offset));
        assert_eq!(index.hashes.get("msg-89"), None);
        assert_eq!(index.last_checkpoint_id.as_deref(), Some("id90"));
        assert_eq!(resume, Some(ResumeOffset::new(raw[40].offset, 40)));
    }

    #[test]
    fn test_blob_ignores_checkpoint_markers() {
        let raw = lines(&payloads(20, &[5]));
        let (index, _) = build(&raw, ChannelKind::Blob);
        assert!(index.checkpoints.is_empty());
        assert_eq!(index.hash_count(), 20);
    }

    #[test]
    fn test_unconventional_tail() {
        let raw = lines(&payloads(160, &[]));
        let (index, resume) = build(&raw, ChannelKind::Standard);

        assert!(index.unconventional);
        assert!(index.hash_count() <= 100);
        assert_eq!(index.hashes.get("msg-159"), Some(raw[159].offset));
        assert_eq!(index.hashes.get("msg-0"), None);
        let first = index.hashes.iter().next().unwrap().1;
        assert_eq!(resume.unwrap().start, first);
    }

    #[test]
    fn test_short_channel_keeps_everything() {
        let raw = lines(&payloads(60, &[]));
        let (index, _) = build(&raw, ChannelKind::Standard);
        assert!(!index.unconventional);
        assert_eq!(index.hash_count(), 60);
        assert_eq!(index.hashes.get("msg-55"), Some(raw[55].offset));
    }

    #[test]
    fn test_metadata_skipped_only_at_zero() {
        let meta = r#"{"channel":"c","owners":[]}"#.to_string();
        let mut raw = vec![RawLine {
            offset: 0,
            line: 0,
            len: meta.len() as u64 + 1,
            text: meta.clone(),
        }];
        for mut line in lines(&payloads(3, &[])) {
            line.offset += raw[0].len;
            line.line += 1;
            raw.push(line);
        }
        let (index, _) = build(&raw, ChannelKind::Standard);
        assert_eq!(index.line_count, 4);
        assert_eq!(index.hash_count(), 3);

        let mut builder =
            IndexBuilder::new(ChannelKind::Standard, IndexLimits::default(), ResumeOffset::default());
        builder.feed(&raw[1]).unwrap();
        let stray = RawLine { offset: raw[1].end(), line: 2, len: raw[0].len, text: meta };
        assert!(matches!(
            builder.feed(&stray),
            Err(StoreError::OffsetConsistency { .. })
        ));
    }

    #[test]
    fn test_garbage_after_checkpoint_is_skipped() {
        let mut raw = lines(&payloads(5, &[1]));
        raw[3].text = "garbage".into();
        let (index, _) = build(&raw, ChannelKind::Standard);
        assert_eq!(index.skipped_lines, 1);
        assert_eq!(index.line_count, 5);

        let mut raw = lines(&payloads(5, &[]));
        raw[2].text = "garbage".into();
        let mut builder =
            IndexBuilder::new(ChannelKind::Standard, IndexLimits::default(), ResumeOffset::default());
        builder.feed(&raw[0]).unwrap();
        builder.feed(&raw[1]).unwrap();
        assert!(matches!(
            builder.feed(&raw[2]),
            Err(StoreError::OffsetConsistency { offset }) if offset == raw[2].offset
        ));
    }

    #[test]
    fn test_record_append_matches_rebuild() {
        let raw = lines(&payloads(130, &[10, 60, 110]));
        let (mut incremental, _) = build(&raw[..70], ChannelKind::Standard);
        for line in &raw[70..] {
            let LogLine::Message(msg) = LogLine::parse(&line.text).unwrap() else {
                panic!("expected message");
            };
            incremental.record_append(
                &msg,
                ChannelKind::Standard,
                line.offset,
                line.len,
                &IndexLimits::default(),
            );
        }
        let (rebuilt, _) = build(&raw, ChannelKind::Standard);

        // Live bookkeeping only slices when a checkpoint arrives, so it may
        // hold older checkpoints than a rebuild.
        assert!(incremental.checkpoints.ends_with(&rebuilt.checkpoints));
        assert_eq!(incremental.checkpoints.len(), 3);
        assert_eq!(rebuilt.checkpoints.len(), 2);
        assert_eq!(incremental.line_count, rebuilt.line_count);
        assert_eq!(incremental.total_size, rebuilt.total_size);
        assert_eq!(incremental.last_checkpoint_id, rebuilt.last_checkpoint_id);
        // Every hash the rebuild knows, the live index knows at the same offset.
        for (hash, offset) in rebuilt.hashes.iter() {
            assert_eq!(incremental.hashes.get(hash), Some(offset));
        }
        let earliest = incremental.checkpoints[0].offset;
        assert!(incremental.hashes.iter().all(|(_, off)| off >= earliest));
    }

    fn append_all(raw: &[RawLine]) -> ChannelIndex {
        let mut index = ChannelIndex::default();
        for line in raw {
            let msg = LogLine::parse(&line.text).unwrap().as_message().cloned().unwrap();
            index.record_append(&msg, ChannelKind::Standard, line.offset, line.len, &IndexLimits::default());
        }
        index
    }

    #[test]
    fn test_record_append_trims_tail() {
        let raw = lines(&payloads(101, &[]));
        let index = append_all(&raw);
        assert!(index.unconventional);
        assert_eq!(index.hash_count(), 50);
        assert_eq!(index.hashes.get("msg-100"), Some(raw[100].offset));
        assert_eq!(index.hashes.get("msg-50"), None);
    }

    #[test]
    fn test_live_and_rebuilt_trim_at_same_length() {
        for n in [UNCONVENTIONAL_THRESHOLD, UNCONVENTIONAL_THRESHOLD + 1] {
            let raw = lines(&payloads(n, &[]));
            let live = append_all(&raw);
            let (rebuilt, _) = build(&raw, ChannelKind::Standard);

            assert_eq!(live.unconventional, rebuilt.unconventional, "n = {n}");
            assert_eq!(
                live.hashes.iter().collect::<Vec<_>>(),
                rebuilt.hashes.iter().collect::<Vec<_>>(),
                "n = {n}"
            );
        }
        let at = append_all(&lines(&payloads(UNCONVENTIONAL_THRESHOLD, &[])));
        assert!(!at.unconventional);
        assert_eq!(at.hash_count(), UNCONVENTIONAL_THRESHOLD);
    }

    #[test]
    fn test_non_monotonic_hashes_left_alone() {
        let mut hashes = HashIndex::default();
        hashes.insert_if_absent("a", 10);
        hashes.insert_if_absent("b", 5);
        assert!(!hashes.is_monotonic());

        let mut index = ChannelIndex {
            hashes,
            ..ChannelIndex::default()
        };
        let limits = IndexLimits {
            unconventional_threshold: 2,
            tail_keep: 1,
            checkpoint_window: 100,
        };
        let msg = LogMessage::new(None, CHAN, "c");
        index.record_append(&msg, ChannelKind::Standard, 20, 5, &limits);
        assert_eq!(index.hash_count(), 3);
        assert!(!index.unconventional);
    }

    #[test]
    fn test_hash_index_retain_and_order() {
        let mut hashes = HashIndex::default();
        assert!(hashes.insert_if_absent("a", 0));
        assert!(hashes.insert_if_absent("b", 10));
        assert!(!hashes.insert_if_absent("a", 20));
        assert!(hashes.insert_if_absent("c", 20));
        hashes.retain_from(10);
        assert_eq!(hashes.iter().collect::<Vec<_>>(), vec![("b", 10), ("c", 20)]);
        hashes.trim_oldest(1);
        assert_eq!(hashes.iter().collect::<Vec<_>>(), vec![("c", 20)]);
        assert!(hashes.is_monotonic());
    }
}
