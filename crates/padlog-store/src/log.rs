//! Append-only channel log files.
//!
//! One newline-delimited JSON file per channel at
//! `<root>/<id[..2]>/<id>.ndjson`. Offsets handed out by this module are
//! always line starts and stay valid for the lifetime of the file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use padlog_shared::ChannelId;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use crate::error::Result;

const LOG_EXT: &str = "ndjson";
const OFFSET_EXT: &str = "offset.json";

/// Resolves on-disk locations for channel files.
#[derive(Debug, Clone)]
pub struct LogPaths {
    root: PathBuf,
}

impl LogPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, channel: &ChannelId) -> PathBuf {
        self.root.join(channel.bucket())
    }

    pub fn log(&self, channel: &ChannelId) -> PathBuf {
        self.dir(channel)
            .join(format!("{}.{LOG_EXT}", channel.as_str()))
    }

    pub fn resume_offset(&self, channel: &ChannelId) -> PathBuf {
        self.dir(channel)
            .join(format!("{}.{OFFSET_EXT}", channel.as_str()))
    }
}

/// One complete line read from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Byte offset of the first character of the line.
    pub offset: u64,
    /// Line number, counted from the `line` the reader was opened with.
    pub line: u64,
    /// Length in bytes including the terminating newline.
    pub len: u64,
    pub text: String,
}

impl RawLine {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Forward-only reader yielding complete lines.
///
/// A trailing line without its newline is a write in progress: it is held
/// back, and returned once a later call finds the rest of it.
pub struct LogReader {
    reader: BufReader<File>,
    pending: Vec<u8>,
    offset: u64,
    line: u64,
}

impl LogReader {
    /// Open a log positioned at `offset`, which must be a line start.
    /// `line` is the absolute line number at that offset.
    ///
    /// Returns `None` when the log does not exist.
    pub async fn open(path: &Path, offset: u64, line: u64) -> Result<Option<Self>> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Some(Self {
            reader: BufReader::new(file),
            pending: Vec::new(),
            offset,
            line,
        }))
    }

    /// Offset of the next line to be returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of the next line to be returned.
    pub fn line(&self) -> u64 {
        self.line
    }

    pub async fn next_line(&mut self) -> Result<Option<RawLine>> {
        self.reader.read_until(b'\n', &mut self.pending).await?;
        if self.pending.last() != Some(&b'\n') {
            return Ok(None);
        }

        let bytes = std::mem::take(&mut self.pending);
        let len = bytes.len() as u64;
        let text = String::from_utf8_lossy(&bytes[..bytes.len() - 1])
            .trim_end_matches('\r')
            .to_string();

        let raw = RawLine {
            offset: self.offset,
            line: self.line,
            len,
            text,
        };
        self.offset += len;
        self.line += 1;
        Ok(Some(raw))
    }
}

/// Result of a durable append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Offset the new line starts at.
    pub offset: u64,
    /// Bytes written, newline included.
    pub len: u64,
    /// Bytes of an incomplete trailing line discarded before writing.
    pub discarded: u64,
}

/// Append one line to a log, creating it and its directory as needed.
///
/// An incomplete trailing line left by an interrupted write is cut off
/// first, so the new line always starts on a line boundary.
pub async fn append_line(path: &Path, line: &str, fsync: bool) -> Result<WriteAck> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .await?;

    let mut offset = file.metadata().await?.len();
    let mut discarded = 0;
    if offset > 0 {
        let boundary = last_line_boundary(&mut file, offset).await?;
        if boundary < offset {
            discarded = offset - boundary;
            tracing::warn!(
                path = %path.display(),
                discarded,
                "Discarding incomplete trailing line"
            );
            file.set_len(boundary).await?;
            offset = boundary;
        }
    }

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    file.write_all(&buf).await?;
    file.flush().await?;
    if fsync {
        file.sync_data().await?;
    }

    Ok(WriteAck {
        offset,
        len: buf.len() as u64,
        discarded,
    })
}

/// Create a log whose first line is `line`. Returns `false` if the log
/// already exists.
pub async fn create_log(path: &Path, line: &str, fsync: bool) -> Result<bool> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await?;
    if fsync {
        file.sync_data().await?;
    }
    Ok(true)
}

/// Current length of a log, zero if it does not exist.
pub async fn log_len(path: &Path) -> Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Offset just past the last newline in the first `len` bytes.
async fn last_line_boundary(file: &mut File, len: u64) -> Result<u64> {
    const CHUNK: u64 = 4096;
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];

    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf[..n]).await?;
        if let Some(pos) = buf[..n].iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
