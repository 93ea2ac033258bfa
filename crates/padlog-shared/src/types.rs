use serde::{Deserialize, Serialize};

use crate::constants::{
    ADMIN_CHANNEL_LEN, BLOB_CHANNEL_LEN, EPHEMERAL_CHANNEL_LEN, STANDARD_CHANNEL_LEN,
};
use crate::error::ProtocolError;

/// Channel class, decided once from the id length when the id enters the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Persistent, user-owned channel (pads, mailboxes, login blocks).
    Standard,
    /// System-only broadcast channel without a membership list.
    Admin,
    /// Presence-only channel, never persisted.
    Ephemeral,
    /// Large binary blob, stored like a standard channel but never checkpointed.
    Blob,
}

impl ChannelKind {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            STANDARD_CHANNEL_LEN => Some(Self::Standard),
            ADMIN_CHANNEL_LEN => Some(Self::Admin),
            EPHEMERAL_CHANNEL_LEN => Some(Self::Ephemeral),
            BLOB_CHANNEL_LEN => Some(Self::Blob),
            _ => None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Ephemeral)
    }

    pub fn supports_checkpoints(&self) -> bool {
        matches!(self, Self::Standard | Self::Admin)
    }
}

/// Validated channel id. The kind is carried alongside so lower layers never
/// re-inspect the string length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    raw: String,
    kind: ChannelKind,
}

impl ChannelId {
    /// Parse and classify a channel id.
    ///
    /// Ids are restricted to characters that are safe as file names
    /// (alphanumerics plus the URL-safe base64 alphabet and padding).
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let kind = ChannelKind::from_len(raw.len())
            .ok_or(ProtocolError::InvalidChannelLength(raw.len()))?;

        let valid = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'+' | b'='));
        if !valid {
            return Err(ProtocolError::InvalidChannelChars(raw.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Two-character directory bucket used by the on-disk layout.
    pub fn bucket(&self) -> &str {
        &self.raw[..2]
    }

    pub fn short(&self) -> &str {
        &self.raw[..8]
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.raw
    }
}

/// A user's public signing key as presented by clients (base64, possibly
/// escaped for use in URLs and file names).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserKey(pub String);

impl UserKey {
    /// Canonical form used for routing and comparisons.
    ///
    /// Strips surrounding brackets and padding, and restores the standard
    /// base64 alphabet (`-` → `/`, `_` → `+`), so every escaped variant of
    /// the same key maps to the same string.
    pub fn canonical(&self) -> String {
        self.0
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '-' => '/',
                '_' => '+',
                other => other,
            })
            .collect()
    }
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
