//! On-disk and in-flight message formats.
//!
//! A channel log is newline-delimited JSON. Every content line is a message
//! tuple `[seq, sender, type, channel, payload, time]`; the first line of a
//! log may instead be a JSON object carrying the channel's metadata.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::constants::{CHECKPOINT_PREFIX, MESSAGE_HASH_LEN};
use crate::error::ProtocolError;

/// Message type tag for ordinary channel content.
pub const MSG_TYPE: &str = "MSG";

/// A single channel message.
///
/// `time` is `None` for messages that have not been persisted yet; the store
/// stamps it immediately before the durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub seq: i64,
    /// Sender id, `None` for system-originated messages.
    pub sender: Option<String>,
    pub kind: String,
    pub channel: String,
    pub payload: String,
    /// Server timestamp (Unix epoch millis).
    pub time: Option<i64>,
}

impl LogMessage {
    pub fn new(sender: Option<String>, channel: &str, payload: impl Into<String>) -> Self {
        Self {
            seq: 0,
            sender,
            kind: MSG_TYPE.to_string(),
            channel: channel.to_string(),
            payload: payload.into(),
            time: None,
        }
    }

    /// Hash used as a history cursor.
    pub fn hash(&self) -> &str {
        message_hash(&self.payload)
    }

    pub fn checkpoint(&self) -> Option<Checkpoint<'_>> {
        Checkpoint::parse(&self.payload)
    }

    pub fn is_checkpoint(&self) -> bool {
        self.payload.starts_with(CHECKPOINT_PREFIX)
    }

    /// Serialize to a single log line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for LogMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.time.is_some() { 6 } else { 5 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.seq)?;
        seq.serialize_element(&self.sender)?;
        seq.serialize_element(&self.kind)?;
        seq.serialize_element(&self.channel)?;
        seq.serialize_element(&self.payload)?;
        if let Some(time) = self.time {
            seq.serialize_element(&time)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LogMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TupleVisitor;

        impl<'de> Visitor<'de> for TupleVisitor {
            type Value = LogMessage;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a message tuple [seq, sender, type, channel, payload, time?]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LogMessage, A::Error> {
                let seq_no: i64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let sender: Option<String> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let channel: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let payload: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;
                let time = seq.next_element::<Option<i64>>()?.flatten();
                // Tolerate trailing fields written by newer nodes.
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}

                Ok(LogMessage {
                    seq: seq_no,
                    sender,
                    kind,
                    channel,
                    payload,
                    time,
                })
            }
        }

        deserializer.deserialize_seq(TupleVisitor)
    }
}

/// Channel metadata, stored as line 0 of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetadata {
    pub channel: String,
    #[serde(default)]
    pub owners: Vec<String>,
    /// Base64 Ed25519 public key checked against every signed payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_key: Option<String>,
    /// Expiry (Unix epoch millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<i64>,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

impl ChannelMetadata {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ..Self::default()
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire, Some(expire) if expire > 0 && expire < now_ms)
    }

    /// Whether a (canonicalized) user key may write to a restricted channel.
    pub fn allows(&self, key: &str) -> bool {
        if !self.restricted {
            return true;
        }
        self.owners.iter().chain(self.allowed.iter()).any(|k| k == key)
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Metadata(ChannelMetadata),
    Message(LogMessage),
}

impl LogLine {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim_end_matches(&['\n', '\r'][..]);
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed)
                .map(LogLine::Metadata)
                .map_err(|e| ProtocolError::MalformedLine(e.to_string()));
        }
        serde_json::from_str(trimmed)
            .map(LogLine::Message)
            .map_err(|e| ProtocolError::MalformedLine(e.to_string()))
    }

    pub fn as_message(&self) -> Option<&LogMessage> {
        match self {
            LogLine::Message(msg) => Some(msg),
            LogLine::Metadata(_) => None,
        }
    }
}

/// Checkpoint marker embedded at the start of a payload:
/// `cp|<id>|<payload>` or `cp|<payload>` when no id is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint<'a> {
    /// Identifier used only for duplicate-checkpoint suppression.
    pub id: Option<&'a str>,
    /// Remaining signed payload.
    pub body: &'a str,
}

impl<'a> Checkpoint<'a> {
    pub fn parse(payload: &'a str) -> Option<Self> {
        let rest = payload.strip_prefix(CHECKPOINT_PREFIX)?;
        if let Some((id, body)) = rest.split_once('|') {
            let is_id = !id.is_empty()
                && id
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='));
            if is_id {
                return Some(Self { id: Some(id), body });
            }
        }
        Some(Self {
            id: None,
            body: rest,
        })
    }
}

/// Strip the checkpoint marker, leaving the payload that was signed.
pub fn signed_payload(payload: &str) -> &str {
    Checkpoint::parse(payload)
        .map(|cp| cp.body)
        .unwrap_or(payload)
}

/// First [`MESSAGE_HASH_LEN`] characters of a stored payload.
pub fn message_hash(payload: &str) -> &str {
    match payload.char_indices().nth(MESSAGE_HASH_LEN) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_line_roundtrip() {
        let mut msg = LogMessage::new(Some("user1".into()), "chan", "payload");
        msg.time = Some(1_700_000_000_000);
        let line = msg.to_line().unwrap();
        assert_eq!(line, r#"[0,"user1","MSG","chan","payload",1700000000000]"#);

        match LogLine::parse(&line).unwrap() {
            LogLine::Message(parsed) => assert_eq!(parsed, msg),
            other => panic!("unexpected line {other:?}"),
        }
    }

    #[test]
    fn test_unstamped_message_has_five_fields() {
        let msg = LogMessage::new(None, "chan", "x");
        assert_eq!(msg.to_line().unwrap(), r#"[0,null,"MSG","chan","x"]"#);
    }

    #[test]
    fn test_metadata_line() {
        let line = r#"{"channel":"abc","owners":["k1"],"validateKey":"vk","expire":5}"#;
        let LogLine::Metadata(meta) = LogLine::parse(line).unwrap() else {
            panic!("expected metadata");
        };
        assert_eq!(meta.owners, vec!["k1".to_string()]);
        assert_eq!(meta.validate_key.as_deref(), Some("vk"));
        assert!(meta.is_expired(10));
        assert!(!meta.is_expired(4));
        assert!(!meta.restricted);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(LogLine::parse("not json").is_err());
        assert!(LogLine::parse("[1,2]").is_err());
        assert!(LogLine::parse(r#"[0,null,"MSG","c""#).is_err());
    }

    #[test]
    fn test_checkpoint_parse() {
        let cp = Checkpoint::parse("cp|abc123|SIGNED").unwrap();
        assert_eq!(cp.id, Some("abc123"));
        assert_eq!(cp.body, "SIGNED");

        let cp = Checkpoint::parse("cp|SIGNED").unwrap();
        assert_eq!(cp.id, None);
        assert_eq!(cp.body, "SIGNED");

        assert!(Checkpoint::parse("plain").is_none());
        assert_eq!(signed_payload("cp|id|body"), "body");
        assert_eq!(signed_payload("body"), "body");
    }

    #[test]
    fn test_message_hash_is_prefix() {
        let payload = "x".repeat(100);
        assert_eq!(message_hash(&payload).len(), MESSAGE_HASH_LEN);
        assert_eq!(message_hash("short"), "short");
    }

    #[test]
    fn test_restricted_allow_list() {
        let mut meta = ChannelMetadata::new("c");
        assert!(meta.allows("anyone"));
        meta.restricted = true;
        meta.owners = vec!["owner".into()];
        meta.allowed = vec!["guest".into()];
        assert!(meta.allows("owner"));
        assert!(meta.allows("guest"));
        assert!(!meta.allows("stranger"));
    }
}
