//! # padlog-shared
//!
//! Types shared by every padlog crate: channel ids and their classes, the
//! log line codec, checkpoint markers, the shard router and payload
//! signature verification.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod router;
pub mod types;

pub use error::{ProtocolError, SignatureError};
pub use protocol::{Checkpoint, ChannelMetadata, LogLine, LogMessage};
pub use router::{ShardId, ShardRouter};
pub use types::{ChannelId, ChannelKind, UserKey};
