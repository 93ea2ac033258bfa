/// Channel id length for standard (user-owned, persistent) channels
pub const STANDARD_CHANNEL_LEN: usize = 32;

/// Channel id length for admin/broadcast channels (system-only writes)
pub const ADMIN_CHANNEL_LEN: usize = 33;

/// Channel id length for ephemeral (presence-only) channels
pub const EPHEMERAL_CHANNEL_LEN: usize = 34;

/// Id length for large binary blobs stored through the channel log
pub const BLOB_CHANNEL_LEN: usize = 48;

/// Reserved prefix marking a checkpoint payload: `cp|<id>|<payload>`
pub const CHECKPOINT_PREFIX: &str = "cp|";

/// Number of payload characters that make up a message hash
pub const MESSAGE_HASH_LEN: usize = 64;

/// Ed25519 detached signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Filler used to right-pad short routing keys to 8 bytes
pub const ROUTE_KEY_FILLER: u8 = b'=';

/// Default shard role used in routing identifiers (`core:3`)
pub const DEFAULT_SHARD_ROLE: &str = "core";

/// Buffer size past which a checkpoint-less channel is treated as unconventional
pub const UNCONVENTIONAL_THRESHOLD: usize = 100;

/// Tail messages retained for checkpoint-less channels
pub const TAIL_KEEP: usize = 50;

/// Older checkpoints are only retained if they fall within this many lines
pub const CHECKPOINT_WINDOW: u64 = 100;

/// Default HTTP port for the node's collaborator interface
pub const DEFAULT_HTTP_PORT: u16 = 3014;
