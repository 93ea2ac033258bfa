//! Consistent shard routing.
//!
//! Maps channel ids and user keys onto one of `N` storage nodes with a jump
//! consistent hash (Lamping & Veach). Growing the fleet from `n` to `n + 1`
//! nodes only moves keys onto the new node, roughly `1 / (n + 1)` of them.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SHARD_ROLE, ROUTE_KEY_FILLER};
use crate::types::{ChannelId, UserKey};

/// Identifier of a storage node, rendered as `<role>:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub role: String,
    pub index: u32,
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.index)
    }
}

/// Fold the first 8 bytes of a key into a u64, right-padding short keys.
pub fn route_key(key: &[u8]) -> u64 {
    let mut buf = [ROUTE_KEY_FILLER; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf)
}

/// splitmix64 finalizer; spreads the ASCII-heavy route key over all 64 bits.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Jump consistent hash. Always returns a bucket in `[0, buckets)`;
/// zero buckets is treated as one.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    let buckets = i64::from(buckets.max(1));
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }

    b as u32
}

/// Route an arbitrary byte key onto `shard_count` shards.
pub fn route(key: &[u8], shard_count: u32) -> u32 {
    jump_hash(mix64(route_key(key)), shard_count)
}

/// Fleet-wide router for one shard role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRouter {
    role: String,
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(role: impl Into<String>, shard_count: u32) -> Self {
        Self {
            role: role.into(),
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard(&self, index: u32) -> ShardId {
        ShardId {
            role: self.role.clone(),
            index,
        }
    }

    pub fn route_bytes(&self, key: &[u8]) -> ShardId {
        self.shard(route(key, self.shard_count))
    }

    pub fn route_channel(&self, channel: &ChannelId) -> ShardId {
        self.route_bytes(channel.as_str().as_bytes())
    }

    /// Route per-user state (quota, pin list, login block) by canonical key.
    pub fn route_user(&self, key: &UserKey) -> ShardId {
        self.route_bytes(key.canonical().as_bytes())
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_ROLE, 1)
    }
}
