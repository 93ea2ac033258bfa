//! # padlog-store
//!
//! Durable channel storage for a padlog node.
//!
//! Every persistent channel is an append-only newline-delimited JSON log.
//! Writes are serialized per channel through a FIFO queue and acknowledged
//! only once durable. A derived index of checkpoint positions and recent
//! message hashes is computed lazily, shared between concurrent readers, and
//! resumed from a persisted offset hint so large logs are not rescanned from
//! the start. The history resolver turns client cursors into log offsets.

pub mod batch;
pub mod history;
pub mod index;
pub mod log;
pub mod offset;
pub mod queue;
pub mod registry;
pub mod store;

mod error;

pub use error::{Result, StoreError};
pub use history::{Cursor, HistoryBound, HistoryRange, StoredMessage};
pub use index::{ChannelIndex, CheckpointPos, IndexLimits};
pub use offset::ResumeOffset;
pub use store::{
    AppendAck, ChannelStore, StoreConfig, ValidationTicket, ValidationTurn, WriteTicket, WriteTurn,
};
