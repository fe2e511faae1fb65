//! Push replication of published computed values.
//!
//! A publisher process exposes selected computed cells as publications; each
//! replica subscribes over a framed duplex channel and mirrors the current
//! value locally. Invalidation reaches replicas before the recomputed value
//! does, so a replica is never unknowingly stale: it is either consistent or
//! knows it is waiting.

pub mod frame;
pub mod proto;
pub mod publisher;
pub mod replica;
pub mod server;
pub mod transport;

use thiserror::Error;

use crate::core::CoreError;
use crate::error::{Effect, Transience};

pub use frame::{FrameReader, FrameWriter, FRAME_HEADER_LEN};
pub use proto::{
    decode_envelope, encode_envelope, PublicationId, ReplEnvelope, ReplMessage, PROTOCOL_VERSION,
};
pub use publisher::{Publisher, PublisherHandle};
pub use replica::{Replica, ReplicaPolicy, ReplicaState};
pub use server::ReplServer;
pub use transport::{
    duplex_pair, in_memory, Connector, DuplexConn, InMemoryConnector, InMemoryListener, Listener,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplError {
    #[error("replication io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {reason}")]
    FrameMalformed { reason: String },

    #[error("frame of {got} bytes exceeds the {limit}-byte limit")]
    FrameOversize { limit: usize, got: usize },

    #[error("frame checksum mismatch: expected {expected:#010x} got {got:#010x}")]
    FrameChecksum { expected: u32, got: u32 },

    #[error(transparent)]
    Encode(#[from] proto::ProtoEncodeError),

    #[error(transparent)]
    Decode(#[from] proto::ProtoDecodeError),

    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("subscription refused: {reason}")]
    Refused { reason: String },

    #[error("replication channel closed")]
    ChannelClosed,

    #[error("replica disposed")]
    Disposed,

    #[error("timed out waiting for replica state")]
    Timeout,

    #[error("payload encode failed: {reason}")]
    Payload { reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("replication lock poisoned")]
    LockPoisoned,
}

impl ReplError {
    pub fn transience(&self) -> Transience {
        match self {
            // A checksum failure is stream corruption; a reconnect restarts
            // the stream from a fresh State.
            ReplError::Io(_)
            | ReplError::FrameChecksum { .. }
            | ReplError::ChannelClosed
            | ReplError::Timeout => Transience::Retryable,
            ReplError::Core(e) => e.transience(),
            ReplError::FrameMalformed { .. }
            | ReplError::FrameOversize { .. }
            | ReplError::Encode(_)
            | ReplError::Decode(_)
            | ReplError::Handshake { .. }
            | ReplError::Refused { .. }
            | ReplError::Payload { .. }
            | ReplError::Disposed
            | ReplError::LockPoisoned => Transience::Permanent,
        }
    }

    // Replication never mutates the authoritative store.
    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
