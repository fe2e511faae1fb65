//! Durable operation log and cross-process change propagation.
//!
//! Commands committed by any process land as rows in a shared store; peers
//! learn about them through a best-effort notification channel backed up by
//! polling, re-run each operation's Invalidate phase, and eventually trim
//! rows old enough that every watcher has seen them.

pub mod log;
pub mod notifier;
pub mod operation;
pub mod store;
pub mod trimmer;
pub mod watcher;

use thiserror::Error;

use crate::core::InvalidId;
use crate::error::{Effect, Transience};

pub use log::OperationLog;
pub use notifier::{
    ChangeNotifier, InProcessHub, NotifyConnection, NotifyPolicy, NotifySubscription,
    NotifyTransport,
};
pub use operation::{AgentId, CommandEnvelope, Operation, OperationId};
pub use store::{init_oplog_schema, open_connection};
pub use trimmer::{OperationTrimmer, TrimmerParams};
pub use watcher::{CompletedOps, OperationWatcher, WatcherParams};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpLogError {
    #[error("operation store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("operation encode failed: {reason}")]
    Encode { reason: String },

    #[error("operation decode failed: {reason}")]
    Decode { reason: String },

    #[error("change notification failed: {reason}")]
    Notify { reason: String },

    #[error("configuration invalid: {reason}")]
    ConfigInvalid { reason: String },

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("operation log lock poisoned")]
    LockPoisoned,
}

impl OpLogError {
    pub fn transience(&self) -> Transience {
        match self {
            OpLogError::Sqlite(_) | OpLogError::Notify { .. } => Transience::Retryable,
            OpLogError::Encode { .. }
            | OpLogError::Decode { .. }
            | OpLogError::ConfigInvalid { .. }
            | OpLogError::InvalidId(_)
            | OpLogError::LockPoisoned => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            OpLogError::Sqlite(_) => Effect::Unknown,
            OpLogError::Notify { .. }
            | OpLogError::Encode { .. }
            | OpLogError::Decode { .. }
            | OpLogError::ConfigInvalid { .. }
            | OpLogError::InvalidId(_)
            | OpLogError::LockPoisoned => Effect::None,
        }
    }
}
