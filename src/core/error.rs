//! Core computation errors (identity, capture, memoization).
//!
//! These are bounded and cloneable: a failed computation is memoized like a
//! value, and every caller blocked on that computation observes the same
//! error.

use thiserror::Error;

use crate::core::Fingerprint;
use crate::error::{Effect, Transience};

/// Invalid identity component.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("service id `{raw}` is invalid: {reason}")]
    Service { raw: String, reason: String },
    #[error("method id `{raw}` is invalid: {reason}")]
    Method { raw: String, reason: String },
    #[error("agent id `{raw}` is invalid: {reason}")]
    Agent { raw: String, reason: String },
}

/// Canonical error enum for the computation core.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("arguments are not canonically encodable: {reason}")]
    ArgsNotEncodable { reason: String },

    #[error("dependency cycle: {fingerprint} is already computing on this thread")]
    DependencyCycle { fingerprint: Fingerprint },

    #[error("computation cancelled")]
    Cancelled,

    #[error("compute failed: {reason}")]
    ComputeFailed { reason: String },

    #[error("computed output for {fingerprint} has a different payload type")]
    OutputTypeMismatch { fingerprint: Fingerprint },

    #[error("compute call made during an invalidation pass produces no value")]
    InvalidationPass,

    #[error("registry lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        match self {
            CoreError::Cancelled => Transience::Retryable,
            CoreError::ComputeFailed { .. } => Transience::Unknown,
            CoreError::InvalidId(_)
            | CoreError::ArgsNotEncodable { .. }
            | CoreError::DependencyCycle { .. }
            | CoreError::OutputTypeMismatch { .. }
            | CoreError::InvalidationPass
            | CoreError::LockPoisoned => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        // Compute operations are side-effect-free by contract.
        match self {
            CoreError::LockPoisoned => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
