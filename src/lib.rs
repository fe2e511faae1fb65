#![forbid(unsafe_code)]

pub mod command;
pub mod config;
pub mod core;
pub mod error;
pub mod kv;
pub mod oplog;
pub mod repl;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ArgsDigest, CancelToken, Clock, ComputeCtx, ComputeDef, Computed, ComputedState, CoreError,
    Fingerprint, Limits, ManualClock, MethodId, Phase, Registry, ServiceId, SweepStats, Sweeper,
    SystemClock,
};
