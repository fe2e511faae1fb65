//! The memoization and dependency-tracking engine.

pub mod cancel;
pub mod capture;
pub mod clock;
pub mod compute;
pub mod computed;
pub mod error;
pub mod fingerprint;
pub mod limits;
pub mod phase;
pub mod propagate;
pub mod registry;

pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use compute::{ComputeCtx, ComputeDef};
pub use computed::{ArcAny, Computed, ComputedState};
pub use error::{CoreError, InvalidId};
pub use fingerprint::{ArgsDigest, Fingerprint, MethodId, ServiceId};
pub use limits::Limits;
pub use phase::Phase;
pub use registry::{Registry, SweepStats, Sweeper};
