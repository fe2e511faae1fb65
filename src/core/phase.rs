//! The two-valued command phase flag.

use std::fmt;

/// Which pass of a mutating command is currently running.
///
/// `Execute` performs the side effect against the backing store; `Invalidate`
/// re-invokes the read paths the command staled, turning each compute call
/// into an invalidation instead of a computation. Plain reads outside any
/// command run in the `Execute` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Execute,
    Invalidate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Execute => "execute",
            Phase::Invalidate => "invalidate",
        }
    }

    pub fn is_invalidate(self) -> bool {
        matches!(self, Phase::Invalidate)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
