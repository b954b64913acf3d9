use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::types::{Identifier, Location};

/// Program constructs and operations the analysis refuses to handle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Feature {
    /// The deprecated `RETURN` instruction form.
    Return,
    StartThread,
    EndThread,
    AtomicBegin,
    AtomicEnd,
    Throw,
    Catch,
    /// Merging cross-thread writes to shared state.
    MergeShared,
}

impl Display for Feature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Feature::Return => "RETURN instruction",
            Feature::StartThread => "START_THREAD",
            Feature::EndThread => "END_THREAD",
            Feature::AtomicBegin => "ATOMIC_BEGIN",
            Feature::AtomicEnd => "ATOMIC_END",
            Feature::Throw => "THROW",
            Feature::Catch => "CATCH",
            Feature::MergeShared => "merge of shared state",
        };
        write!(f, "{}", s)
    }
}

/// Reasons an analysis run is aborted.
///
/// None of these is recoverable: continuing would produce unsound results.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum RdError {
    #[error("unsupported: {0}")]
    Unsupported(Feature),

    #[error("unrecognized instruction kind at {location}")]
    UnrecognizedInstruction { location: Location },

    #[error("analysis context is not a reaching-definitions analysis")]
    ContextMismatch,

    #[error("call to `{0}` which has no symbol")]
    UnknownFunction(Identifier),

    #[error("no fixed point after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

pub type Result<T> = std::result::Result<T, RdError>;
