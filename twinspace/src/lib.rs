//! Twinspace: Dual Execution-Space Objects and Region Race Detection
//!
//! This crate lets host code that runs the same loop bodies on a CPU or on an
//! accelerator hold polymorphic objects whose representation differs per
//! execution space, and optionally instruments every element access made inside
//! a data-parallel region to flag unsynchronized read/write conflicts.
//!
//! # Architecture
//!
//! - [`handle`]: arena-backed [`DualSpaceHandle`] owning a host and a device
//!   representation, built through [`SafeFactory`] from a [`SpaceBuilder`]
//! - [`region`]: the per-region [`RegionContext`], its de-duplicating
//!   [`RegionActionRegistry`], and the worker context queried by accessors
//! - [`accessor`]: the per-element access hooks ([`DefaultAccessor`],
//!   [`RaceConditionAccessor`], [`HookedAccessor`])
//! - [`array`]: [`SharedArray`], a concurrently mutable buffer that routes each
//!   access through its accessor
//! - [`detector`]: the snapshot/touch-set comparison run after a region ends
//! - [`executor`]: [`Forall`], a small fan-out/join driver that issues region
//!   entry and completion notifications
//!
//! # Detection Invariant
//!
//! An index is reported when, over one region,
//! ```text
//! current[i] != snapshot[i]  ∧  |workers(i)| > 1
//! ```
//! This is a heuristic: a write that is undone before the region ends, or a
//! conflict confined to a single worker, is never reported.
//!
//! # Example
//!
//! ```rust
//! use twinspace::{CollectingSink, Forall, RaceConditionAccessor, SharedArray};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(CollectingSink::new());
//! let counts: SharedArray<u32, RaceConditionAccessor<u32>> =
//!     SharedArray::from_vec(vec![0; 4]).with_name("counts");
//!
//! // Every worker bumps slot 0: a textbook lost-update race.
//! Forall::new(4)
//!     .with_sink(sink.clone())
//!     .run_captured(&counts, 0..64, |counts, _| {
//!         counts.update(0, |c| c + 1);
//!     })
//!     .unwrap();
//!
//! assert!(sink.reports().iter().any(|r| r.index == 0));
//! ```
//!
//! # Feature Flags
//!
//! - `loom`: route registry, log and worker-context primitives through Loom
//! - `statistics`: registry and handle-table counters

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Conditional synchronization primitives for Loom integration
pub mod sync;

pub mod accessor;
pub mod access_log;
pub mod array;
pub mod config;
pub mod detector;
pub mod diagnostics;
pub mod executor;
pub mod handle;
pub mod region;
pub mod space;

pub use accessor::{
    Accessor, ContentReader, DefaultAccessor, HookedAccessor, RaceConditionAccessor, ReaderSource,
};
pub use access_log::{AccessLog, WorkerSet};
pub use array::{BufferId, SharedArray};
pub use config::DetectorConfig;
pub use detector::RaceReport;
pub use diagnostics::{CollectingSink, DiagnosticSink, TracingSink};
pub use executor::{Capture, Forall};
pub use handle::{
    Callback, DualSpaceHandle, FreeOutcome, HandleTable, MigrationOutcome, SafeFactory,
    SlotKey, SpaceBuilder, Teardown,
};
pub use region::{
    worker::{self, WorkerId, WorkerScope},
    ActionEnv, RegionActionRegistry, RegionContext, RegionId, RegionSite, RegionSummary,
    Registration,
};
pub use space::{Action, Device, ExecutionSpace};

/// Error types for the twinspace crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation needs a handle that owns representations
    #[error("handle is empty")]
    EmptyHandle,
    /// Handle key refers to a slot that has been released
    #[error("handle refers to a released slot")]
    StaleHandle,
    /// No representation exists in the requested space
    #[error("no representation in {0} space")]
    MissingRepresentation(ExecutionSpace),
    /// A space builder failed
    #[error("failed to build {space} representation: {reason}")]
    Build {
        /// Space that was being built
        space: ExecutionSpace,
        /// Builder-supplied reason
        reason: String,
    },
    /// A builder produced a different kind of object than the one requested
    #[error("built `{found}` where `{expected}` was expected")]
    KindMismatch {
        /// Kind the caller asked for
        expected: String,
        /// Kind the builder produced
        found: String,
    },
    /// Out-of-place operation called without an output buffer
    #[error("out-of-place operation requires an output buffer")]
    MissingOutput,
    /// Access log does not match the buffer it describes
    #[error("access log covers {found} elements but the buffer has {expected}")]
    MalformedLog {
        /// Buffer length
        expected: usize,
        /// Log or snapshot length
        found: usize,
    },
    /// Element index past the end of a buffer
    #[error("index {index} out of bounds for buffer of length {len}")]
    OutOfBounds {
        /// The requested index
        index: usize,
        /// The buffer length
        len: usize,
    },
    /// The active representation was mutated and the target was never updated
    #[error("{from} representation was modified; {to} is out of date")]
    Diverged {
        /// Space holding the modified representation
        from: ExecutionSpace,
        /// Space whose representation is stale
        to: ExecutionSpace,
    },
    /// Workers panicked before the region could complete
    #[error("parallel region aborted: {panicked} worker(s) panicked")]
    RegionAborted {
        /// Number of workers that panicked
        panicked: usize,
    },
}

impl Error {
    /// A builder was asked for `Expected` but can only produce `Found`.
    pub fn kind_mismatch<Expected: ?Sized, Found: ?Sized>() -> Self {
        Error::KindMismatch {
            expected: core::any::type_name::<Expected>().to_owned(),
            found: core::any::type_name::<Found>().to_owned(),
        }
    }

    /// A builder failed in `space` for `reason`.
    pub fn build(space: ExecutionSpace, reason: impl Into<String>) -> Self {
        Error::Build {
            space,
            reason: reason.into(),
        }
    }
}

/// Result type for twinspace operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_space() {
        let err = Error::MissingRepresentation(ExecutionSpace::Device);
        assert_eq!(err.to_string(), "no representation in device space");

        let err = Error::Build {
            space: ExecutionSpace::Host,
            reason: "no memory".into(),
        };
        assert_eq!(err.to_string(), "failed to build host representation: no memory");
    }
}
