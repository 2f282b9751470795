//! Conditional Synchronization Primitives
//!
//! The region registry, the access log, the worker context and the handle
//! table's reference counts are the parts of this crate that many workers hit
//! concurrently. They take their atomics, locks and thread-locals from here so
//! the same code runs against either the standard library or Loom's
//! model-checked primitives.
//!
//! # Loom Integration
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test --features loom --test loom_verification
//! ```
//!
//! Without the `loom` feature every item is a plain re-export from `std`.

#[cfg(all(feature = "loom", loom))]
pub mod atomic {
    //! Atomic types for Loom model checking.

    pub use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod atomic {
    //! Standard library atomic types.

    pub use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(all(feature = "loom", loom))]
pub mod lock {
    //! Loom-aware locks.

    pub use loom::sync::{Mutex, MutexGuard};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod lock {
    //! Standard library locks.

    pub use std::sync::{Mutex, MutexGuard};
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Post-region actions run under `catch_unwind`, so a poisoned lock only means
/// a detector failed halfway; the protected map itself is still consistent.
#[inline]
pub(crate) fn lock_unpoisoned<T>(mutex: &lock::Mutex<T>) -> lock::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Declares a thread-local that Loom can see.
///
/// Loom simulates every model thread on one OS thread, so a `std` thread-local
/// would leak worker identity between simulated workers.
macro_rules! loom_thread_local {
    ($(#[$attr:meta])* $vis:vis static $name:ident: $ty:ty = $init:expr;) => {
        #[cfg(all(feature = "loom", loom))]
        loom::thread_local! {
            $(#[$attr])*
            $vis static $name: $ty = $init;
        }

        #[cfg(not(all(feature = "loom", loom)))]
        std::thread_local! {
            $(#[$attr])*
            $vis static $name: $ty = $init;
        }
    };
}

pub(crate) use loom_thread_local;
