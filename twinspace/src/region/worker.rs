//! Worker context.
//!
//! The scheduler that fans a loop body out across workers is not part of this
//! crate. It tells us which worker a thread is running by holding a
//! [`WorkerScope`] for the duration of the worker's share of the region;
//! accessors query [`current`] and [`in_parallel_context`] on every access.

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;

use crate::sync::loom_thread_local;

/// Identifier of a worker within a parallel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

loom_thread_local! {
    static CURRENT: Cell<Option<WorkerId>> = Cell::new(None);
}

/// Marks the current thread as a worker until dropped.
///
/// Scopes nest: dropping an inner scope restores the outer worker id.
pub struct WorkerScope {
    id: WorkerId,
    previous: Option<WorkerId>,
    /// Scopes are bound to the thread that entered them
    _marker: PhantomData<*mut ()>,
}

/// Enters a worker context on the current thread.
///
/// # Example
///
/// ```rust
/// use twinspace::worker::{self, WorkerId};
///
/// assert!(!worker::in_parallel_context());
/// {
///     let _scope = worker::enter(WorkerId(3));
///     assert_eq!(worker::current(), Some(WorkerId(3)));
/// }
/// assert_eq!(worker::current(), None);
/// ```
pub fn enter(id: impl Into<WorkerId>) -> WorkerScope {
    let id = id.into();
    let previous = CURRENT.with(|cell| cell.replace(Some(id)));
    WorkerScope {
        id,
        previous,
        _marker: PhantomData,
    }
}

impl WorkerScope {
    /// The id this scope installed.
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        let previous = self.previous;
        CURRENT.with(|cell| cell.set(previous));
    }
}

/// Worker executing on this thread, if any.
#[inline]
pub fn current() -> Option<WorkerId> {
    CURRENT.with(Cell::get)
}

/// Returns `true` while the calling thread is inside a worker scope.
#[inline]
pub fn in_parallel_context() -> bool {
    current().is_some()
}
