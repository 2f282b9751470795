//! Element Access Hooks
//!
//! Instrumented containers call [`Accessor::touch`] on every element access and
//! [`Accessor::enter_region`] when they are captured into a region. Three
//! accessors are provided:
//!
//! - [`DefaultAccessor`]: does nothing; the uninstrumented configuration
//! - [`RaceConditionAccessor`]: snapshots on capture and logs worker touches
//! - [`HookedAccessor`]: runs a per-access callback, then logs like
//!   `RaceConditionAccessor`
//!
//! # States
//!
//! ```text
//! Unbound ──bind──► Bound ──enter_region──► InRegion
//! ```
//!
//! Outside a worker context every accessor is a no-op, so instrumentation
//! changes nothing about sequential code.

use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

use crate::access_log::AccessLog;
use crate::array::BufferId;
use crate::detector::{detect_races, BufferCheck};
use crate::region::registry::{PostRegionAction, Registration};
use crate::region::{worker, ActionEnv, RegionContext};

/// Reads the current contents of an instrumented buffer.
pub type ContentReader<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// Produces a [`ContentReader`] on demand, so captures that never snapshot
/// never allocate one.
pub type ReaderSource<'a, T> = &'a dyn Fn() -> ContentReader<T>;

/// Per-element hook installed in an instrumented container.
pub trait Accessor<T>: Clone + Default + Send + Sync + 'static {
    /// Attaches the accessor to a buffer identity.
    ///
    /// Called once by the owning container; the identity never changes after.
    fn bind(&mut self, id: BufferId, name: Option<Arc<str>>);

    /// Explicit notification that the container was captured into `region`.
    ///
    /// `contents` builds a reader for the buffer; only the capture that wins
    /// registration calls it.
    fn enter_region(&mut self, region: &RegionContext, contents: ReaderSource<'_, T>);

    /// Records an access to `index`.
    fn touch(&self, index: usize);
}

/// Accessor that records nothing.
pub struct DefaultAccessor<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DefaultAccessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DefaultAccessor<T> {}

impl<T> Default for DefaultAccessor<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DefaultAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DefaultAccessor")
    }
}

impl<T: 'static> Accessor<T> for DefaultAccessor<T> {
    #[inline]
    fn bind(&mut self, _id: BufferId, _name: Option<Arc<str>>) {}

    #[inline]
    fn enter_region(&mut self, _region: &RegionContext, _contents: ReaderSource<'_, T>) {}

    #[inline]
    fn touch(&self, _index: usize) {}
}

/// Lifecycle state of a [`RaceConditionAccessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorState {
    /// No buffer attached
    Unbound,
    /// Attached to a buffer, not captured into a region
    Bound,
    /// Captured into a region with a live access log
    InRegion,
}

/// Accessor that snapshots its buffer on capture and logs worker touches.
///
/// Captures of the same buffer within one region share a single snapshot and
/// access log, however many workers perform them.
pub struct RaceConditionAccessor<T> {
    id: Option<BufferId>,
    name: Option<Arc<str>>,
    log: Option<Arc<AccessLog>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RaceConditionAccessor<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> AccessorState {
        match (&self.id, &self.log) {
            (None, _) => AccessorState::Unbound,
            (Some(_), None) => AccessorState::Bound,
            (Some(_), Some(_)) => AccessorState::InRegion,
        }
    }

    /// Bound buffer identity.
    pub fn buffer(&self) -> Option<BufferId> {
        self.id
    }

    /// Access log shared with the other captures of this region, if any.
    pub fn log(&self) -> Option<&Arc<AccessLog>> {
        self.log.as_ref()
    }
}

impl<T> Clone for RaceConditionAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            log: self.log.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for RaceConditionAccessor<T> {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            log: None,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RaceConditionAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceConditionAccessor")
            .field("buffer", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Accessor<T> for RaceConditionAccessor<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    fn bind(&mut self, id: BufferId, name: Option<Arc<str>>) {
        if let Some(bound) = self.id {
            if bound != id {
                tracing::warn!(%bound, requested = %id, "accessor is already bound; keeping original buffer");
                return;
            }
        }
        self.id = Some(id);
        self.name = name;
    }

    fn enter_region(&mut self, region: &RegionContext, contents: ReaderSource<'_, T>) {
        // A copy made outside a region must not keep logging into a stale one.
        self.log = None;

        let Some(id) = self.id else {
            return;
        };
        if !region.detection_enabled() {
            return;
        }

        let registration = region.registry().register_with(id, || {
            let reader = contents();
            let snapshot = reader();
            let log = Arc::new(AccessLog::new(snapshot.len()));
            let action = detection_action(
                id,
                self.name.clone(),
                snapshot,
                Arc::clone(&log),
                reader,
                region.config().max_reports_per_buffer,
            );
            (log, action)
        });

        if let Registration::Installed(_) = registration {
            tracing::trace!(buffer = %id, region = %region.id(), "snapshot taken");
        }
        self.log = registration.into_shared();
    }

    #[inline]
    fn touch(&self, index: usize) {
        if let Some(log) = &self.log {
            if let Some(worker) = worker::current() {
                log.record(index, worker);
            }
        }
    }
}

fn detection_action<T>(
    buffer: BufferId,
    name: Option<Arc<str>>,
    snapshot: Vec<T>,
    log: Arc<AccessLog>,
    contents: ContentReader<T>,
    limit: usize,
) -> PostRegionAction
where
    T: PartialEq + Send + Sync + 'static,
{
    Box::new(move |env: &ActionEnv<'_>| {
        let current = contents();
        let check = BufferCheck {
            buffer,
            name: name.as_ref(),
            current: &current,
            snapshot: &snapshot,
            log: &log,
        };

        match detect_races(&check, env.site(), limit) {
            Ok((reports, omitted)) => {
                for report in &reports {
                    env.report(report);
                }
                if omitted > 0 {
                    env.warn(&format!(
                        "{omitted} further conflicts on buffer {buffer} not reported"
                    ));
                }
            }
            Err(err) => env.warn(&format!("race check skipped for buffer {buffer}: {err}")),
        }
    })
}

/// Per-access side-effect hook.
pub type AccessHook = Arc<dyn Fn(usize) + Send + Sync>;

/// [`RaceConditionAccessor`] with a callback run on every access.
///
/// The hook runs before the access is logged and sees every access, inside or
/// outside a region. Logging behaves exactly as in the wrapped accessor.
///
/// # Example
///
/// ```rust
/// use twinspace::{HookedAccessor, SharedArray};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = hits.clone();
/// let data = SharedArray::<u8, _>::from_vec_with(
///     vec![0; 4],
///     HookedAccessor::with_hook(move |_| {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }),
/// );
///
/// data.write(0, 1);
/// data.read(3);
/// assert_eq!(hits.load(Ordering::Relaxed), 2);
/// ```
pub struct HookedAccessor<T> {
    inner: RaceConditionAccessor<T>,
    hook: Option<AccessHook>,
}

impl<T> HookedAccessor<T> {
    /// Creates an accessor that calls `hook` with the index of every access.
    pub fn with_hook<F>(hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self {
            inner: RaceConditionAccessor::default(),
            hook: Some(Arc::new(hook)),
        }
    }

    /// The wrapped logging accessor.
    pub fn inner(&self) -> &RaceConditionAccessor<T> {
        &self.inner
    }
}

impl<T> Clone for HookedAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            hook: self.hook.clone(),
        }
    }
}

impl<T> Default for HookedAccessor<T> {
    fn default() -> Self {
        Self {
            inner: RaceConditionAccessor::default(),
            hook: None,
        }
    }
}

impl<T> fmt::Debug for HookedAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedAccessor")
            .field("inner", &self.inner)
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

impl<T> Accessor<T> for HookedAccessor<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    fn bind(&mut self, id: BufferId, name: Option<Arc<str>>) {
        self.inner.bind(id, name);
    }

    fn enter_region(&mut self, region: &RegionContext, contents: ReaderSource<'_, T>) {
        self.inner.enter_region(region, contents);
    }

    #[inline]
    fn touch(&self, index: usize) {
        if let Some(hook) = &self.hook {
            hook(index);
        }
        self.inner.touch(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::worker::WorkerId;
    use crate::space::ExecutionSpace;

    fn reader(values: Vec<i32>) -> impl Fn() -> ContentReader<i32> {
        move || {
            let values = values.clone();
            Arc::new(move || values.clone()) as ContentReader<i32>
        }
    }

    fn bound() -> RaceConditionAccessor<i32> {
        let mut accessor = RaceConditionAccessor::default();
        accessor.bind(BufferId::from_raw(0x2000, 4, 3), None);
        accessor
    }

    #[test]
    fn test_state_transitions() {
        let mut accessor = RaceConditionAccessor::<i32>::default();
        assert_eq!(accessor.state(), AccessorState::Unbound);

        accessor.bind(BufferId::from_raw(0x2000, 4, 3), None);
        assert_eq!(accessor.state(), AccessorState::Bound);

        let region = RegionContext::parallel(ExecutionSpace::Host);
        accessor.enter_region(&region, &reader(vec![0; 3]));
        assert_eq!(accessor.state(), AccessorState::InRegion);
        region.finish();
    }

    #[test]
    fn test_rebinding_keeps_original_identity() {
        let mut accessor = bound();
        accessor.bind(BufferId::from_raw(0x3000, 4, 3), None);
        assert_eq!(accessor.buffer(), Some(BufferId::from_raw(0x2000, 4, 3)));
    }

    #[test]
    fn test_captures_share_one_log() {
        let region = RegionContext::parallel(ExecutionSpace::Host);
        let contents = reader(vec![0; 3]);

        let mut first = bound();
        let mut second = bound();
        first.enter_region(&region, &contents);
        second.enter_region(&region, &contents);

        assert!(Arc::ptr_eq(first.log().unwrap(), second.log().unwrap()));
        assert_eq!(region.registry().len(), 1);
        region.finish();
    }

    #[test]
    fn test_only_the_winning_capture_builds_a_reader() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let built = AtomicUsize::new(0);
        let counted = || {
            built.fetch_add(1, Ordering::SeqCst);
            Arc::new(|| vec![0; 3]) as ContentReader<i32>
        };
        let region = RegionContext::parallel(ExecutionSpace::Host);

        let mut plain = DefaultAccessor::<i32>::default();
        plain.enter_region(&region, &counted);
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let mut first = bound();
        let mut second = bound();
        first.enter_region(&region, &counted);
        second.enter_region(&region, &counted);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        region.finish();
    }

    #[test]
    fn test_touch_outside_worker_is_noop() {
        let region = RegionContext::parallel(ExecutionSpace::Host);
        let mut accessor = bound();
        accessor.enter_region(&region, &reader(vec![0; 3]));

        accessor.touch(0);
        assert_eq!(accessor.log().unwrap().touched_indices(), 0);

        let _scope = worker::enter(WorkerId(2));
        accessor.touch(0);
        assert_eq!(accessor.log().unwrap().workers(0).as_slice(), &[WorkerId(2)]);
        region.finish();
    }

    #[test]
    fn test_sequential_region_registers_nothing() {
        let region = RegionContext::sequential(ExecutionSpace::Host);
        let mut accessor = bound();
        accessor.enter_region(&region, &reader(vec![0; 3]));

        assert_eq!(accessor.state(), AccessorState::Bound);
        assert!(region.registry().is_empty());
    }

    #[test]
    fn test_unbound_accessor_registers_nothing() {
        let region = RegionContext::parallel(ExecutionSpace::Host);
        let mut accessor = RaceConditionAccessor::<i32>::default();
        accessor.enter_region(&region, &reader(vec![0; 3]));
        assert!(region.registry().is_empty());
    }

    #[test]
    fn test_hook_runs_before_logging_and_outside_regions() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut accessor = HookedAccessor::<i32>::with_hook(move |i| seen.lock().push(i));
        accessor.bind(BufferId::from_raw(0x2000, 4, 3), None);

        accessor.touch(1);
        let region = RegionContext::parallel(ExecutionSpace::Host);
        accessor.enter_region(&region, &reader(vec![0; 3]));
        {
            let _scope = worker::enter(WorkerId(0));
            accessor.touch(2);
        }

        assert_eq!(*calls.lock(), vec![1, 2]);
        assert_eq!(accessor.inner().log().unwrap().touch_count(2), 1);
        region.finish();
    }
}
