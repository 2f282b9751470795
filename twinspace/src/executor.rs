//! Reference Fan-Out/Join Driver
//!
//! [`Forall`] runs a loop body over an index range on scoped worker threads
//! and performs the region protocol around it: it opens a [`RegionContext`],
//! gives every worker a [`WorkerScope`](crate::WorkerScope), captures the loop
//! state once per worker, and completes the region after the join.
//!
//! ```text
//! Forall::run_captured(&state, 0..n, body)
//!   region = RegionContext::parallel(space)
//!   scope ─┬─ worker 0: enter(0), state.capture(&region), body(i) for i ≡ 0
//!          ├─ worker 1: enter(1), state.capture(&region), body(i) for i ≡ 1
//!          └─ ...
//!   join, then region.finish()
//! ```
//!
//! Indices are dealt cyclically (`i mod workers`), so neighbouring indices land
//! on different workers.

use core::ops::Range;
use std::sync::Arc;

use crossbeam_utils::thread;

use crate::accessor::Accessor;
use crate::config::{DetectorConfig, DEFAULT_WORKERS, MAX_WORKERS};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::handle::DualSpaceHandle;
use crate::region::worker::{self, WorkerId};
use crate::region::{RegionContext, RegionSite, RegionSummary};
use crate::space::ExecutionSpace;
use crate::{Error, Result, SharedArray};

/// Loop state that can be carried into a region.
///
/// Capturing is where instrumented buffers learn that a region has begun.
pub trait Capture {
    /// Returns the per-worker copy used inside `region`.
    fn capture(&self, region: &RegionContext) -> Self;
}

impl Capture for () {
    fn capture(&self, _region: &RegionContext) -> Self {}
}

impl<T, A> Capture for SharedArray<T, A>
where
    T: Copy + PartialEq + Send + Sync + 'static,
    A: Accessor<T>,
{
    fn capture(&self, region: &RegionContext) -> Self {
        SharedArray::capture(self, region)
    }
}

impl<T: ?Sized + Send + Sync + 'static> Capture for DualSpaceHandle<T> {
    fn capture(&self, _region: &RegionContext) -> Self {
        self.clone()
    }
}

macro_rules! impl_capture_tuple {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Capture),+> Capture for ($($name,)+) {
            fn capture(&self, region: &RegionContext) -> Self {
                ($(self.$idx.capture(region),)+)
            }
        }
    };
}

impl_capture_tuple!(A 0);
impl_capture_tuple!(A 0, B 1);
impl_capture_tuple!(A 0, B 1, C 2);
impl_capture_tuple!(A 0, B 1, C 2, D 3);

/// Data-parallel loop driver.
///
/// # Example
///
/// ```rust
/// use twinspace::{Forall, SharedArray};
///
/// let squares = SharedArray::<u64>::new(100);
/// let summary = Forall::new(8)
///     .run_captured(&squares, 0..100, |out, i| out.write(i, (i * i) as u64))
///     .unwrap();
///
/// assert_eq!(squares.read(9), 81);
/// assert_eq!(summary.reports, 0);
/// ```
#[derive(Clone)]
pub struct Forall {
    workers: usize,
    space: ExecutionSpace,
    config: DetectorConfig,
    sink: Arc<dyn DiagnosticSink>,
}

impl Forall {
    /// Creates a driver with `workers` threads, clamped to `1..=MAX_WORKERS`.
    ///
    /// Detector settings come from [`DetectorConfig::from_env`].
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.clamp(1, MAX_WORKERS),
            space: ExecutionSpace::Host,
            config: DetectorConfig::from_env(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Routes conflict reports to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the detector configuration.
    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Tags regions with `space` instead of the host space.
    pub fn with_space(mut self, space: ExecutionSpace) -> Self {
        self.space = space;
        self
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `body(i)` for every `i` in `range`.
    #[track_caller]
    pub fn run<F>(&self, range: Range<usize>, body: F) -> Result<RegionSummary>
    where
        F: Fn(usize) + Sync,
    {
        let site = RegionSite::here(self.space);
        self.execute(site, &(), range, |_: &(), i| body(i))
    }

    /// Runs `body(&state, i)` for every `i` in `range`, with `state` captured
    /// into the region by each worker.
    ///
    /// Fails with [`Error::RegionAborted`] if a worker panics; the region is
    /// then dropped without completing and its pending buffers are reported
    /// as leaked.
    #[track_caller]
    pub fn run_captured<C, F>(&self, state: &C, range: Range<usize>, body: F) -> Result<RegionSummary>
    where
        C: Capture + Sync,
        F: Fn(&C, usize) + Sync,
    {
        let site = RegionSite::here(self.space);
        self.execute(site, state, range, body)
    }

    fn execute<C, F>(
        &self,
        site: RegionSite,
        state: &C,
        range: Range<usize>,
        body: F,
    ) -> Result<RegionSummary>
    where
        C: Capture + Sync,
        F: Fn(&C, usize) + Sync,
    {
        let region = RegionContext::at(site, true)
            .with_config(self.config.clone())
            .with_sink(Arc::clone(&self.sink));
        let workers = self.workers.min(range.len()).max(1);

        let joined = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let region = &region;
                    let body = &body;
                    let range = range.clone();
                    scope.spawn(move |_| {
                        let _worker = worker::enter(WorkerId(w as u32));
                        let local = state.capture(region);
                        for i in range.skip(w).step_by(workers) {
                            body(&local, i);
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join())
                .filter(|outcome| outcome.is_err())
                .count()
        });

        let panicked = joined.unwrap_or(workers);
        if panicked > 0 {
            tracing::error!(region = %region.id(), panicked, "worker panicked; region aborted");
            return Err(Error::RegionAborted { panicked });
        }

        Ok(region.finish())
    }
}

impl Default for Forall {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl core::fmt::Debug for Forall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Forall")
            .field("workers", &self.workers)
            .field("space", &self.space)
            .field("config", &self.config)
            .finish()
    }
}
