//! Parallel Regions
//!
//! A [`RegionContext`] is created by whatever drives a data-parallel loop and
//! lives exactly as long as one region. It owns the [`RegionActionRegistry`]
//! for that region, the diagnostic sink conflict reports go to, and the source
//! location used to tag them.
//!
//! # Protocol
//!
//! ```text
//! RegionContext::parallel(space)          region entry
//!   ├─ worker::enter(id)                  per worker, scheduler-owned
//!   │    └─ SharedArray::capture(&ctx)    explicit entry notification
//!   │         └─ registry.register_with   once per buffer identity
//!   │    element accesses                 recorded in the access log
//!   └─ ctx.finish()                       region completion
//!        └─ registry.run_all              detector runs, state released
//! ```
//!
//! A region that is dropped without [`finish`](RegionContext::finish) never
//! runs its detectors; the registry reports every pending buffer as leaked.
//! This is a known limitation of aborted regions, not something to paper over.

pub mod registry;
pub mod worker;

pub use registry::{PostRegionAction, RegionActionRegistry, Registration};

#[cfg(feature = "statistics")]
pub use registry::RegistryStatistics;

use core::cell::Cell;
use core::fmt;
use core::panic::Location;
use core::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::array::BufferId;
use crate::config::DetectorConfig;
use crate::detector::RaceReport;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::space::ExecutionSpace;
use crate::sync::atomic::{AtomicBool, Ordering};

/// Process-unique region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

impl RegionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Source location and execution space of a region, used to tag reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSite {
    /// Source file of the loop
    pub file: &'static str,
    /// Line of the loop
    pub line: u32,
    /// Column of the loop
    pub column: u32,
    /// Space the loop executes in
    pub space: ExecutionSpace,
}

impl RegionSite {
    /// The caller's location.
    #[track_caller]
    pub fn here(space: ExecutionSpace) -> Self {
        Self::from_location(Location::caller(), space)
    }

    /// Builds a site from a captured location.
    pub fn from_location(location: &'static Location<'static>, space: ExecutionSpace) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
            space,
        }
    }
}

impl fmt::Display for RegionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} ({} space)",
            self.file, self.line, self.column, self.space
        )
    }
}

/// What a post-region action sees when it runs.
pub struct ActionEnv<'a> {
    site: &'a RegionSite,
    sink: &'a dyn DiagnosticSink,
    reports: Cell<usize>,
}

impl<'a> ActionEnv<'a> {
    /// Creates an environment reporting to `sink`.
    pub fn new(site: &'a RegionSite, sink: &'a dyn DiagnosticSink) -> Self {
        Self {
            site,
            sink,
            reports: Cell::new(0),
        }
    }

    /// Location tag of the completing region.
    pub fn site(&self) -> &RegionSite {
        self.site
    }

    /// Delivers a conflict report.
    pub fn report(&self, report: &RaceReport) {
        self.reports.set(self.reports.get() + 1);
        self.sink.race(report);
    }

    /// Delivers a non-conflict diagnostic.
    pub fn warn(&self, message: &str) {
        self.sink.warning(message);
    }

    /// Reports delivered through this environment so far.
    pub fn reports(&self) -> usize {
        self.reports.get()
    }
}

/// Outcome of completing a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSummary {
    /// The completed region
    pub region: RegionId,
    /// Where it was entered
    pub site: RegionSite,
    /// Post-region actions that ran
    pub actions_run: usize,
    /// Conflict reports emitted
    pub reports: usize,
}

/// State owned by one parallel region.
///
/// # Example
///
/// ```rust
/// use twinspace::{worker, CollectingSink, ExecutionSpace, RaceConditionAccessor, RegionContext, SharedArray, WorkerId};
/// use std::sync::Arc;
///
/// let sink = Arc::new(CollectingSink::new());
/// let region = RegionContext::parallel(ExecutionSpace::Host).with_sink(sink.clone());
/// let data: SharedArray<i32, RaceConditionAccessor<i32>> = SharedArray::from_vec(vec![0, 0, 0]);
///
/// {
///     let _a = worker::enter(WorkerId(0));
///     data.capture(&region).write(1, 5);
/// }
/// {
///     let _b = worker::enter(WorkerId(1));
///     data.capture(&region).read(1);
/// }
///
/// let summary = region.finish();
/// assert_eq!(summary.reports, 1);
/// assert_eq!(sink.reports()[0].workers, vec![WorkerId(0), WorkerId(1)]);
/// ```
pub struct RegionContext {
    id: RegionId,
    site: RegionSite,
    parallel: bool,
    config: DetectorConfig,
    sink: Arc<dyn DiagnosticSink>,
    registry: RegionActionRegistry,
    completed: AtomicBool,
}

impl RegionContext {
    /// Enters a parallel region at the caller's location.
    #[track_caller]
    pub fn parallel(space: ExecutionSpace) -> Self {
        Self::at(RegionSite::here(space), true)
    }

    /// Enters a sequential region; instrumented buffers register nothing.
    #[track_caller]
    pub fn sequential(space: ExecutionSpace) -> Self {
        Self::at(RegionSite::here(space), false)
    }

    /// Enters a region tagged with an explicit site.
    pub fn at(site: RegionSite, parallel: bool) -> Self {
        let id = RegionId::next();
        tracing::debug!(region = %id, %site, parallel, "region entered");
        Self {
            id,
            site,
            parallel,
            config: DetectorConfig::default(),
            sink: Arc::new(TracingSink),
            registry: RegionActionRegistry::new(),
            completed: AtomicBool::new(false),
        }
    }

    /// Routes reports to `sink` instead of the default tracing sink.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the detector configuration.
    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Region identifier.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Entry site.
    pub fn site(&self) -> &RegionSite {
        &self.site
    }

    /// Returns `true` if workers of this region run concurrently.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Detector configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// The region's action registry.
    pub fn registry(&self) -> &RegionActionRegistry {
        &self.registry
    }

    /// Diagnostic sink.
    pub fn sink(&self) -> &dyn DiagnosticSink {
        &*self.sink
    }

    /// Returns `true` if capturing an instrumented buffer should register a
    /// snapshot in this region.
    #[inline]
    pub fn detection_enabled(&self) -> bool {
        self.parallel && self.config.enabled && !self.is_completed()
    }

    /// Returns `true` once [`finish`](Self::finish) has run.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Completes one buffer ahead of the rest of the region.
    ///
    /// Returns `false` if nothing was pending for `id`.
    pub fn finish_buffer(&self, id: BufferId) -> bool {
        let env = ActionEnv::new(&self.site, &*self.sink);
        self.registry.run_and_clear(id, &env)
    }

    /// Signals region completion: runs every pending action exactly once.
    ///
    /// The registry is closed first, so a capture still in flight is either
    /// drained here or refused; none is left behind as a leak. Calling it again is a no-op that reports zero actions.
    pub fn finish(&self) -> RegionSummary {
        if self.completed.swap(true, Ordering::AcqRel) {
            tracing::debug!(region = %self.id, "region already completed");
            return RegionSummary {
                region: self.id,
                site: self.site,
                actions_run: 0,
                reports: 0,
            };
        }

        self.registry.close();
        let env = ActionEnv::new(&self.site, &*self.sink);
        let actions_run = self.registry.run_all(&env);
        let summary = RegionSummary {
            region: self.id,
            site: self.site,
            actions_run,
            reports: env.reports(),
        };

        tracing::debug!(
            region = %self.id,
            actions = summary.actions_run,
            reports = summary.reports,
            "region completed"
        );
        summary
    }
}

impl fmt::Debug for RegionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionContext")
            .field("id", &self.id)
            .field("site", &self.site)
            .field("parallel", &self.parallel)
            .field("pending", &self.registry.len())
            .finish()
    }
}
