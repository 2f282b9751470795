//! Region Action Registry
//!
//! Maps a buffer identity to the single action that must run when the owning
//! region completes. Every worker that captures an instrumented buffer races to
//! register; the check and the insert happen under one lock so exactly one
//! registration wins per identity, and the losers are handed the winner's shared
//! state instead of building their own.
//!
//! # Lifecycle
//!
//! ```text
//! capture ──► register_with(id) ──┬─► Installed  (init ran, entry stored)
//!                                 └─► Joined     (init skipped, winner's state)
//!                                 └─► Closed     (region already completing)
//! region end ──► close() ──► run_all() ──► each action runs once, entries removed
//! ```
//!
//! Closing and registering take the same lock, so a capture racing region
//! completion either lands before the drain and is checked, or is refused.
//!
//! An entry that is still present when the registry is dropped belongs to a
//! region that never completed. Its snapshot and access log are reported as
//! leaked rather than silently discarded.

use core::any::Any;
use core::fmt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::ActionEnv;
use crate::array::BufferId;
use crate::sync::lock::Mutex;
use crate::sync::lock_unpoisoned;

#[cfg(feature = "statistics")]
use crate::sync::atomic::{AtomicU64, Ordering};

/// Work deferred until the owning region completes.
pub type PostRegionAction = Box<dyn FnOnce(&ActionEnv<'_>) + Send>;

struct Entry {
    shared: Arc<dyn Any + Send + Sync>,
    action: PostRegionAction,
}

#[derive(Default)]
struct Entries {
    pending: HashMap<BufferId, Entry>,
    closed: bool,
}

/// Outcome of [`RegionActionRegistry::register_with`].
pub enum Registration<S> {
    /// This caller won: its state and action were installed
    Installed(Arc<S>),
    /// Another caller won first; this is the winner's state
    Joined(Arc<S>),
    /// The identity is registered with state of a different type
    Conflicted,
    /// The registry was closed; nothing was installed
    Closed,
}

impl<S> Registration<S> {
    /// Returns `true` if this caller installed the entry.
    pub fn is_installed(&self) -> bool {
        matches!(self, Registration::Installed(_))
    }

    /// The state shared by every registrant of the identity.
    pub fn shared(&self) -> Option<&Arc<S>> {
        match self {
            Registration::Installed(shared) | Registration::Joined(shared) => Some(shared),
            Registration::Conflicted | Registration::Closed => None,
        }
    }

    /// Consumes the registration, returning the shared state.
    pub fn into_shared(self) -> Option<Arc<S>> {
        match self {
            Registration::Installed(shared) | Registration::Joined(shared) => Some(shared),
            Registration::Conflicted | Registration::Closed => None,
        }
    }
}

impl<S> fmt::Debug for Registration<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registration::Installed(_) => f.write_str("Installed"),
            Registration::Joined(_) => f.write_str("Joined"),
            Registration::Conflicted => f.write_str("Conflicted"),
            Registration::Closed => f.write_str("Closed"),
        }
    }
}

/// Counters kept by a registry when the `statistics` feature is enabled.
#[cfg(feature = "statistics")]
#[derive(Debug)]
struct RegistryStats {
    installed: AtomicU64,
    joined: AtomicU64,
    actions_run: AtomicU64,
    actions_panicked: AtomicU64,
}

#[cfg(feature = "statistics")]
impl RegistryStats {
    fn new() -> Self {
        Self {
            installed: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            actions_run: AtomicU64::new(0),
            actions_panicked: AtomicU64::new(0),
        }
    }
}

/// Snapshot of registry counters.
#[cfg(feature = "statistics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatistics {
    /// Registrations that installed an entry
    pub installed: u64,
    /// Registrations that found an entry already present
    pub joined: u64,
    /// Actions executed
    pub actions_run: u64,
    /// Actions that panicked and were contained
    pub actions_panicked: u64,
}

/// De-duplicating map from buffer identity to pending post-region action.
///
/// One registry belongs to one [`RegionContext`](super::RegionContext); its
/// lifetime is the region's lifetime.
///
/// # Example
///
/// ```rust
/// use twinspace::{ActionEnv, BufferId, RegionActionRegistry, RegionSite, TracingSink};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let registry = RegionActionRegistry::new();
/// let id = BufferId::from_raw(0x1000, 4, 8);
/// let runs = Arc::new(AtomicUsize::new(0));
///
/// let r = runs.clone();
/// assert!(registry.register(id, Box::new(move |_: &ActionEnv<'_>| {
///     r.fetch_add(1, Ordering::SeqCst);
/// })));
/// assert!(!registry.register(id, Box::new(|_: &ActionEnv<'_>| {})));
///
/// let site = RegionSite::here(twinspace::ExecutionSpace::Host);
/// let env = ActionEnv::new(&site, &TracingSink);
/// assert!(registry.run_and_clear(id, &env));
/// assert!(!registry.run_and_clear(id, &env));
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// ```
pub struct RegionActionRegistry {
    entries: Mutex<Entries>,
    #[cfg(feature = "statistics")]
    stats: RegistryStats,
}

impl RegionActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            #[cfg(feature = "statistics")]
            stats: RegistryStats::new(),
        }
    }

    /// Returns `true` if an action is pending for `id`.
    pub fn is_registered(&self, id: BufferId) -> bool {
        lock_unpoisoned(&self.entries).pending.contains_key(&id)
    }

    /// Installs `action` for `id` unless one is already pending.
    ///
    /// Returns `true` if this call installed the action.
    pub fn register(&self, id: BufferId, action: PostRegionAction) -> bool {
        self.register_with(id, move || (Arc::new(()), action))
            .is_installed()
    }

    /// Registers lazily: `init` runs only if `id` has no pending entry.
    ///
    /// The check, the call to `init` and the insert form one critical section,
    /// so concurrent callers for the same identity observe exactly one
    /// `Installed` and allocate nothing else.
    pub fn register_with<S, F>(&self, id: BufferId, init: F) -> Registration<S>
    where
        S: Any + Send + Sync,
        F: FnOnce() -> (Arc<S>, PostRegionAction),
    {
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.closed {
            tracing::debug!(buffer = %id, "registry closed; capture not checked");
            return Registration::Closed;
        }

        if let Some(entry) = entries.pending.get(&id) {
            return match Arc::clone(&entry.shared).downcast::<S>() {
                Ok(shared) => {
                    #[cfg(feature = "statistics")]
                    self.stats.joined.fetch_add(1, Ordering::Relaxed);
                    Registration::Joined(shared)
                }
                Err(_) => {
                    tracing::warn!(
                        buffer = %id,
                        "buffer already registered with state of a different element type"
                    );
                    Registration::Conflicted
                }
            };
        }

        let (shared, action) = init();
        entries.pending.insert(
            id,
            Entry {
                shared: Arc::clone(&shared) as Arc<dyn Any + Send + Sync>,
                action,
            },
        );

        #[cfg(feature = "statistics")]
        self.stats.installed.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(buffer = %id, "post-region action registered");
        Registration::Installed(shared)
    }

    /// Refuses every later registration. Pending entries are kept for
    /// [`run_all`](Self::run_all).
    pub fn close(&self) {
        lock_unpoisoned(&self.entries).closed = true;
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.entries).closed
    }

    /// Runs and removes the action pending for `id`.
    ///
    /// Returns `false` if nothing was registered. The action runs after the
    /// entry has been removed and the lock released; a panic inside it is
    /// contained and reported through `env`.
    pub fn run_and_clear(&self, id: BufferId, env: &ActionEnv<'_>) -> bool {
        let entry = lock_unpoisoned(&self.entries).pending.remove(&id);
        match entry {
            Some(entry) => {
                self.run_entry(id, entry, env);
                true
            }
            None => false,
        }
    }

    /// Runs and removes every pending action, in identity order.
    ///
    /// Returns the number of actions run.
    pub fn run_all(&self, env: &ActionEnv<'_>) -> usize {
        let mut drained: Vec<(BufferId, Entry)> =
            lock_unpoisoned(&self.entries).pending.drain().collect();
        drained.sort_by_key(|(id, _)| *id);

        let count = drained.len();
        for (id, entry) in drained {
            self.run_entry(id, entry, env);
        }
        count
    }

    fn run_entry(&self, id: BufferId, entry: Entry, env: &ActionEnv<'_>) {
        let Entry { shared, action } = entry;
        // Other holders of the shared state keep it alive; the action owns the rest.
        drop(shared);

        #[cfg(feature = "statistics")]
        self.stats.actions_run.fetch_add(1, Ordering::Relaxed);

        if catch_unwind(AssertUnwindSafe(|| action(env))).is_err() {
            #[cfg(feature = "statistics")]
            self.stats.actions_panicked.fetch_add(1, Ordering::Relaxed);

            env.warn(&format!(
                "post-region action for buffer {id} panicked; its report was suppressed"
            ));
        }
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).pending.len()
    }

    /// Returns `true` if no action is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the registry counters.
    #[cfg(feature = "statistics")]
    pub fn statistics(&self) -> RegistryStatistics {
        RegistryStatistics {
            installed: self.stats.installed.load(Ordering::Relaxed),
            joined: self.stats.joined.load(Ordering::Relaxed),
            actions_run: self.stats.actions_run.load(Ordering::Relaxed),
            actions_panicked: self.stats.actions_panicked.load(Ordering::Relaxed),
        }
    }
}

impl Default for RegionActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegionActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionActionRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl Drop for RegionActionRegistry {
    fn drop(&mut self) {
        let entries = lock_unpoisoned(&self.entries);
        for id in entries.pending.keys() {
            tracing::error!(
                buffer = %id,
                "region ended without completing; snapshot and access log were never checked"
            );
        }
    }
}
