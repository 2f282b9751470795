//! Execution spaces, lifecycle actions, and the device barrier.
//!
//! An execution space is a memory/compute domain in which a representation of
//! an object or a buffer may independently live. The [`Device`] type models the
//! accelerator side: work launched on it completes asynchronously, and every
//! construct/destroy/migrate boundary must call [`Device::synchronize`] before
//! the result is considered visible from the other space.

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

// Jobs run on OS threads outside any Loom model, so these stay plain atomics.
#[cfg(feature = "statistics")]
use core::sync::atomic::{AtomicU64, Ordering};

/// A memory/compute domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionSpace {
    /// No particular space; used for space-independent lifecycle events
    None,
    /// Host CPU memory
    Host,
    /// Accelerator memory
    Device,
}

impl ExecutionSpace {
    /// The spaces a representation can live in, in default registration order.
    pub const RESIDENT: [ExecutionSpace; 2] = [ExecutionSpace::Host, ExecutionSpace::Device];

    /// Lower-case name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            ExecutionSpace::None => "none",
            ExecutionSpace::Host => "host",
            ExecutionSpace::Device => "device",
        }
    }
}

impl fmt::Display for ExecutionSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle transition reported to a handle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// A representation becomes the active one in another space
    Move,
    /// The handle is being torn down in the given space
    Free,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Move => f.write_str("move"),
            Action::Free => f.write_str("free"),
        }
    }
}

struct DeviceState {
    name: String,
    pending: Mutex<usize>,
    idle: Condvar,
    #[cfg(feature = "statistics")]
    launched: AtomicU64,
    #[cfg(feature = "statistics")]
    barriers: AtomicU64,
}

/// Handle to an accelerator queue.
///
/// Cloning shares the queue. Work submitted through [`launch`](Self::launch)
/// runs asynchronously; [`synchronize`](Self::synchronize) blocks until every
/// launched job has finished.
///
/// # Example
///
/// ```rust
/// use twinspace::Device;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let device = Device::emulated();
/// let done = Arc::new(AtomicBool::new(false));
/// let flag = done.clone();
///
/// device.launch(move || flag.store(true, Ordering::SeqCst));
/// device.synchronize();
///
/// assert!(done.load(Ordering::SeqCst));
/// assert_eq!(device.pending(), 0);
/// ```
#[derive(Clone)]
pub struct Device {
    state: Arc<DeviceState>,
}

impl Device {
    /// Creates a named device queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(DeviceState {
                name: name.into(),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                #[cfg(feature = "statistics")]
                launched: AtomicU64::new(0),
                #[cfg(feature = "statistics")]
                barriers: AtomicU64::new(0),
            }),
        }
    }

    /// A device whose jobs run on host threads.
    pub fn emulated() -> Self {
        Self::new("emulated")
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Submits `work` to the device queue and returns immediately.
    pub fn launch<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.state.pending.lock() += 1;

        #[cfg(feature = "statistics")]
        self.state.launched.fetch_add(1, Ordering::Relaxed);

        let state = Arc::clone(&self.state);
        std::thread::spawn(move || {
            // Completion must be signalled even if the job panics, or
            // synchronize() would wait forever.
            let _completion = Completion(&state);
            work();
        });
    }

    /// Number of launched jobs that have not completed yet.
    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }

    /// Returns `true` if asynchronous work is outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }

    /// Blocks until all launched work has completed.
    pub fn synchronize(&self) {
        #[cfg(feature = "statistics")]
        self.state.barriers.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
        tracing::trace!(device = %self.state.name, "device synchronized");
    }

    /// Returns `(jobs launched, barriers executed)`.
    #[cfg(feature = "statistics")]
    pub fn statistics(&self) -> (u64, u64) {
        (
            self.state.launched.load(Ordering::Relaxed),
            self.state.barriers.load(Ordering::Relaxed),
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.state.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::emulated()
    }
}

struct Completion<'a>(&'a DeviceState);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        let mut pending = self.0.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.0.idle.notify_all();
        }
    }
}
