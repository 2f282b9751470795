//! Slot arena backing [`DualSpaceHandle`](super::DualSpaceHandle).
//!
//! Each slot holds the per-space representations of one object together with
//! its reference count, lifecycle callback and companion resources. Keys pair
//! an index with a generation; releasing the last reference bumps the
//! generation and recycles the index, so stale keys never resolve again.
//!
//! Reads take the table lock recursively and the reference count is atomic:
//! sharing a handle or dropping a non-final reference never waits for a
//! writer. Only insertion, mutation and the final release lock exclusively.
//!
//! ```text
//! Slot { generation, state }
//!          │
//!          ├─ Some(SlotState)  live: refs >= 1
//!          └─ None             vacant: index on the free list
//! ```

use core::any::Any;
use core::fmt;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use smallvec::SmallVec;

use crate::space::{Action, Device, ExecutionSpace};
use crate::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "statistics")]
use crate::sync::atomic::AtomicU64;

/// Lifecycle callback: returns `true` if it handled the transition itself.
pub type Callback = Box<dyn FnMut(Action, ExecutionSpace) -> bool + Send + Sync>;

/// Owned sub-resource whose teardown follows the handle's.
pub type Companion = Box<dyn Any + Send + Sync>;

/// Key of a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the key was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Everything one live object owns.
pub(crate) struct SlotState<T: ?Sized> {
    pub(crate) host: Option<Box<T>>,
    pub(crate) device: Option<Box<T>>,
    /// Spaces in the order their representations were registered
    pub(crate) order: SmallVec<[ExecutionSpace; 2]>,
    pub(crate) active: ExecutionSpace,
    pub(crate) refs: AtomicUsize,
    /// Set by mutable access; cleared once the other side is reconciled
    pub(crate) diverged: bool,
    pub(crate) callback: Option<Callback>,
    pub(crate) companions: Vec<Companion>,
}

impl<T: ?Sized> SlotState<T> {
    pub(crate) fn representation(&self, space: ExecutionSpace) -> Option<&T> {
        match space {
            ExecutionSpace::Host => self.host.as_deref(),
            ExecutionSpace::Device => self.device.as_deref(),
            ExecutionSpace::None => None,
        }
    }

    pub(crate) fn representation_mut(&mut self, space: ExecutionSpace) -> Option<&mut T> {
        match space {
            ExecutionSpace::Host => self.host.as_deref_mut(),
            ExecutionSpace::Device => self.device.as_deref_mut(),
            ExecutionSpace::None => None,
        }
    }

    pub(crate) fn take_representation(&mut self, space: ExecutionSpace) -> Option<Box<T>> {
        match space {
            ExecutionSpace::Host => self.host.take(),
            ExecutionSpace::Device => self.device.take(),
            ExecutionSpace::None => None,
        }
    }
}

struct Slot<T: ?Sized> {
    generation: u32,
    state: Option<SlotState<T>>,
}

struct Slots<T: ?Sized> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T: ?Sized> Slots<T> {
    fn live(&self, key: SlotKey) -> Option<&SlotState<T>> {
        self.entries
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.state.as_ref())
    }

    fn live_mut(&mut self, key: SlotKey) -> Option<&mut SlotState<T>> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.state.as_mut())
    }
}

/// Result of dropping one reference.
pub(crate) enum Release<T: ?Sized> {
    /// The key no longer resolves
    Stale,
    /// Other references remain
    Shared(usize),
    /// This was the last reference; the caller destroys the state
    Last(SlotState<T>),
}

#[cfg(feature = "statistics")]
#[derive(Debug)]
struct TableStats {
    created: AtomicU64,
    destroyed: AtomicU64,
}

#[cfg(feature = "statistics")]
impl TableStats {
    fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }
}

/// Snapshot of handle-table counters.
#[cfg(feature = "statistics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStatistics {
    /// Objects inserted
    pub created: u64,
    /// Objects whose last reference was released
    pub destroyed: u64,
}

/// Arena of dual-space objects sharing one device.
pub struct HandleTable<T: ?Sized> {
    slots: RwLock<Slots<T>>,
    device: Device,
    #[cfg(feature = "statistics")]
    stats: TableStats,
}

impl<T: ?Sized> HandleTable<T> {
    /// Creates an empty table bound to `device`.
    pub fn new(device: Device) -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
            device,
            #[cfg(feature = "statistics")]
            stats: TableStats::new(),
        }
    }

    /// Device every device-space representation lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        let slots = self.slots.read_recursive();
        slots.entries.len() - slots.free.len()
    }

    /// Returns `true` if `key` refers to a live object.
    pub fn contains(&self, key: SlotKey) -> bool {
        self.slots.read_recursive().live(key).is_some()
    }

    /// Stores a new object with one reference, host registered first.
    pub(crate) fn insert(&self, host: Box<T>, device: Box<T>) -> SlotKey {
        let state = SlotState {
            host: Some(host),
            device: Some(device),
            order: SmallVec::from_buf(ExecutionSpace::RESIDENT),
            active: ExecutionSpace::Host,
            refs: AtomicUsize::new(1),
            diverged: false,
            callback: None,
            companions: Vec::new(),
        };

        let mut slots = self.slots.write();
        let key = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index as usize];
                slot.state = Some(state);
                SlotKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot {
                    generation: 0,
                    state: Some(state),
                });
                SlotKey {
                    index,
                    generation: 0,
                }
            }
        };
        drop(slots);

        #[cfg(feature = "statistics")]
        self.stats.created.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(index = key.index, generation = key.generation, "handle slot created");
        key
    }

    /// Adds a reference. Returns `false` if the key is stale.
    ///
    /// A live slot always has at least one reference, and it can only be
    /// vacated under the write lock, so the increment needs the read lock only.
    pub(crate) fn retain(&self, key: SlotKey) -> bool {
        match self.slots.read_recursive().live(key) {
            Some(state) => {
                state.refs.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Drops a reference, vacating the slot on the last one.
    pub(crate) fn release(&self, key: SlotKey) -> Release<T> {
        {
            let slots = self.slots.read_recursive();
            let Some(state) = slots.live(key) else {
                return Release::Stale;
            };
            let mut refs = state.refs.load(Ordering::Acquire);
            while refs > 1 {
                match state.refs.compare_exchange_weak(
                    refs,
                    refs - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Release::Shared(refs - 1),
                    Err(actual) => refs = actual,
                }
            }
        }

        // Possibly the last reference: decide under the write lock, where no
        // retain can run concurrently.
        let mut slots = self.slots.write();
        let Some(state) = slots.live_mut(key) else {
            return Release::Stale;
        };
        let remaining = state.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return Release::Shared(remaining);
        }

        let slot = &mut slots.entries[key.index as usize];
        let state = slot.state.take();
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(key.index);
        drop(slots);

        #[cfg(feature = "statistics")]
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);

        match state {
            Some(state) => Release::Last(state),
            None => Release::Stale,
        }
    }

    /// Shared access to a live object's state.
    pub(crate) fn read(&self, key: SlotKey) -> Option<MappedRwLockReadGuard<'_, SlotState<T>>> {
        RwLockReadGuard::try_map(self.slots.read_recursive(), |slots| slots.live(key)).ok()
    }

    /// Exclusive access to a live object's state.
    pub(crate) fn write(&self, key: SlotKey) -> Option<MappedRwLockWriteGuard<'_, SlotState<T>>> {
        RwLockWriteGuard::try_map(self.slots.write(), |slots| slots.live_mut(key)).ok()
    }

    /// Returns the table counters.
    #[cfg(feature = "statistics")]
    pub fn statistics(&self) -> TableStatistics {
        TableStatistics {
            created: self.stats.created.load(Ordering::Relaxed),
            destroyed: self.stats.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl<T: ?Sized> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.live())
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HandleTable<str> {
        HandleTable::new(Device::emulated())
    }

    fn insert(table: &HandleTable<str>) -> SlotKey {
        table.insert(Box::from("host"), Box::from("device"))
    }

    #[test]
    fn test_insert_and_read() {
        let table = table();
        let key = insert(&table);

        let state = table.read(key).unwrap();
        assert_eq!(state.representation(ExecutionSpace::Host), Some("host"));
        assert_eq!(state.representation(ExecutionSpace::Device), Some("device"));
        assert_eq!(state.representation(ExecutionSpace::None), None);
        assert_eq!(state.refs.load(Ordering::Relaxed), 1);
        drop(state);

        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_last_release_vacates_and_recycles() {
        let table = table();
        let key = insert(&table);
        assert!(table.retain(key));

        assert!(matches!(table.release(key), Release::Shared(1)));
        assert!(matches!(table.release(key), Release::Last(_)));
        assert!(!table.contains(key));
        assert!(matches!(table.release(key), Release::Stale));
        assert_eq!(table.live(), 0);

        let reused = insert(&table);
        assert_eq!(reused.index(), key.index());
        assert_ne!(reused.generation(), key.generation());
        assert!(table.read(key).is_none());
        assert!(!table.retain(key));
    }

    #[test]
    fn test_sharing_needs_no_exclusive_lock() {
        let table = table();
        let key = insert(&table);

        let held = table.read(key).unwrap();
        assert!(table.retain(key));
        assert!(matches!(table.release(key), Release::Shared(1)));
        assert_eq!(held.refs.load(Ordering::Relaxed), 1);
        drop(held);

        assert!(matches!(table.release(key), Release::Last(_)));
    }

    #[cfg(feature = "statistics")]
    #[test]
    fn test_statistics_count_created_and_destroyed() {
        let table = table();
        let first = insert(&table);
        let second = insert(&table);
        assert!(table.retain(first));

        assert!(matches!(table.release(first), Release::Shared(1)));
        assert_eq!(
            table.statistics(),
            TableStatistics {
                created: 2,
                destroyed: 0,
            }
        );

        assert!(matches!(table.release(first), Release::Last(_)));
        assert!(matches!(table.release(second), Release::Last(_)));
        assert_eq!(
            table.statistics(),
            TableStatistics {
                created: 2,
                destroyed: 2,
            }
        );
    }
}
