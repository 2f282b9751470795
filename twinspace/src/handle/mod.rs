//! Dual-Space Object Handles
//!
//! A [`DualSpaceHandle`] owns a host-resident and a device-resident
//! representation of one logical object. Handles are reference-counted keys
//! into a [`HandleTable`]; the last release destroys both representations.
//!
//! # Lifecycle
//!
//! ```text
//!   SafeFactory::make ──► Live { refs: 1, active: Host }
//!        clone()       ──► refs + 1
//!        get_mut()     ──► diverged
//!        reconcile(f)  ──► f(active, other), synchronized
//!        migrate(to)   ──► callback(Move, to)?, barrier, active = to
//!                          (diverged and no custom move: Error::Diverged)
//!        free()/drop   ──► refs - 1
//!                           └─ refs == 0:
//!                              for space in destroy order:
//!                                  callback(Free, space), drop repr,
//!                                  barrier after the device repr
//!                              callback(Free, None) or default companion teardown
//! ```
//!
//! # Destroy Order
//!
//! Representations are destroyed in registration order (host, then device),
//! except when the device still has work in flight: then the device
//! representation goes first so that the barrier drains that work before the
//! host side disappears.
//!
//! # Divergence
//!
//! [`DualSpaceHandle::get_mut`] only changes the active representation. The
//! slot is then marked diverged until the other side is brought up to date,
//! either by a callback that handles `(Move, to)` or by
//! [`DualSpaceHandle::reconcile`]. A default migration of a diverged slot
//! fails instead of exposing the stale side.
//!
//! # Locking
//!
//! Shared guards from [`DualSpaceHandle::get`] and [`DualSpaceHandle::get_in`]
//! take the table lock recursively, and cloning or dropping a non-final
//! reference only needs shared access, so workers reading and sharing handles
//! never block each other. A thread that holds any guard must not call
//! `get_mut`, `migrate`, `reconcile`, `set_callback`, `adopt` or release the
//! last reference of a handle in the same table: those lock exclusively and
//! would wait on the thread's own guard.

mod factory;
mod table;

pub use factory::{SafeFactory, SpaceBuilder};
pub use table::{Callback, Companion, HandleTable, SlotKey};

#[cfg(feature = "statistics")]
pub use table::TableStatistics;

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};
use smallvec::SmallVec;

use crate::space::{Action, Device, ExecutionSpace};
use crate::sync::atomic::Ordering;
use crate::{Error, Result};
use table::{Release, SlotState};

/// How one space's representation was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The callback handled the `Free` event
    Custom,
    /// No callback, or it declined
    Default,
}

/// What a call to [`DualSpaceHandle::free`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeOutcome {
    /// `true` if this release destroyed the object
    pub destroyed: bool,
    /// References still alive after this release
    pub remaining: usize,
    /// Spaces torn down, in destruction order
    pub torn_down: SmallVec<[(ExecutionSpace, Teardown); 2]>,
    /// `true` if the callback accepted the final `(Free, None)` event
    pub custom_teardown: bool,
}

impl FreeOutcome {
    /// Spaces torn down, in destruction order.
    pub fn order(&self) -> SmallVec<[ExecutionSpace; 2]> {
        self.torn_down.iter().map(|(space, _)| *space).collect()
    }
}

/// What a call to [`DualSpaceHandle::migrate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The target was already active; nothing happened
    AlreadyActive,
    /// The callback performed the migration
    Custom,
    /// Default migration: barrier, then switch the active space
    Default,
}

/// Reference-counted handle to an object with per-space representations.
///
/// # Example
///
/// ```rust
/// use twinspace::{Device, ExecutionSpace, SafeFactory, SpaceBuilder};
///
/// trait Shape: Send + Sync {
///     fn area(&self) -> f64;
/// }
///
/// struct Square(f64);
/// impl Shape for Square {
///     fn area(&self) -> f64 { self.0 * self.0 }
/// }
///
/// struct SquareBuilder(f64);
/// impl SpaceBuilder<dyn Shape> for SquareBuilder {
///     fn build_host(&self) -> twinspace::Result<Box<dyn Shape>> {
///         Ok(Box::new(Square(self.0)))
///     }
///     fn build_device(&self, _device: &Device) -> twinspace::Result<Box<dyn Shape>> {
///         Ok(Box::new(Square(self.0)))
///     }
/// }
///
/// let factory = SafeFactory::<dyn Shape>::new(Device::emulated());
/// let mut shape = factory.make(Some(&SquareBuilder(3.0)));
///
/// assert_eq!(shape.get().unwrap().area(), 9.0);
/// assert_eq!(shape.active_space(), ExecutionSpace::Host);
/// assert!(shape.free().destroyed);
/// assert!(shape.is_empty());
/// ```
pub struct DualSpaceHandle<T: ?Sized> {
    inner: Option<(Arc<HandleTable<T>>, SlotKey)>,
}

impl<T: ?Sized> DualSpaceHandle<T> {
    /// A handle that owns nothing.
    pub const fn empty() -> Self {
        Self { inner: None }
    }

    pub(crate) fn from_parts(table: Arc<HandleTable<T>>, key: SlotKey) -> Self {
        Self {
            inner: Some((table, key)),
        }
    }

    /// Returns `true` if the handle owns nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Table slot key, if any.
    pub fn key(&self) -> Option<SlotKey> {
        self.inner.as_ref().map(|(_, key)| *key)
    }

    fn slot(&self) -> Result<(&HandleTable<T>, SlotKey)> {
        match &self.inner {
            Some((table, key)) => Ok((&**table, *key)),
            None => Err(Error::EmptyHandle),
        }
    }

    fn state(&self) -> Result<MappedRwLockReadGuard<'_, SlotState<T>>> {
        let (table, key) = self.slot()?;
        table.read(key).ok_or(Error::StaleHandle)
    }

    fn state_mut(&self) -> Result<MappedRwLockWriteGuard<'_, SlotState<T>>> {
        let (table, key) = self.slot()?;
        table.write(key).ok_or(Error::StaleHandle)
    }

    /// Space whose representation [`get`](Self::get) resolves to.
    ///
    /// [`ExecutionSpace::None`] for an empty handle.
    pub fn active_space(&self) -> ExecutionSpace {
        self.state()
            .map(|state| state.active)
            .unwrap_or(ExecutionSpace::None)
    }

    /// Number of live handles sharing the object; zero when empty.
    pub fn ref_count(&self) -> usize {
        self.state()
            .map(|state| state.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Returns `true` if a representation exists in `space`.
    pub fn has_representation(&self, space: ExecutionSpace) -> bool {
        self.state()
            .map(|state| state.representation(space).is_some())
            .unwrap_or(false)
    }

    /// The active-space representation.
    pub fn get(&self) -> Result<MappedRwLockReadGuard<'_, T>> {
        let state = self.state()?;
        let active = state.active;
        Self::map_representation(state, active)
    }

    /// The representation in `space`.
    pub fn get_in(&self, space: ExecutionSpace) -> Result<MappedRwLockReadGuard<'_, T>> {
        let state = self.state()?;
        Self::map_representation(state, space)
    }

    fn map_representation<'a>(
        state: MappedRwLockReadGuard<'a, SlotState<T>>,
        space: ExecutionSpace,
    ) -> Result<MappedRwLockReadGuard<'a, T>> {
        MappedRwLockReadGuard::try_map(state, |state| state.representation(space))
            .map_err(|_| Error::MissingRepresentation(space))
    }

    /// Mutable access to the active-space representation.
    ///
    /// Marks the object diverged: the other representation is now out of date.
    pub fn get_mut(&self) -> Result<MappedRwLockWriteGuard<'_, T>> {
        let mut state = self.state_mut()?;
        let active = state.active;
        if state.representation(active).is_none() {
            return Err(Error::MissingRepresentation(active));
        }
        state.diverged = true;
        MappedRwLockWriteGuard::try_map(state, |state| state.representation_mut(active))
            .map_err(|_| Error::MissingRepresentation(active))
    }

    /// Returns `true` if the representations may hold different states.
    pub fn is_diverged(&self) -> bool {
        self.state().map(|state| state.diverged).unwrap_or(false)
    }

    /// Brings the inactive representation up to date with the active one.
    ///
    /// `sync` receives the active representation and the one to update. The
    /// device is synchronized afterwards and the divergence mark is cleared.
    pub fn reconcile<F>(&self, sync: F) -> Result<()>
    where
        F: FnOnce(&T, &mut T),
    {
        let (table, key) = self.slot()?;
        let mut guard = table.write(key).ok_or(Error::StaleHandle)?;
        let state = &mut *guard;

        let (source, target, stale) = match state.active {
            ExecutionSpace::Host => (
                state.host.as_deref(),
                state.device.as_deref_mut(),
                ExecutionSpace::Device,
            ),
            ExecutionSpace::Device => (
                state.device.as_deref(),
                state.host.as_deref_mut(),
                ExecutionSpace::Host,
            ),
            ExecutionSpace::None => return Err(Error::MissingRepresentation(ExecutionSpace::None)),
        };
        let source = source.ok_or(Error::MissingRepresentation(state.active))?;
        let target = target.ok_or(Error::MissingRepresentation(stale))?;

        sync(source, target);
        table.device().synchronize();
        state.diverged = false;
        Ok(())
    }

    /// Installs the lifecycle callback, replacing any previous one.
    pub fn set_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(Action, ExecutionSpace) -> bool + Send + Sync + 'static,
    {
        self.state_mut()?.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Hands a companion resource to the object; it is dropped at final release.
    pub fn adopt<C>(&self, companion: C) -> Result<()>
    where
        C: Any + Send + Sync,
    {
        self.state_mut()?.companions.push(Box::new(companion));
        Ok(())
    }

    /// Number of companion resources held.
    pub fn companions(&self) -> usize {
        self.state().map(|state| state.companions.len()).unwrap_or(0)
    }

    /// Makes the representation in `to` the active one.
    ///
    /// The callback sees `(Move, to)` first and may perform the migration
    /// itself. Either way the device is synchronized before the switch.
    ///
    /// Fails with [`Error::Diverged`] when the object was mutated through
    /// [`get_mut`](Self::get_mut) and neither a custom move nor
    /// [`reconcile`](Self::reconcile) updated the target; the active space is
    /// left unchanged.
    pub fn migrate(&self, to: ExecutionSpace) -> Result<MigrationOutcome> {
        let (table, key) = self.slot()?;

        let mut callback = {
            let mut state = table.write(key).ok_or(Error::StaleHandle)?;
            if state.representation(to).is_none() {
                return Err(Error::MissingRepresentation(to));
            }
            if state.active == to {
                return Ok(MigrationOutcome::AlreadyActive);
            }
            state.callback.take()
        };

        // The table lock is released: the callback may use other handles.
        let custom = callback
            .as_mut()
            .map_or(false, |callback| callback(Action::Move, to));
        table.device().synchronize();

        let mut state = table.write(key).ok_or(Error::StaleHandle)?;
        if state.callback.is_none() {
            state.callback = callback;
        }
        let from = state.active;
        if state.diverged && !custom {
            drop(state);
            tracing::warn!(%from, %to, "refusing to migrate: target representation is out of date");
            return Err(Error::Diverged { from, to });
        }
        state.diverged = false;
        state.active = to;
        drop(state);

        tracing::debug!(%from, %to, custom, "handle migrated");
        Ok(if custom {
            MigrationOutcome::Custom
        } else {
            MigrationOutcome::Default
        })
    }

    /// Releases this reference; a second call is a no-op.
    ///
    /// The last release destroys the object (see the module docs for the
    /// order of events).
    pub fn free(&mut self) -> FreeOutcome {
        let Some((table, key)) = self.inner.take() else {
            return FreeOutcome::default();
        };

        match table.release(key) {
            Release::Stale => {
                tracing::warn!(index = key.index(), "released a stale handle");
                FreeOutcome::default()
            }
            Release::Shared(remaining) => FreeOutcome {
                remaining,
                ..FreeOutcome::default()
            },
            Release::Last(state) => destroy(state, table.device()),
        }
    }
}

fn destroy<T: ?Sized>(mut state: SlotState<T>, device: &Device) -> FreeOutcome {
    let mut order = state.order.clone();
    let both = state.host.is_some() && state.device.is_some();
    if both && device.is_busy() {
        order.sort_by_key(|space| *space != ExecutionSpace::Device);
    }

    let mut outcome = FreeOutcome {
        destroyed: true,
        ..FreeOutcome::default()
    };

    for space in order {
        let Some(representation) = state.take_representation(space) else {
            continue;
        };
        let custom = notify_free(&mut state.callback, space);
        drop(representation);
        if space == ExecutionSpace::Device {
            device.synchronize();
        }
        outcome.torn_down.push((
            space,
            if custom {
                Teardown::Custom
            } else {
                Teardown::Default
            },
        ));
    }

    outcome.custom_teardown = notify_free(&mut state.callback, ExecutionSpace::None);
    if !outcome.custom_teardown && !state.companions.is_empty() {
        tracing::debug!(
            companions = state.companions.len(),
            "default teardown of companion resources"
        );
    }
    state.companions.clear();

    tracing::debug!(order = ?outcome.order(), "handle destroyed");
    outcome
}

fn notify_free(callback: &mut Option<Callback>, space: ExecutionSpace) -> bool {
    callback
        .as_mut()
        .map_or(false, |callback| callback(Action::Free, space))
}

impl<T: ?Sized> Clone for DualSpaceHandle<T> {
    /// Shares the object; cloning a handle whose slot is gone yields an empty one.
    fn clone(&self) -> Self {
        match &self.inner {
            Some((table, key)) if table.retain(*key) => Self::from_parts(Arc::clone(table), *key),
            _ => Self::empty(),
        }
    }
}

impl<T: ?Sized> Default for DualSpaceHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Drop for DualSpaceHandle<T> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<T: ?Sized> fmt::Debug for DualSpaceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("DualSpaceHandle(empty)"),
            Some((_, key)) => f
                .debug_struct("DualSpaceHandle")
                .field("key", key)
                .field("active", &self.active_space())
                .field("refs", &self.ref_count())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Twins;

    impl SpaceBuilder<str> for Twins {
        fn build_host(&self) -> Result<Box<str>> {
            Ok(Box::from("on host"))
        }

        fn build_device(&self, _device: &Device) -> Result<Box<str>> {
            Ok(Box::from("on device"))
        }
    }

    struct Counts;

    impl SpaceBuilder<[i32]> for Counts {
        fn build_host(&self) -> Result<Box<[i32]>> {
            Ok(vec![1, 2].into_boxed_slice())
        }

        fn build_device(&self, _device: &Device) -> Result<Box<[i32]>> {
            Ok(vec![1, 2].into_boxed_slice())
        }
    }

    fn handle() -> DualSpaceHandle<str> {
        SafeFactory::new(Device::emulated())
            .try_make(&Twins)
            .unwrap()
    }

    #[test]
    fn test_empty_handle() {
        let mut empty = DualSpaceHandle::<str>::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.ref_count(), 0);
        assert_eq!(empty.active_space(), ExecutionSpace::None);
        assert_eq!(empty.get().err(), Some(Error::EmptyHandle));
        assert_eq!(empty.migrate(ExecutionSpace::Host), Err(Error::EmptyHandle));
        assert_eq!(empty.free(), FreeOutcome::default());
        assert!(empty.clone().is_empty());
    }

    #[test]
    fn test_get_follows_active_space() {
        let h = handle();
        assert_eq!(&*h.get().unwrap(), "on host");
        assert_eq!(&*h.get_in(ExecutionSpace::Device).unwrap(), "on device");
        assert_eq!(
            h.get_in(ExecutionSpace::None).err(),
            Some(Error::MissingRepresentation(ExecutionSpace::None))
        );

        assert_eq!(h.migrate(ExecutionSpace::Device), Ok(MigrationOutcome::Default));
        assert_eq!(&*h.get().unwrap(), "on device");
        assert_eq!(
            h.migrate(ExecutionSpace::Device),
            Ok(MigrationOutcome::AlreadyActive)
        );
    }

    #[test]
    fn test_mutation_blocks_default_migration_until_reconciled() {
        let h = SafeFactory::<[i32]>::new(Device::emulated())
            .try_make(&Counts)
            .unwrap();
        assert!(!h.is_diverged());

        h.get_mut().unwrap()[0] = 42;
        assert!(h.is_diverged());
        assert_eq!(
            h.migrate(ExecutionSpace::Device),
            Err(Error::Diverged {
                from: ExecutionSpace::Host,
                to: ExecutionSpace::Device,
            })
        );
        assert_eq!(h.active_space(), ExecutionSpace::Host);
        assert_eq!(h.get_in(ExecutionSpace::Device).unwrap()[0], 1);

        h.reconcile(|source, target| target.copy_from_slice(source))
            .unwrap();
        assert!(!h.is_diverged());
        assert_eq!(h.migrate(ExecutionSpace::Device), Ok(MigrationOutcome::Default));
        assert_eq!(&*h.get().unwrap(), &[42, 2]);
    }

    #[test]
    fn test_custom_move_clears_divergence() {
        let h = SafeFactory::<[i32]>::new(Device::emulated())
            .try_make(&Counts)
            .unwrap();
        h.set_callback(|action, _| action == Action::Move).unwrap();

        h.get_mut().unwrap()[1] = 7;
        assert_eq!(h.migrate(ExecutionSpace::Device), Ok(MigrationOutcome::Custom));
        assert!(!h.is_diverged());
    }

    #[test]
    fn test_readers_are_not_blocked_by_sharing_on_another_thread() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let factory = SafeFactory::<str>::new(Device::emulated());
        let first = factory.try_make(&Twins).unwrap();
        let second = factory.try_make(&Twins).unwrap();
        let third = factory.try_make(&Twins).unwrap();

        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let (read_tx, read_rx) = mpsc::channel();
        let (shared_tx, shared_rx) = mpsc::channel::<()>();

        let reading = first.clone();
        let reader = thread::spawn(move || {
            let held = reading.get().unwrap();
            let _ = ready_tx.send(());
            // The other thread clones, then queues an exclusive final release.
            thread::sleep(Duration::from_millis(50));
            let next = second.get().unwrap();
            let _ = read_tx.send((held.len(), next.len()));
        });

        let sharer = thread::spawn(move || {
            let _ = ready_rx.recv();
            let copy = first.clone();
            drop(copy);
            drop(first);
            drop(third);
            let _ = shared_tx.send(());
        });

        assert_eq!(read_rx.recv_timeout(Duration::from_secs(5)), Ok((7, 7)));
        assert_eq!(shared_rx.recv_timeout(Duration::from_secs(5)), Ok(()));
        reader.join().unwrap();
        sharer.join().unwrap();
        assert_eq!(factory.table().live(), 0);
    }

    #[test]
    fn test_clone_and_free_count_references() {
        let mut a = handle();
        let mut b = a.clone();
        assert_eq!(a.ref_count(), 2);

        let first = a.free();
        assert!(!first.destroyed);
        assert_eq!(first.remaining, 1);
        assert_eq!(a.free(), FreeOutcome::default());

        assert_eq!(&*b.get().unwrap(), "on host");
        assert!(b.free().destroyed);
    }

    #[test]
    fn test_callback_sees_move_then_frees() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        let mut h = handle();
        h.set_callback(move |action, space| {
            log.lock().push((action, space));
            action == Action::Move
        })
        .unwrap();

        assert_eq!(h.migrate(ExecutionSpace::Device), Ok(MigrationOutcome::Custom));
        let outcome = h.free();

        assert_eq!(
            *events.lock(),
            vec![
                (Action::Move, ExecutionSpace::Device),
                (Action::Free, ExecutionSpace::Host),
                (Action::Free, ExecutionSpace::Device),
                (Action::Free, ExecutionSpace::None),
            ]
        );
        assert_eq!(
            outcome.torn_down.as_slice(),
            &[
                (ExecutionSpace::Host, Teardown::Default),
                (ExecutionSpace::Device, Teardown::Default)
            ]
        );
        assert!(!outcome.custom_teardown);
    }

    #[test]
    fn test_companions_dropped_on_final_release() {
        let marker = Arc::new(());
        let mut h = handle();
        h.adopt(marker.clone()).unwrap();
        assert_eq!(h.companions(), 1);
        assert_eq!(Arc::strong_count(&marker), 2);

        h.free();
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_busy_device_is_destroyed_first() {
        let device = Device::emulated();
        let mut h = SafeFactory::<str>::new(device.clone())
            .try_make(&Twins)
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        device.launch(move || {
            let _ = rx.recv();
        });
        let release = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let _ = tx.send(());
        });

        let outcome = h.free();
        release.join().unwrap();

        assert_eq!(
            outcome.order().as_slice(),
            &[ExecutionSpace::Device, ExecutionSpace::Host]
        );
        assert_eq!(device.pending(), 0);
    }
}
