//! Building handles from per-space builders.

use std::sync::Arc;

use super::{DualSpaceHandle, HandleTable};
use crate::space::Device;
use crate::Result;

/// Produces the representation of an object in each execution space.
///
/// A builder that cannot produce the requested kind of object returns
/// [`Error::KindMismatch`](crate::Error::KindMismatch) (see
/// [`Error::kind_mismatch`](crate::Error::kind_mismatch)); the factory turns
/// any builder error into an empty handle.
pub trait SpaceBuilder<T: ?Sized> {
    /// Host-resident representation.
    fn build_host(&self) -> Result<Box<T>>;

    /// Device-resident representation on `device`.
    ///
    /// The factory synchronizes `device` after this returns.
    fn build_device(&self, device: &Device) -> Result<Box<T>>;
}

/// Builds [`DualSpaceHandle`]s that share one [`HandleTable`].
pub struct SafeFactory<T: ?Sized> {
    table: Arc<HandleTable<T>>,
}

impl<T: ?Sized> SafeFactory<T> {
    /// Creates a factory with a fresh table on `device`.
    pub fn new(device: Device) -> Self {
        Self::with_table(Arc::new(HandleTable::new(device)))
    }

    /// Creates a factory inserting into an existing table.
    pub fn with_table(table: Arc<HandleTable<T>>) -> Self {
        Self { table }
    }

    /// The backing table.
    pub fn table(&self) -> &Arc<HandleTable<T>> {
        &self.table
    }

    /// The device representations are built on.
    pub fn device(&self) -> &Device {
        self.table.device()
    }

    /// Builds a handle from `source`; never fails.
    ///
    /// `None` yields an empty handle. A builder error is logged and also
    /// yields an empty handle.
    pub fn make(&self, source: Option<&dyn SpaceBuilder<T>>) -> DualSpaceHandle<T> {
        let Some(source) = source else {
            return DualSpaceHandle::empty();
        };
        match self.try_make(source) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "factory produced an empty handle");
                DualSpaceHandle::empty()
            }
        }
    }

    /// Builds a handle from `source`, returning the builder's error.
    pub fn try_make<B>(&self, source: &B) -> Result<DualSpaceHandle<T>>
    where
        B: SpaceBuilder<T> + ?Sized,
    {
        let host = source.build_host()?;
        let device = self.device();
        let remote = source.build_device(device)?;
        device.synchronize();

        let key = self.table.insert(host, remote);
        tracing::debug!(index = key.index(), device = device.name(), "dual-space handle built");
        Ok(DualSpaceHandle::from_parts(Arc::clone(&self.table), key))
    }
}

impl<T: ?Sized> Clone for SafeFactory<T> {
    fn clone(&self) -> Self {
        Self::with_table(Arc::clone(&self.table))
    }
}

impl<T: ?Sized> Default for SafeFactory<T> {
    fn default() -> Self {
        Self::new(Device::default())
    }
}

impl<T: ?Sized> core::fmt::Debug for SafeFactory<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SafeFactory").field("table", &self.table).finish()
    }
}
