//! Instrumented Shared Array
//!
//! [`SharedArray`] is a fixed-length buffer that many workers may read and
//! write at once. Every element lives in its own `AtomicCell`, so concurrent
//! access is memory-safe while still exhibiting the lost updates and torn
//! read-modify-write sequences a race detector is meant to catch.
//!
//! # Layout
//!
//! ```text
//! SharedArray<T, A>
//! ├─ data:     Arc<[AtomicCell<T>]>   shared by every clone and capture
//! ├─ name:     Option<Arc<str>>       label used in reports
//! └─ accessor: A                      per-copy hook, bound to BufferId
//!                  │
//!                  └─ BufferId { addr, elem_size, len }
//! ```
//!
//! Cloning shares the data and copies the accessor. [`SharedArray::capture`]
//! is a clone that also notifies the accessor of region entry.

use core::fmt;
use core::mem;
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;

use crate::accessor::{Accessor, ContentReader, DefaultAccessor};
use crate::region::RegionContext;
use crate::{Error, Result};

/// Identity of a buffer: start address, element size and logical length.
///
/// Two arrays share an identity exactly when they share storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    /// Address of the first element
    pub addr: usize,
    /// Size of one element in bytes
    pub elem_size: usize,
    /// Number of elements
    pub len: usize,
}

impl BufferId {
    /// Builds an identity from its parts.
    pub const fn from_raw(addr: usize, elem_size: usize, len: usize) -> Self {
        Self {
            addr,
            elem_size,
            len,
        }
    }

    /// Identity of a slice.
    pub fn of<T>(slice: &[T]) -> Self {
        Self::from_raw(slice.as_ptr() as usize, mem::size_of::<T>(), slice.len())
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}

/// Concurrently mutable buffer whose element accesses pass through `A`.
///
/// # Type Parameters
///
/// - `T`: element type, copied in and out of its cell
/// - `A`: the [`Accessor`]; [`DefaultAccessor`] records nothing
///
/// # Example
///
/// ```rust
/// use twinspace::SharedArray;
///
/// let data = SharedArray::<u64>::from_vec(vec![1, 2, 3]);
/// let view = data.clone();
///
/// view.write(1, 20);
/// assert_eq!(data.read(1), 20);
/// assert_eq!(data.to_vec(), vec![1, 20, 3]);
/// ```
pub struct SharedArray<T, A = DefaultAccessor<T>> {
    data: Arc<[AtomicCell<T>]>,
    name: Option<Arc<str>>,
    accessor: A,
}

impl<T, A> SharedArray<T, A>
where
    T: Copy + PartialEq + Send + Sync + 'static,
    A: Accessor<T>,
{
    /// Creates an array of `len` default values.
    pub fn new(len: usize) -> Self
    where
        T: Default,
    {
        Self::filled(T::default(), len)
    }

    /// Creates an array of `len` copies of `value`.
    pub fn filled(value: T, len: usize) -> Self {
        Self::from_vec(vec![value; len])
    }

    /// Takes ownership of `values`.
    pub fn from_vec(values: Vec<T>) -> Self {
        Self::from_vec_with(values, A::default())
    }

    /// Takes ownership of `values` and installs a pre-configured accessor.
    pub fn from_vec_with(values: Vec<T>, mut accessor: A) -> Self {
        let data: Arc<[AtomicCell<T>]> = values.into_iter().map(AtomicCell::new).collect();
        accessor.bind(Self::identity(&data), None);
        Self {
            data,
            name: None,
            accessor,
        }
    }

    fn identity(data: &Arc<[AtomicCell<T>]>) -> BufferId {
        BufferId::of::<AtomicCell<T>>(data)
    }

    /// Labels the buffer in conflict reports.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        let id = self.id();
        self.accessor.bind(id, Some(Arc::clone(&name)));
        self.name = Some(name);
        self
    }

    /// Buffer label, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        Self::identity(&self.data)
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the array has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The installed accessor.
    pub fn accessor(&self) -> &A {
        &self.accessor
    }

    /// Reads element `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`, like slice indexing.
    #[inline]
    pub fn read(&self, index: usize) -> T {
        self.accessor.touch(index);
        self.data[index].load()
    }

    /// Writes element `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`, like slice indexing.
    #[inline]
    pub fn write(&self, index: usize, value: T) {
        self.accessor.touch(index);
        self.data[index].store(value);
    }

    /// Reads element `index`, failing instead of panicking when out of range.
    pub fn try_read(&self, index: usize) -> Result<T> {
        let cell = self.cell(index)?;
        self.accessor.touch(index);
        Ok(cell.load())
    }

    /// Writes element `index`, failing instead of panicking when out of range.
    pub fn try_write(&self, index: usize, value: T) -> Result<()> {
        let cell = self.cell(index)?;
        self.accessor.touch(index);
        cell.store(value);
        Ok(())
    }

    /// Replaces element `index` with `f(old)`.
    ///
    /// The load and the store are separate operations: two workers updating
    /// the same index concurrently can lose one update. Counts as one access.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn update<F>(&self, index: usize, f: F)
    where
        F: FnOnce(T) -> T,
    {
        self.accessor.touch(index);
        let cell = &self.data[index];
        cell.store(f(cell.load()));
    }

    /// Copies the contents out without touching the accessor.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.iter().map(AtomicCell::load).collect()
    }

    /// Out-of-place copy into `out`, element by element.
    ///
    /// A missing output buffer is reported and the copy is skipped; both sides
    /// record their accesses.
    pub fn copy_into<B>(&self, out: Option<&SharedArray<T, B>>) -> Result<()>
    where
        B: Accessor<T>,
    {
        let Some(out) = out else {
            tracing::warn!(buffer = %self.id(), "out-of-place copy without an output buffer; skipped");
            return Err(Error::MissingOutput);
        };
        if out.len() < self.len() {
            return Err(Error::OutOfBounds {
                index: self.len() - 1,
                len: out.len(),
            });
        }
        for index in 0..self.len() {
            out.write(index, self.read(index));
        }
        Ok(())
    }

    /// Copy of this array for use inside `region`.
    ///
    /// This is the entry notification: an instrumented accessor registers its
    /// snapshot and access log with the region here, once per buffer.
    pub fn capture(&self, region: &RegionContext) -> Self {
        let mut captured = self.clone();
        let contents = || -> ContentReader<T> {
            let data = Arc::clone(&self.data);
            Arc::new(move || data.iter().map(AtomicCell::load).collect())
        };
        captured.accessor.enter_region(region, &contents);
        captured
    }

    fn cell(&self, index: usize) -> Result<&AtomicCell<T>> {
        self.data.get(index).ok_or(Error::OutOfBounds {
            index,
            len: self.len(),
        })
    }
}

impl<T, A: Clone> Clone for SharedArray<T, A> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            name: self.name.clone(),
            accessor: self.accessor.clone(),
        }
    }
}

impl<T, A> fmt::Debug for SharedArray<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("addr", &format_args!("{:p}", self.data.as_ptr()))
            .field("len", &self.data.len())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{AccessorState, RaceConditionAccessor};
    use crate::region::worker::{self, WorkerId};
    use crate::space::ExecutionSpace;

    type Checked = SharedArray<i32, RaceConditionAccessor<i32>>;

    #[test]
    fn test_clones_share_identity_and_storage() {
        let a = SharedArray::<i32>::from_vec(vec![1, 2, 3]);
        let b = a.clone();
        b.write(0, 9);

        assert_eq!(a.id(), b.id());
        assert_eq!(a.read(0), 9);
        assert_ne!(a.id(), SharedArray::<i32>::new(3).id());
    }

    #[test]
    fn test_identity_covers_length_and_element_size() {
        let a = SharedArray::<u64>::new(5);
        let id = a.id();
        assert_eq!(id.len, 5);
        assert_eq!(id.elem_size, mem::size_of::<AtomicCell<u64>>());
    }

    #[test]
    fn test_checked_access_reports_out_of_bounds() {
        let a = SharedArray::<u8>::new(2);
        assert_eq!(a.try_read(2), Err(Error::OutOfBounds { index: 2, len: 2 }));
        assert!(a.try_write(1, 4).is_ok());
        assert_eq!(a.try_read(1), Ok(4));
    }

    #[test]
    #[should_panic]
    fn test_read_past_end_panics() {
        SharedArray::<u8>::new(2).read(2);
    }

    #[test]
    fn test_copy_into_requires_output() {
        let src = SharedArray::<i32>::from_vec(vec![1, 2]);
        assert_eq!(
            src.copy_into::<DefaultAccessor<i32>>(None),
            Err(Error::MissingOutput)
        );

        let dst = SharedArray::<i32>::new(2);
        src.copy_into(Some(&dst)).unwrap();
        assert_eq!(dst.to_vec(), vec![1, 2]);

        let short = SharedArray::<i32>::new(1);
        assert!(src.copy_into(Some(&short)).is_err());
    }

    #[test]
    fn test_name_reaches_accessor_and_reports() {
        let a: Checked = SharedArray::from_vec(vec![0; 2]).with_name("flux");
        assert_eq!(a.name(), Some("flux"));
        assert_eq!(a.accessor().state(), AccessorState::Bound);
    }

    #[test]
    fn test_capture_enters_region_once_per_buffer() {
        let region = RegionContext::parallel(ExecutionSpace::Host);
        let a: Checked = SharedArray::from_vec(vec![0; 4]);

        let first = a.capture(&region);
        let second = a.capture(&region);
        assert_eq!(first.accessor().state(), AccessorState::InRegion);
        assert_eq!(region.registry().len(), 1);

        {
            let _w = worker::enter(WorkerId(3));
            second.write(2, 1);
        }
        assert_eq!(
            first.accessor().log().unwrap().workers(2).as_slice(),
            &[WorkerId(3)]
        );
        assert_eq!(a.accessor().state(), AccessorState::Bound);
        region.finish();
    }

    #[test]
    fn test_capture_after_finish_does_not_register() {
        let region = RegionContext::parallel(ExecutionSpace::Host);
        region.finish();

        let a: Checked = SharedArray::from_vec(vec![0; 4]);
        let captured = a.capture(&region);
        assert_eq!(captured.accessor().state(), AccessorState::Bound);
        assert!(region.registry().is_empty());
    }
}
