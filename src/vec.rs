use std::{
    fmt,
    marker::PhantomData,
    mem,
    ops::{Deref, DerefMut, Index, IndexMut},
    ptr::{self, NonNull},
    slice,
};

use crate::{CommitStrategy, DefaultStrategy, Reservation};

/// A growable array with a fixed ceiling whose storage is reserved from the OS up front and
/// committed as elements are appended.
///
/// The elements never move: the address returned by [`as_ptr`](ReservedVec::as_ptr) is stable for
/// the lifetime of the array, and references handed out by [`push`](ReservedVec::push) stay
/// valid until the array is [reset](ReservedVec::reset) or dropped.
///
/// Going past [`capacity`](ReservedVec::capacity) is a bug, not a reason to grow, so
/// [`push`](ReservedVec::push) panics instead.
///
/// ```
/// use resvec::ReservedVec;
///
/// let mut values = ReservedVec::<u64>::new(1 << 20);
/// let first = values.push(1) as *const u64;
/// values.push(2);
///
/// assert_eq!(values.len(), 2);
/// assert_eq!(values[0], 1);
/// assert_eq!(first, &values[0] as *const u64);
/// ```
pub struct ReservedVec<T, S: CommitStrategy = DefaultStrategy> {
    reservation: Reservation,
    strategy: S,
    capacity: usize,
    len: usize,
    _ty: PhantomData<T>,
}

// Safety: the array owns its elements and its reservation outright, and the fault trap state
// lives on whichever thread is appending.
unsafe impl<T: Send, S: CommitStrategy + Send> Send for ReservedVec<T, S> {}

impl<T> ReservedVec<T> {
    /// Reserves room for `capacity` elements using the [`DefaultStrategy`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity * size_of::<T>()` overflows or the address space can't be reserved.
    pub fn new(capacity: usize) -> Self {
        Self::with_strategy(capacity, DefaultStrategy::default())
    }
}

impl<T, S: CommitStrategy> ReservedVec<T, S> {
    /// Reserves room for `capacity` elements, committing them through `strategy`.
    ///
    /// A `capacity` of zero, or a zero-sized `T`, reserves nothing.
    ///
    /// # Panics
    ///
    /// Panics if `capacity * size_of::<T>()` overflows or the address space can't be reserved.
    pub fn with_strategy(capacity: usize, strategy: S) -> Self {
        let Some(bytes) = capacity.checked_mul(mem::size_of::<T>()) else {
            panic!(
                "Capacity of {capacity} elements of {} bytes overflows usize",
                mem::size_of::<T>()
            );
        };

        // Reservations are page aligned, which covers every sane alignment.
        assert!(
            mem::align_of::<T>() <= crate::page_size(),
            "Alignment of {} exceeds the page size",
            mem::align_of::<T>()
        );

        Self {
            reservation: Reservation::acquire(bytes, S::INITIAL_ACCESS),
            strategy,
            capacity,
            len: 0,
            _ty: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn as_ptr(&self) -> *const T {
        self.base().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.base().as_ptr()
    }

    fn base(&self) -> NonNull<T> {
        if self.reservation.is_empty() {
            NonNull::dangling()
        } else {
            self.reservation.base().cast()
        }
    }

    /// Appends `value` and returns a reference to it in its final location.
    ///
    /// # Panics
    ///
    /// Panics if the array is full.
    pub fn push(&mut self, value: T) -> &mut T {
        self.assert_not_full();
        unsafe { self.push_unchecked(value) }
    }

    /// Builds an element with `f` and appends it. If `f` panics, the array is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if the array is full. `f` is not called in that case.
    pub fn push_with(&mut self, f: impl FnOnce() -> T) -> &mut T {
        self.assert_not_full();
        unsafe { self.push_unchecked(f()) }
    }

    /// Appends `value`, or gives it back if the array is full.
    pub fn try_push(&mut self, value: T) -> Result<&mut T, T> {
        if self.is_full() {
            return Err(value);
        }
        Ok(unsafe { self.push_unchecked(value) })
    }

    fn assert_not_full(&self) {
        assert!(
            !self.is_full(),
            "ReservedVec capacity exceeded ({} elements)",
            self.capacity
        );
    }

    /// ## Safety
    ///
    /// The array must not be full.
    unsafe fn push_unchecked(&mut self, value: T) -> &mut T {
        let slot = NonNull::new_unchecked(self.base().as_ptr().add(self.len));
        if mem::size_of::<T>() == 0 {
            slot.as_ptr().write(value);
        } else {
            self.strategy.emplace(&self.reservation, slot, value);
        }

        // Only counted once it has actually been written.
        self.len += 1;
        &mut *slot.as_ptr()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.base().as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.base().as_ptr(), self.len) }
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn iter_mut(&mut self) -> slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }

    /// Drops every element and hands their physical memory back to the OS. The address space
    /// stays reserved and the next [`push`](ReservedVec::push) lands at index 0 again.
    pub fn reset(&mut self) {
        self.drop_elements();

        tracing::debug!(
            "Resetting ReservedVec at {:p} ({} bytes reserved)",
            self.reservation.base(),
            self.reservation.len()
        );
        self.strategy.invalidate(&self.reservation);
    }

    fn drop_elements(&mut self) {
        let len = mem::replace(&mut self.len, 0);
        if mem::needs_drop::<T>() {
            unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base().as_ptr(), len)) };
        }
    }

    /// Bytes of this array's reservation currently backed by physical memory.
    ///
    /// On Windows this counts committed rather than resident bytes.
    pub fn resident_bytes(&self) -> usize {
        self.reservation.resident_bytes()
    }
}

impl<T, S: CommitStrategy> Drop for ReservedVec<T, S> {
    fn drop(&mut self) {
        // The reservation itself is released right after, by its own destructor.
        self.drop_elements();
    }
}

impl<T, S: CommitStrategy> Index<usize> for ReservedVec<T, S> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(
            index < self.len,
            "ReservedVec index {index} out of bounds (len {})",
            self.len
        );
        &self.as_slice()[index]
    }
}

impl<T, S: CommitStrategy> IndexMut<usize> for ReservedVec<T, S> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(
            index < self.len,
            "ReservedVec index {index} out of bounds (len {})",
            self.len
        );
        &mut self.as_mut_slice()[index]
    }
}

impl<T, S: CommitStrategy> Deref for ReservedVec<T, S> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T, S: CommitStrategy> DerefMut for ReservedVec<T, S> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T, S: CommitStrategy> IntoIterator for &'a ReservedVec<T, S> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, S: CommitStrategy> IntoIterator for &'a mut ReservedVec<T, S> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T: fmt::Debug, S: CommitStrategy> fmt::Debug for ReservedVec<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedVec")
            .field("capacity", &self.capacity)
            .field("elements", &self.as_slice())
            .finish()
    }
}
