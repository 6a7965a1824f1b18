//! Growable circular buffer shared by one writer and one reader.
//!
//! The buffer never grows on its own: growth allocates, and the writer may be
//! running inside a signal handler. Callers check [`RingBuffer::free_space`]
//! and call [`RingBuffer::grow`] themselves at a point where allocating is
//! allowed.
//!
//! # Roles
//!
//! Every storage-touching method is `unsafe` and belongs to one role:
//!
//! - **writer**: `push_back`, `pop_back`, `back`, `replace_back`, `capacity`, `free_space`
//! - **reader**: `front`, `pop_front`
//! - **exclusive**: `push_front`, `grow` (the reader must not run concurrently)
//!
//! At any moment at most one thread acts as writer and one as reader. Only
//! [`RingBuffer::len`] is safe to call from anywhere.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer<T> {
    slots: UnsafeCell<*mut MaybeUninit<T>>,
    capacity: UnsafeCell<usize>,
    /// Index of the first element. Reader-owned.
    head: UnsafeCell<usize>,
    /// Index one past the last element. Writer-owned.
    tail: UnsafeCell<usize>,
    len: AtomicUsize,
}

// SAFETY: the role contract above serializes every access to each field;
// `len` is the only field both roles touch without coordination and it is atomic.
unsafe impl<T: Send> Send for RingBuffer<T> {}
// SAFETY: see `Send`.
unsafe impl<T: Send> Sync for RingBuffer<T> {}

fn allocate<T: Copy>(capacity: usize) -> *mut MaybeUninit<T> {
    let slots: Box<[MaybeUninit<T>]> = vec![MaybeUninit::uninit(); capacity].into_boxed_slice();
    Box::into_raw(slots).cast::<MaybeUninit<T>>()
}

/// # Safety
///
/// `slots` must come from [`allocate`] with the same `capacity` and must not be used afterwards.
unsafe fn release<T>(slots: *mut MaybeUninit<T>, capacity: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(slots, capacity)));
}

impl<T: Copy> RingBuffer<T> {
    /// Creates a buffer holding at least `capacity` elements.
    ///
    /// The capacity is rounded up to a power of two (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: UnsafeCell::new(allocate::<T>(capacity)),
            capacity: UnsafeCell::new(capacity),
            head: UnsafeCell::new(0),
            tail: UnsafeCell::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of stored elements. Safe from either role.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// Writer role, or reader role while holding off `grow`.
    pub unsafe fn capacity(&self) -> usize {
        *self.capacity.get()
    }

    /// # Safety
    ///
    /// Writer role.
    pub unsafe fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    unsafe fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        let mask = *self.capacity.get() - 1;
        (*self.slots.get()).add(index & mask)
    }

    /// Appends `value`.
    ///
    /// # Safety
    ///
    /// Writer role. The buffer must not be full.
    pub unsafe fn push_back(&self, value: T) {
        debug_assert!(self.free_space() > 0, "push into a full ring buffer");
        let tail = *self.tail.get();
        self.slot(tail).write(MaybeUninit::new(value));
        *self.tail.get() = tail.wrapping_add(1);
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Removes and returns the last element.
    ///
    /// # Safety
    ///
    /// Writer role. The reader must not be able to reach the last element.
    pub unsafe fn pop_back(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let tail = (*self.tail.get()).wrapping_sub(1);
        *self.tail.get() = tail;
        let value = self.slot(tail).read().assume_init();
        self.len.fetch_sub(1, Ordering::Release);
        Some(value)
    }

    /// # Safety
    ///
    /// Writer role.
    pub unsafe fn back(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let tail = (*self.tail.get()).wrapping_sub(1);
        Some(self.slot(tail).read().assume_init())
    }

    /// Overwrites the last element in place.
    ///
    /// # Safety
    ///
    /// Writer role. The buffer must not be empty and the reader must not be
    /// able to reach the last element.
    pub unsafe fn replace_back(&self, value: T) {
        debug_assert!(!self.is_empty(), "replace_back on an empty ring buffer");
        let tail = (*self.tail.get()).wrapping_sub(1);
        self.slot(tail).write(MaybeUninit::new(value));
    }

    /// # Safety
    ///
    /// Reader role.
    pub unsafe fn front(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        Some(self.slot(*self.head.get()).read().assume_init())
    }

    /// Removes and returns the first element.
    ///
    /// # Safety
    ///
    /// Reader role.
    pub unsafe fn pop_front(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let head = *self.head.get();
        let value = self.slot(head).read().assume_init();
        *self.head.get() = head.wrapping_add(1);
        self.len.fetch_sub(1, Ordering::Release);
        Some(value)
    }

    /// Prepends `value`.
    ///
    /// # Safety
    ///
    /// Exclusive access. The buffer must not be full.
    pub unsafe fn push_front(&self, value: T) {
        debug_assert!(self.free_space() > 0, "push into a full ring buffer");
        let head = (*self.head.get()).wrapping_sub(1);
        self.slot(head).write(MaybeUninit::new(value));
        *self.head.get() = head;
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Doubles the capacity, preserving element order.
    ///
    /// # Safety
    ///
    /// Exclusive access: called by the writer while the reader is held off.
    pub unsafe fn grow(&self) {
        let old_capacity = *self.capacity.get();
        let new_capacity = old_capacity * 2;
        let new_slots = allocate::<T>(new_capacity);

        let len = self.len();
        let head = *self.head.get();
        for offset in 0..len {
            new_slots.add(offset).write(self.slot(head.wrapping_add(offset)).read());
        }

        release(*self.slots.get(), old_capacity);
        *self.slots.get() = new_slots;
        *self.capacity.get() = new_capacity;
        *self.head.get() = 0;
        *self.tail.get() = len;
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out every other role; the storage came
        // from `allocate` with the current capacity. `T: Copy` in every
        // constructor, so elements need no drop.
        unsafe { release(*self.slots.get_mut(), *self.capacity.get_mut()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // All tests run on one thread, which trivially owns every role.

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let buffer = RingBuffer::<u32>::with_capacity(100);
        assert_eq!(unsafe { buffer.capacity() }, 128);
        let buffer = RingBuffer::<u32>::with_capacity(0);
        assert_eq!(unsafe { buffer.capacity() }, 1);
    }

    #[test]
    fn test_push_pop_both_ends() {
        let buffer = RingBuffer::with_capacity(4);
        unsafe {
            buffer.push_back(2);
            buffer.push_back(3);
            buffer.push_front(1);
            assert_eq!(buffer.len(), 3);
            assert_eq!(buffer.front(), Some(1));
            assert_eq!(buffer.back(), Some(3));
            assert_eq!(buffer.pop_back(), Some(3));
            assert_eq!(buffer.pop_front(), Some(1));
            assert_eq!(buffer.pop_front(), Some(2));
            assert_eq!(buffer.pop_front(), None);
            assert_eq!(buffer.pop_back(), None);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_indices_wrap_around() {
        let buffer = RingBuffer::with_capacity(4);
        unsafe {
            for round in 0..10 {
                buffer.push_back(round);
                buffer.push_back(round + 100);
                assert_eq!(buffer.pop_front(), Some(round));
                assert_eq!(buffer.pop_front(), Some(round + 100));
            }
            assert_eq!(buffer.free_space(), 4);
        }
    }

    #[test]
    fn test_replace_back_rewrites_tail_only() {
        let buffer = RingBuffer::with_capacity(2);
        unsafe {
            buffer.push_back('a');
            buffer.push_back('b');
            buffer.replace_back('c');
            assert_eq!(buffer.pop_front(), Some('a'));
            assert_eq!(buffer.pop_front(), Some('c'));
        }
    }

    #[test]
    fn test_grow_preserves_order_of_wrapped_contents() {
        let buffer = RingBuffer::with_capacity(4);
        unsafe {
            buffer.push_back(0);
            buffer.push_back(1);
            buffer.pop_front();
            buffer.pop_front();
            for value in 10..14 {
                buffer.push_back(value);
            }
            assert_eq!(buffer.free_space(), 0);

            buffer.grow();
            assert_eq!(buffer.capacity(), 8);
            assert_eq!(buffer.free_space(), 4);
            buffer.push_back(14);

            let drained: Vec<i32> = std::iter::from_fn(|| buffer.pop_front()).collect();
            assert_eq!(drained, vec![10, 11, 12, 13, 14]);
        }
    }
}
