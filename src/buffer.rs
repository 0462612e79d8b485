//! Reference-counted byte buffers.
//!
//! A buffer is a single heap allocation: a small header holding the
//! reference count and capacity, followed directly by the data bytes. The
//! header is reachable from every handle, so sharing a buffer is a pointer
//! copy plus a counter increment.
//!
//! The counter is a plain [`Cell`]: buffers are only ever shared between
//! string values on one thread, and the raw-pointer handles keep both
//! handle types `!Send` and `!Sync`.

use std::{alloc::Layout, cell::Cell, ptr::NonNull};

const HEADER_LEN: usize = std::mem::size_of::<BufferHeader>();
const HEADER_ALIGN: usize = std::mem::align_of::<BufferHeader>();

/// Metadata in front of every buffer allocation.
struct BufferHeader {
    /// Number of live handles to this buffer. Always at least one.
    refs: Cell<usize>,

    /// Size of the data region, in bytes.
    capacity: usize,
}

/// Computes the layout of an allocation holding `capacity` data bytes
/// behind a `BufferHeader`.
const fn layout_for_capacity(capacity: usize) -> Layout {
    assert!(
        capacity <= isize::MAX as usize - HEADER_LEN,
        "capacity would overflow isize::MAX, which violates layout constraints"
    );

    // SAFETY: The size is non-zero (the header alone is non-zero) and does not overflow `isize::MAX` per the assert
    // above, and the alignment comes directly from `std::mem::align_of`.
    unsafe { Layout::from_size_align_unchecked(HEADER_LEN + capacity, HEADER_ALIGN) }
}

/// Returns a pointer to the data region behind `header`.
///
/// # Safety
///
/// `header` must point to a live buffer allocation.
unsafe fn data_ptr(header: NonNull<BufferHeader>) -> *mut u8 {
    // Skipping over the header while the pointer is still typed as `*mut BufferHeader` lands exactly at the start of
    // the data region.
    header.as_ptr().add(1).cast::<u8>()
}

/// Drops one reference to the buffer behind `header`, freeing the
/// allocation when the last reference goes away.
///
/// # Safety
///
/// `header` must point to a live buffer allocation, and the caller's handle
/// must be counted in `refs`.
unsafe fn release(header: NonNull<BufferHeader>) {
    let refs = header.as_ref().refs.get();
    debug_assert!(refs >= 1, "released a buffer with no live references");

    if refs == 1 {
        let layout = layout_for_capacity(header.as_ref().capacity);
        std::alloc::dealloc(header.as_ptr().cast::<u8>(), layout);
    } else {
        header.as_ref().refs.set(refs - 1);
    }
}

/// A uniquely-owned byte buffer.
///
/// Produced by [`allocate`](Self::allocate), and the only handle through
/// which the data region is freely writable. Converting into a
/// [`SharedBuffer`] gives up that exclusivity.
pub(crate) struct OwnedBuffer {
    header: NonNull<BufferHeader>,
}

impl OwnedBuffer {
    /// Allocates a new buffer with room for `capacity` data bytes.
    ///
    /// The data region is uninitialized. Allocation failure diverts through
    /// `std::alloc::handle_alloc_error`.
    pub fn allocate(capacity: usize) -> Self {
        let layout = layout_for_capacity(capacity);

        // SAFETY: `layout_for_capacity` never produces a zero-sized layout.
        let raw = unsafe { std::alloc::alloc(layout) };
        let header = match NonNull::new(raw.cast::<BufferHeader>()) {
            Some(header) => header,
            None => std::alloc::handle_alloc_error(layout),
        };

        // SAFETY: Freshly allocated and well-aligned for `BufferHeader`.
        unsafe {
            header.as_ptr().write(BufferHeader {
                refs: Cell::new(1),
                capacity,
            });
        }

        Self { header }
    }

    /// Returns the size of the data region, in bytes.
    pub fn capacity(&self) -> usize {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { self.header.as_ref().capacity }
    }

    /// Returns a mutable pointer to the data region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { data_ptr(self.header) }
    }

    /// Converts this handle into a shareable one.
    ///
    /// The reference count stays at one; the buffer simply becomes eligible
    /// for further sharing through `SharedBuffer::clone`.
    pub fn into_shared(self) -> SharedBuffer {
        let header = self.header;
        std::mem::forget(self);
        SharedBuffer { header }
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        // SAFETY: An `OwnedBuffer` is the sole handle, counted as the single reference.
        unsafe { release(self.header) }
    }
}

/// A shared handle to a reference-counted byte buffer.
///
/// Cloning increments the embedded counter; dropping decrements it and
/// frees the allocation when the count reaches zero. The data region is
/// readable through any handle, and writable only while the handle is
/// unique.
#[derive(Debug)]
pub(crate) struct SharedBuffer {
    header: NonNull<BufferHeader>,
}

impl SharedBuffer {
    /// Returns the size of the data region, in bytes.
    pub fn capacity(&self) -> usize {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { self.header.as_ref().capacity }
    }

    /// Returns the number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { self.header.as_ref().refs.get() }
    }

    /// Returns `true` if this is the only handle to the buffer.
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Returns a pointer to the data region.
    pub fn as_ptr(&self) -> *const u8 {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { data_ptr(self.header) }
    }

    /// Returns a mutable pointer to the data region.
    ///
    /// Callers must only write through the returned pointer while this
    /// handle is unique; a shared buffer is immutable.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        debug_assert!(self.is_unique(), "mutable access to a shared buffer");

        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        unsafe { data_ptr(self.header) }
    }

    /// Attempts to reclaim exclusive ownership of the buffer.
    ///
    /// Succeeds exactly when this is the last handle, handing back an
    /// [`OwnedBuffer`] without touching the allocation. Fails by returning
    /// the untouched shared handle.
    pub fn try_take_unique(self) -> Result<OwnedBuffer, SharedBuffer> {
        if self.is_unique() {
            let header = self.header;
            std::mem::forget(self);
            Ok(OwnedBuffer { header })
        } else {
            Err(self)
        }
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        // SAFETY: `self.header` points to a live allocation for as long as this handle exists.
        let header = unsafe { self.header.as_ref() };
        header.refs.set(header.refs.get() + 1);

        Self { header: self.header }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: This handle is counted as one reference.
        unsafe { release(self.header) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_sizes() {
        // Both handles are a bare pointer, so the string representations that embed them stay one machine word.
        assert_eq!(std::mem::size_of::<OwnedBuffer>(), std::mem::size_of::<usize>());
        assert_eq!(std::mem::size_of::<SharedBuffer>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn allocate_write_read() {
        let mut owned = OwnedBuffer::allocate(16);
        assert_eq!(owned.capacity(), 16);

        // SAFETY: The data region is 16 bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), owned.as_mut_ptr(), 5);
        }

        let shared = owned.into_shared();
        assert_eq!(shared.capacity(), 16);

        // SAFETY: The first five bytes were initialized above.
        let bytes = unsafe { std::slice::from_raw_parts(shared.as_ptr(), 5) };
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn clone_and_drop_track_references() {
        let shared = OwnedBuffer::allocate(8).into_shared();
        assert_eq!(shared.ref_count(), 1);
        assert!(shared.is_unique());

        let second = shared.clone();
        assert_eq!(shared.ref_count(), 2);
        assert_eq!(second.ref_count(), 2);
        assert!(!shared.is_unique());

        drop(second);
        assert_eq!(shared.ref_count(), 1);
        assert!(shared.is_unique());
    }

    #[test]
    fn take_unique_requires_last_handle() {
        let shared = OwnedBuffer::allocate(8).into_shared();
        let second = shared.clone();

        let shared = match shared.try_take_unique() {
            Ok(_) => panic!("took unique ownership of a shared buffer"),
            Err(shared) => shared,
        };
        assert_eq!(shared.ref_count(), 2);

        drop(second);

        let owned = shared.try_take_unique().expect("last handle should take ownership");
        assert_eq!(owned.capacity(), 8);
    }
}
