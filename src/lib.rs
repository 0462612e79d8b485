//! Sharing-optimized copy-on-write UTF-8 strings.
//!
//! `stringcow` provides a single string value type, [`CowString`], that selects one of three storage
//! strategies based on where its bytes come from and how many there are, and moves between them on
//! demand:
//!
//! - **small**: up to 31 content bytes live inline in the value itself, with no allocation;
//! - **literal**: the value borrows caller-owned immortal bytes (see [`CowString::from_static`] and
//!   the [`literal!`] macro) and never allocates until mutated;
//! - **dynamic**: the bytes live in a reference-counted heap buffer. Cloning a dynamic string
//!   shares the buffer, and the first mutation through any holder reallocates a private copy, so
//!   mutations are never observable through sibling values (copy-on-write).
//!
//! Every representation keeps its bytes NUL-terminated, and the value caches its code-point count
//! for the heap-backed representations so that repeated [`char_count`](CowString::char_count) calls
//! do not rescan the bytes.
//!
//! `CowString` dereferences to `&str`, so the usual read-only string machinery (comparison,
//! hashing, formatting) works directly on it.
//!
//! Sharing is strictly single-threaded: the buffer's reference count is a plain [`Cell`], which is
//! what keeps `CowString` (intentionally) `!Send` and `!Sync`.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(not(all(target_pointer_width = "64", target_endian = "little")))]
compile_error!("stringcow requires a 64-bit little-endian target: the mode tag lives in the most significant byte of the cache word");

use std::{
    borrow::Borrow, cell::Cell, cmp, fmt, hash, mem::ManuallyDrop, ops::Deref, ptr, slice::from_raw_parts,
    str::from_utf8_unchecked,
};

use serde::Serialize;

pub mod character;
pub use self::character::Character;

mod buffer;
use self::buffer::{OwnedBuffer, SharedBuffer};

mod introspect;
pub use self::introspect::{Introspection, Mode};

/// Size of the string value, and therefore of the inline buffer: the three representations are
/// padded to the size of the largest one.
const SMALL_CAPACITY: usize = std::mem::size_of::<DynamicRepr>();

/// Index of the byte holding the mode tag (and, in small mode, the remaining free space).
const TAG_BYTE_IDX: usize = SMALL_CAPACITY - 1;

const TAG_MASK: u64 = 3 << 62;
const TAG_SMALL: u64 = 0;
const TAG_LITERAL: u64 = 1 << 62;
const TAG_DYNAMIC: u64 = 2 << 62;

/// Floor for the first heap allocation, so that leaving small mode buys a usefully larger buffer.
const DYNAMIC_CAPACITY_FLOOR: usize = SMALL_CAPACITY * 2;

/// Longest appended run that is recounted to keep a valid code-point cache current, rather than
/// marking the cache stale.
const APPEND_RECOUNT_LIMIT: usize = 64;

/// Cached code-point count sharing its word with the mode tag.
///
/// The top two bits are the mode tag and are preserved by every store; the low 62 bits hold the
/// count. A stored count of zero means "stale, recount on demand" whenever the string holds more
/// than its terminator, and "known to be zero" otherwise.
#[repr(transparent)]
struct CodePointCache(Cell<u64>);

impl CodePointCache {
    fn new(tag: u64, count: u64) -> Self {
        Self(Cell::new(tag | (count & !TAG_MASK)))
    }

    fn get(&self) -> u64 {
        self.0.get() & !TAG_MASK
    }

    fn set(&self, count: u64) {
        // The tag bits are what marks the representation as dynamic or literal; cache stores must
        // leave them alone.
        let tag = self.0.get() & TAG_MASK;
        self.0.set(tag | (count & !TAG_MASK));
    }
}

/// Inline storage: the whole value is the byte buffer.
///
/// `data[31]` carries the mode tag in its top two bits (`00` for small) and the number of unused
/// bytes in its low six bits. At full occupancy the free count is zero, so the tag byte doubles as
/// the terminator.
#[repr(C)]
#[derive(Clone, Copy)]
struct SmallRepr {
    data: [u8; SMALL_CAPACITY],
}

/// Heap storage: a handle to a reference-counted buffer plus byte accounting.
///
/// Whether the string is "owned" or "shared" is not stored anywhere; it is read off the buffer's
/// reference count on demand.
#[repr(C)]
struct DynamicRepr {
    buffer: SharedBuffer, // Field one.
    capacity: usize,      // Field two.
    used: usize,          // Field three.
    meta: CodePointCache, // Field four.
}

/// Borrowed storage: a pointer to caller-owned immortal bytes, never written through.
#[repr(C)]
struct LiteralRepr {
    ptr: *const u8,       // Field one.
    capacity: usize,      // Field two, always zero.
    used: usize,          // Field three.
    meta: CodePointCache, // Field four.
}

/// View used to read the mode tag without knowing the active representation.
#[repr(C)]
struct DiscriminantRepr {
    _ptr: usize,
    _capacity: usize,
    _used: usize,
    meta: Cell<u64>,
}

/// The core storage for all string representations.
///
/// ## Invariants
///
/// This code depends on a number of invariants in order to work correctly:
///
/// 1. Only used on 64-bit little-endian platforms, so the top two bits of the `meta` word are the
///    top two bits of the value's final byte.
/// 2. Every representation is exactly [`SMALL_CAPACITY`] bytes, with the `meta`/tag word last.
/// 3. A small string uses at most all [`SMALL_CAPACITY`] bytes including its terminator, so the
///    free count in the tag byte fits in six bits and the tag bits read as `00`.
/// 4. The dynamic and literal representations keep their tag bits (`10` and `01`) intact across
///    every cache store, which [`CodePointCache::set`] guarantees.
/// 5. The dynamic representation's buffer handle is always valid: buffers are allocated and filled
///    before the representation is written.
/// 6. The literal representation's pointer addresses `used` immortal bytes whose final byte is the
///    terminator, and is never written through.
#[repr(C)]
union Inner {
    small: SmallRepr,
    dynamic: ManuallyDrop<DynamicRepr>,
    literal: ManuallyDrop<LiteralRepr>,
    discriminant: ManuallyDrop<DiscriminantRepr>,
}

impl Inner {
    /// Creates an empty small-mode value: one terminator byte in use.
    const fn small_empty() -> Self {
        let mut data = [0; SMALL_CAPACITY];
        data[TAG_BYTE_IDX] = (SMALL_CAPACITY - 1) as u8;
        Self {
            small: SmallRepr { data },
        }
    }

    /// Creates a small-mode value holding `content` plus a terminator.
    fn small(content: &[u8]) -> Self {
        debug_assert!(
            content.len() < SMALL_CAPACITY,
            "content does not leave room for the terminator"
        );

        let used = content.len() + 1;
        let mut data = [0; SMALL_CAPACITY];
        data[..content.len()].copy_from_slice(content);

        // The terminator is already in place from the zero fill.
        data[TAG_BYTE_IDX] = (SMALL_CAPACITY - used) as u8;

        Self {
            small: SmallRepr { data },
        }
    }

    fn dynamic(buffer: SharedBuffer, capacity: usize, used: usize, code_points: u64) -> Self {
        debug_assert_eq!(capacity, buffer.capacity(), "capacity field must match the buffer allocation");

        Self {
            dynamic: ManuallyDrop::new(DynamicRepr {
                buffer,
                capacity,
                used,
                meta: CodePointCache::new(TAG_DYNAMIC, code_points),
            }),
        }
    }

    fn literal(ptr: *const u8, used: usize) -> Self {
        Self {
            literal: ManuallyDrop::new(LiteralRepr {
                ptr,
                capacity: 0,
                used,
                meta: CodePointCache::new(TAG_LITERAL, 0),
            }),
        }
    }
}

/// A UTF-8 string value with three storage strategies and copy-on-write sharing.
///
/// See the [crate documentation](crate) for an overview of the storage model. The short version:
///
/// - construction from `&str` (or `String`) stores up to 31 content bytes inline and anything
///   longer in a freshly allocated heap buffer;
/// - [`from_static`](Self::from_static) (usually via [`literal!`]) borrows terminated immortal
///   bytes without copying;
/// - [`Clone`] is always cheap: inline bytes are copied, literal pointers are copied, and heap
///   buffers are shared by bumping a reference count;
/// - every mutating operation first makes sure the value exclusively owns a sufficiently large
///   heap buffer, so mutation is never visible through clones.
///
/// Byte accounting ([`buffer_size`](Self::buffer_size), [`buffer_capacity`](Self::buffer_capacity))
/// always includes the NUL terminator that every representation maintains;
/// [`char_count`](Self::char_count), [`char_at`](Self::char_at), and
/// [`set_char_at`](Self::set_char_at) work in code points.
pub struct CowString {
    inner: Inner,
}

impl CowString {
    /// Creates an empty `CowString`.
    ///
    /// This does not allocate; the value starts in small mode.
    pub const fn new() -> Self {
        Self {
            inner: Inner::small_empty(),
        }
    }

    /// Creates a `CowString` from a static string, borrowing its bytes when possible.
    ///
    /// Borrowing requires a terminator to live alongside the content, so only inputs whose final
    /// byte is NUL are eligible: for those, a value too large to store inline goes to literal
    /// mode, pointing directly at the caller's bytes and never allocating. The [`literal!`] macro
    /// appends the NUL for a plain string literal and is the intended way to call this.
    ///
    /// An input that does not end in NUL has nothing to borrow as a terminator and is copied,
    /// exactly as `From<&str>` would.
    pub fn from_static(s: &'static str) -> Self {
        let bytes = s.as_bytes();
        match bytes.split_last() {
            Some((0, content)) => {
                if bytes.len() <= SMALL_CAPACITY {
                    Self {
                        inner: Inner::small(content),
                    }
                } else {
                    Self {
                        inner: Inner::literal(bytes.as_ptr(), bytes.len()),
                    }
                }
            }
            _ => Self::copy_from_str(s),
        }
    }

    /// Copies `s` into inline storage if it fits, or a fresh heap buffer otherwise.
    fn copy_from_str(s: &str) -> Self {
        let used = s.len() + 1;
        if used <= SMALL_CAPACITY {
            return Self {
                inner: Inner::small(s.as_bytes()),
            };
        }

        let capacity = cmp::max(DYNAMIC_CAPACITY_FLOOR, used);
        let mut buffer = OwnedBuffer::allocate(capacity);

        // SAFETY: `capacity >= used == s.len() + 1`, so both the content and the terminator are in
        // bounds.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), buffer.as_mut_ptr(), s.len());
            buffer.as_mut_ptr().add(s.len()).write(0);
        }

        Self {
            inner: Inner::dynamic(buffer.into_shared(), capacity, used, 0),
        }
    }

    /// Returns a read-only view of this string's storage internals.
    ///
    /// Intended for tests and diagnostics; inspecting a string never causes a representation
    /// transition.
    pub fn introspect(&self) -> Introspection<'_> {
        Introspection::new(self)
    }

    /// Returns the capacity of this string's buffer, in bytes.
    ///
    /// Small strings report the inline size, literal strings report zero (their storage is not
    /// writable, so it has no usable capacity), and dynamic strings report their heap buffer's
    /// size.
    pub fn buffer_capacity(&self) -> usize {
        if self.is_small() {
            SMALL_CAPACITY
        } else if self.is_literal() {
            self.literal().capacity
        } else {
            self.dynamic().capacity
        }
    }

    /// Returns the number of bytes in use, including the NUL terminator.
    pub fn buffer_size(&self) -> usize {
        if self.is_small() {
            SMALL_CAPACITY - self.small().data[TAG_BYTE_IDX] as usize
        } else if self.is_literal() {
            self.literal().used
        } else {
            self.dynamic().used
        }
    }

    /// Returns the number of code points in this string.
    ///
    /// Literal and dynamic strings cache the count, computing it on first use and keeping it
    /// current across appends where that is cheap; small strings simply recount on every call.
    pub fn char_count(&self) -> usize {
        match self.code_point_cache() {
            None => character::count_code_points(self.content_bytes()),
            Some(cache) => {
                // A zero cache on a non-empty string means the count is stale.
                if cache.get() == 0 && self.buffer_size() > 1 {
                    cache.set(character::count_code_points(self.content_bytes()) as u64);
                }
                cache.get() as usize
            }
        }
    }

    /// Returns the code point at index `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= self.char_count()`.
    pub fn char_at(&self, idx: usize) -> Character {
        let content = self.content_bytes();
        match character::code_point_offset(content, idx) {
            Some(offset) => Character::from_utf8_prefix(&content[offset..]),
            None => panic!("character index {idx} out of bounds"),
        }
    }

    /// Returns this string's content as `&str`, terminator excluded.
    pub fn as_str(&self) -> &str {
        // SAFETY: Every byte stored in a `CowString` originates from `&str` or `char` input, so
        // the content is always valid UTF-8.
        unsafe { from_utf8_unchecked(self.content_bytes()) }
    }

    /// Returns every byte in use, including the NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        // SAFETY: `buffer_ptr` and `buffer_size` always describe a live, initialized region, for
        // every representation.
        unsafe { from_raw_parts(self.buffer_ptr(), self.buffer_size()) }
    }

    /// Returns `true` if this string holds no content bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer_size() <= 1
    }

    /// Appends another string's content to this one.
    pub fn append(&mut self, other: &CowString) -> &mut Self {
        // Precompute the resulting count when that is cheap: a small operand counts on demand,
        // anything else needs a valid cache on its side.
        let can_precompute = (other.is_small() && self.has_cached_code_points())
            || (other.has_cached_code_points() && self.is_small())
            || (other.has_cached_code_points() && self.has_cached_code_points());

        let mut new_count = 0;
        if can_precompute {
            new_count = self.char_count() + other.char_count();

            // Clear the cache so append_bytes does not account on top of the precomputed total.
            self.reset_code_point_cache();
        }

        self.append_bytes(other.content_bytes());

        if !self.is_small() {
            self.dynamic().meta.set(new_count as u64);
        }

        self
    }

    /// Appends string slice content to this string.
    pub fn append_str(&mut self, s: &str) -> &mut Self {
        let num_bytes = s.len();
        let num_code_points = character::count_code_points(s.as_bytes());

        // Precompute when the cache is valid, and also when this append pushes a small string
        // onto the heap, where the count would otherwise start out stale.
        let mut new_count = 0;
        let can_precompute =
            self.has_cached_code_points() || (self.is_small() && self.buffer_size() + num_bytes > SMALL_CAPACITY);
        if can_precompute {
            new_count = self.char_count() + num_code_points;
            self.reset_code_point_cache();
        }

        self.append_bytes(s.as_bytes());

        if !self.is_small() {
            self.dynamic().meta.set(new_count as u64);
        }

        self
    }

    /// Appends a single code point to this string.
    pub fn append_char(&mut self, c: Character) -> &mut Self {
        self.append_bytes(c.bytes());
        self
    }

    /// Appends another string by value, stealing its buffer when that avoids copying the larger
    /// of the two byte runs.
    ///
    /// Stealing pays off only when `other` exclusively owns a buffer that already has room for
    /// the combined content, and this value either has no owned buffer of its own, or its buffer
    /// is too small, or the incoming buffer has meaningfully more spare room. In every other case
    /// this behaves exactly like [`append`](Self::append).
    pub fn append_owned(&mut self, other: CowString) -> &mut Self {
        let self_used = self.buffer_size();
        let other_used = other.buffer_size();
        let combined = self_used - 1 + other_used;

        let steal = other.mode() == Mode::Owned
            && other.buffer_capacity() >= combined
            && (self.mode() != Mode::Owned
                || self.buffer_capacity() < combined
                || other.buffer_capacity().saturating_sub(self.buffer_capacity()) > self_used);
        if !steal {
            return self.append(&other);
        }

        // Compute the resulting count before any state is torn down.
        let new_count = if (self.is_small() || self.has_cached_code_points()) && other.has_cached_code_points() {
            (self.char_count() + other.char_count()) as u64
        } else {
            0
        };

        // Dismantle `other` without running its destructor; its buffer handle moves into this
        // value.
        let other = ManuallyDrop::new(other);

        // SAFETY: `other` is dynamic (its mode was Owned above) and its destructor will not run,
        // so the representation read here is the sole owner of the handle.
        let repr = unsafe { ptr::read(&*other.inner.dynamic) };
        let mut stolen = repr
            .buffer
            .try_take_unique()
            .ok()
            .expect("owned mode implies a unique buffer handle");
        let stolen_capacity = stolen.capacity();

        if self_used > 1 {
            // Slide the stolen content right to make room, then lay this value's content bytes in
            // front of it. The slide overlaps itself; the front copy cannot overlap, since this
            // value's bytes live elsewhere.
            //
            // SAFETY: `stolen_capacity >= combined`, so both regions are in bounds.
            unsafe {
                let base = stolen.as_mut_ptr();
                ptr::copy(base, base.add(self_used - 1), other_used);
                ptr::copy_nonoverlapping(self.buffer_ptr(), base, self_used - 1);
            }
        }

        // Release whatever this value held, then adopt the stolen buffer.
        if self.is_dynamic() {
            // SAFETY: The dynamic representation is active and is dropped exactly once, right
            // before being overwritten.
            unsafe { ManuallyDrop::drop(&mut self.inner.dynamic) };
        }
        self.inner = Inner::dynamic(stolen.into_shared(), stolen_capacity, combined, new_count);

        self
    }

    /// Replaces the code point at index `idx`, shifting the tail when the replacement has a
    /// different encoded width.
    ///
    /// The value transitions to an exclusively owned heap buffer first, so the replacement is
    /// never visible through clones. The code-point count is unchanged by construction, so a
    /// valid cache stays valid.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= self.char_count()`.
    pub fn set_char_at(&mut self, idx: usize, c: Character) {
        let used = self.buffer_size();
        let offset = match character::code_point_offset(self.content_bytes(), idx) {
            Some(offset) => offset,
            None => panic!("character index {idx} out of bounds"),
        };

        let old_width = Character::byte_length_from_leading_byte(self.as_bytes_with_nul()[offset]);
        let new_width = c.byte_count();

        // The replacement must land in an owned buffer with room for any widening. The buffer
        // pointer is resolved afterwards, since this may have reallocated.
        self.ensure_owned_capacity(used - old_width + new_width);

        let dynamic = self.dynamic_mut();

        // Bytes after the old code point, terminator included.
        let tail_len = used - offset - old_width;

        // SAFETY: The buffer is uniquely owned with `capacity >= used - old_width + new_width`,
        // so the shifted tail and the written code point are in bounds; the tail shifts overlap
        // themselves and use `ptr::copy`.
        unsafe {
            let pos = dynamic.buffer.as_mut_ptr().add(offset);
            if new_width > old_width {
                ptr::copy(pos.add(old_width), pos.add(new_width), tail_len);
            }
            ptr::copy_nonoverlapping(c.bytes().as_ptr(), pos, new_width);
            if new_width < old_width {
                ptr::copy(pos.add(old_width), pos.add(new_width), tail_len);
            }
        }

        dynamic.used = used - old_width + new_width;
    }

    /// Forces this string into an exclusively owned heap buffer of at least `num_bytes` capacity.
    ///
    /// `num_bytes` is a total, terminator included, not an addition to the current size. Calling
    /// this with zero on a shared or literal string is the idiom for forcing a private copy
    /// without growing it.
    pub fn reserve(&mut self, num_bytes: usize) {
        if self.buffer_capacity() < num_bytes || self.is_shared() || self.is_literal() {
            self.ensure_owned_capacity(num_bytes);
        }
    }

    fn tag(&self) -> u64 {
        // SAFETY: Every representation keeps the tag bits of its final word valid (invariants 3
        // and 4 on `Inner`), and the discriminant view reads that word through the same interior
        // mutability the cache stores use.
        unsafe { self.inner.discriminant.meta.get() & TAG_MASK }
    }

    pub(crate) fn is_small(&self) -> bool {
        self.tag() == TAG_SMALL
    }

    pub(crate) fn is_literal(&self) -> bool {
        self.tag() == TAG_LITERAL
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.tag() == TAG_DYNAMIC
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.is_dynamic() && self.dynamic().buffer.ref_count() > 1
    }

    pub(crate) fn mode(&self) -> Mode {
        if self.is_small() {
            Mode::Small
        } else if self.is_literal() {
            Mode::Literal
        } else if self.is_shared() {
            Mode::Shared
        } else {
            Mode::Owned
        }
    }

    pub(crate) fn dynamic_capacity(&self) -> Option<usize> {
        self.is_dynamic().then(|| self.dynamic().capacity)
    }

    pub(crate) fn dynamic_used(&self) -> Option<usize> {
        self.is_dynamic().then(|| self.dynamic().used)
    }

    pub(crate) fn dynamic_ref_count(&self) -> Option<usize> {
        self.is_dynamic().then(|| self.dynamic().buffer.ref_count())
    }

    pub(crate) fn cached_char_count(&self) -> Option<u64> {
        self.code_point_cache().map(CodePointCache::get)
    }

    fn small(&self) -> &SmallRepr {
        debug_assert!(self.is_small());

        // SAFETY: The tag says the small representation is active.
        unsafe { &self.inner.small }
    }

    fn small_mut(&mut self) -> &mut SmallRepr {
        debug_assert!(self.is_small());

        // SAFETY: The tag says the small representation is active.
        unsafe { &mut self.inner.small }
    }

    fn dynamic(&self) -> &DynamicRepr {
        debug_assert!(self.is_dynamic());

        // SAFETY: The tag says the dynamic representation is active.
        unsafe { &self.inner.dynamic }
    }

    fn dynamic_mut(&mut self) -> &mut DynamicRepr {
        debug_assert!(self.is_dynamic());

        // SAFETY: The tag says the dynamic representation is active.
        unsafe { &mut self.inner.dynamic }
    }

    fn literal(&self) -> &LiteralRepr {
        debug_assert!(self.is_literal());

        // SAFETY: The tag says the literal representation is active.
        unsafe { &self.inner.literal }
    }

    fn buffer_ptr(&self) -> *const u8 {
        if self.is_small() {
            self.small().data.as_ptr()
        } else if self.is_literal() {
            self.literal().ptr
        } else {
            self.dynamic().buffer.as_ptr()
        }
    }

    /// Returns the content bytes, terminator excluded.
    fn content_bytes(&self) -> &[u8] {
        let bytes = self.as_bytes_with_nul();
        &bytes[..bytes.len() - 1]
    }

    fn code_point_cache(&self) -> Option<&CodePointCache> {
        if self.is_dynamic() {
            Some(&self.dynamic().meta)
        } else if self.is_literal() {
            Some(&self.literal().meta)
        } else {
            None
        }
    }

    fn has_cached_code_points(&self) -> bool {
        match self.code_point_cache() {
            Some(cache) => cache.get() != 0 || self.buffer_size() <= 1,
            None => false,
        }
    }

    fn reset_code_point_cache(&self) {
        if let Some(cache) = self.code_point_cache() {
            cache.set(0);
        }
    }

    /// Makes sure this value exclusively owns a heap buffer of at least `num_bytes` capacity,
    /// transitioning out of small or literal mode and reallocating shared or undersized buffers.
    fn ensure_owned_capacity(&mut self, num_bytes: usize) {
        if !self.is_dynamic() {
            self.grow_into_dynamic(num_bytes);
            return;
        }

        let cur_capacity = self.dynamic().capacity;
        let has_space = cur_capacity >= num_bytes;
        if !self.is_shared() && has_space {
            return;
        }

        // A shared buffer is replaced at its current capacity; an undersized one grows by
        // doubling, floored at twice the inline size.
        let new_capacity = if has_space {
            cur_capacity
        } else {
            cmp::max(cmp::max(cur_capacity * 2, num_bytes), DYNAMIC_CAPACITY_FLOOR)
        };

        let used = self.dynamic().used;
        let mut new_buffer = OwnedBuffer::allocate(new_capacity);

        // SAFETY: `used <= cur_capacity <= new_capacity`, and the regions cannot overlap since
        // one of them was just allocated.
        unsafe {
            ptr::copy_nonoverlapping(self.dynamic().buffer.as_ptr(), new_buffer.as_mut_ptr(), used);
        }

        let dynamic = self.dynamic_mut();
        let old_buffer = std::mem::replace(&mut dynamic.buffer, new_buffer.into_shared());
        dynamic.capacity = new_capacity;
        drop(old_buffer);
    }

    /// Moves a small or literal string into a freshly allocated, exclusively owned heap buffer.
    fn grow_into_dynamic(&mut self, num_bytes: usize) {
        debug_assert!(self.is_small() || self.is_literal());

        let used = self.buffer_size();

        // The clamp to `used` matters for narrowing edits, which can request less capacity than
        // the bytes currently stored.
        let new_capacity = cmp::max(cmp::max(DYNAMIC_CAPACITY_FLOOR, num_bytes), used);
        let mut buffer = OwnedBuffer::allocate(new_capacity);

        // SAFETY: `new_capacity >= used`, and the regions cannot overlap since the buffer was
        // just allocated.
        unsafe {
            ptr::copy_nonoverlapping(self.buffer_ptr(), buffer.as_mut_ptr(), used);
        }

        // Neither small nor literal owns heap state, so the old representation can be overwritten
        // wholesale. The fresh representation starts with a stale code-point cache.
        self.inner = Inner::dynamic(buffer.into_shared(), new_capacity, used, 0);
    }

    /// Appends raw content bytes, without a terminator of their own.
    fn append_bytes(&mut self, bytes: &[u8]) {
        let num_bytes = bytes.len();
        let capacity = self.buffer_capacity();
        let used = self.buffer_size();

        // Enough room left inside the value itself.
        if self.is_small() && used + num_bytes <= capacity {
            let data = &mut self.small_mut().data;
            data[used - 1..used - 1 + num_bytes].copy_from_slice(bytes);
            data[TAG_BYTE_IDX] = (SMALL_CAPACITY - used - num_bytes) as u8;
            data[used + num_bytes - 1] = 0;
            return;
        }

        self.ensure_owned_capacity(used + num_bytes);

        let dynamic = self.dynamic_mut();

        // SAFETY: The buffer is uniquely owned after `ensure_owned_capacity` with
        // `capacity >= used + num_bytes`, and `bytes` cannot alias it: a source slice borrows
        // either a different value or a previous buffer of this one, which a reallocation leaves
        // untouched.
        unsafe {
            let dst = dynamic.buffer.as_mut_ptr().add(used - 1);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, num_bytes);
            dst.add(num_bytes).write(0);
        }
        dynamic.used = used + num_bytes;

        // A short appended run keeps a valid cache current by recounting just the new bytes;
        // anything else marks the cache stale.
        if self.has_cached_code_points() && num_bytes <= APPEND_RECOUNT_LIMIT {
            let appended = character::count_code_points(bytes) as u64;
            let cache = &self.dynamic().meta;
            cache.set(cache.get() + appended);
        } else {
            self.reset_code_point_cache();
        }
    }
}

impl Drop for CowString {
    fn drop(&mut self) {
        if self.is_dynamic() {
            // SAFETY: The dynamic representation is active, and is dropped exactly once.
            unsafe { ManuallyDrop::drop(&mut self.inner.dynamic) };
        }
    }
}

impl Clone for CowString {
    fn clone(&self) -> Self {
        if self.is_small() {
            Self {
                inner: Inner { small: *self.small() },
            }
        } else if self.is_literal() {
            let literal = self.literal();
            Self {
                inner: Inner {
                    literal: ManuallyDrop::new(LiteralRepr {
                        ptr: literal.ptr,
                        capacity: literal.capacity,
                        used: literal.used,
                        meta: CodePointCache::new(TAG_LITERAL, literal.meta.get()),
                    }),
                },
            }
        } else {
            // Cloning the handle makes both values shared views of one buffer.
            let dynamic = self.dynamic();
            Self {
                inner: Inner::dynamic(dynamic.buffer.clone(), dynamic.capacity, dynamic.used, dynamic.meta.get()),
            }
        }
    }
}

impl Default for CowString {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for CowString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for CowString {
    fn borrow(&self) -> &str {
        self.deref()
    }
}

impl hash::Hash for CowString {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.deref().hash(state)
    }
}

impl PartialEq<str> for CowString {
    fn eq(&self, other: &str) -> bool {
        self.deref() == other
    }
}

impl PartialEq<&str> for CowString {
    fn eq(&self, other: &&str) -> bool {
        self.deref() == *other
    }
}

impl PartialEq<CowString> for CowString {
    fn eq(&self, other: &CowString) -> bool {
        self.deref() == other.deref()
    }
}

impl Eq for CowString {}

impl PartialOrd for CowString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CowString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deref().cmp(other.deref())
    }
}

impl Serialize for CowString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.deref())
    }
}

impl From<&str> for CowString {
    fn from(s: &str) -> Self {
        Self::copy_from_str(s)
    }
}

impl From<String> for CowString {
    fn from(s: String) -> Self {
        Self::copy_from_str(&s)
    }
}

impl fmt::Debug for CowString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl fmt::Display for CowString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// Builds a [`CowString`] from a string literal without copying it when it is too large to store
/// inline.
///
/// The macro appends the NUL terminator that borrowed storage needs and hands the result to
/// [`CowString::from_static`], so a short literal is stored inline and a long one borrows the
/// program's constant bytes for as long as the value lives.
///
/// ```
/// let s = stringcow::literal!("only short strings are copied into the value itself");
/// assert_eq!(s.buffer_capacity(), 0);
/// ```
#[macro_export]
macro_rules! literal {
    ($s:expr) => {
        $crate::CowString::from_static(::core::concat!($s, "\0"))
    };
}
