//! Heap manager types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`HeapManager`](struct.HeapManager.html)
//!
//! A `HeapManager` is a single-threaded, non-thread-safe heap. It hands out
//! payloads from a [`BlockList`](../blocklist/struct.BlockList.html) of free
//! blocks using best fit, splits blocks to size, and coalesces neighbors on
//! free. When nothing fits it asks its `RegionProvider` for another extension
//! of a fixed size. It exposes the classic `malloc` family: `allocate`,
//! `free`, `resize` and `zero_allocate`, and records the outcome of the last
//! call in [`MallocErr`](enum.MallocErr.html).
//!
//! ### [`LockedHeap`](struct.LockedHeap.html)
//!
//! A `LockedHeap` wraps a `HeapManager` in a spin lock to make it thread-safe,
//! and implements `GlobalAlloc` on top of it.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! With the `use_libc` feature, `UnixAllocator` combines `LockedHeap` with
//! [`SbrkProvider`](struct.SbrkProvider.html) so it can be installed as the
//! global allocator.
//!
//! ### [`RegionProvider`](trait.RegionProvider.html)
//!
//! `RegionProvider` is a simple trait interface meant to abstract over the
//! calls to the OS to extend the heap.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed arena that can pretend to be the OS, and implements
//! `RegionProvider` for such a purpose. It is mainly useful for testing.
//!
//! ## Logging
//!
//! Free list operations are traced through the `log` facade. When a heap is
//! installed as the global allocator, the logger must not allocate, since log
//! calls happen with the heap locked.

use alloc::boxed::Box;
use alloc::vec;
use core::alloc::{GlobalAlloc, Layout};
#[cfg(feature = "use_libc")]
use core::convert::TryFrom;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;
use spin::{Mutex, MutexGuard};

use crate::blocklist::{Block, BlockList, Stats, Validity, ALIGNMENT, HEADER_SIZE};

/// Size of each extension requested from the `RegionProvider`, unless
/// configured otherwise.
pub const DEFAULT_EXTENSION_SIZE: usize = 2048;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Outcome of the last public heap operation, in the manner of `errno`.
///
/// Every operation clears it on entry; failures leave it set until the next
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocErr {
    NoError,
    /// The request was larger than a single extension can ever hold.
    SingleRequestTooLarge,
    /// The `RegionProvider` could not extend the heap.
    OutOfMemory,
}

impl Default for MallocErr {
    fn default() -> Self {
        MallocErr::NoError
    }
}

impl fmt::Display for MallocErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MallocErr::NoError => "no error",
            MallocErr::SingleRequestTooLarge => "request exceeds maximum single allocation size",
            MallocErr::OutOfMemory => "heap extension failed",
        };
        f.write_str(msg)
    }
}

pub trait RegionProvider {
    type Err: fmt::Debug;

    /// Extend the heap by exactly `size` bytes, returning the start of the
    /// new region.
    ///
    /// # Safety
    ///
    /// This is pretty much entirely unsafe.
    ///
    /// For this to function properly with the other types in this module, the
    /// returned region must be aligned to `ALIGNMENT`, and must be available
    /// and untracked by any other rust code, including the heap itself.
    /// Successive regions should have increasing addresses; regions that
    /// happen to be contiguous are merged.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// SbrkProvider moves the program break to extend the heap.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct SbrkProvider {
    // Just for tracking, not really needed
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkProvider {
    pub const fn new() -> Self {
        SbrkProvider { growths: 0 }
    }

    /// Number of times the break was successfully moved.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(feature = "use_libc")]
impl RegionProvider for SbrkProvider {
    type Err = Errno;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let increment = libc::c_int::try_from(size).map_err(|_| Errno(libc::ENOMEM))?;

        // The initial break isn't necessarily aligned, so pad up to the next
        // header boundary first.
        let brk = libc::sbrk(0);
        if brk as isize == -1 {
            return Err(errno::errno());
        }
        let misalignment = brk as usize % ALIGNMENT;
        if misalignment != 0 {
            let padding = (ALIGNMENT - misalignment) as libc::c_int;
            if libc::sbrk(padding as _) as isize == -1 {
                return Err(errno::errno());
            }
        }

        let ptr = libc::sbrk(increment as _);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }

        self.growths += 1;
        NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
    }
}

/// A heap, capable of extending itself, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Note: It never returns memory to the `RegionProvider`.
///
/// Requests are rounded up to a multiple of 16 bytes so that every header and
/// payload stays aligned. A request larger than one extension minus a header
/// can never be satisfied and is refused up front.
///
/// Finding a block, freeing one, and inserting into the free list are all
/// linear in the number of free blocks.
pub struct HeapManager<P> {
    provider: P,
    blocks: BlockList,
    errno: MallocErr,
    extension_size: usize,
    heap_size: usize,
    extensions: usize,
}

impl<P: RegionProvider + Default> Default for HeapManager<P> {
    fn default() -> Self {
        HeapManager::new(P::default())
    }
}

impl<P: RegionProvider> HeapManager<P> {
    /// Create a new `HeapManager` extending itself `DEFAULT_EXTENSION_SIZE`
    /// bytes at a time.
    pub const fn new(provider: P) -> Self {
        HeapManager::with_extension_size(provider, DEFAULT_EXTENSION_SIZE)
    }

    /// Create a new `HeapManager` extending itself `extension_size` bytes at a
    /// time.
    ///
    /// Panics unless `extension_size` is a multiple of 16 with room for a
    /// header and some payload.
    pub const fn with_extension_size(provider: P, extension_size: usize) -> Self {
        assert!(
            extension_size % ALIGNMENT == 0,
            "extension size must be a multiple of the header alignment"
        );
        assert!(
            extension_size >= 2 * HEADER_SIZE,
            "extension size must leave room for a header and payload"
        );

        HeapManager {
            provider,
            blocks: BlockList::new(),
            errno: MallocErr::NoError,
            extension_size,
            heap_size: 0,
            extensions: 0,
        }
    }

    /// Outcome of the last call to `allocate`, `free`, `resize` or
    /// `zero_allocate`.
    pub fn errno(&self) -> MallocErr {
        self.errno
    }

    pub fn extension_size(&self) -> usize {
        self.extension_size
    }

    /// The largest request that can ever succeed.
    pub fn max_request(&self) -> usize {
        self.extension_size - HEADER_SIZE
    }

    /// Total bytes obtained from the `RegionProvider` so far.
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Number of successful calls to the `RegionProvider`.
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Get statistics on this heap, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// Payload capacity of a live allocation. This can be more than was asked
    /// for. Returns 0 for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        match NonNull::new(ptr as *mut u8) {
            None => 0,
            Some(payload) => Block::from_payload(payload).capacity(),
        }
    }

    // Ask the provider for one more extension and put it on the free list,
    // merged with the free block before it if they touch.
    fn extend_heap(&mut self) -> Result<(), MallocErr> {
        let size = self.extension_size;
        let ptr = match unsafe { self.provider.extend(size) } {
            Ok(ptr) => ptr,
            Err(e) => {
                log::warn!("Failed to extend heap by {} bytes: {:?}", size, e);
                return Err(MallocErr::OutOfMemory);
            }
        };
        log::debug!("Extended heap by {} bytes at {:?}", size, ptr);

        self.heap_size += size;
        self.extensions += 1;

        unsafe {
            let block = Block::from_raw(ptr, size - HEADER_SIZE);
            self.blocks.insert(block);
            // The new extension is the highest address so far, so only a left
            // neighbor is possible.
            if let Some(left) = self.blocks.find_left(block) {
                BlockList::merge(left, block);
            }
        }

        Ok(())
    }

    // Ok(None) is the degenerate zero-size request, which is not an error.
    fn allocate_block(&mut self, size: usize) -> Result<Option<Block>, MallocErr> {
        if size == 0 {
            return Ok(None);
        }
        if size > self.max_request() {
            log::warn!(
                "Refusing request for {} bytes, the most one extension can hold is {}",
                size,
                self.max_request()
            );
            return Err(MallocErr::SingleRequestTooLarge);
        }

        let size = round_up(size, ALIGNMENT);
        log::trace!("Allocating {} bytes", size);

        let best = match self.blocks.find_best_fit(size) {
            Some(block) => block,
            None => {
                self.extend_heap()?;
                self.blocks
                    .find_best_fit(size)
                    .ok_or(MallocErr::OutOfMemory)?
            }
        };

        if best.can_split(size) {
            Ok(Some(unsafe { BlockList::split(best, size) }))
        } else {
            // Not enough left over for another block; hand out the whole thing.
            self.blocks.remove(best);
            Ok(Some(best))
        }
    }

    ////////////////////////////////////////////////////////////
    // The malloc family

    /// Allocate `size` bytes. Returns null for a zero-size request, or on
    /// failure, with the reason left in `errno()`.
    ///
    /// # Safety
    ///
    /// The `RegionProvider` must uphold its contract.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        self.errno = MallocErr::NoError;
        match self.allocate_block(size) {
            Ok(Some(block)) => block.payload().as_ptr(),
            Ok(None) => null_mut(),
            Err(e) => {
                self.errno = e;
                null_mut()
            }
        }
    }

    /// Give an allocation back to the heap, coalescing it with any free
    /// neighbors. Freeing null does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this heap. Nothing is
    /// validated: freeing anything else, or freeing twice, corrupts the heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.errno = MallocErr::NoError;
        let block = match NonNull::new(ptr) {
            None => return,
            Some(payload) => Block::from_payload(payload),
        };

        let left = self.blocks.find_left(block);
        let right = self.blocks.find_right(block);
        log::trace!(
            "Freeing {:?} (left: {:?}, right: {:?})",
            block,
            left,
            right
        );

        let merged = match (left, right) {
            (None, None) => block,
            (None, Some(right)) => {
                self.blocks.remove(right);
                BlockList::merge(block, right)
            }
            (Some(left), None) => {
                self.blocks.remove(left);
                BlockList::merge(left, block)
            }
            (Some(left), Some(right)) => {
                self.blocks.remove(left);
                self.blocks.remove(right);
                let left = BlockList::merge(left, block);
                BlockList::merge(left, right)
            }
        };

        self.blocks.insert(merged);
    }

    /// Move an allocation into a block of `size` bytes.
    ///
    /// A null `ptr` behaves as `allocate(size)`; a zero `size` frees `ptr` and
    /// returns null. If the new block can't be allocated, null is returned and
    /// `ptr` is left untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.errno = MallocErr::NoError;
        let old = match NonNull::new(ptr) {
            None => return self.allocate(size),
            Some(payload) => Block::from_payload(payload),
        };
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }

        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        // Copy no more than the old block holds.
        let count = old.capacity().min(size);
        ptr::copy_nonoverlapping(ptr, new_ptr, count);
        self.free(ptr);
        new_ptr
    }

    /// Allocate room for `count` elements of `size` bytes, all zeroed.
    ///
    /// An overflowing `count * size` is refused as `SingleRequestTooLarge`.
    ///
    /// # Safety
    ///
    /// The `RegionProvider` must uphold its contract.
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        self.errno = MallocErr::NoError;
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => {
                log::warn!("Refusing request for {} * {} bytes: overflow", count, size);
                self.errno = MallocErr::SingleRequestTooLarge;
                return null_mut();
            }
        };

        let ptr = self.allocate(total);
        if let Some(payload) = NonNull::new(ptr) {
            let capacity = Block::from_payload(payload).capacity();
            ptr::write_bytes(ptr, 0, capacity);
        }
        ptr
    }
}

/// A thread-safe heap, using a spin lock around a HeapManager.
///
/// Thread-safety is required for a heap to be used as a global allocator, so
/// that was easy to add with a spin lock. Layouts aligned to more than 16
/// bytes are refused.
pub struct LockedHeap<P> {
    heap: Mutex<HeapManager<P>>,
}

impl<P: RegionProvider> LockedHeap<P> {
    pub const fn new(provider: P, extension_size: usize) -> Self {
        LockedHeap {
            heap: Mutex::new(HeapManager::with_extension_size(provider, extension_size)),
        }
    }

    /// Get a reference to the underlying HeapManager.
    ///
    /// Allocation blocks while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, HeapManager<P>> {
        self.heap.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }

    pub fn errno(&self) -> MallocErr {
        self.lock().errno()
    }

    pub fn heap_size(&self) -> usize {
        self.lock().heap_size()
    }

    pub fn extensions(&self) -> usize {
        self.lock().extensions()
    }
}

unsafe impl<P: RegionProvider> GlobalAlloc for LockedHeap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.lock().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.lock().zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.lock().resize(ptr, new_size)
    }
}

/// Extension size used by `UnixAllocator`.
#[cfg(feature = "use_libc")]
pub const UNIX_EXTENSION_SIZE: usize = 1 << 20;

/// A global allocator backed by the program break.
#[cfg(feature = "use_libc")]
pub struct UnixAllocator {
    heap: LockedHeap<SbrkProvider>,
}

#[cfg(feature = "use_libc")]
impl Default for UnixAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            heap: LockedHeap::new(SbrkProvider::new(), UNIX_EXTENSION_SIZE),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.heap.stats()
    }

    pub fn errno(&self) -> MallocErr {
        self.heap.errno()
    }

    /// Bytes taken from the program break so far.
    pub fn heap_size(&self) -> usize {
        self.heap.heap_size()
    }

    pub fn extensions(&self) -> usize {
        self.heap.extensions()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.heap.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.heap.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.heap.realloc(ptr, layout, new_size)
    }
}

/// Default `ToyHeap` capacity, in bytes.
pub const TOY_HEAP_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Chunk([u8; ALIGNMENT]);

/// A fixed arena handing out contiguous extensions at increasing addresses.
///
/// The arena is allocated once and only ever reached through `base`, so
/// moving a `ToyHeap` (or the heap owning it) does not invalidate pointers
/// into it, and handing out a new extension does not disturb earlier ones.
pub struct ToyHeap {
    base: NonNull<Chunk>,
    chunks: usize,
    used: usize,
}

// The arena is owned outright, like a Box.
unsafe impl Send for ToyHeap {}

impl ToyHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        let chunks = round_up(capacity, ALIGNMENT) / ALIGNMENT;
        let arena: Box<[Chunk]> = vec![Chunk([0; ALIGNMENT]); chunks].into_boxed_slice();
        let base = unsafe { NonNull::new_unchecked(Box::into_raw(arena) as *mut Chunk) };
        ToyHeap {
            base,
            chunks,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.chunks * ALIGNMENT
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Start of the arena.
    pub fn base(&self) -> *const u8 {
        self.base.as_ptr() as *const u8
    }
}

impl Drop for ToyHeap {
    fn drop(&mut self) {
        let arena = ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.chunks);
        unsafe { drop(Box::from_raw(arena)) };
    }
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::with_capacity(TOY_HEAP_SIZE)
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl RegionProvider for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let allocating = round_up(size, ALIGNMENT);
        let available = self.capacity() - self.used;
        if allocating > available {
            return Err(ToyHeapOverflowError {
                requested: allocating,
                available,
            });
        }

        let ptr = (self.base.as_ptr() as *mut u8).add(self.used);
        self.used += allocating;
        Ok(NonNull::new_unchecked(ptr))
    }
}
