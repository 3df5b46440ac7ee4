//! A best-fit memory allocator written in pure Rust.
//!
//! Memory is obtained from a [`RegionProvider`](allocators/trait.RegionProvider.html)
//! in fixed-size extensions and carved up into blocks. Each block carries a
//! small header just before its payload; free blocks are threaded through
//! those headers into a single list sorted by address.
//!
//! - Allocation picks the smallest free block that fits, preferring an exact
//!   fit, and splits the request off the high end of larger blocks.
//! - Freeing coalesces a block with its free neighbors on either side, so no
//!   two free blocks ever touch.
//!
//! The main entry point is [`HeapManager`](allocators/struct.HeapManager.html),
//! a single-threaded heap with `allocate`, `free`, `resize` and
//! `zero_allocate`. [`LockedHeap`](allocators/struct.LockedHeap.html) puts it
//! behind a spin lock for use as a `GlobalAlloc`.
//!
//! ```
//! use bestfit_allocator::{HeapManager, MallocErr, ToyHeap};
//!
//! let mut heap = HeapManager::new(ToyHeap::default());
//! unsafe {
//!     let ptr = heap.allocate(64);
//!     assert!(!ptr.is_null());
//!     heap.free(ptr);
//!
//!     assert!(heap.allocate(1 << 20).is_null());
//!     assert_eq!(heap.errno(), MallocErr::SingleRequestTooLarge);
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocators;
pub mod blocklist;

#[cfg(feature = "use_libc")]
pub use allocators::{SbrkProvider, UnixAllocator};
pub use allocators::{HeapManager, LockedHeap, MallocErr, RegionProvider, ToyHeap};
pub use blocklist::{Stats, Validity};
