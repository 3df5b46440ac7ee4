use core::fmt;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

/// The header placed directly before every block's payload.
///
/// `capacity` is the size of the payload, excluding the header. `next` links
/// to the following free block, and is only meaningful while the block is on
/// a [`BlockList`](struct.BlockList.html); once a block is handed out, its
/// `next` is garbage.
///
/// We use C representation and align to 16 bytes, so that a header followed
/// by a payload whose size is a multiple of 16 always leaves the next header
/// aligned too.
#[repr(C, align(16))]
pub struct BlockHeader {
    next: Option<NonNull<BlockHeader>>,
    capacity: usize,
}

/// Space taken up by a header, in bytes.
pub const HEADER_SIZE: usize = 16;
const_assert_eq!(HEADER_SIZE, core::mem::size_of::<BlockHeader>());

/// Alignment of every header, and therefore of every payload.
pub const ALIGNMENT: usize = core::mem::align_of::<BlockHeader>();
const_assert_eq!(ALIGNMENT, HEADER_SIZE);

/// An enum for easy comparison of blocks and their order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a header living in managed memory.
///
/// It is a plain pointer wrapper: copying it does not copy the block, and two
/// handles to the same header compare equal. All handles are created through
/// the unsafe constructors, which are responsible for the pointer being valid;
/// everything else relies on that.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks are just addresses inside the heap. Moving a whole chain of them to
// another thread is fine; sharing it is not, hence Send without Sync.
unsafe impl Send for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?}, {})", self.header, self.capacity())
    }
}

impl Block {
    /// Write a fresh header at `ptr` describing a payload of `capacity` bytes,
    /// and return a handle to it. The new block is not linked to anything.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to [`ALIGNMENT`](constant.ALIGNMENT.html) and
    /// point to `HEADER_SIZE + capacity` bytes that nothing else is using.
    pub unsafe fn from_raw(ptr: NonNull<u8>, capacity: usize) -> Block {
        if capacity == 0 {
            panic!("Can't create a block with no payload");
        }
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);

        let header: NonNull<BlockHeader> = ptr.cast();
        header.as_ptr().write(BlockHeader {
            next: None,
            capacity,
        });
        Block { header }
    }

    /// Recover the block from the payload pointer handed to a caller.
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`Block::payload`] on a block that has not
    /// since been merged into a neighbor.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        let header = payload.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The first byte available to the caller.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Size of the payload, in bytes.
    pub fn capacity(&self) -> usize {
        self.header_view().capacity
    }

    /// Size of the header and payload together, in bytes.
    pub fn footprint(&self) -> usize {
        HEADER_SIZE + self.capacity()
    }

    /// Get the pointer range covered by this block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.header.as_ptr() as *const u8;
        unsafe { start..start.add(self.footprint()) }
    }

    /// Whether enough is left over after carving `size` bytes off this block
    /// to keep a header and at least one byte of payload.
    pub fn can_split(&self, size: usize) -> bool {
        self.capacity() >= size + HEADER_SIZE + 1
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    fn next(&self) -> Option<Block> {
        self.header_view().next.map(|header| Block { header })
    }

    fn set_next(&mut self, next: Option<Block>) {
        unsafe { self.header.as_mut().next = next.map(|b| b.header) }
    }

    fn set_capacity(&mut self, capacity: usize) {
        unsafe { self.header.as_mut().capacity = capacity }
    }
}

/// A `BlockList` is the free list: a singly linked list of free blocks,
/// threaded through their own headers.
///
/// Each block is "owned" by the list while linked. Blocks are split and
/// merged in place; the list itself never allocates.
///
/// It maintains a few internal invariants:
///
/// - Each block links to the next, with the last one linking to nothing.
/// - Each block has an address lower than its next.
/// - No two blocks are byte-adjacent (those are merged by the heap manager).
///
/// Every search is a linear scan from the head.
pub struct BlockList {
    first: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList::new()
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Number of blocks that are directly adjacent to each other, and not
    /// merged.
    pub adjacents: usize,

    /// Number of blocks that do not have an address less than their next.
    pub out_of_orders: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Payload bytes available across all free blocks.
    pub free_bytes: usize,
    /// Bytes covered by free blocks, headers included.
    pub footprint: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList { first: None }
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.first,
            _list: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for next in self {
            match previous.map(|p| p.relation(&next)) {
                Some(Relation::Before) | None => {}
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should have been merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    validity.out_of_orders += 1;
                }
            }

            stats.length += 1;
            stats.free_bytes += next.capacity();
            stats.footprint += next.footprint();
            previous = Some(next);
        }

        (validity, stats)
    }

    /// Find the free block ending exactly where `block` starts.
    pub fn find_left(&self, block: Block) -> Option<Block> {
        let start = block.as_range().start;
        self.iter()
            .take_while(|b| b.as_range().start < start)
            .find(|b| b.as_range().end == start)
    }

    /// Find the free block starting exactly where `block` ends.
    pub fn find_right(&self, block: Block) -> Option<Block> {
        let end = block.as_range().end;
        self.iter()
            .take_while(|b| b.as_range().start <= end)
            .find(|b| b.as_range().start == end)
    }

    /// Find the smallest block that can hold `size` bytes.
    ///
    /// A block of exactly `size` is returned as soon as it is seen. Otherwise
    /// the smallest larger block wins, and among equals the lowest address.
    pub fn find_best_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        for block in self {
            let capacity = block.capacity();
            if capacity == size {
                log::trace!("  Exact fit for {} at {:?}", size, block);
                return Some(block);
            }
            if capacity > size && best.map_or(true, |b| capacity < b.capacity()) {
                best = Some(block);
            }
        }
        best
    }

    /// Link `block` into the list, keeping the list sorted by address.
    ///
    /// This does not merge with neighbors.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block not already on this list, and ownership
    /// of its memory passes to the list.
    pub unsafe fn insert(&mut self, mut block: Block) {
        let start = block.as_range().start;

        let mut previous = match self.first {
            Some(first) if first.as_range().start < start => first,
            _ => {
                // Either the list is empty, or this block comes before the
                // current head.
                block.set_next(self.first);
                self.first = Some(block);
                return;
            }
        };

        while let Some(next) = previous.next() {
            if next.as_range().start > start {
                break;
            }
            previous = next;
        }

        block.set_next(previous.next());
        previous.set_next(Some(block));
    }

    /// Unlink `block` from the list. Ownership of its memory passes back to
    /// the caller. Nothing happens if the block isn't found.
    pub fn remove(&mut self, mut block: Block) {
        let first = match self.first {
            None => return,
            Some(first) => first,
        };

        if first == block {
            self.first = block.next();
            block.set_next(None);
            return;
        }

        let start = block.as_range().start;
        let mut previous = first;
        while let Some(next) = previous.next() {
            if next == block {
                previous.set_next(block.next());
                block.set_next(None);
                return;
            }
            if next.as_range().start > start {
                return;
            }
            previous = next;
        }
    }

    /// Fold `right` into `left`: `left` grows by `right`'s header and payload,
    /// and takes over `right`'s link. `right` stops existing as a block.
    ///
    /// Panics if `right` does not start where `left` ends.
    ///
    /// # Safety
    ///
    /// Both must be valid blocks. If `left` is linked, `right` must be its
    /// successor on the list.
    pub unsafe fn merge(mut left: Block, right: Block) -> Block {
        assert_eq!(
            left.as_range().end,
            right.as_range().start,
            "Can only merge adjacent blocks"
        );
        log::trace!("  Merging {:?} into {:?}", right, left);

        left.set_capacity(left.capacity() + HEADER_SIZE + right.capacity());
        left.set_next(right.next());
        left
    }

    /// Carve a block with a payload of exactly `size` bytes off the high end of
    /// `block`, and return it. `block` shrinks but stays where it is in the
    /// list; the returned block is not linked.
    ///
    /// Panics if the remainder would not keep a header and at least one byte.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block, and `size` a multiple of `ALIGNMENT`.
    pub unsafe fn split(mut block: Block, size: usize) -> Block {
        if !block.can_split(size) {
            panic!(
                "Can't split {} bytes off of a block of capacity {} - need {} for header and remainder",
                size,
                block.capacity(),
                HEADER_SIZE + 1,
            )
        }

        let remaining = block.capacity() - size - HEADER_SIZE;
        let start = NonNull::new_unchecked(block.payload().as_ptr().add(remaining));
        block.set_capacity(remaining);

        let split = Block::from_raw(start, size);
        log::trace!("  Split {:?} off of {:?}", split, block);
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    const ARENA_SIZE: usize = 1024;

    #[repr(C, align(16))]
    struct Arena([u8; ARENA_SIZE]);

    impl Arena {
        fn new() -> Box<Arena> {
            Box::new(Arena([0; ARENA_SIZE]))
        }

        fn block(&mut self, offset: usize, capacity: usize) -> Block {
            assert!(offset + HEADER_SIZE + capacity <= ARENA_SIZE);
            unsafe {
                let ptr = NonNull::new(self.0.as_mut_ptr().add(offset)).unwrap();
                Block::from_raw(ptr, capacity)
            }
        }

        fn at(&self, offset: usize) -> *const u8 {
            unsafe { self.0.as_ptr().add(offset) }
        }
    }

    fn capacities(list: &BlockList) -> Vec<usize> {
        list.iter().map(|b| b.capacity()).collect()
    }

    #[test]
    fn test_payload_round_trip() {
        let mut arena = Arena::new();
        let block = arena.block(32, 48);

        let payload = block.payload();
        assert_eq!(payload.as_ptr() as *const u8, arena.at(32 + HEADER_SIZE));

        let recovered = unsafe { Block::from_payload(payload) };
        assert_eq!(recovered, block);
        assert_eq!(recovered.capacity(), 48);
        assert_eq!(block.as_range(), arena.at(32)..arena.at(32 + 64));
    }

    #[test]
    fn test_insert_sorts_by_address() {
        let mut arena = Arena::new();
        let a = arena.block(0, 16);
        let b = arena.block(64, 32);
        let c = arena.block(160, 48);

        let mut list = BlockList::new();
        unsafe {
            list.insert(b);
            list.insert(c);
            list.insert(a);
        }

        assert_eq!(list.iter().collect::<Vec<_>>(), vec![a, b, c]);
        let (validity, stats) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.free_bytes, 16 + 32 + 48);
        assert_eq!(stats.footprint, 16 + 32 + 48 + 3 * HEADER_SIZE);
        log::info!("{}", list);
    }

    #[test]
    fn test_find_neighbors() {
        let mut arena = Arena::new();
        let left = arena.block(0, 32);
        let middle = arena.block(48, 16);
        let right = arena.block(80, 64);
        let far = arena.block(512, 16);

        let mut list = BlockList::new();
        unsafe {
            list.insert(left);
            list.insert(right);
            list.insert(far);
        }

        assert_eq!(list.find_left(middle), Some(left));
        assert_eq!(list.find_right(middle), Some(right));
        assert_eq!(list.find_left(far), None);
        assert_eq!(list.find_right(far), None);
        assert_eq!(list.find_left(left), None);
    }

    #[test]
    fn test_merge_absorbs_header() {
        let mut arena = Arena::new();
        let left = arena.block(0, 32);
        let right = arena.block(48, 64);
        let after = arena.block(256, 16);

        let mut list = BlockList::new();
        unsafe {
            list.insert(left);
            list.insert(right);
            list.insert(after);
        }
        let (validity, _) = list.stats();
        assert_eq!(validity.adjacents, 1);

        let merged = unsafe { BlockList::merge(left, right) };
        assert_eq!(merged, left);
        assert_eq!(merged.capacity(), 32 + HEADER_SIZE + 64);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![left, after]);

        let (validity, _) = list.stats();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    #[should_panic(expected = "adjacent")]
    fn test_merge_rejects_gap() {
        let mut arena = Arena::new();
        let left = arena.block(0, 32);
        let right = arena.block(64, 32);
        unsafe {
            BlockList::merge(left, right);
        }
    }

    #[test]
    fn test_best_fit() {
        let mut arena = Arena::new();
        let big = arena.block(0, 128);
        let medium = arena.block(160, 64);
        let exact = arena.block(256, 32);
        let medium_again = arena.block(320, 64);

        let mut list = BlockList::new();
        unsafe {
            list.insert(big);
            list.insert(medium);
            list.insert(exact);
            list.insert(medium_again);
        }

        assert_eq!(list.find_best_fit(32), Some(exact));
        // Ties go to the lowest address
        assert_eq!(list.find_best_fit(48), Some(medium));
        assert_eq!(list.find_best_fit(16), Some(exact));
        assert_eq!(list.find_best_fit(96), Some(big));
        assert_eq!(list.find_best_fit(128), Some(big));
        assert_eq!(list.find_best_fit(144), None);
        assert_eq!(BlockList::new().find_best_fit(16), None);
    }

    #[test]
    fn test_split_takes_high_end() {
        let mut arena = Arena::new();
        let block = arena.block(0, 128);

        let mut list = BlockList::new();
        unsafe { list.insert(block) };

        assert!(block.can_split(80));
        assert!(!block.can_split(112));
        let split = unsafe { BlockList::split(block, 32) };

        assert_eq!(block.capacity(), 128 - 32 - HEADER_SIZE);
        assert_eq!(split.capacity(), 32);
        assert_eq!(split.as_range().end, arena.at(HEADER_SIZE + 128));
        assert_eq!(block.relation(&split), Relation::AdjacentBefore);

        // The remainder stays on the list, the split off block does not.
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![block]);
    }

    #[test]
    #[should_panic(expected = "Can't split")]
    fn test_split_below_threshold() {
        let mut arena = Arena::new();
        let block = arena.block(0, 48);
        unsafe {
            BlockList::split(block, 32);
        }
    }

    #[test]
    fn test_remove() {
        let mut arena = Arena::new();
        let a = arena.block(0, 16);
        let b = arena.block(64, 16);
        let c = arena.block(128, 16);
        let d = arena.block(192, 16);
        let stranger = arena.block(512, 16);

        let mut list = BlockList::new();
        unsafe {
            list.insert(a);
            list.insert(b);
            list.insert(c);
            list.insert(d);
        }

        list.remove(c);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![a, b, d]);
        list.remove(a);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![b, d]);
        list.remove(d);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![b]);
        list.remove(stranger);
        assert_eq!(capacities(&list), vec![16]);
        list.remove(b);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
