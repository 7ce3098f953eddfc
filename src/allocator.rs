//! The allocator proper.
//!
//! [`SegAlloc`] is a single-threaded heap and freed-memory manager over
//! any [`HeapSource`]. It lays the heap out as a free-list directory, a
//! pair of sentinel blocks, and a run of boundary-tagged blocks, and
//! serves the classic `malloc` / `free` / `realloc` / `calloc` surface.
//! Because it is not thread-safe, callers must serialize access
//! themselves if they want to share it.
//!
//! Placement is a hybrid: small requests take the first fitting block
//! in their size class (and upward), large requests scan each list for
//! the tightest fit. Freed blocks coalesce with their address-order
//! neighbours immediately.

use core::cmp;
use core::fmt;
use core::ptr::{self, NonNull};

use log::debug;
use static_assertions::const_assert;

use crate::block::{pack, write_word, BlockPtr, ALIGNMENT, MIN_BLOCK_SIZE, WSIZE};
use crate::check::{self, Stats, Validity};
use crate::heap::HeapSource;
use crate::seglist::{class_of, SegLists, CLASS_LIMITS, DIRECTORY_SIZE, SEG_NUM};

/// How many bytes to grow the heap by when a small request misses; a
/// larger request grows by its own size instead.
pub(crate) const CHUNKSIZE: usize = 464;

/// Requests below this many bytes are placed first-fit; everything
/// larger is worth a best-fit scan. Chosen to match a class boundary so
/// a whole list is always searched one way.
const FIRST_FIT_LIMIT: usize = CLASS_LIMITS[6];

/// Byte offset from the heap base to the blocks zone: the directory,
/// one word of padding, the prologue header/footer, and the epilogue
/// header that the first real block will overwrite.
pub(crate) const BLOCKS_ZONE: usize = DIRECTORY_SIZE + 4 * WSIZE;

/// Free-list links are 32-bit offsets from the heap base, so the heap
/// must stay below this many bytes.
const MAX_HEAP_BYTES: u64 = 1 << 32;

const_assert!(CHUNKSIZE % ALIGNMENT == 0);
const_assert!(CHUNKSIZE >= MIN_BLOCK_SIZE);

/// The single error surfaced by the allocation entry points: the raw
/// heap refused to extend, or growing further would overflow the
/// 32-bit link offsets. The caller's existing blocks remain valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of heap memory")
    }
}

/// A segregated-fit allocator over a grow-only heap source.
///
/// The source is sampled for its low address at initialization time and
/// every piece of block metadata is expressed relative to that base, so
/// an initialized allocator (together with any source that stores its
/// memory inline, like [`crate::heap::ToyHeap`]) must not be moved.
pub struct SegAlloc<G> {
    pub(crate) source: G,
    /// Base of the heap and of the free-list directory; null until the
    /// first successful `init`.
    pub(crate) base: *mut u8,
}

// A SegAlloc is sendable: it owns its source outright, and the raw base
// pointer only ever refers to memory the source owns.
unsafe impl<G: Send> Send for SegAlloc<G> {}

impl<G: HeapSource> SegAlloc<G> {
    /// Create an allocator over `source`. No heap memory is touched
    /// until [`SegAlloc::init`] or the first [`SegAlloc::malloc`].
    pub fn new(source: G) -> Self {
        SegAlloc {
            source,
            base: ptr::null_mut(),
        }
    }

    /// The underlying heap source.
    pub fn source(&self) -> &G {
        &self.source
    }

    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// Fixed bookkeeping bytes at the bottom of the heap: the list
    /// directory, the padding and prologue words, and the epilogue
    /// header. Everything above this is blocks.
    pub const fn overhead() -> usize {
        BLOCKS_ZONE
    }

    /// The block size that a request for `size` payload bytes occupies:
    /// the payload plus a one-word header, rounded up to alignment,
    /// floored at the minimum block. `None` on overflow.
    pub fn block_size(size: usize) -> Option<usize> {
        let padded = size.checked_add(WSIZE + ALIGNMENT - 1)?;
        Some(cmp::max(MIN_BLOCK_SIZE, padded & !(ALIGNMENT - 1)))
    }

    pub(crate) fn lists(&self) -> SegLists {
        debug_assert!(self.is_initialized());
        SegLists::new(unsafe { NonNull::new_unchecked(self.base) })
    }

    fn in_heap(&self, ptr: *mut u8) -> bool {
        self.is_initialized() && ptr >= self.source.heap_lo() && ptr <= self.source.heap_hi()
    }

    fn raw_sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, OutOfMemory> {
        // Safety: the trait contract makes the new range ours alone.
        match unsafe { self.source.sbrk(incr) } {
            Ok(ptr) => Ok(ptr),
            Err(_) => {
                debug!("raw heap refused to extend by {} bytes", incr);
                Err(OutOfMemory)
            }
        }
    }

    /// Lay out the empty heap: the free-list directory, the prologue
    /// and epilogue sentinels, and one seed chunk of free memory.
    ///
    /// Idempotent after the first success; a failed attempt leaves the
    /// allocator uninitialized and can be retried.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.is_initialized() {
            return Ok(());
        }

        let lo = self.source.heap_lo();
        let laid = self.source.heap_size();
        if laid == 0 {
            self.raw_sbrk(DIRECTORY_SIZE)?;
            self.raw_sbrk(4 * WSIZE)?;
        } else if laid < BLOCKS_ZONE {
            // An earlier attempt got part way; top the zone up. The
            // source's contiguity makes this equivalent to the two
            // extensions above.
            self.raw_sbrk(BLOCKS_ZONE - laid)?;
        }

        unsafe {
            // One empty (zero) slot per size class.
            ptr::write_bytes(lo, 0, DIRECTORY_SIZE);

            // Padding word, prologue header and footer, and the initial
            // epilogue header. The prologue is allocated and flagged as
            // having an allocated predecessor, so no coalesce ever
            // walks off the low end; the epilogue's prev_alloc starts
            // out set for the same reason.
            let sentinel = lo.add(DIRECTORY_SIZE);
            write_word(sentinel, 0);
            write_word(sentinel.add(WSIZE), pack(MIN_BLOCK_SIZE, true, true));
            write_word(sentinel.add(2 * WSIZE), pack(MIN_BLOCK_SIZE, false, true));
            write_word(sentinel.add(3 * WSIZE), pack(0, true, true));
        }
        self.base = lo;

        // Seed the blocks zone with one free chunk.
        if unsafe { self.extend(CHUNKSIZE / WSIZE) }.is_none() {
            self.base = ptr::null_mut();
            return Err(OutOfMemory);
        }
        Ok(())
    }

    /// Allocate at least `size` bytes, 8-byte aligned. Returns `None`
    /// for a zero-sized request or when the heap cannot grow; existing
    /// allocations are untouched either way. Initializes the heap on
    /// first use.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if !self.is_initialized() {
            self.init().ok()?;
        }
        let asize = Self::block_size(size)?;
        debug!("malloc({}) needs a {} byte block", size, asize);

        unsafe {
            let block = match self.find_fit(asize) {
                Some(block) => block,
                None => self.extend(cmp::max(asize, CHUNKSIZE) / WSIZE)?,
            };
            self.place(block, asize);
            Some(block.payload())
        }
    }

    /// Release a block previously returned by one of the allocation
    /// entry points. Null pointers and pointers outside the heap are
    /// ignored.
    ///
    /// # Safety
    ///
    /// A non-null pointer inside the heap must be one previously
    /// returned by this allocator and not yet freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() || !self.in_heap(ptr) {
            return;
        }
        let block = BlockPtr::from_payload(NonNull::new_unchecked(ptr));
        debug!("free({:p}) releases a {} byte block", ptr, block.size());
        self.release(block);
    }

    /// Resize `ptr`'s block to at least `size` bytes, preserving the
    /// payload prefix. A null `ptr` behaves as `malloc(size)`; a zero
    /// `size` behaves as `free(ptr)` and returns `None`. On allocation
    /// failure the original block is left untouched.
    ///
    /// # Safety
    ///
    /// As [`SegAlloc::free`].
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return None;
        }

        let block = BlockPtr::from_payload(NonNull::new_unchecked(ptr));
        let current = block.size();
        let asize = Self::block_size(size)?;

        // TODO: growing could also happen in place by absorbing a free
        // successor instead of always falling back to malloc-and-copy.
        if asize <= current {
            // The block already fits; give the tail back if it can
            // stand on its own as a block.
            if current - asize >= MIN_BLOCK_SIZE {
                block.write_header(asize, block.prev_alloc(), true);
                let tail = block.next();
                tail.write_header(current - asize, true, true);
                self.release(tail);
            }
            return Some(block.payload());
        }

        let new = self.malloc(size)?;
        let keep = cmp::min(size, current - WSIZE);
        ptr::copy_nonoverlapping(ptr, new.as_ptr(), keep);
        self.free(ptr);
        Some(new)
    }

    /// Allocate a zero-filled region for `nmemb` elements of `size`
    /// bytes each. Returns `None` when the product overflows or the
    /// allocation fails.
    pub fn calloc(&mut self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = nmemb.checked_mul(size)?;
        let ptr = self.malloc(bytes)?;
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, bytes);
        }
        Some(ptr)
    }

    /// Sweep the heap and the free lists, logging one error line per
    /// violated invariant, tagged with the caller's line number.
    pub fn checkheap(&self, lineno: u32) -> (Validity, Stats) {
        check::examine(self, Some(lineno))
    }

    /// Get statistics on this allocator and verify the heap layout,
    /// without logging.
    pub fn stats(&self) -> (Validity, Stats) {
        check::examine(self, None)
    }

    /// Find a free block of at least `asize` bytes. Starts at the
    /// request's own size class and moves upward; within a list, small
    /// requests take the first fit, large ones the best fit.
    unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        let lists = self.lists();
        for class in class_of(asize)..SEG_NUM {
            let found = if asize < FIRST_FIT_LIMIT {
                first_fit(lists, class, asize)
            } else {
                best_fit(lists, class, asize)
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Mark `block` allocated for an `asize`-byte request, splitting a
    /// free remainder off the end when at least a minimum block is left
    /// over.
    unsafe fn place(&mut self, block: BlockPtr, asize: usize) {
        let current = block.size();
        let prev_alloc = block.prev_alloc();
        self.lists().remove(block);

        if current - asize >= MIN_BLOCK_SIZE {
            block.write_header(asize, prev_alloc, true);

            let rest = block.next();
            rest.write_header(current - asize, true, false);
            rest.write_footer(current - asize);
            self.lists().push(rest);
        } else {
            // The whole block goes; its successor now has an allocated
            // neighbour.
            block.write_header(current, prev_alloc, true);
            block.next().mark_prev_alloc(true);
        }
    }

    /// Turn an allocated block back into a free one and merge it with
    /// its neighbours.
    unsafe fn release(&mut self, block: BlockPtr) {
        let size = block.size();
        block.write_header(size, block.prev_alloc(), false);
        block.write_footer(size);
        block.next().mark_prev_alloc(false);
        self.lists().push(block);
        self.coalesce(block);
    }

    /// Merge `block` (free, already on its list) with free address-order
    /// neighbours. Returns the merged block, whose address is the
    /// predecessor's when one was absorbed.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let prev_alloc = block.prev_alloc();
        let next = block.next();
        let next_alloc = next.is_alloc();

        if prev_alloc && next_alloc {
            return block;
        }

        // The merged block may land in a different size class, so pull
        // everything involved off the lists before touching any tag.
        let lists = self.lists();
        lists.remove(block);

        let mut start = block;
        let mut size = block.size();
        if !next_alloc {
            lists.remove(next);
            size += next.size();
        }
        if !prev_alloc {
            let prev = block.prev();
            lists.remove(prev);
            size += prev.size();
            start = prev;
        }

        // Merged size is settled; now the header goes at the lowest
        // block and the footer at the end of the combined extent.
        start.write_header(size, start.prev_alloc(), false);
        start.write_footer(size);
        lists.push(start);

        start
    }

    /// Grow the heap by `words` 4-byte words (at least one minimum
    /// block, rounded to alignment) and return the resulting free
    /// block, coalesced with a free predecessor if there is one. The
    /// new block's header lands where the old epilogue header was.
    unsafe fn extend(&mut self, words: usize) -> Option<BlockPtr> {
        let size = cmp::max(MIN_BLOCK_SIZE, round_up(words * WSIZE, ALIGNMENT));

        if self.source.heap_size() as u64 + size as u64 > MAX_HEAP_BYTES {
            debug!("refusing to grow the heap past the 32-bit offset range");
            return None;
        }

        let payload = self.raw_sbrk(size).ok()?;
        debug!("extended the heap by {} bytes", size);

        let block = BlockPtr::from_payload(payload);
        // The old epilogue header sits exactly where this block's
        // header goes; its prev_alloc bit still describes the last real
        // block, so carry it over before overwriting.
        let inherited = block.prev_alloc();
        block.write_header(size, inherited, false);
        block.write_footer(size);
        block.next().write_header(0, false, true);

        self.lists().push(block);
        Some(self.coalesce(block))
    }
}

impl<G: HeapSource> fmt::Display for SegAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegAlloc(")?;
        if !self.is_initialized() {
            return write!(f, "uninitialized)");
        }

        let lists = self.lists();
        let mut first_class = true;
        for class in 0..SEG_NUM {
            unsafe {
                let mut cursor = lists.head(class);
                if cursor.is_none() {
                    continue;
                }
                if !first_class {
                    write!(f, "; ")?;
                }
                first_class = false;
                write!(f, "C{}:", class)?;

                let mut first = true;
                while let Some(block) = cursor {
                    if !first {
                        write!(f, ",")?;
                    }
                    first = false;
                    write!(f, " {:p}+{}", block.addr(), block.size())?;
                    cursor = lists.next_in_list(block);
                }
            }
        }
        write!(f, ")")
    }
}

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

unsafe fn first_fit(lists: SegLists, class: usize, asize: usize) -> Option<BlockPtr> {
    let mut cursor = lists.head(class);
    while let Some(block) = cursor {
        if block.size() >= asize {
            return Some(block);
        }
        cursor = lists.next_in_list(block);
    }
    None
}

/// Best fit over one list: the smallest block that still fits, ties
/// going to the earliest node. An exact fit short-circuits.
unsafe fn best_fit(lists: SegLists, class: usize, asize: usize) -> Option<BlockPtr> {
    let mut best: Option<(BlockPtr, usize)> = None;
    let mut cursor = lists.head(class);
    while let Some(block) = cursor {
        let size = block.size();
        if size == asize {
            return Some(block);
        }
        if size > asize && best.map_or(true, |(_, best_size)| size < best_size) {
            best = Some((block, size));
        }
        cursor = lists.next_in_list(block);
    }
    best.map(|(block, _)| block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ToyHeap, TOY_HEAP_SIZE};

    use std::vec::Vec;

    use test_log::test;

    fn new_alloc() -> SegAlloc<ToyHeap> {
        SegAlloc::new(ToyHeap::default())
    }

    fn assert_valid(alloc: &SegAlloc<ToyHeap>) -> Stats {
        let (validity, stats) = alloc.checkheap(line!());
        assert!(validity.is_valid(), "heap invalid: {:?}", validity);
        stats
    }

    #[test]
    fn malloc_zero_is_none() {
        let mut alloc = new_alloc();
        assert!(alloc.malloc(0).is_none());
        // A zero-sized request must not even initialize the heap.
        assert_eq!(alloc.source().heap_size(), 0);
    }

    #[test]
    fn init_is_idempotent() {
        let mut alloc = new_alloc();
        alloc.init().unwrap();
        let grown = alloc.source().heap_size();
        assert_eq!(grown, BLOCKS_ZONE + CHUNKSIZE);
        alloc.init().unwrap();
        assert_eq!(alloc.source().heap_size(), grown);
        assert_valid(&alloc);
    }

    #[test]
    fn first_malloc_is_a_minimum_block() {
        let mut alloc = new_alloc();
        let p0 = alloc.malloc(8).unwrap();

        assert_eq!(p0.as_ptr() as usize % ALIGNMENT, 0);
        // The first payload sits right above the sentinels.
        assert_eq!(
            p0.as_ptr() as usize - alloc.source().heap_lo() as usize,
            BLOCKS_ZONE
        );

        let block = BlockPtr::from_payload(p0);
        unsafe {
            assert_eq!(block.size(), MIN_BLOCK_SIZE);
            assert!(block.is_alloc());
            assert!(block.prev_alloc());
        }
        assert_valid(&alloc);
    }

    #[test]
    fn one_byte_request_rounds_to_minimum() {
        let mut alloc = new_alloc();
        let p = alloc.malloc(1).unwrap();
        let block = BlockPtr::from_payload(p);
        unsafe {
            assert_eq!(block.size(), MIN_BLOCK_SIZE);
        }
        assert_valid(&alloc);
    }

    #[test]
    fn split_places_blocks_back_to_back() {
        let mut alloc = new_alloc();
        let p1 = alloc.malloc(16).unwrap();
        let p2 = alloc.malloc(16).unwrap();

        assert!(p2 > p1);
        // 16 payload bytes plus one header word, rounded to alignment.
        assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 24);
        assert_valid(&alloc);
    }

    #[test]
    fn freeing_a_neighbour_coalesces_forward() {
        let mut alloc = new_alloc();
        let a = alloc.malloc(64).unwrap();
        let b = alloc.malloc(64).unwrap();

        unsafe { alloc.free(a.as_ptr()) };
        let stats = assert_valid(&alloc);
        // `a`, plus the unused tail of the seed chunk.
        assert_eq!(stats.free_blocks, 2);

        unsafe { alloc.free(b.as_ptr()) };
        let stats = assert_valid(&alloc);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, CHUNKSIZE);

        // The merged block starts where `a` was.
        let merged = BlockPtr::from_payload(a);
        unsafe {
            assert!(!merged.is_alloc());
            assert_eq!(merged.size(), CHUNKSIZE);
        }
    }

    #[test]
    fn freeing_the_middle_coalesces_both_sides() {
        let mut alloc = new_alloc();
        let a = alloc.malloc(64).unwrap();
        let b = alloc.malloc(64).unwrap();
        let c = alloc.malloc(64).unwrap();

        unsafe {
            alloc.free(a.as_ptr());
            alloc.free(c.as_ptr());
        }
        let stats = assert_valid(&alloc);
        // `a` alone, and `c` merged with the chunk tail.
        assert_eq!(stats.free_blocks, 2);

        unsafe { alloc.free(b.as_ptr()) };
        let stats = assert_valid(&alloc);
        assert_eq!(stats.free_blocks, 1);

        let merged = BlockPtr::from_payload(a);
        unsafe {
            assert!(!merged.is_alloc());
            assert_eq!(merged.size(), CHUNKSIZE);
        }
    }

    #[test]
    fn free_roundtrip_restores_the_heap() {
        let mut alloc = new_alloc();
        alloc.init().unwrap();
        let before = assert_valid(&alloc);

        let p = alloc.malloc(100).unwrap();
        unsafe { alloc.free(p.as_ptr()) };

        assert_eq!(assert_valid(&alloc), before);
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut alloc = new_alloc();
        let p = alloc.malloc(64).unwrap();
        unsafe {
            for i in 0..64 {
                p.as_ptr().add(i).write(i as u8);
            }
        }

        let q = unsafe { alloc.realloc(p.as_ptr(), 128) }.unwrap();
        assert_ne!(p, q);
        unsafe {
            for i in 0..64 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }
        }
        assert_valid(&alloc);

        // Shrinking keeps the block and the prefix in place.
        let r = unsafe { alloc.realloc(q.as_ptr(), 8) }.unwrap();
        assert_eq!(r, q);
        unsafe {
            for i in 0..8 {
                assert_eq!(r.as_ptr().add(i).read(), i as u8);
            }
        }
        assert_valid(&alloc);
    }

    #[test]
    fn realloc_null_and_zero() {
        let mut alloc = new_alloc();
        let p = unsafe { alloc.realloc(ptr::null_mut(), 32) }.unwrap();
        assert!(unsafe { alloc.realloc(p.as_ptr(), 0) }.is_none());
        let stats = assert_valid(&alloc);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn large_requests_take_the_tightest_fit() {
        let mut alloc = new_alloc();

        // Carve out two free blocks in the same size class, 1024 and
        // 1536 bytes, fenced off by live separators so they cannot
        // coalesce. The larger one is freed last, so a first-fit scan
        // would take it.
        let x1 = alloc.malloc(1020).unwrap();
        let _s1 = alloc.malloc(8).unwrap();
        let x2 = alloc.malloc(1532).unwrap();
        let _s2 = alloc.malloc(8).unwrap();
        unsafe {
            assert_eq!(BlockPtr::from_payload(x1).size(), 1024);
            assert_eq!(BlockPtr::from_payload(x2).size(), 1536);
            alloc.free(x1.as_ptr());
            alloc.free(x2.as_ptr());
        }
        assert_eq!(class_of(1024), class_of(1536));
        assert_valid(&alloc);

        let p = alloc.malloc(1000).unwrap();
        assert_eq!(p, x1);
        assert_valid(&alloc);
    }

    #[test]
    fn foreign_pointers_are_ignored() {
        let mut alloc = new_alloc();

        // Freeing into an uninitialized allocator is a no-op too.
        let outside = 0u64;
        unsafe { alloc.free(&outside as *const u64 as *mut u8) };
        assert!(!alloc.is_initialized());

        let _p = alloc.malloc(32).unwrap();
        let before = assert_valid(&alloc);
        unsafe {
            alloc.free(ptr::null_mut());
            alloc.free(&outside as *const u64 as *mut u8);
        }
        assert_eq!(assert_valid(&alloc), before);
    }

    #[test]
    fn failed_extension_leaves_the_heap_alone() {
        let mut alloc = new_alloc();
        let _p = alloc.malloc(64).unwrap();
        let before = assert_valid(&alloc);

        assert!(alloc.malloc(TOY_HEAP_SIZE).is_none());
        assert_eq!(assert_valid(&alloc), before);
    }

    #[test]
    fn repeated_mallocs_do_not_overlap() {
        let mut alloc = new_alloc();
        let mut blocks: Vec<usize> = (0..32)
            .map(|_| alloc.malloc(24).unwrap().as_ptr() as usize)
            .collect();
        assert_valid(&alloc);

        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            // 24 payload bytes round up to a 32-byte block.
            assert!(pair[1] - pair[0] >= 32);
        }
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let mut alloc = new_alloc();
        let p = alloc.malloc(64).unwrap();
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xAB, 64);
            alloc.free(p.as_ptr());
        }

        let q = alloc.calloc(8, 8).unwrap();
        unsafe {
            for i in 0..64 {
                assert_eq!(q.as_ptr().add(i).read(), 0);
            }
        }
        assert_valid(&alloc);
    }

    #[test]
    fn calloc_rejects_overflow() {
        let mut alloc = new_alloc();
        assert!(alloc.calloc(usize::MAX, 2).is_none());
        assert!(alloc.calloc(0, 8).is_none());
    }

    #[test]
    fn exhaustion_and_full_release() {
        let mut alloc = new_alloc();
        let mut blocks = Vec::new();
        while let Some(p) = alloc.malloc(4096) {
            blocks.push(p);
        }
        assert!(!blocks.is_empty());
        assert_valid(&alloc);

        for p in &blocks {
            unsafe { alloc.free(p.as_ptr()) };
        }
        let stats = assert_valid(&alloc);
        assert_eq!(stats.free_blocks, 1);
        // Everything except the directory, the sentinels and the
        // epilogue header is one free block again.
        assert_eq!(stats.free_bytes, alloc.source().heap_size() - BLOCKS_ZONE);
    }

    #[test]
    fn display_lists_free_blocks() {
        let mut alloc = new_alloc();
        let s = std::format!("{}", alloc);
        assert!(s.contains("uninitialized"));

        alloc.init().unwrap();
        let s = std::format!("{}", alloc);
        assert!(s.contains("C5:"), "unexpected dump: {}", s);
    }
}
