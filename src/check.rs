//! Heap consistency checking.
//!
//! The checker is read-only: it sweeps the blocks zone in address
//! order, walks every segregated list, and counts everything that
//! disagrees with the heap invariants. It never fixes anything, and the
//! allocator never calls it on its own; it exists for tests and for
//! debugging sessions.

use core::fmt;
use core::ptr::NonNull;

use log::error;

use crate::allocator::{SegAlloc, BLOCKS_ZONE};
use crate::block::{read_word, word_alloc, word_size, BlockPtr, ALIGNMENT, DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::heap::HeapSource;
use crate::seglist::{class_bounds, DIRECTORY_SIZE, SEG_NUM};

/// Validity contains a count of every kind of invalid state found in
/// the heap. A healthy heap is all zeroes.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Blocks or list nodes whose payload is not 8-byte aligned.
    pub misaligned: usize,
    /// Blocks whose size is not a positive multiple of 8, or is below
    /// the minimum block size.
    pub bad_sizes: usize,
    /// Blocks whose successor's prev-alloc bit disagrees with their own
    /// alloc bit.
    pub tag_mismatches: usize,
    /// Pairs of adjacent free blocks; coalescing should have merged
    /// them on the spot.
    pub adjacent_frees: usize,
    /// Free blocks whose footer disagrees with their header.
    pub footer_mismatches: usize,
    /// List nodes filed under the wrong size class, or allocated blocks
    /// found on a free list.
    pub misfiled: usize,
    /// Nodes whose prev link does not point back at their predecessor.
    pub broken_links: usize,
    /// Addresses (blocks or list nodes) outside the heap bounds.
    pub out_of_heap: usize,
    /// Lists whose traversal did not terminate within the theoretical
    /// maximum node count; almost certainly a link cycle.
    pub cycles: usize,
    /// Prologue or epilogue sentinels with the wrong size or alloc
    /// bits, or an epilogue that is not at the top of the heap.
    pub bad_sentinels: usize,
    /// Bytes or free blocks that the sweep and the lists cannot agree
    /// on: the blocks zone does not add up to the heap size, or the
    /// lists hold a different number of free blocks than the sweep
    /// found.
    pub unaccounted: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.misaligned == 0
            && self.bad_sizes == 0
            && self.tag_mismatches == 0
            && self.adjacent_frees == 0
            && self.footer_mismatches == 0
            && self.misfiled == 0
            && self.broken_links == 0
            && self.out_of_heap == 0
            && self.cycles == 0
            && self.bad_sentinels == 0
            && self.unaccounted == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// A snapshot of the heap's shape, gathered during the same sweep.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the raw heap so far.
    pub heap_size: usize,
    /// Blocks in the blocks zone, sentinels excluded.
    pub blocks: usize,
    /// Free blocks seen by the address-order sweep.
    pub free_blocks: usize,
    /// Bytes held in free blocks, headers included.
    pub free_bytes: usize,
}

fn report(lineno: Option<u32>, message: fmt::Arguments) {
    if let Some(line) = lineno {
        error!("checkheap({}): {}", line, message);
    }
}

/// Validate the whole heap. With `lineno` set, every violation is also
/// logged as an error tagged with that line.
pub(crate) fn examine<G: HeapSource>(
    alloc: &SegAlloc<G>,
    lineno: Option<u32>,
) -> (Validity, Stats) {
    let mut validity = Validity::default();
    let mut stats = Stats::default();
    if !alloc.is_initialized() {
        return (validity, stats);
    }

    let base = alloc.base;
    let lo = alloc.source.heap_lo();
    let hi = alloc.source.heap_hi();
    stats.heap_size = alloc.source.heap_size();
    // One past the last heap byte: where the epilogue payload "starts".
    let end = hi as usize + 1;

    unsafe {
        // Sentinels. The prologue tag claims the minimum block size
        // even though the physical sentinel is only header + footer;
        // nothing ever walks through it, so only the tag is checked.
        let prologue = BlockPtr::from_payload(NonNull::new_unchecked(
            base.add(DIRECTORY_SIZE + 2 * WSIZE),
        ));
        if prologue.size() != MIN_BLOCK_SIZE || !prologue.is_alloc() {
            validity.bad_sentinels += 1;
            report(lineno, format_args!("prologue header is corrupt"));
        }
        // The sentinel is physically header + footer, so the footer
        // occupies the same word the payload pointer names.
        let prologue_footer = read_word(base.add(DIRECTORY_SIZE + 2 * WSIZE));
        if word_size(prologue_footer) != MIN_BLOCK_SIZE || !word_alloc(prologue_footer) {
            validity.bad_sentinels += 1;
            report(lineno, format_args!("prologue footer is corrupt"));
        }

        // Address-order sweep of the blocks zone.
        let mut block = BlockPtr::from_payload(NonNull::new_unchecked(base.add(BLOCKS_ZONE)));
        let mut prev_free = false;
        let mut swept_bytes = 0usize;
        loop {
            let addr = block.addr();
            if addr < lo || addr as usize > end {
                validity.out_of_heap += 1;
                report(
                    lineno,
                    format_args!("sweep left the heap at {:p}", addr),
                );
                break;
            }

            let size = block.size();
            if size == 0 {
                // The epilogue, which must sit exactly at the top.
                if addr as usize != end || !block.is_alloc() {
                    validity.bad_sentinels += 1;
                    report(lineno, format_args!("epilogue header is corrupt"));
                }
                break;
            }

            stats.blocks += 1;
            if addr as usize % ALIGNMENT != 0 {
                validity.misaligned += 1;
                report(lineno, format_args!("block {:p} is misaligned", addr));
            }
            if size % ALIGNMENT != 0 {
                validity.bad_sizes += 1;
                report(
                    lineno,
                    format_args!("block {:p} has unaligned size {}", addr, size),
                );
                // The walk can no longer be trusted.
                break;
            }
            if size < MIN_BLOCK_SIZE {
                validity.bad_sizes += 1;
                report(
                    lineno,
                    format_args!("block {:p} is below the minimum size", addr),
                );
            }

            // Bound the extent before looking inside the block, so a
            // corrupt size cannot send the checker itself out of the
            // heap.
            let next = block.next();
            if (next.addr() as usize) > end {
                validity.out_of_heap += 1;
                report(
                    lineno,
                    format_args!("block {:p} extends past the heap", addr),
                );
                break;
            }

            let allocated = block.is_alloc();
            if !allocated {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if prev_free {
                    validity.adjacent_frees += 1;
                    report(
                        lineno,
                        format_args!("uncoalesced free blocks at {:p}", addr),
                    );
                }
                let footer = read_word(addr.add(size - DSIZE));
                if word_size(footer) != size || word_alloc(footer) {
                    validity.footer_mismatches += 1;
                    report(
                        lineno,
                        format_args!("free block {:p} footer disagrees with header", addr),
                    );
                }
            }

            if next.prev_alloc() != allocated {
                validity.tag_mismatches += 1;
                report(
                    lineno,
                    format_args!("block {:p} and its successor disagree on its alloc bit", addr),
                );
            }

            swept_bytes += size;
            prev_free = !allocated;
            block = next;
        }

        // The blocks plus the epilogue header must exactly fill
        // everything above the directory and prologue.
        let zone = stats.heap_size - DIRECTORY_SIZE - 3 * WSIZE;
        if swept_bytes + WSIZE != zone {
            validity.unaccounted += 1;
            report(
                lineno,
                format_args!(
                    "blocks cover {} bytes of a {} byte zone",
                    swept_bytes + WSIZE,
                    zone
                ),
            );
        }

        // Walk every list: membership, class, link symmetry. A heap of
        // S bytes cannot hold more than S / MIN_BLOCK_SIZE free blocks,
        // so any longer traversal means the links form a cycle.
        let lists = alloc.lists();
        let bound = stats.heap_size / MIN_BLOCK_SIZE + 1;
        let mut listed = 0usize;
        for class in 0..SEG_NUM {
            let (size_lo, size_hi) = class_bounds(class);
            let mut prev_offset = 0u32;
            let mut steps = 0usize;
            let mut cursor = lists.head(class);
            while let Some(node) = cursor {
                steps += 1;
                if steps > bound {
                    validity.cycles += 1;
                    report(lineno, format_args!("list {} does not terminate", class));
                    break;
                }

                let addr = node.addr();
                if addr < lo || addr > hi {
                    validity.out_of_heap += 1;
                    report(
                        lineno,
                        format_args!("list {} points outside the heap at {:p}", class, addr),
                    );
                    break;
                }
                listed += 1;
                if addr as usize % ALIGNMENT != 0 {
                    validity.misaligned += 1;
                    report(lineno, format_args!("list node {:p} is misaligned", addr));
                }
                if node.is_alloc() {
                    validity.misfiled += 1;
                    report(
                        lineno,
                        format_args!("allocated block {:p} sits on list {}", addr, class),
                    );
                }
                let size = node.size();
                if size < size_lo || size >= size_hi {
                    validity.misfiled += 1;
                    report(
                        lineno,
                        format_args!("{} byte block {:p} filed under list {}", size, addr, class),
                    );
                }
                if node.prev_link() != prev_offset {
                    validity.broken_links += 1;
                    report(
                        lineno,
                        format_args!("list node {:p} has an inconsistent prev link", addr),
                    );
                }

                prev_offset = lists.offset_of(node);
                cursor = lists.next_in_list(node);
            }
        }

        if listed != stats.free_blocks {
            validity.unaccounted += 1;
            report(
                lineno,
                format_args!(
                    "lists hold {} free blocks but the sweep found {}",
                    listed, stats.free_blocks
                ),
            );
        }
    }

    (validity, stats)
}
