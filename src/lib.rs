#![no_std]

//! A segregated-fit memory allocator.
//!
//! [`SegAlloc`] manages a single contiguous heap obtained from a
//! [`HeapSource`] — a break-style service that only ever grows — and
//! serves the classic allocation interface on top of it: `malloc`,
//! `free`, `realloc` and `calloc`.
//!
//! The heap is laid out as a free-list directory, a pair of sentinel
//! blocks, and a run of boundary-tagged blocks:
//!
//! ```text
//! +--------------------+
//! | directory          | <- 14 list heads, one per size class
//! +--------------------+
//! | prologue sentinel  | <- allocated; stops coalescing low
//! +--------------------+
//! | block | block | .. | <- allocated and free blocks, tagged
//! +--------------------+
//! | epilogue header    | <- zero-sized, allocated; stops it high
//! +--------------------+
//! ```
//!
//! Every block carries a one-word header holding its size, its own
//! alloc bit, and the alloc bit of its address-order predecessor. Free
//! blocks also hold a footer and a pair of 32-bit list links, so
//! allocated blocks pay exactly one word of overhead. Freed blocks
//! merge with free neighbours immediately, and placement is first-fit
//! for small requests and best-fit for large ones.
//!
//! Nothing here is thread-safe: the allocator assumes exclusive access
//! for the duration of every call. The heap is never returned to the
//! operating system.
//!
//! The [`check`] module can audit the whole heap on demand, which the
//! tests do after every operation.

#[cfg(test)]
extern crate std;

pub mod allocator;
mod block;
pub mod check;
pub mod heap;
mod seglist;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
mod unix;

pub use allocator::{OutOfMemory, SegAlloc};
pub use check::{Stats, Validity};
#[cfg(feature = "use_libc")]
pub use heap::SbrkHeap;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
pub use heap::SyscallHeap;
pub use heap::{HeapSource, ToyHeap};
