//! Constants that must agree across every process sharing a basename.
//!
//! Mirrors `shm_config` in the C++ original: these are baked into the
//! on-disk layout, so changing any of them invalidates existing mapping
//! files.
use static_assertions::const_assert;

/// Page size used by the allocator's own bookkeeping. Independent of the
/// host's actual page size, which the segment manager queries at runtime
/// and rounds up to.
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Spans with a page count below this are tracked in a page-count-indexed
/// array for O(1) first-fit lookup.
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_PAGES: usize = 1 << (20 - PAGE_SHIFT);
#[cfg(feature = "test_only_small_constants")]
pub const MAX_PAGES: usize = 8;

pub const MIN_HEAP_GROW_BITS: usize = 20;
pub const MAX_HEAP_GROW_BITS: usize = 32;
pub const MIN_HEAP_GROW_SIZE: usize = 1 << MIN_HEAP_GROW_BITS;
pub const MAX_HEAP_GROW_SIZE: usize = 1 << MAX_HEAP_GROW_BITS;
pub const MIN_HEAP_GROW_PAGE_COUNT: usize = 1 << (MIN_HEAP_GROW_BITS - PAGE_SHIFT);
pub const MAX_HEAP_GROW_PAGE_COUNT: usize = 1 << (MAX_HEAP_GROW_BITS - PAGE_SHIFT);
const_assert!(MAX_PAGES as u64 <= (1u64 << 32));

/// Block alignment: blocks are reserved in units of this size, and the
/// address radix tree keys on `addr >> ALIGNMENT_BITS`.
pub const ALIGNMENT_BITS: usize = 20;
pub const ALIGNMENT: usize = 1 << ALIGNMENT_BITS;

/// Metadata pool growth increment (see `meta` module).
pub const META_ALLOC_INCREMENT: usize = 128 * 1024;

/// Only 48 bits of a 64-bit address are meaningful on the platforms we
/// target; the top 16 become the serial.
pub const ADDRESS_BITS: usize = 48;

pub const MAX_BLOCK_BITS: usize = 16;
pub const MAX_BLOCK: usize = 1 << MAX_BLOCK_BITS;

pub const MAX_PAGE_BITS: usize = 19;
pub const MAX_PAGE_COUNT: usize = 1 << MAX_PAGE_BITS;
const_assert!(MAX_PAGE_COUNT == MAX_HEAP_GROW_PAGE_COUNT);

pub const MAX_SERIAL_BITS: usize = 16;
pub const MAX_SERIAL_NUM: usize = 1 << MAX_SERIAL_BITS;

/// Reserved serials. 0 is null; the rest tag the two top-level blocks.
pub const SERIAL_NULL: u16 = 0;
pub const SERIAL_METADATA: u16 = 1;
pub const SERIAL_USERDATA: u16 = 2;

pub const MAX_PATH_SIZE: usize = 256;

pub const SIZE_CLASS_COUNT: usize = 87;
pub const MAX_SMALL_SIZE: usize = 1024;
pub const MAX_SIZE: usize = 256 * 1024;

pub const MAX_SINGLETON_COUNT: usize = 256;
