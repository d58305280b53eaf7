//! The size-class table: maps a requested allocation size to one of
//! `SIZE_CLASS_COUNT` discrete classes, each class carrying the number of
//! pages a span of that class spans and how many same-sized chunks fit in
//! it. Ported from the original's `size_map`, which builds the table once
//! with an iterative, waste-bounded growth rule instead of hand-listing
//! classes.
use static_assertions::const_assert;

use crate::config;

const_assert!(config::SIZE_CLASS_COUNT < 256);

/// Maximum fraction of a chunk's allocation that may go to waste before the
/// next size class is forced to grow, expressed as a ratio (1/8 = 12.5%).
const MAX_WASTE_NUMERATOR: usize = 1;
const MAX_WASTE_DENOMINATOR: usize = 8;

const ALIGNMENT_GRANULARITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub chunk_size: usize,
    pub pages: usize,
    pub chunks_per_span: usize,
}

pub struct ClassTable {
    classes: Vec<ClassInfo>,
    /// `small_index[i]` maps size `(i+1) * ALIGNMENT_GRANULARITY` (rounded
    /// up) to a class id, for sizes up to `MAX_SMALL_SIZE`.
    small_index: Vec<u8>,
    /// Reverse lookup for `MAX_SMALL_SIZE < bytes <= MAX_SIZE`, indexed by
    /// the same flattened index the large branch of `size_to_class` computes
    /// (`(bytes + 127 + (120 << 7)) >> 7`), offset down to start at 0.
    large_index: Vec<u8>,
    large_index_base: usize,
}

fn lg_floor(mut x: usize) -> u32 {
    debug_assert!(x > 0);
    let mut n = 0;
    while x > 1 {
        x >>= 1;
        n += 1;
    }
    n
}

fn round_up(value: usize, unit: usize) -> usize {
    (value + unit - 1) / unit * unit
}

/// How many pages a span needs to hold `chunk_size`-sized chunks with no
/// more than the allowed waste fraction left over, and how many whole
/// chunks fit.
fn chunks_and_pages(chunk_size: usize) -> (usize, usize) {
    let mut pages = 1;
    loop {
        let span_bytes = pages * config::PAGE_SIZE;
        let chunks = span_bytes / chunk_size;
        let at_page_limit = pages >= config::MAX_PAGES - 1;
        if chunks == 0 {
            if at_page_limit {
                // Only reachable with a shrunk MAX_PAGES (test_only_small_constants)
                // paired with a chunk size bigger than the whole allowed span;
                // still terminate rather than spin, even though the span
                // bottoms out holding zero whole chunks.
                return (pages, chunks);
            }
            pages += 1;
            continue;
        }
        let used = chunks * chunk_size;
        let waste = span_bytes - used;
        if waste * MAX_WASTE_DENOMINATOR <= span_bytes * MAX_WASTE_NUMERATOR || at_page_limit {
            return (pages, chunks);
        }
        pages += 1;
    }
}

/// Flattened reverse-lookup index for the large branch of `size_to_class`
/// (`MAX_SMALL_SIZE < bytes <= MAX_SIZE`), straight from spec.md §4.3:
/// `index2class[(b + 127 + (120 << 7)) >> 7]`. `120 << 7` offsets the large
/// branch's 128-byte-granularity indices to start immediately after the
/// small branch's 8-byte-granularity ones end, so the two lookup tables
/// partition one contiguous index space rather than overlapping.
fn large_class_index(bytes: usize) -> usize {
    (bytes + 127 + (120 << 7)) >> 7
}

impl ClassTable {
    pub fn build() -> ClassTable {
        let mut classes: Vec<ClassInfo> = Vec::new();

        // Class 0 is reserved to mean "no class" (used for large
        // allocations, which bypass the chunk cache).
        classes.push(ClassInfo { chunk_size: 0, pages: 0, chunks_per_span: 0 });

        let mut size = ALIGNMENT_GRANULARITY;
        while size <= config::MAX_SIZE {
            let (pages, chunks) = chunks_and_pages(size);
            let candidate = ClassInfo { chunk_size: size, pages, chunks_per_span: chunks };

            // Merge with the previous class if it has identical span shape;
            // this is what lets a handful of distinct (pages, chunks_per_span)
            // combinations cover every size up to MAX_SIZE.
            if let Some(prev) = classes.last_mut() {
                if prev.pages == candidate.pages && prev.chunks_per_span == candidate.chunks_per_span {
                    prev.chunk_size = size;
                    size = next_size(size);
                    continue;
                }
            }
            classes.push(candidate);
            size = next_size(size);
        }

        // The geometric step schedule in `next_size` doesn't necessarily
        // land exactly on MAX_SIZE; make sure the last class still covers
        // it, since MAX_SIZE itself must map to a real class (only sizes
        // strictly above it bypass the chunk cache).
        if classes.last().map_or(true, |c| c.chunk_size < config::MAX_SIZE) {
            let (pages, chunks) = chunks_and_pages(config::MAX_SIZE);
            let candidate = ClassInfo { chunk_size: config::MAX_SIZE, pages, chunks_per_span: chunks };
            match classes.last_mut() {
                Some(prev) if prev.pages == candidate.pages && prev.chunks_per_span == candidate.chunks_per_span => {
                    prev.chunk_size = config::MAX_SIZE;
                }
                _ => classes.push(candidate),
            }
        }

        let find_class = |want: usize| -> u8 {
            classes
                .iter()
                .position(|c| c.chunk_size > 0 && c.chunk_size >= want)
                .expect("every size up to MAX_SIZE must map to some class") as u8
        };

        let small_index_len = config::MAX_SMALL_SIZE / ALIGNMENT_GRANULARITY;
        let mut small_index = vec![0u8; small_index_len];
        for (i, slot) in small_index.iter_mut().enumerate() {
            let want = (i + 1) * ALIGNMENT_GRANULARITY;
            *slot = find_class(want);
        }

        let large_index_base = large_class_index(config::MAX_SMALL_SIZE + 1);
        let large_index_top = large_class_index(config::MAX_SIZE);
        let mut large_index = vec![0u8; large_index_top - large_index_base + 1];
        let mut bytes = config::MAX_SMALL_SIZE + 1;
        while bytes <= config::MAX_SIZE {
            large_index[large_class_index(bytes) - large_index_base] = find_class(bytes);
            bytes += 128;
        }
        // The 128-byte step above may not land exactly on MAX_SIZE; make
        // sure its slot is filled regardless.
        large_index[large_index_top - large_index_base] = find_class(config::MAX_SIZE);

        let table = ClassTable { classes, small_index, large_index, large_index_base };
        debug_assert!(
            table.classes.len() <= config::SIZE_CLASS_COUNT,
            "size class growth rule produced more classes than the on-disk format reserves room for"
        );
        table
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn info(&self, class: u8) -> ClassInfo {
        self.classes[class as usize]
    }

    /// Maps a requested byte size to a class id, or `None` if it exceeds
    /// `MAX_SIZE` and must be served as a raw large allocation straight out
    /// of the page heap. Implements spec.md §4.3's two-branch lookup: sizes
    /// up to `MAX_SMALL_SIZE` round up to an 8-byte bucket, sizes above that
    /// (up to `MAX_SIZE`) round up to a 128-byte bucket.
    pub fn size_to_class(&self, bytes: usize) -> Option<u8> {
        if bytes == 0 || bytes > config::MAX_SIZE {
            return None;
        }
        if bytes <= config::MAX_SMALL_SIZE {
            let index = (bytes + 7) >> 3;
            return Some(self.small_index[index - 1]);
        }
        let index = large_class_index(bytes) - self.large_index_base;
        Some(self.large_index[index])
    }

    pub fn class_to_size(&self, class: u8) -> usize {
        self.classes[class as usize].chunk_size
    }

    pub fn class_to_pages(&self, class: u8) -> usize {
        self.classes[class as usize].pages
    }
}

/// Step size grows geometrically (coarser granularity for bigger sizes),
/// mirroring the original's schedule of roughly-constant relative steps.
fn next_size(size: usize) -> usize {
    let step = (1usize << lg_floor(size).saturating_sub(3)).max(ALIGNMENT_GRANULARITY);
    round_up(size + 1, step)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn covers_every_small_size() {
        let table = ClassTable::build();
        for bytes in (8..=config::MAX_SMALL_SIZE).step_by(8) {
            let class = table.size_to_class(bytes).expect("small size must have a class");
            assert!(table.class_to_size(class) >= bytes);
        }
    }

    #[test]
    fn covers_every_large_size() {
        let table = ClassTable::build();
        for bytes in (config::MAX_SMALL_SIZE + 1..=config::MAX_SIZE).step_by(128) {
            let class = table.size_to_class(bytes).expect("large-small size must have a class");
            assert!(table.class_to_size(class) >= bytes);
        }
        let class = table.size_to_class(config::MAX_SIZE).expect("MAX_SIZE itself must have a class");
        assert!(table.class_to_size(class) >= config::MAX_SIZE);
    }

    #[test]
    fn sizes_past_max_size_have_no_class() {
        let table = ClassTable::build();
        assert_eq!(table.size_to_class(config::MAX_SIZE + 1), None);
    }

    #[test]
    fn waste_is_bounded() {
        let table = ClassTable::build();
        for class in 1..table.len() as u8 {
            let info = table.info(class);
            if info.chunk_size == 0 {
                continue;
            }
            let span_bytes = info.pages * config::PAGE_SIZE;
            let used = info.chunks_per_span * info.chunk_size;
            assert!(span_bytes - used <= span_bytes / 8);
        }
    }
}
