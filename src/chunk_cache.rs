//! The chunk cache: carves page-heap spans into same-sized chunks for one
//! size class and hands them out one at a time. Ported from the original's
//! `chunk_cache`.
//!
//! Once a span is assigned to a class it leaves the page heap's own
//! free-list bookkeeping, so this module reuses the span's `prev`/`next`
//! fields for its own "spans with a free chunk" list — the same kind of
//! field aliasing the original relies on between the page heap and the
//! chunk cache.
use crate::address::Addr;
use crate::block::BlockManager;
use crate::class_table::ClassTable;
use crate::config;
use crate::error::Result;
use crate::page_heap::PageHeap;
use crate::span::{Span, SizeClass};

fn get_span(blocks: &BlockManager, addr: Addr) -> Span {
    unsafe { *(blocks.resolve(addr) as *const Span) }
}

fn put_span(blocks: &BlockManager, addr: Addr, span: Span) {
    unsafe {
        *(blocks.resolve(addr) as *mut Span) = span;
    }
}

fn read_link(blocks: &BlockManager, addr: Addr) -> Addr {
    unsafe { *(blocks.resolve(addr) as *const Addr) }
}

fn write_link(blocks: &BlockManager, addr: Addr, next: Addr) {
    unsafe {
        *(blocks.resolve(addr) as *mut Addr) = next;
    }
}

fn chunk_addr(span: &Span, index: usize, chunk_size: usize) -> Addr {
    let byte_offset = span.start_page as usize * config::PAGE_SIZE + index * chunk_size;
    Addr::from_block_offset(config::SERIAL_USERDATA, span.block, byte_offset as u32)
}

pub struct ChunkCache {
    /// Head of the "has at least one free chunk" span list, per class.
    partial_spans: Vec<Addr>,
    /// How many spans are currently assigned to each class, whether or not
    /// they're on `partial_spans` right now (a span with no free chunks
    /// left is still "assigned", just unlinked). Lets `deallocate_chunk`
    /// tell a sole cached span apart from one of several, per spec.md/
    /// SPEC_FULL.md §4.6 rule 3: the last span for a class stays cached
    /// rather than being evicted back to the page heap.
    span_counts: Vec<u32>,
}

impl ChunkCache {
    pub fn new(class_count: usize) -> ChunkCache {
        ChunkCache { partial_spans: vec![Addr::NULL; class_count], span_counts: vec![0; class_count] }
    }

    fn unlink_span(&mut self, blocks: &BlockManager, class: u8, addr: Addr) {
        let span = get_span(blocks, addr);
        if !span.prev.is_null() {
            let mut prev = get_span(blocks, span.prev);
            prev.next = span.next;
            put_span(blocks, span.prev, prev);
        } else {
            self.partial_spans[class as usize] = span.next;
        }
        if !span.next.is_null() {
            let mut next = get_span(blocks, span.next);
            next.prev = span.prev;
            put_span(blocks, span.next, next);
        }
    }

    fn link_span(&mut self, blocks: &BlockManager, class: u8, addr: Addr) {
        let head = self.partial_spans[class as usize];
        let mut span = get_span(blocks, addr);
        span.prev = Addr::NULL;
        span.next = head;
        put_span(blocks, addr, span);
        if !head.is_null() {
            let mut old_head = get_span(blocks, head);
            old_head.prev = addr;
            put_span(blocks, head, old_head);
        }
        self.partial_spans[class as usize] = addr;
    }

    fn new_span_for_class(
        &mut self,
        blocks: &mut BlockManager,
        page_heap: &mut PageHeap,
        classes: &ClassTable,
        class: u8,
    ) -> Result<Addr> {
        let info = classes.info(class);
        let addr = page_heap.allocate_span(blocks, info.pages as u32)?;
        let mut span = get_span(blocks, addr);
        span.size_class = SizeClass::Small(class);
        span.used_count = 0;

        let mut head = Addr::NULL;
        for i in (0..info.chunks_per_span).rev() {
            let chunk = chunk_addr(&span, i, info.chunk_size);
            write_link(blocks, chunk, head);
            head = chunk;
        }
        span.chunk_list = head;
        put_span(blocks, addr, span);
        self.span_counts[class as usize] += 1;
        Ok(addr)
    }

    /// Hands out one chunk of `class`'s size, growing the page heap through
    /// a fresh span if every existing span for this class is full.
    pub fn allocate_chunk(
        &mut self,
        blocks: &mut BlockManager,
        page_heap: &mut PageHeap,
        classes: &ClassTable,
        class: u8,
    ) -> Result<Addr> {
        if self.partial_spans[class as usize].is_null() {
            let addr = self.new_span_for_class(blocks, page_heap, classes, class)?;
            self.link_span(blocks, class, addr);
        }

        let span_addr = self.partial_spans[class as usize];
        let mut span = get_span(blocks, span_addr);
        let chunk = span.chunk_list;
        debug_assert!(!chunk.is_null());
        span.chunk_list = read_link(blocks, chunk);
        span.used_count += 1;
        put_span(blocks, span_addr, span);

        if span.chunk_list.is_null() {
            self.unlink_span(blocks, class, span_addr);
        }

        Ok(chunk)
    }

    /// Returns a chunk to its span, recycling the whole span back to the
    /// page heap once every chunk in it is free again.
    pub fn deallocate_chunk(
        &mut self,
        blocks: &mut BlockManager,
        page_heap: &mut PageHeap,
        classes: &ClassTable,
        addr: Addr,
    ) {
        let page = addr.intra_block_offset() as usize / config::PAGE_SIZE;
        let span_addr = page_heap
            .find_span(addr.block_id(), page as u32)
            .expect("freed address must belong to a known span");
        let mut span = get_span(blocks, span_addr);
        let class = match span.size_class {
            SizeClass::Small(c) => c,
            _ => panic!("deallocate_chunk called on a non-small span"),
        };
        debug_assert!(
            span.used_count as usize <= classes.info(class).chunks_per_span,
            "a span can never have more chunks in use than it was carved into"
        );

        let was_full = span.chunk_list.is_null();
        write_link(blocks, addr, span.chunk_list);
        span.chunk_list = addr;
        span.used_count -= 1;
        put_span(blocks, span_addr, span);

        if span.used_count == 0 && self.span_counts[class as usize] > 1 {
            self.unlink_span(blocks, class, span_addr);
            self.span_counts[class as usize] -= 1;
            page_heap.deallocate_span(blocks, span_addr);
            return;
        }

        // Either the span still has chunks in use, or it's the only span
        // cached for this class. The latter stays around rather than being
        // evicted, so the next allocation of this size doesn't immediately
        // re-grow the page heap.
        if was_full {
            self.link_span(blocks, class, span_addr);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class_table::ClassTable;

    #[test]
    fn allocate_and_free_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("chunk-cache");
        let mut blocks = BlockManager::create(&basename).unwrap();
        let mut page_heap = PageHeap::new();
        let classes = ClassTable::build();
        let mut cache = ChunkCache::new(classes.len());

        let class = classes.size_to_class(64).unwrap();
        let a = cache.allocate_chunk(&mut blocks, &mut page_heap, &classes, class).unwrap();
        let b = cache.allocate_chunk(&mut blocks, &mut page_heap, &classes, class).unwrap();
        assert_ne!(a, b);

        cache.deallocate_chunk(&mut blocks, &mut page_heap, &classes, a);
        let c = cache.allocate_chunk(&mut blocks, &mut page_heap, &classes, class).unwrap();
        assert_eq!(a, c, "freed chunk should be reused before carving a new one");

        blocks.close();
    }

    #[test]
    fn sole_span_stays_cached_after_going_fully_idle() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("chunk-cache-sole-span");
        let mut blocks = BlockManager::create(&basename).unwrap();
        let mut page_heap = PageHeap::new();
        let classes = ClassTable::build();
        let mut cache = ChunkCache::new(classes.len());

        let class = classes.size_to_class(64).unwrap();
        let chunks_per_span = classes.info(class).chunks_per_span;

        let mut first_batch = Vec::new();
        for _ in 0..chunks_per_span {
            first_batch.push(cache.allocate_chunk(&mut blocks, &mut page_heap, &classes, class).unwrap());
        }
        for &addr in &first_batch {
            cache.deallocate_chunk(&mut blocks, &mut page_heap, &classes, addr);
        }
        assert_eq!(cache.span_counts[class as usize], 1, "the one span for this class must stay cached, not be evicted");

        let mut second_batch = Vec::new();
        for _ in 0..chunks_per_span {
            second_batch.push(cache.allocate_chunk(&mut blocks, &mut page_heap, &classes, class).unwrap());
        }
        let mut first_sorted = first_batch.clone();
        let mut second_sorted = second_batch.clone();
        first_sorted.sort_by_key(|a| a.as_u64());
        second_sorted.sort_by_key(|a| a.as_u64());
        assert_eq!(first_sorted, second_sorted, "reallocating a fully-idle class should reuse the cached span, not grow a new one");

        blocks.close();
    }
}
