//! The page heap: tracks free spans of pages, growing the userdata pool
//! one block at a time and splitting/coalescing spans on demand. Ported
//! from the original's `page_heap`.
//!
//! Free spans below `MAX_PAGES` pages live in a page-count-indexed array
//! of lists for O(1) first-fit; anything bigger goes on one large-span
//! list, scanned linearly (large allocations are rare enough that this
//! does not matter in practice, matching the original's own tradeoff).
use crate::address::Addr;
use crate::block::BlockManager;
use crate::config;
use crate::error::{AllocError, Result};
use crate::meta::MetadataAllocator;
use crate::radix::RadixTree;
use crate::span::{self, Span, SizeClass};

fn get_span(blocks: &BlockManager, addr: Addr) -> Span {
    unsafe { *(blocks.resolve(addr) as *const Span) }
}

fn put_span(blocks: &BlockManager, addr: Addr, span: Span) {
    unsafe {
        *(blocks.resolve(addr) as *mut Span) = span;
    }
}

fn span_key(block: u16, page: u32) -> usize {
    ((block as usize) << config::MAX_PAGE_BITS) | (page as usize)
}

pub struct PageHeap {
    free_lists: Vec<Addr>,
    large_list: Addr,
    span_alloc: MetadataAllocator<Span>,
    span_map: RadixTree<Addr>,
}

impl PageHeap {
    pub fn new() -> PageHeap {
        PageHeap {
            free_lists: vec![Addr::NULL; config::MAX_PAGES],
            large_list: Addr::NULL,
            span_alloc: MetadataAllocator::new(),
            span_map: RadixTree::new(),
        }
    }

    fn list_head_mut(&mut self, page_count: u32) -> &mut Addr {
        if (page_count as usize) < config::MAX_PAGES - 1 {
            &mut self.free_lists[page_count as usize]
        } else {
            &mut self.large_list
        }
    }

    fn prepend(&mut self, blocks: &BlockManager, page_count: u32, addr: Addr) {
        let head = self.list_head_mut(page_count);
        let mut span = get_span(blocks, addr);
        span.prev = Addr::NULL;
        span.next = *head;
        if !head.is_null() {
            let mut old_head = get_span(blocks, *head);
            old_head.prev = addr;
            put_span(blocks, *head, old_head);
        }
        put_span(blocks, addr, span);
        *head = addr;
    }

    fn remove(&mut self, blocks: &BlockManager, page_count: u32, addr: Addr) {
        let span = get_span(blocks, addr);
        if !span.prev.is_null() {
            let mut prev = get_span(blocks, span.prev);
            prev.next = span.next;
            put_span(blocks, span.prev, prev);
        } else {
            *self.list_head_mut(page_count) = span.next;
        }
        if !span.next.is_null() {
            let mut next = get_span(blocks, span.next);
            next.prev = span.prev;
            put_span(blocks, span.next, next);
        }
    }

    fn register_pages(&mut self, span: &Span, addr: Addr) {
        for page in span.start_page..span.end_page() {
            self.span_map.set(span_key(span.block, page), addr);
        }
    }

    fn unregister_pages(&mut self, span: &Span) {
        for page in span.start_page..span.end_page() {
            self.span_map.remove(span_key(span.block, page));
        }
    }

    /// Reverse lookup: which span (if any) owns the page a raw handle
    /// offset falls in.
    pub fn find_span(&self, block: u16, page: u32) -> Option<Addr> {
        self.span_map.get(span_key(block, page))
    }

    /// Discards the lookup table and rebuilds it by walking every block's
    /// address-ordered span chain. Called once after `attach`.
    pub fn rebuild(&mut self, blocks: &BlockManager, block_roots: &[(u16, Addr)]) {
        self.span_map.clear();
        for &(_, root) in block_roots {
            let mut cur = root;
            while !cur.is_null() {
                let span = get_span(blocks, cur);
                self.register_pages(&span, cur);
                cur = span.order_next;
            }
        }
    }

    fn grow(&mut self, blocks: &mut BlockManager) -> Result<Addr> {
        let (block_id, size) = blocks.allocate_block(config::MIN_HEAP_GROW_SIZE, config::SERIAL_USERDATA)?;
        let page_count = (size / config::PAGE_SIZE) as u32;
        let addr = self.span_alloc.allocate(blocks)?;
        let span = Span::new(block_id, 0, page_count);
        put_span(blocks, addr, span);
        blocks.set_root_span(block_id, addr);
        self.register_pages(&span, addr);
        self.prepend(blocks, page_count, addr);
        Ok(addr)
    }

    fn find_large(&self, blocks: &BlockManager, pages: u32) -> Option<Addr> {
        let mut cur = self.large_list;
        while !cur.is_null() {
            let span = get_span(blocks, cur);
            if span.page_count >= pages {
                return Some(cur);
            }
            cur = span.next;
        }
        None
    }

    /// Returns a span with exactly `pages` pages, marked in use, splitting
    /// a larger free span if necessary and growing the heap if none is
    /// available.
    pub fn allocate_span(&mut self, blocks: &mut BlockManager, pages: u32) -> Result<Addr> {
        if pages == 0 || pages as usize >= config::MAX_HEAP_GROW_PAGE_COUNT {
            return Err(AllocError::OutOfRange { requested: pages as usize, limit: config::MAX_HEAP_GROW_PAGE_COUNT });
        }

        loop {
            let mut found = None;
            for n in pages..(config::MAX_PAGES - 1) as u32 {
                if !self.free_lists[n as usize].is_null() {
                    found = Some((self.free_lists[n as usize], n));
                    break;
                }
            }
            if found.is_none() {
                if let Some(addr) = self.find_large(blocks, pages) {
                    let span = get_span(blocks, addr);
                    found = Some((addr, span.page_count));
                }
            }

            let (addr, page_count) = match found {
                Some(f) => f,
                None => {
                    self.grow(blocks)?;
                    continue;
                }
            };

            self.remove(blocks, page_count, addr);
            let mut span = get_span(blocks, addr);
            self.unregister_pages(&span);

            if span.page_count > pages {
                let orig_order_prev = span.order_prev;
                let orig_order_next = span.order_next;
                let mut remainder = span;
                let mut head = span::partition(&mut remainder, pages, SizeClass::Unused);

                // `partition` shrinks `remainder` in place and returns the
                // carved-off head; re-thread the address-order list so
                // both halves still know their neighbours.
                let remainder_addr = self.span_alloc.allocate(blocks)?;
                remainder.order_prev = addr;
                remainder.order_next = orig_order_next;
                if !remainder.order_next.is_null() {
                    let mut next = get_span(blocks, remainder.order_next);
                    next.order_prev = remainder_addr;
                    put_span(blocks, remainder.order_next, next);
                }
                put_span(blocks, remainder_addr, remainder);
                self.register_pages(&remainder, remainder_addr);
                self.prepend(blocks, remainder.page_count, remainder_addr);

                head.order_prev = orig_order_prev;
                head.order_next = remainder_addr;
                head.in_use = true;
                put_span(blocks, addr, head);
                self.register_pages(&head, addr);
            } else {
                span.in_use = true;
                put_span(blocks, addr, span);
                self.register_pages(&span, addr);
            }

            return Ok(addr);
        }
    }

    /// Returns a span to the page heap, coalescing with its address-order
    /// neighbours when they are themselves free.
    pub fn deallocate_span(&mut self, blocks: &mut BlockManager, addr: Addr) {
        let mut span = get_span(blocks, addr);
        self.unregister_pages(&span);
        span.in_use = false;
        span.size_class = SizeClass::Unused;
        span.used_count = 0;
        span.prev = Addr::NULL;
        span.next = Addr::NULL;

        let mut head_addr = addr;

        if !span.order_next.is_null() {
            let next = get_span(blocks, span.order_next);
            if !next.in_use && next.block == span.block {
                self.remove(blocks, next.page_count, span.order_next);
                self.unregister_pages(&next);
                self.span_alloc.deallocate(blocks, span.order_next);
                span.page_count += next.page_count;
                span.order_next = next.order_next;
                if !span.order_next.is_null() {
                    let mut after = get_span(blocks, span.order_next);
                    after.order_prev = head_addr;
                    put_span(blocks, span.order_next, after);
                }
            }
        }

        if !span.order_prev.is_null() {
            let prev = get_span(blocks, span.order_prev);
            if !prev.in_use && prev.block == span.block {
                self.remove(blocks, prev.page_count, span.order_prev);
                self.unregister_pages(&prev);
                let merged_pages = prev.page_count + span.page_count;
                let mut merged = prev;
                merged.page_count = merged_pages;
                merged.order_next = span.order_next;
                if !merged.order_next.is_null() {
                    let mut after = get_span(blocks, merged.order_next);
                    after.order_prev = span.order_prev;
                    put_span(blocks, merged.order_next, after);
                }
                self.span_alloc.deallocate(blocks, head_addr);
                head_addr = span.order_prev;
                span = merged;
            }
        }

        put_span(blocks, head_addr, span);
        self.register_pages(&span, head_addr);
        self.prepend(blocks, span.page_count, head_addr);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grow_allocate_free_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("page-heap");
        let mut blocks = BlockManager::create(&basename).unwrap();
        let mut heap = PageHeap::new();

        let span1 = heap.allocate_span(&mut blocks, 2).unwrap();
        let page = get_span(&blocks, span1).start_page;
        let block = get_span(&blocks, span1).block;
        assert_eq!(heap.find_span(block, page), Some(span1));

        heap.deallocate_span(&mut blocks, span1);
        let span2 = heap.allocate_span(&mut blocks, 2).unwrap();
        // After freeing the only outstanding span, the next allocation of
        // the same size should come from the same freed region rather
        // than growing the heap again.
        assert_eq!(get_span(&blocks, span2).block, block);

        blocks.close();
    }
}
