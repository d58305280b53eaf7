//! The metadata bump allocator: carves fixed-size objects (span descriptors,
//! block bookkeeping, singleton slots) out of blocks tagged
//! `SERIAL_METADATA`, growing the pool `META_ALLOC_INCREMENT` bytes at a
//! time. Ported from the original's `metadata_allocator<T>`.
//!
//! Freed objects are threaded onto a singly linked free list through their
//! own storage, exactly like the original: the first `size_of::<Addr>()`
//! bytes of a freed object hold the address of the next free object.
use std::marker::PhantomData;
use std::mem::size_of;

use static_assertions::const_assert;

use crate::address::Addr;
use crate::block::BlockManager;
use crate::config;
use crate::error::Result;

const_assert!(config::META_ALLOC_INCREMENT >= size_of::<Addr>());

pub struct MetadataAllocator<T> {
    free_list: Addr,
    bump_block: Option<u16>,
    bump_offset: u32,
    bump_remaining: usize,
    _marker: PhantomData<T>,
}

impl<T> Default for MetadataAllocator<T> {
    fn default() -> Self {
        MetadataAllocator {
            free_list: Addr::NULL,
            bump_block: None,
            bump_offset: 0,
            bump_remaining: 0,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy> MetadataAllocator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates one `T`-sized object, growing the metadata pool through
    /// `blocks` if neither the free list nor the current bump block has
    /// room.
    pub fn allocate(&mut self, blocks: &mut BlockManager) -> Result<Addr> {
        if !self.free_list.is_null() {
            let addr = self.free_list;
            let next = unsafe { *(blocks.resolve(addr) as *const Addr) };
            self.free_list = next;
            return Ok(addr);
        }

        let size = size_of::<T>() as usize;
        debug_assert!(
            size <= config::META_ALLOC_INCREMENT,
            "metadata object does not fit in a single growth increment"
        );

        if self.bump_remaining < size {
            let (block_id, block_size) =
                blocks.allocate_block(config::META_ALLOC_INCREMENT, config::SERIAL_METADATA)?;
            self.bump_block = Some(block_id);
            self.bump_offset = 0;
            self.bump_remaining = block_size;
        }

        let block_id = self.bump_block.expect("bump block must be set after growth");
        let addr = Addr::from_block_offset(config::SERIAL_METADATA, block_id, self.bump_offset);
        self.bump_offset += size as u32;
        self.bump_remaining -= size;
        Ok(addr)
    }

    /// Returns `addr` to the free list. The caller must not dereference
    /// `addr` again except through a fresh `allocate`.
    pub fn deallocate(&mut self, blocks: &BlockManager, addr: Addr) {
        unsafe {
            *(blocks.resolve(addr) as *mut Addr) = self.free_list;
        }
        self.free_list = addr;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_reuses_freed_slot() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("meta-test");
        let mut blocks = BlockManager::create(&basename).unwrap();
        let mut alloc: MetadataAllocator<Addr> = MetadataAllocator::new();

        let a = alloc.allocate(&mut blocks).unwrap();
        let b = alloc.allocate(&mut blocks).unwrap();
        assert_ne!(a, b);

        alloc.deallocate(&blocks, a);
        let c = alloc.allocate(&mut blocks).unwrap();
        assert_eq!(a, c, "freed slot should be reused before growing further");
    }

    #[test]
    fn allocate_grows_pool_across_increments() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("meta-grow");
        let mut blocks = BlockManager::create(&basename).unwrap();
        let mut alloc: MetadataAllocator<[u8; 4096]> = MetadataAllocator::new();

        let per_increment = config::META_ALLOC_INCREMENT / 4096;
        let mut addrs = Vec::new();
        for _ in 0..(per_increment + 1) {
            addrs.push(alloc.allocate(&mut blocks).unwrap());
        }
        let unique: std::collections::HashSet<_> = addrs.iter().map(|a| a.as_u64()).collect();
        assert_eq!(unique.len(), addrs.len());
    }
}
