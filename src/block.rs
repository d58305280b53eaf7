//! The block manager: up to `MAX_BLOCK` named, 1-MiB-aligned mapping files
//! that back every allocation this crate ever makes, metadata and userdata
//! alike. Ported from the original's `block_mgr`, which is the richer
//! many-blocks design spec.md's Block Manager section describes, not the
//! simpler two-block `shm_mgr` scheme also present in the original sources.
//!
//! The block table itself (which slots are in use, their size and
//! purpose) lives in a small manager file that is mapped like any other
//! segment, so it survives a restart. The address lookup tree does not:
//! it is rebuilt unconditionally on every `attach`, by re-walking the
//! table and re-mapping every block that was in use (Open Question (a)).
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::bitmap::Bitmap;
use crate::config;
use crate::error::{AllocError, Result};
use crate::radix::RadixTree;
use crate::segment;

/// On-disk record for one block slot. `#[repr(C)]` so the manager file's
/// layout does not depend on the compiler's struct-reordering heuristics.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockRecord {
    in_use: u8,
    purpose: u16,
    _pad: u8,
    byte_size: u64,
    /// Address of the page heap's first span in this block, so the span
    /// lookup tree can be rebuilt by walking `Span::order_next` chains
    /// after a restart, without the tree itself needing to persist.
    root_span: u64,
}

impl BlockRecord {
    #[allow(dead_code)]
    const EMPTY: BlockRecord = BlockRecord { in_use: 0, purpose: 0, _pad: 0, byte_size: 0, root_span: 0 };
}

struct MappedBlock {
    fd: RawFd,
    base: *mut c_void,
    size: usize,
}

pub struct BlockManager {
    basename: PathBuf,
    manager_fd: RawFd,
    manager_base: *mut c_void,
    manager_size: usize,
    slots: HashMap<u16, MappedBlock>,
    free_slots: Bitmap,
    addr_tree: RadixTree<u16>,
}

fn manager_path(basename: &Path) -> PathBuf {
    basename.to_path_buf()
}

fn block_path(basename: &Path, slot: u16) -> PathBuf {
    let mut name = basename.as_os_str().to_owned();
    name.push(format!("-{:05}.mmap", slot));
    PathBuf::from(name)
}

fn header_bytes() -> usize {
    config::MAX_BLOCK * std::mem::size_of::<BlockRecord>()
}

impl BlockManager {
    /// Creates a brand-new block manager at `basename`. Fails if a manager
    /// file already exists there.
    pub fn create(basename: &Path) -> Result<BlockManager> {
        let path = manager_path(basename);
        let (fd, size) = segment::create(&path, header_bytes())?;
        let (base, mapped_size) = segment::map(fd, size, segment::page_size())?;
        unsafe {
            std::ptr::write_bytes(base as *mut u8, 0, size);
        }

        Ok(BlockManager {
            basename: basename.to_path_buf(),
            manager_fd: fd,
            manager_base: base,
            manager_size: mapped_size,
            slots: HashMap::new(),
            free_slots: Bitmap::new_all_set(config::MAX_BLOCK),
            addr_tree: RadixTree::new(),
        })
    }

    /// Re-attaches to an existing block manager, remapping every block that
    /// was in use and rebuilding the address lookup tree from scratch.
    pub fn attach(basename: &Path) -> Result<BlockManager> {
        let path = manager_path(basename);
        let (fd, size) = segment::attach(&path)?;
        let (base, mapped_size) = segment::map(fd, size, segment::page_size())?;

        let mut manager = BlockManager {
            basename: basename.to_path_buf(),
            manager_fd: fd,
            manager_base: base,
            manager_size: mapped_size,
            slots: HashMap::new(),
            free_slots: Bitmap::new_all_set(config::MAX_BLOCK),
            addr_tree: RadixTree::new(),
        };

        for slot in 0..config::MAX_BLOCK as u16 {
            let record = manager.record(slot);
            if record.in_use == 0 {
                continue;
            }
            manager.free_slots.reset(slot as usize);

            let block_path = block_path(basename, slot);
            let (bfd, bsize) = segment::attach(&block_path)?;
            let (bbase, bmapped) = segment::map(bfd, bsize, config::ALIGNMENT)?;
            debug_assert_eq!(bmapped as u64, record.byte_size);

            manager.register_block(slot, bbase, bmapped);
            manager.slots.insert(slot, MappedBlock { fd: bfd, base: bbase, size: bmapped });
        }

        Ok(manager)
    }

    fn record(&self, slot: u16) -> BlockRecord {
        unsafe { *(self.manager_base as *const BlockRecord).add(slot as usize) }
    }

    fn set_record(&mut self, slot: u16, record: BlockRecord) {
        unsafe {
            *(self.manager_base as *mut BlockRecord).add(slot as usize) = record;
        }
    }

    /// Grows the pool by one block of at least `byte_hint` bytes (clamped
    /// to `[MIN_HEAP_GROW_SIZE, MAX_HEAP_GROW_SIZE]` and rounded up to
    /// `ALIGNMENT`), tagging it with `serial` for bookkeeping. Returns the
    /// new block's id and its actual size.
    #[requires(byte_hint > 0, "growing the pool by zero bytes makes no sense")]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().1 % config::ALIGNMENT == 0, "blocks are always alignment-sized")]
    pub fn allocate_block(&mut self, byte_hint: usize, serial: u16) -> Result<(u16, usize)> {
        let slot = self.free_slots.find_first();
        if slot >= config::MAX_BLOCK {
            return Err(AllocError::OutOfRange { requested: slot, limit: config::MAX_BLOCK });
        }
        let slot = slot as u16;

        let size = byte_hint
            .max(config::MIN_HEAP_GROW_SIZE)
            .min(config::MAX_HEAP_GROW_SIZE);
        let size = if size % config::ALIGNMENT == 0 {
            size
        } else {
            size + (config::ALIGNMENT - size % config::ALIGNMENT)
        };

        let path = block_path(&self.basename, slot);
        let (fd, file_size) = segment::create(&path, size)?;
        let (base, mapped_size) = segment::map(fd, file_size, config::ALIGNMENT)?;

        self.free_slots.reset(slot as usize);
        self.set_record(
            slot,
            BlockRecord { in_use: 1, purpose: serial, _pad: 0, byte_size: mapped_size as u64 },
        );
        self.register_block(slot, base, mapped_size);
        self.slots.insert(slot, MappedBlock { fd, base, size: mapped_size });

        Ok((slot, mapped_size))
    }

    /// Registers every `ALIGNMENT`-sized step of `[base, base+size)` in the
    /// address lookup tree, so `find_block` can resolve any pointer inside
    /// the block back to `slot`.
    fn register_block(&mut self, slot: u16, base: *mut c_void, size: usize) {
        let start = base as usize;
        let steps = size / config::ALIGNMENT;
        for i in 0..steps.max(1) {
            let key = (start + i * config::ALIGNMENT) >> config::ALIGNMENT_BITS;
            self.addr_tree.set(key, slot);
        }
    }

    /// Resolves a stable address to a live pointer in this process's
    /// address space.
    pub fn resolve(&self, addr: crate::address::Addr) -> *mut u8 {
        let block = self.slots.get(&addr.block_id()).expect("dangling block id");
        unsafe { (block.base as *mut u8).add(addr.intra_block_offset() as usize) }
    }

    /// Finds which block, if any, a raw pointer falls inside.
    pub fn find_block(&self, ptr: *const u8) -> Option<u16> {
        let key = (ptr as usize) >> config::ALIGNMENT_BITS;
        self.addr_tree.get(key)
    }

    pub fn block_size(&self, slot: u16) -> usize {
        self.slots.get(&slot).map(|b| b.size).unwrap_or(0)
    }

    pub fn contains_block(&self, slot: u16) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Records the page heap's first span for a block, so it can be found
    /// again after a restart.
    pub fn set_root_span(&mut self, slot: u16, root: crate::address::Addr) {
        let mut record = self.record(slot);
        record.root_span = root.as_u64();
        self.set_record(slot, record);
    }

    /// Every in-use userdata block's (slot, root span) pair, for rebuilding
    /// the page heap's span lookup after `attach`.
    pub fn userdata_roots(&self) -> Vec<(u16, crate::address::Addr)> {
        let mut roots = Vec::new();
        for slot in 0..config::MAX_BLOCK as u16 {
            let record = self.record(slot);
            if record.in_use != 0 && record.purpose == config::SERIAL_USERDATA {
                roots.push((slot, crate::address::Addr::from_u64(record.root_span)));
            }
        }
        roots
    }

    /// Unmaps every block and the manager file, leaving the files on disk
    /// so a later `attach` can resume.
    pub fn close(&mut self) {
        for (_, block) in self.slots.drain() {
            let _ = segment::unmap(block.base, block.size);
            segment::close(block.fd);
        }
        let _ = segment::unmap(self.manager_base, self.manager_size);
        segment::close(self.manager_fd);
    }

    /// Unmaps and deletes every file this manager owns. Used by `fini`
    /// without a resume in mind.
    pub fn destroy(mut self) {
        let basename = self.basename.clone();
        let slots: Vec<u16> = self.slots.keys().copied().collect();
        self.close();
        for slot in slots {
            let _ = segment::unlink(&block_path(&basename, slot));
        }
        let _ = segment::unlink(&manager_path(&basename));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("block-test");
        let mut blocks = BlockManager::create(&basename).unwrap();

        let (slot, size) = blocks.allocate_block(config::MIN_HEAP_GROW_SIZE, config::SERIAL_USERDATA).unwrap();
        assert!(size >= config::MIN_HEAP_GROW_SIZE);

        let addr = crate::address::Addr::from_block_offset(config::SERIAL_USERDATA, slot, 16);
        let ptr = blocks.resolve(addr);
        assert_eq!(blocks.find_block(ptr), Some(slot));

        blocks.close();
    }

    #[test]
    fn resume_rebuilds_address_tree() {
        let dir = tempfile::tempdir().unwrap();
        let basename = dir.path().join("block-resume");

        let slot = {
            let mut blocks = BlockManager::create(&basename).unwrap();
            let (slot, _) = blocks.allocate_block(config::MIN_HEAP_GROW_SIZE, config::SERIAL_USERDATA).unwrap();
            blocks.close();
            slot
        };

        // A fresh mapping almost certainly lands at a different virtual
        // address than before the restart; what must survive is that the
        // rebuilt tree agrees with the rebuilt mapping, not that either one
        // stays at a fixed address.
        let resumed = BlockManager::attach(&basename).unwrap();
        let addr = crate::address::Addr::from_block_offset(config::SERIAL_USERDATA, slot, 0);
        let ptr = resumed.resolve(addr);
        assert_eq!(resumed.find_block(ptr), Some(slot));
    }
}
