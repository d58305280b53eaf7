//! `Addr` is the crate's stable address: a 64-bit value that survives
//! remapping because it names an offset into a block, not a virtual
//! address. Analogous to slitter's `LinearRef`, except a `LinearRef` wraps
//! a live process pointer while an `Addr` wraps something that outlives
//! the process.
use crate::config;

/// A 64-bit handle: `serial:16 | offset:48`. `Addr::NULL` is the all-zero
/// pattern and is the only value with `serial() == 0`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Addr(u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    #[inline]
    pub fn new(serial: u16, offset: u64) -> Addr {
        debug_assert!(offset < (1u64 << config::ADDRESS_BITS));
        Addr(((serial as u64) << config::ADDRESS_BITS) | (offset & ((1u64 << config::ADDRESS_BITS) - 1)))
    }

    #[inline]
    pub fn from_u64(bits: u64) -> Addr {
        Addr(bits)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn serial(self) -> u16 {
        (self.0 >> config::ADDRESS_BITS) as u16
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & ((1u64 << config::ADDRESS_BITS) - 1)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.serial() == config::SERIAL_NULL
    }

    /// The 48-bit offset packs a block id into its upper
    /// `MAX_BLOCK_BITS` bits and a byte offset within that block into the
    /// rest: `offset = block_id:16 | intra_block:32`. This lets one flat
    /// offset space span every block a pool has ever grown into, without
    /// needing the serial (a coarse metadata/userdata namespace tag) to
    /// also double as a block selector.
    #[inline]
    pub fn from_block_offset(serial: u16, block_id: u16, intra_block: u32) -> Addr {
        let offset = ((block_id as u64) << config::MAX_HEAP_GROW_BITS) | (intra_block as u64);
        Addr::new(serial, offset)
    }

    #[inline]
    pub fn block_id(self) -> u16 {
        (self.offset() >> config::MAX_HEAP_GROW_BITS) as u16
    }

    #[inline]
    pub fn intra_block_offset(self) -> u32 {
        (self.offset() & ((1u64 << config::MAX_HEAP_GROW_BITS) - 1)) as u32
    }
}

impl Default for Addr {
    fn default() -> Addr {
        Addr::NULL
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let a = Addr::new(7, 0x1234_5678);
        assert_eq!(a.serial(), 7);
        assert_eq!(a.offset(), 0x1234_5678);
        assert!(!a.is_null());
    }

    #[test]
    fn null_is_null() {
        assert!(Addr::NULL.is_null());
        assert_eq!(Addr::default(), Addr::NULL);
    }

    #[test]
    fn offset_masks_high_bits() {
        let a = Addr::new(3, (1u64 << config::ADDRESS_BITS) - 1);
        assert_eq!(a.offset(), (1u64 << config::ADDRESS_BITS) - 1);
        assert_eq!(a.serial(), 3);
    }

    #[test]
    fn block_offset_round_trip() {
        let a = Addr::from_block_offset(config::SERIAL_USERDATA, 42, 0xABCD_EF01);
        assert_eq!(a.serial(), config::SERIAL_USERDATA);
        assert_eq!(a.block_id(), 42);
        assert_eq!(a.intra_block_offset(), 0xABCD_EF01);
    }
}
