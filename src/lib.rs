//! A malloc/free allocator whose allocations are addressed by stable,
//! file-relative handles instead of raw pointers, so a pool survives a
//! process restart: `fini` unmaps everything and leaves the backing files
//! alone, and a later `resume` remaps them and rebuilds the handful of
//! in-process lookup structures that do not themselves live on disk.
//!
//! See [`Allocator`] for the public surface and [`Addr`] for the handle
//! type every allocation is named by.
mod address;
mod bitmap;
mod block;
mod chunk_cache;
mod class_table;
mod config;
mod error;
mod manager;
mod meta;
mod page_heap;
mod radix;
mod segment;
mod span;

pub use address::Addr;
pub use error::{AllocError, Result};
pub use manager::{Allocator, Stats};
