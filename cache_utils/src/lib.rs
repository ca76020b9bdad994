#![deny(unsafe_op_in_unsafe_fn)]

use core::ptr;

pub mod cache_info;
pub mod geometry;
pub mod mmap;

pub use geometry::{CacheGeometry, GeometryError, WORD_BYTES};

pub const BYTES_PER_MB: usize = 1024 * 1024;

/// Volatile load, the compiler cannot drop it or fuse it with its neighbours.
///
/// # Safety
///
/// `p` must be valid for reads and properly aligned.
pub unsafe fn maccess<T: Copy>(p: *const T) -> T {
    unsafe { ptr::read_volatile(p) }
}
