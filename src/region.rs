//! Byte-addressable arenas.
//!
//! Every structure in a trace file is addressed by offset from the start of
//! a region, never by a stored pointer. The same layout code therefore runs
//! over a heap allocation in tests and over a shared mapping in production,
//! where a concurrent writer may change any byte at any time. All accesses
//! are unaligned-safe copies; nothing hands out references into the region.

use std::alloc::{self, Layout, LayoutError};
use std::ptr;

/// A raw view over `len` bytes.
///
/// `RawRegion` is `Copy` and carries no lifetime: whoever creates one
/// (a [`HeapArena`], a mapped trace file) must keep the memory alive for as
/// long as views exist. Out-of-range accesses never fault: loads read zero
/// bytes and stores are dropped.
#[derive(Clone, Copy, Debug)]
pub struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as this view (or any copy of it) is used.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A view of `len` bytes starting at `offset`, clamped to this region.
    pub fn sub(&self, offset: usize, len: usize) -> RawRegion {
        let offset = offset.min(self.len);
        let len = len.min(self.len - offset);
        RawRegion {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    #[inline(always)]
    fn in_bounds(&self, offset: usize, n: usize) -> bool {
        offset <= self.len && n <= self.len - offset
    }

    /// Copies up to `out.len()` bytes starting at `offset` and returns how
    /// many were available. Missing bytes in `out` are left untouched.
    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - offset);
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), n) };
        n
    }

    #[inline(always)]
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        if self.in_bounds(offset, bytes.len()) {
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len()) };
        }
    }

    pub fn fill(&self, offset: usize, n: usize, value: u8) {
        if self.in_bounds(offset, n) {
            unsafe { ptr::write_bytes(self.ptr.add(offset), value, n) };
        }
    }

    #[inline(always)]
    pub fn load_u8(&self, offset: usize) -> u8 {
        if offset < self.len {
            unsafe { ptr::read_volatile(self.ptr.add(offset)) }
        } else {
            0
        }
    }

    #[inline(always)]
    pub fn load_u32(&self, offset: usize) -> u32 {
        if self.in_bounds(offset, 4) {
            unsafe { ptr::read_unaligned(self.ptr.add(offset) as *const u32) }
        } else {
            0
        }
    }

    #[inline(always)]
    pub fn load_u64(&self, offset: usize) -> u64 {
        if self.in_bounds(offset, 8) {
            u64::from_ne_bytes(unsafe { ptr::read_volatile(self.ptr.add(offset) as *const [u8; 8]) })
        } else {
            0
        }
    }

    #[inline(always)]
    pub fn load_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.load_u64(offset))
    }

    #[inline(always)]
    pub fn store_u8(&self, offset: usize, value: u8) {
        if offset < self.len {
            unsafe { ptr::write_volatile(self.ptr.add(offset), value) };
        }
    }

    #[inline(always)]
    pub fn store_u32(&self, offset: usize, value: u32) {
        if self.in_bounds(offset, 4) {
            unsafe { ptr::write_unaligned(self.ptr.add(offset) as *mut u32, value) };
        }
    }

    #[inline(always)]
    pub fn store_u64(&self, offset: usize, value: u64) {
        if self.in_bounds(offset, 8) {
            unsafe { ptr::write_volatile(self.ptr.add(offset) as *mut [u8; 8], value.to_ne_bytes()) };
        }
    }

    #[inline(always)]
    pub fn store_f64(&self, offset: usize, value: f64) {
        self.store_u64(offset, value.to_bits());
    }

    /// Raw address of `offset`, used for prefetch hints and for atomics on
    /// naturally aligned fields.
    pub(crate) fn addr(&self, offset: usize) -> *mut u8 {
        unsafe { self.ptr.add(offset.min(self.len)) }
    }
}

/// An owned, zeroed, 8-byte aligned heap region.
pub struct HeapArena {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for HeapArena {}

impl HeapArena {
    pub fn new(size: usize) -> Result<Self, LayoutError> {
        let layout = Layout::from_size_align(size.max(8), 8)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Ok(Self { ptr, layout })
    }

    pub fn region(&self) -> RawRegion {
        unsafe { RawRegion::from_raw_parts(self.ptr, self.layout.size()) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }
}

impl Drop for HeapArena {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}
