//! Shared harness for the cache integration tests: a `GpuCache` over the
//! software device and a plain RAM guest memory the tests keep a handle to.

// Each test binary uses its own subset of the harness.
#![allow(dead_code)]

use std::rc::Rc;

use aster_gpu::{CacheConfig, GpuCache, SimDevice, VecGuestMemory};

pub const GUEST_RAM_BYTES: usize = 8 * 1024 * 1024;

/// Texture data region.
pub const TEX_ADDR: u32 = 0x0010_0000;
/// CLUT region.
pub const CLUT_ADDR: u32 = 0x0008_0000;
/// Framebuffer regions.
pub const FB_ADDR_A: u32 = 0x0040_0000;
pub const FB_ADDR_B: u32 = 0x0060_0000;
pub const Z_ADDR: u32 = 0x0070_0000;

pub type TestCache = GpuCache<SimDevice, Rc<VecGuestMemory>>;

pub fn new_cache() -> (TestCache, Rc<VecGuestMemory>) {
    new_cache_with(CacheConfig::default())
}

pub fn new_cache_with(config: CacheConfig) -> (TestCache, Rc<VecGuestMemory>) {
    let mem = Rc::new(VecGuestMemory::new(GUEST_RAM_BYTES));
    let mut cache = GpuCache::new(SimDevice::new(), Rc::clone(&mem), config);
    // Frame 0 is reserved for setup; tests drive frames explicitly.
    cache.begin_frame();
    (cache, mem)
}
