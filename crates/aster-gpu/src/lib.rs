//! GPU resource caching layer for the aster graphics backend.
//!
//! Translates a guest console's retained-mode GPU state (texture addresses,
//! palette data, render targets) into backend GPU objects while tracking
//! when those objects go stale relative to guest memory writes. Two
//! interlocked subsystems do the heavy lifting: the hash-validated texture
//! cache (CLUT handling, decimation, replacement/upscaling pipeline) and the
//! virtual framebuffer manager (render-target lifecycle,
//! framebuffer-as-texture binding, CPU readback).
//!
//! The backend itself is abstract: everything is driven through the
//! [`device::GpuDevice`] trait, with one thin adapter per concrete graphics
//! API living outside this crate. [`device::SimDevice`] is the software
//! implementation backing the test suites.

#![forbid(unsafe_code)]

pub mod cache;
pub mod clut;
pub mod config;
pub mod device;
mod evict;
pub mod formats;
pub mod framebuffer;
pub mod guest_memory;
pub mod readback;
pub mod replace;
mod scale;
pub mod stats;
mod texbuild;
pub mod texcache;

pub use cache::GpuCache;
pub use clut::ClutTracker;
pub use config::CacheConfig;
pub use device::{
    DeviceCaps, DeviceError, GpuDevice, Rect, RenderTargetId, SimDevice, TextureId, TransferId,
};
pub use formats::{BufferFormat, ClutFormat, PixelBuffer, PixelBufferKind, TextureFormat};
pub use framebuffer::{
    BindFlags, FramebufferInfo, FramebufferManager, RenderTargetParams, VirtualFramebuffer,
};
pub use guest_memory::{GuestMemory, GuestMemoryError, VecGuestMemory};
pub use replace::{
    content_key_for, ContentKey, NoReplacements, ReplacementImage, ReplacementProvider,
    TableReplacements,
};
pub use stats::{FrameStats, StatsSnapshot, TotalStats};
pub use texcache::{
    AlphaStatus, SamplerParams, TexCacheKey, TextureBinding, TextureCache, TextureSource,
    TextureState, WrapMode,
};
