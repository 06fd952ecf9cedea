//! Texture entry store and hash validator.
//!
//! The guest treats texture memory as flat mutable RAM; the backend wants
//! long-lived typed objects. The store bridges the two with hash validation:
//! a cheap sampled fingerprint on every bind, a full-region hash only when
//! the cheap one mismatches, and a rebuild only when the full hash confirms
//! the pixels really changed. The cheap tier can miss an edit within one
//! validation cycle; that false-negative rate is the price of not hashing
//! entire textures on every bind.

use hashbrown::HashMap;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::clut::ClutTracker;
use crate::config::CacheConfig;
use crate::device::{DeviceCaps, DeviceError, GpuDevice, RenderTargetId, TextureDesc, TextureId};
use crate::evict::RecencyQueue;
use crate::formats::{HostFormat, TextureFormat};
use crate::guest_memory::GuestMemory;
use crate::replace::{ContentKey, ReplacementProvider};
use crate::stats::CacheStats;
use crate::texbuild;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapMode {
    Repeat,
    Clamp,
}

/// Guest texture configuration for one draw, as decoded from GPU state.
#[derive(Clone, Copy, Debug)]
pub struct TextureState {
    pub address: u32,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub mag_filter_linear: bool,
    pub min_filter_linear: bool,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub max_anisotropy: u8,
}

impl TextureState {
    pub fn new(address: u32, format: TextureFormat, width: u32, height: u32) -> Self {
        Self {
            address,
            format,
            width,
            height,
            mip_levels: 1,
            mag_filter_linear: true,
            min_filter_linear: true,
            wrap_u: WrapMode::Repeat,
            wrap_v: WrapMode::Repeat,
            max_anisotropy: 1,
        }
    }
}

/// Sampler state handed to the draw pipeline alongside the texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerParams {
    pub mag_linear: bool,
    pub min_linear: bool,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub max_anisotropy: u8,
}

pub fn derive_sampler(state: &TextureState, caps: &DeviceCaps) -> SamplerParams {
    SamplerParams {
        mag_linear: state.mag_filter_linear,
        min_linear: state.min_filter_linear,
        wrap_u: state.wrap_u,
        wrap_v: state.wrap_v,
        max_anisotropy: state.max_anisotropy.clamp(1, caps.max_anisotropy),
    }
}

/// Alpha-channel classification driving downstream blend-path selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlphaStatus {
    #[default]
    Unknown,
    Opaque,
    Translucent,
}

/// Composite cache key. Indexed formats fold the palette hash in, so a CLUT
/// change is a different key: a texture is stale if either its pixels or its
/// palette changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TexCacheKey {
    pub address: u32,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub clut_hash: u64,
}

#[derive(Debug)]
pub struct TexCacheEntry {
    pub texture: Option<TextureId>,
    /// Backing texture dimensions; differ from the key under upscaling or
    /// replacement.
    pub tex_width: u32,
    pub tex_height: u32,
    pub tex_levels: u32,
    pub quick_hash: u64,
    pub full_hash: u64,
    /// Stable content key used for replacement lookup.
    pub content_key: ContentKey,
    /// Total guest bytes across all mip levels, for invalidation overlap.
    pub guest_bytes: usize,
    pub last_frame_used: u64,
    pub alpha: AlphaStatus,
    pub scale_factor: u32,
    pub invalidated: bool,
}

impl TexCacheEntry {
    fn new() -> Self {
        Self {
            texture: None,
            tex_width: 0,
            tex_height: 0,
            tex_levels: 0,
            quick_hash: 0,
            full_hash: 0,
            content_key: [0; 32],
            guest_bytes: 0,
            last_frame_used: 0,
            alpha: AlphaStatus::Unknown,
            scale_factor: 1,
            invalidated: false,
        }
    }
}

/// What a bind resolved to. Valid for the remainder of the current draw
/// call only; the next bind may rebuild or retarget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureSource {
    /// A cache-owned texture object.
    Owned(TextureId),
    /// A live framebuffer's color attachment, sampled zero-copy.
    Framebuffer(RenderTargetId),
    /// A duplicated framebuffer copy (self-sampling hazard).
    FramebufferCopy(TextureId),
}

#[derive(Clone, Copy, Debug)]
pub struct TextureBinding {
    pub source: TextureSource,
    pub sampler: SamplerParams,
    pub alpha: AlphaStatus,
}

/// Cheap validation fingerprint: xxh3 over a bounded sample of the region
/// (start, middle, end) folded with the region length and, for indexed
/// formats, the palette hash.
pub(crate) fn quick_fingerprint<M: GuestMemory>(
    mem: &M,
    address: u32,
    len: usize,
    budget: usize,
    clut_hash: u64,
) -> u64 {
    let budget = budget.max(64);
    let hash = if len <= budget {
        xxh3_64(&mem.read_vec_clamped(address, len))
    } else {
        let head = budget / 2;
        let mid = budget / 4;
        let tail = budget - head - mid;
        let mut buf = Vec::with_capacity(budget + 8);
        buf.extend(mem.read_vec_clamped(address, head));
        buf.extend(mem.read_vec_clamped(address + (len / 2) as u32, mid));
        buf.extend(mem.read_vec_clamped(address + (len - tail) as u32, tail));
        buf.extend((len as u64).to_le_bytes());
        xxh3_64(&buf)
    };
    hash ^ clut_hash
}

/// Deep revalidation hash over the entire level-0 region.
pub(crate) fn full_region_hash<M: GuestMemory>(mem: &M, address: u32, len: usize) -> u64 {
    xxh3_64(&mem.read_vec_clamped(address, len))
}

/// Clamps a requested mip count to what the dimensions support.
pub(crate) fn effective_mip_levels(width: u32, height: u32, requested: u32) -> u32 {
    let largest = width.max(height).max(1);
    let max_levels = 32 - largest.leading_zeros();
    requested.clamp(1, max_levels.max(1))
}

#[derive(Debug, Default)]
pub struct TextureCache {
    entries: HashMap<TexCacheKey, TexCacheEntry>,
    recency: RecencyQueue<TexCacheKey>,
    /// Last key bound; lets an unchanged rebind skip validation entirely
    /// within a frame.
    last_bound: Option<TexCacheKey>,
    placeholder: Option<TextureId>,
    last_invalidate_all_frame: Option<u64>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, key: &TexCacheKey) -> Option<&TexCacheEntry> {
        self.entries.get(key)
    }

    /// Call when the backend's sampler bindings were clobbered externally;
    /// the next bind revalidates even if the key is unchanged.
    pub fn forget_last_texture(&mut self) {
        self.last_bound = None;
    }

    pub fn key_for(&self, state: &TextureState, clut: &ClutTracker) -> TexCacheKey {
        TexCacheKey {
            address: state.address,
            format: state.format,
            width: state.width,
            height: state.height,
            mip_levels: effective_mip_levels(state.width, state.height, state.mip_levels),
            clut_hash: if state.format.is_indexed() {
                clut.hash()
            } else {
                0
            },
        }
    }

    /// Binds a usable texture for the given guest state: no-op, cheap
    /// revalidate, or full rebuild, whichever is necessary.
    #[allow(clippy::too_many_arguments)]
    pub fn bind<D: GpuDevice, M: GuestMemory>(
        &mut self,
        device: &mut D,
        mem: &M,
        clut: &ClutTracker,
        replacer: &dyn ReplacementProvider,
        config: &CacheConfig,
        stats: &mut CacheStats,
        frame: u64,
        state: &TextureState,
    ) -> Result<TextureBinding, DeviceError> {
        stats.frame.binds += 1;
        let sampler = derive_sampler(state, &device.caps());

        // Malformed guest state never fails the draw: substitute a 1x1
        // transparent placeholder.
        if state.width == 0 || state.height == 0 || state.mip_levels == 0 {
            debug!(
                "degenerate texture state at 0x{:08x} ({}x{}), binding placeholder",
                state.address, state.width, state.height
            );
            let placeholder = self.ensure_placeholder(device)?;
            stats.totals.placeholder_binds += 1;
            return Ok(TextureBinding {
                source: TextureSource::Owned(placeholder),
                sampler,
                alpha: AlphaStatus::Translucent,
            });
        }

        let key = self.key_for(state, clut);
        let level0_len = key.format.level_bytes(key.width, key.height);

        if let Some(entry) = self.entries.get_mut(&key) {
            // Unchanged rebind within the same frame: pure lookup.
            if !entry.invalidated
                && entry.last_frame_used == frame
                && self.last_bound == Some(key)
            {
                stats.frame.quick_hits += 1;
                self.recency.touch(&key);
                return Ok(binding_for(entry, sampler));
            }

            let quick = quick_fingerprint(
                mem,
                key.address,
                level0_len,
                config.quick_hash_sample_bytes,
                key.clut_hash,
            );

            if !entry.invalidated && quick == entry.quick_hash {
                stats.frame.quick_hits += 1;
            } else {
                stats.frame.full_hash_checks += 1;
                let full = full_region_hash(mem, key.address, level0_len);
                if full == entry.full_hash {
                    // Content is unchanged; the cheap sample (or an explicit
                    // invalidation) was a false alarm. Refresh and reuse.
                    entry.quick_hash = quick;
                    entry.invalidated = false;
                } else {
                    debug!("texture content at 0x{:08x} changed, rebuilding", key.address);
                    texbuild::build(device, mem, clut, replacer, config, stats, entry, &key)?;
                    entry.invalidated = false;
                }
            }

            entry.last_frame_used = frame;
            let binding = binding_for(entry, sampler);
            self.recency.touch(&key);
            self.last_bound = Some(key);
            return Ok(binding);
        }

        // First bind of a previously-unseen key.
        let mut entry = TexCacheEntry::new();
        texbuild::build(device, mem, clut, replacer, config, stats, &mut entry, &key)?;
        entry.last_frame_used = frame;
        let binding = binding_for(&entry, sampler);
        self.entries.insert(key, entry);
        self.recency.touch(&key);
        self.last_bound = Some(key);
        Ok(binding)
    }

    fn ensure_placeholder<D: GpuDevice>(&mut self, device: &mut D) -> Result<TextureId, DeviceError> {
        if let Some(tex) = self.placeholder {
            return Ok(tex);
        }
        let tex = device.create_texture(&TextureDesc {
            width: 1,
            height: 1,
            mip_levels: 1,
            format: HostFormat::Rgba8,
        })?;
        device.upload_texture_level(tex, 0, 1, 1, &[0, 0, 0, 0])?;
        self.placeholder = Some(tex);
        Ok(tex)
    }

    /// Once-per-frame sweep: entries idle past the retention threshold are
    /// released, then the watermark is enforced oldest-first.
    pub fn decimate<D: GpuDevice>(
        &mut self,
        device: &mut D,
        config: &CacheConfig,
        stats: &mut CacheStats,
        frame: u64,
    ) {
        let stale: Vec<TexCacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| frame.saturating_sub(e.last_frame_used) > config.texture_retention_frames)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            self.remove_entry(device, &key);
            stats.totals.evictions += 1;
        }

        while self.entries.len() > config.max_texture_entries {
            let Some(key) = self.recency.pop_oldest() else {
                break;
            };
            if let Some(mut entry) = self.entries.remove(&key) {
                if let Some(tex) = entry.texture.take() {
                    device.destroy_texture(tex);
                }
                stats.totals.evictions += 1;
            }
            if self.last_bound == Some(key) {
                self.last_bound = None;
            }
        }
    }

    fn remove_entry<D: GpuDevice>(&mut self, device: &mut D, key: &TexCacheKey) {
        if let Some(mut entry) = self.entries.remove(key) {
            if let Some(tex) = entry.texture.take() {
                device.destroy_texture(tex);
            }
        }
        self.recency.remove(key);
        if self.last_bound == Some(*key) {
            self.last_bound = None;
        }
    }

    /// Guest memory operations signaled a write to `[address, address+size)`:
    /// overlapping entries must revalidate with the full hash on next bind.
    pub fn invalidate(&mut self, address: u32, size: u32) {
        let inv_start = address as u64;
        let inv_end = inv_start + size as u64;
        for (key, entry) in self.entries.iter_mut() {
            let start = key.address as u64;
            let end = start + entry.guest_bytes as u64;
            if start < inv_end && inv_start < end {
                entry.invalidated = true;
            }
        }
        self.last_bound = None;
    }

    /// Flags every entry. A second call within the same frame is coalesced;
    /// the entries are already flagged and binds this frame revalidate.
    pub fn invalidate_all(&mut self, stats: &mut CacheStats, frame: u64) {
        stats.frame.invalidate_alls += 1;
        if self.last_invalidate_all_frame == Some(frame) {
            return;
        }
        self.last_invalidate_all_frame = Some(frame);
        for entry in self.entries.values_mut() {
            entry.invalidated = true;
        }
        self.last_bound = None;
    }

    /// Full teardown, releasing every backend object.
    pub fn clear<D: GpuDevice>(&mut self, device: &mut D) {
        for (_, mut entry) in self.entries.drain() {
            if let Some(tex) = entry.texture.take() {
                device.destroy_texture(tex);
            }
        }
        if let Some(tex) = self.placeholder.take() {
            device.destroy_texture(tex);
        }
        self.recency.clear();
        self.last_bound = None;
    }
}

fn binding_for(entry: &TexCacheEntry, sampler: SamplerParams) -> TextureBinding {
    TextureBinding {
        // A built entry always carries a texture; fall back to a null id
        // only if a build was interrupted mid-way.
        source: TextureSource::Owned(entry.texture.unwrap_or(TextureId(0))),
        sampler,
        alpha: entry.alpha,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_clamp_to_dimensions() {
        assert_eq!(effective_mip_levels(64, 64, 1), 1);
        assert_eq!(effective_mip_levels(64, 64, 7), 7);
        assert_eq!(effective_mip_levels(64, 64, 9), 7);
        assert_eq!(effective_mip_levels(1, 1, 5), 1);
        assert_eq!(effective_mip_levels(0, 0, 3), 1);
    }

    #[test]
    fn quick_fingerprint_is_deterministic_and_length_sensitive() {
        use crate::guest_memory::VecGuestMemory;
        let mem = VecGuestMemory::new(16 * 1024);
        mem.write(0, &[0xAB; 8 * 1024]).unwrap();

        let a = quick_fingerprint(&mem, 0, 8 * 1024, 1024, 0);
        let b = quick_fingerprint(&mem, 0, 8 * 1024, 1024, 0);
        assert_eq!(a, b);

        // Same prefix, different declared length: the fold must differ.
        let c = quick_fingerprint(&mem, 0, 4 * 1024, 1024, 0);
        assert_ne!(a, c);

        // Palette hash participates.
        let d = quick_fingerprint(&mem, 0, 8 * 1024, 1024, 0x1234);
        assert_ne!(a, d);
    }
}
