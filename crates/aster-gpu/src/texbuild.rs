//! Texture builder: decodes guest pixel data into backend-uploadable RGBA8,
//! consults the replacement provider, applies optional upscaling and uploads
//! all requested mip levels.
//!
//! Mip levels are stored consecutively in guest memory, level 0 first.
//! Replacement supersedes both decode and upscale for a level; upscaling
//! keeps the decoded 1x data as the fallback until a pass succeeds.

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::clut::ClutTracker;
use crate::config::CacheConfig;
use crate::device::{DeviceError, GpuDevice, TextureDesc};
use crate::formats::{decode_4444, decode_5551, decode_565, format_info, TextureFormat};
use crate::guest_memory::GuestMemory;
use crate::replace::{content_key_for, ContentKey, ReplacementProvider};
use crate::scale;
use crate::stats::CacheStats;
use crate::texcache::{quick_fingerprint, AlphaStatus, TexCacheEntry, TexCacheKey};

pub(crate) struct DecodedLevel {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub(crate) fn level_dims(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

/// Guest address of a mip level, given consecutive storage.
pub(crate) fn level_address(
    address: u32,
    format: TextureFormat,
    width: u32,
    height: u32,
    level: u32,
) -> u32 {
    let mut addr = address;
    for l in 0..level {
        let (w, h) = level_dims(width, height, l);
        addr = addr.wrapping_add(format.level_bytes(w, h) as u32);
    }
    addr
}

/// Decodes one mip level into tightly packed RGBA8. Palette indices resolve
/// through the CLUT snapshot with clamping; out-of-range guest reads come
/// back zero-filled, so this never fails.
pub(crate) fn decode_level<M: GuestMemory>(
    mem: &M,
    clut: &ClutTracker,
    address: u32,
    format: TextureFormat,
    width: u32,
    height: u32,
    level: u32,
) -> DecodedLevel {
    let (w, h) = level_dims(width, height, level);
    let addr = level_address(address, format, width, height, level);
    let raw = mem.read_vec_clamped(addr, format.level_bytes(w, h));
    let texels = (w * h) as usize;
    let mut rgba = Vec::with_capacity(texels * 4);

    match format {
        TextureFormat::Clut4 => {
            for i in 0..texels {
                let byte = raw.get(i / 2).copied().unwrap_or(0);
                let index = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                rgba.extend_from_slice(&clut.entry(index as usize));
            }
        }
        TextureFormat::Clut8 => {
            for i in 0..texels {
                let index = raw.get(i).copied().unwrap_or(0);
                rgba.extend_from_slice(&clut.entry(index as usize));
            }
        }
        TextureFormat::Rgb565 | TextureFormat::Rgba5551 | TextureFormat::Rgba4444 => {
            for px in raw.chunks_exact(2) {
                let v = u16::from_le_bytes([px[0], px[1]]);
                rgba.extend_from_slice(&match format {
                    TextureFormat::Rgb565 => decode_565(v),
                    TextureFormat::Rgba5551 => decode_5551(v),
                    _ => decode_4444(v),
                });
            }
        }
        TextureFormat::Rgba8888 => {
            for px in raw.chunks_exact(4) {
                rgba.extend_from_slice(&[px[0], px[1], px[2], px[3]]);
            }
        }
    }
    rgba.resize(texels * 4, 0);

    DecodedLevel { rgba, width: w, height: h }
}

pub(crate) fn classify_alpha(rgba: &[u8]) -> AlphaStatus {
    if rgba.chunks_exact(4).all(|px| px[3] == 0xFF) {
        AlphaStatus::Opaque
    } else {
        AlphaStatus::Translucent
    }
}

/// Builds (or rebuilds) a validated-stale entry in place: decode, replace,
/// upscale, upload, then refresh the stored fingerprints so subsequent
/// validation passes can short-circuit.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build<D: GpuDevice, M: GuestMemory>(
    device: &mut D,
    mem: &M,
    clut: &ClutTracker,
    replacer: &dyn ReplacementProvider,
    config: &CacheConfig,
    stats: &mut CacheStats,
    entry: &mut TexCacheEntry,
    key: &TexCacheKey,
) -> Result<(), DeviceError> {
    let level0_len = key.format.level_bytes(key.width, key.height);
    let region = mem.read_vec_clamped(key.address, level0_len);
    let full_hash = xxh3_64(&region);
    let content_key: ContentKey = content_key_for(&region);
    let quick_hash = quick_fingerprint(
        mem,
        key.address,
        level0_len,
        config.quick_hash_sample_bytes,
        key.clut_hash,
    );

    let scale_factor = config.scale_factor.max(1);
    let mut levels: Vec<DecodedLevel> = Vec::with_capacity(key.mip_levels as usize);
    let mut applied_scale = 1;
    let mut guest_bytes = 0usize;
    let mut level0_for_alpha: Option<AlphaStatus> = None;

    for level in 0..key.mip_levels {
        let (gw, gh) = level_dims(key.width, key.height, level);
        guest_bytes += key.format.level_bytes(gw, gh);

        if let Some(rep) = replacer.lookup(&content_key, level) {
            debug!(
                "replacement asset substituted for 0x{:08x} level {} ({}x{})",
                key.address, level, rep.width, rep.height
            );
            if level == 0 {
                level0_for_alpha = Some(classify_alpha(&rep.rgba));
            }
            levels.push(DecodedLevel {
                rgba: rep.rgba,
                width: rep.width,
                height: rep.height,
            });
            continue;
        }

        let decoded = decode_level(mem, clut, key.address, key.format, key.width, key.height, level);
        if level == 0 {
            level0_for_alpha = Some(classify_alpha(&decoded.rgba));
        }

        if scale_factor > 1 {
            match scale::upscale(&decoded.rgba, decoded.width, decoded.height, scale_factor) {
                Some(scaled) => {
                    stats.frame.texels_scaled += (decoded.width * decoded.height) as u64;
                    applied_scale = scale_factor;
                    levels.push(DecodedLevel {
                        rgba: scaled,
                        width: decoded.width * scale_factor,
                        height: decoded.height * scale_factor,
                    });
                    continue;
                }
                None => {
                    debug!(
                        "upscale pass failed for 0x{:08x} level {}, keeping native data",
                        key.address, level
                    );
                }
            }
        }
        levels.push(decoded);
    }

    // Classify alpha once per content change; it is expensive to repeat and
    // downstream blending only needs it when the pixels moved.
    if entry.alpha == AlphaStatus::Unknown || full_hash != entry.full_hash {
        entry.alpha = level0_for_alpha.unwrap_or(AlphaStatus::Translucent);
    }

    let (w0, h0) = (levels[0].width, levels[0].height);
    let level_count = levels.len() as u32;
    let texture = match entry.texture {
        // Same shape: upload in place, keeping the backend object.
        Some(tex)
            if entry.tex_width == w0
                && entry.tex_height == h0
                && entry.tex_levels == level_count =>
        {
            tex
        }
        _ => {
            if let Some(old) = entry.texture.take() {
                device.destroy_texture(old);
            }
            let tex = device.create_texture(&TextureDesc {
                width: w0,
                height: h0,
                mip_levels: level_count,
                format: format_info(key.format).host,
            })?;
            entry.texture = Some(tex);
            entry.tex_width = w0;
            entry.tex_height = h0;
            entry.tex_levels = level_count;
            tex
        }
    };

    for (level, data) in levels.iter().enumerate() {
        device.upload_texture_level(texture, level as u32, data.width, data.height, &data.rgba)?;
    }

    entry.quick_hash = quick_hash;
    entry.full_hash = full_hash;
    entry.content_key = content_key;
    entry.guest_bytes = guest_bytes;
    entry.scale_factor = applied_scale;
    stats.frame.rebuilds += 1;
    Ok(())
}
