//! Hash-driven validation behavior of the texture cache: bind idempotence,
//! invalidation on in-region writes, palette double-keying and the
//! malformed-state placeholder path.

mod common;

use aster_gpu::{
    AlphaStatus, BindFlags, ClutFormat, GuestMemory, TextureFormat, TextureSource, TextureState,
};
use aster_gpu_utils::hgradient;
use common::{new_cache, CLUT_ADDR, TEX_ADDR};

fn rgba_state(width: u32, height: u32) -> TextureState {
    TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, width, height)
}

#[test]
fn first_bind_builds_second_bind_is_a_lookup() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(64, 64)).unwrap();

    let state = rgba_state(64, 64);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert!(matches!(binding.source, TextureSource::Owned(_)));
    assert_eq!(cache.stats().frame.rebuilds, 1);
    assert_eq!(cache.texture_entry_count(), 1);

    // Same frame, unchanged key: pure lookup, no GPU work.
    let uploads_before = cache.device().texture_uploads;
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 1);
    assert_eq!(cache.device().texture_uploads, uploads_before);

    // Next frame, no intervening write: cheap fingerprint match.
    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 0);
    assert_eq!(cache.stats().frame.quick_hits, 1);
    assert_eq!(cache.device().texture_uploads, uploads_before);
}

#[test]
fn write_inside_region_rebuilds_exactly_once() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(64, 64)).unwrap();

    let state = rgba_state(64, 64);
    cache.set_texture(&state, BindFlags::empty()).unwrap();

    // One byte inside [TEX_ADDR, TEX_ADDR + 64*64*4).
    mem.write(TEX_ADDR + 129, &[0xEE]).unwrap();

    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.full_hash_checks, 1);
    assert_eq!(cache.stats().frame.rebuilds, 1);

    // And exactly once: a further bind without writes is free again.
    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 0);
}

#[test]
fn write_outside_region_does_not_rebuild() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(64, 64)).unwrap();

    let state = rgba_state(64, 64);
    cache.set_texture(&state, BindFlags::empty()).unwrap();

    // Just past the end of the region.
    mem.write(TEX_ADDR + 64 * 64 * 4, &[0xEE]).unwrap();

    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 0);
}

#[test]
fn palette_change_invalidates_indexed_formats_only() {
    let (mut cache, mem) = new_cache();
    // Indexed texture: indices 0..=3 in a 2x2 CLUT8 image.
    mem.write(TEX_ADDR, &[0, 1, 2, 3]).unwrap();
    mem.write(CLUT_ADDR, &hgradient(16, 1)).unwrap();
    cache.load_clut(CLUT_ADDR, 16, ClutFormat::Rgba8888).unwrap();

    let indexed = TextureState::new(TEX_ADDR, TextureFormat::Clut8, 2, 2);
    cache.set_texture(&indexed, BindFlags::empty()).unwrap();
    assert_eq!(cache.texture_entry_count(), 1);

    // Changing the palette re-keys the indexed texture: next bind builds a
    // fresh entry rather than reusing stale colors.
    mem.write(CLUT_ADDR, &[9, 9, 9, 9]).unwrap();
    cache.load_clut(CLUT_ADDR, 16, ClutFormat::Rgba8888).unwrap();
    cache.begin_frame();
    cache.set_texture(&indexed, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 1);
    assert_eq!(cache.texture_entry_count(), 2);

    // A direct-format texture is indifferent to palette traffic.
    let direct_addr = TEX_ADDR + 0x1000;
    mem.write(direct_addr, &hgradient(4, 4)).unwrap();
    let direct = TextureState::new(direct_addr, TextureFormat::Rgba8888, 4, 4);
    cache.set_texture(&direct, BindFlags::empty()).unwrap();

    mem.write(CLUT_ADDR, &[7, 7, 7, 7]).unwrap();
    cache.load_clut(CLUT_ADDR, 16, ClutFormat::Rgba8888).unwrap();
    cache.begin_frame();
    cache.set_texture(&direct, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 0);
}

#[test]
fn degenerate_state_binds_placeholder_instead_of_failing() {
    let (mut cache, _mem) = new_cache();

    let state = rgba_state(0, 0);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert!(matches!(binding.source, TextureSource::Owned(_)));
    assert_eq!(binding.alpha, AlphaStatus::Translucent);
    assert_eq!(cache.texture_entry_count(), 0);
    assert_eq!(cache.stats().totals.placeholder_binds, 1);
}

#[test]
fn explicit_invalidation_forces_revalidation() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(16, 16)).unwrap();
    let state = rgba_state(16, 16);
    cache.set_texture(&state, BindFlags::empty()).unwrap();

    // Invalidate without an actual change: the full hash confirms the
    // content is intact, so no rebuild happens.
    cache.invalidate(TEX_ADDR, 16 * 16 * 4);
    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.full_hash_checks, 1);
    assert_eq!(cache.stats().frame.rebuilds, 0);

    // Invalidate after a real write: rebuild.
    mem.write(TEX_ADDR + 4, &[0x55]).unwrap();
    cache.invalidate(TEX_ADDR, 16 * 16 * 4);
    cache.begin_frame();
    cache.set_texture(&state, BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.rebuilds, 1);
}

#[test]
fn invalidate_all_is_coalesced_within_a_frame() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(8, 8)).unwrap();
    cache.set_texture(&rgba_state(8, 8), BindFlags::empty()).unwrap();

    cache.begin_frame();
    cache.invalidate_all();
    cache.invalidate_all();
    assert_eq!(cache.stats().frame.invalidate_alls, 2);

    // Entries revalidate once; the unchanged content avoids a rebuild.
    cache.set_texture(&rgba_state(8, 8), BindFlags::empty()).unwrap();
    assert_eq!(cache.stats().frame.full_hash_checks, 1);
    assert_eq!(cache.stats().frame.rebuilds, 0);
}

#[test]
fn alpha_classification_reaches_the_binding() {
    let (mut cache, mem) = new_cache();

    // Fully opaque 4x4.
    mem.write(TEX_ADDR, &aster_gpu_utils::solid(4, 4, [10, 20, 30, 255]))
        .unwrap();
    let binding = cache
        .set_texture(&rgba_state(4, 4), BindFlags::empty())
        .unwrap();
    assert_eq!(binding.alpha, AlphaStatus::Opaque);

    // One translucent pixel flips the classification on rebuild.
    mem.write(TEX_ADDR + 3, &[0x7F]).unwrap();
    cache.begin_frame();
    let binding = cache
        .set_texture(&rgba_state(4, 4), BindFlags::empty())
        .unwrap();
    assert_eq!(binding.alpha, AlphaStatus::Translucent);
}

#[test]
fn sampler_anisotropy_clamps_to_device_caps() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &hgradient(4, 4)).unwrap();

    let mut state = rgba_state(4, 4);
    state.max_anisotropy = 255;
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    // SimDevice reports 16x as its ceiling.
    assert_eq!(binding.sampler.max_anisotropy, 16);
}

#[test]
fn corrupt_palette_indices_clamp() {
    let (mut cache, mem) = new_cache();
    // Two-entry palette, but indices go up to 255.
    mem.write(CLUT_ADDR, &[1, 2, 3, 255, 4, 5, 6, 255]).unwrap();
    cache.load_clut(CLUT_ADDR, 2, ClutFormat::Rgba8888).unwrap();
    mem.write(TEX_ADDR, &[0x00, 0xFF, 0x01, 0x80]).unwrap();

    let state = TextureState::new(TEX_ADDR, TextureFormat::Clut8, 2, 2);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };
    let pixels = cache.device().texture_level(tex, 0).unwrap().to_vec();
    assert_eq!(&pixels[0..4], &[1, 2, 3, 255]);
    // Out-of-range indices resolve to the last palette entry.
    assert_eq!(&pixels[4..8], &[4, 5, 6, 255]);
    assert_eq!(&pixels[12..16], &[4, 5, 6, 255]);
}
