//! Texture builder pipeline: mip chains, replacement assets and upscaling.

mod common;

use aster_gpu::{
    content_key_for, BindFlags, CacheConfig, GuestMemory, ReplacementImage, TableReplacements,
    TextureFormat, TextureSource, TextureState,
};
use aster_gpu_utils::{checkerboard, solid};
use common::{new_cache, new_cache_with, TEX_ADDR};

#[test]
fn mip_chain_uploads_every_level() {
    let (mut cache, mem) = new_cache();

    // 16x16 with 3 levels stored consecutively.
    mem.write(TEX_ADDR, &solid(16, 16, [1, 0, 0, 255])).unwrap();
    mem.write(TEX_ADDR + 16 * 16 * 4, &solid(8, 8, [2, 0, 0, 255]))
        .unwrap();
    mem.write(TEX_ADDR + 16 * 16 * 4 + 8 * 8 * 4, &solid(4, 4, [3, 0, 0, 255]))
        .unwrap();

    let mut state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 16, 16);
    state.mip_levels = 3;
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };

    let dev = cache.device();
    assert_eq!(dev.texture_level(tex, 0).unwrap().len(), 16 * 16 * 4);
    assert_eq!(dev.texture_level(tex, 1).unwrap().len(), 8 * 8 * 4);
    assert_eq!(dev.texture_level(tex, 2).unwrap().len(), 4 * 4 * 4);
    assert_eq!(&dev.texture_level(tex, 1).unwrap()[0..4], &[2, 0, 0, 255]);
    assert_eq!(&dev.texture_level(tex, 2).unwrap()[0..4], &[3, 0, 0, 255]);
}

#[test]
fn requested_levels_clamp_to_dimensions() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &solid(4, 4, [5, 0, 0, 255])).unwrap();

    let mut state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 4, 4);
    state.mip_levels = 12;
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };
    // 4x4 supports levels 4x4, 2x2, 1x1.
    assert!(cache.device().texture_level(tex, 2).is_some());
    assert!(cache.device().texture_level(tex, 3).is_none());
}

#[test]
fn upscaling_scales_uploaded_levels_and_counts_texels() {
    let (mut cache, mem) = new_cache_with(CacheConfig {
        scale_factor: 2,
        ..Default::default()
    });
    mem.write(TEX_ADDR, &checkerboard(8, 8, 2, [255, 0, 0, 255], [0, 0, 255, 255]))
        .unwrap();

    let state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 8, 8);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };

    assert_eq!(
        cache.device().texture_level(tex, 0).unwrap().len(),
        16 * 16 * 4
    );
    assert_eq!(cache.stats().frame.texels_scaled, 64);
}

#[test]
fn replacement_supersedes_decode_and_upscale() {
    let (mut cache, mem) = new_cache_with(CacheConfig {
        scale_factor: 2,
        ..Default::default()
    });
    let guest = solid(8, 8, [50, 60, 70, 255]);
    mem.write(TEX_ADDR, &guest).unwrap();

    // Replacement keyed by the guest region's content hash, targeting level
    // 0 only, with its own natural dimensions.
    let mut packs = TableReplacements::new();
    packs.insert(
        content_key_for(&guest),
        0,
        ReplacementImage {
            rgba: solid(32, 32, [200, 0, 200, 255]),
            width: 32,
            height: 32,
        },
    );
    cache.set_replacement_provider(Box::new(packs));

    let state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 8, 8);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };

    let level0 = cache.device().texture_level(tex, 0).unwrap();
    assert_eq!(level0.len(), 32 * 32 * 4);
    assert_eq!(&level0[0..4], &[200, 0, 200, 255]);
    // Replaced levels are never routed through the upscaler.
    assert_eq!(cache.stats().frame.texels_scaled, 0);
}

#[test]
fn replacement_misses_fall_back_to_decode() {
    let (mut cache, mem) = new_cache();
    mem.write(TEX_ADDR, &solid(4, 4, [9, 8, 7, 255])).unwrap();

    // Provider keyed by some other content: never consulted successfully.
    let mut packs = TableReplacements::new();
    packs.insert(
        content_key_for(b"unrelated"),
        0,
        ReplacementImage {
            rgba: solid(2, 2, [0, 0, 0, 0]),
            width: 2,
            height: 2,
        },
    );
    cache.set_replacement_provider(Box::new(packs));

    let state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 4, 4);
    let binding = cache.set_texture(&state, BindFlags::empty()).unwrap();
    let TextureSource::Owned(tex) = binding.source else {
        panic!("expected an owned texture");
    };
    assert_eq!(&cache.device().texture_level(tex, 0).unwrap()[0..4], &[9, 8, 7, 255]);
}

#[test]
fn debug_decode_does_not_touch_the_cache() {
    let (cache, mem) = new_cache();
    mem.write(TEX_ADDR, &solid(4, 4, [1, 2, 3, 4])).unwrap();

    let state = TextureState::new(TEX_ADDR, TextureFormat::Rgba8888, 4, 4);
    let buf = cache.decode_texture_for_debug(&state);
    assert_eq!((buf.width, buf.height), (4, 4));
    assert_eq!(&buf.data[0..4], &[1, 2, 3, 4]);
    assert_eq!(cache.texture_entry_count(), 0);
    assert_eq!(cache.device().textures_created, 0);
}
