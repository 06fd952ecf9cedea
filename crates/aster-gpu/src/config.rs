//! Tunables for the caching layer.
//!
//! Retention thresholds and watermarks are measured in guest frames, not
//! wall time; guest frame pacing is the clock everywhere in this layer.

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Frames a texture entry may go unused before decimation removes it.
    pub texture_retention_frames: u64,
    /// Frames a non-current virtual framebuffer may go unused before its
    /// backing objects are destroyed.
    pub fb_retention_frames: u64,
    /// Hard ceiling on live texture entries. Exceeding it forces
    /// oldest-first eviction regardless of retention age.
    pub max_texture_entries: usize,
    /// Upscale factor applied by the texture builder (1, 2 or 4).
    pub scale_factor: u32,
    /// Render-resolution multiplier for virtual framebuffers. Backing
    /// targets are allocated at `logical * render_scale`; readback samples
    /// back down to logical resolution.
    pub render_scale: u32,
    /// Byte budget for the cheap validation fingerprint. Regions larger
    /// than this are sampled (start, middle, end) instead of fully hashed.
    pub quick_hash_sample_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            texture_retention_frames: 180,
            fb_retention_frames: 30,
            max_texture_entries: 1024,
            scale_factor: 1,
            render_scale: 1,
            quick_hash_sample_bytes: 2048,
        }
    }
}
