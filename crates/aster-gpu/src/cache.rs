//! The cache/manager facade.
//!
//! One [`GpuCache`] instance owns the backend device, the guest memory
//! handle, the palette tracker, the texture entry store, the virtual
//! framebuffer registry and the readback pipeline. All mutation happens on
//! the thread issuing draw calls; there is no internal locking because there
//! is no concurrent mutator. The only asynchrony is the device's own command
//! queue, polled through the readback pipeline.
//!
//! Per-frame protocol: `begin_frame` (counter reset + decimation tick), any
//! number of `set_render_target` / `set_texture` / readback calls, then
//! `end_frame` (async readback housekeeping).

use tracing::{debug, trace};

use crate::clut::ClutTracker;
use crate::config::CacheConfig;
use crate::device::{DeviceError, GpuDevice, Rect};
use crate::formats::{ClutFormat, PixelBuffer, PixelBufferKind};
use crate::framebuffer::{
    BindFlags, FramebufferBinding, FramebufferInfo, FramebufferManager, FramebufferMatch,
    RenderTargetParams, VirtualFramebuffer,
};
use crate::guest_memory::GuestMemory;
use crate::readback::{self, ReadbackPipeline};
use crate::replace::{NoReplacements, ReplacementProvider};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::texbuild;
use crate::texcache::{
    AlphaStatus, SamplerParams, TextureBinding, TextureCache, TextureSource, TextureState,
    WrapMode,
};

pub struct GpuCache<D: GpuDevice, M: GuestMemory> {
    device: D,
    mem: M,
    clut: ClutTracker,
    textures: TextureCache,
    framebuffers: FramebufferManager,
    readback: ReadbackPipeline,
    replacer: Box<dyn ReplacementProvider>,
    stats: CacheStats,
    config: CacheConfig,
    frame: u64,
}

impl<D: GpuDevice, M: GuestMemory> GpuCache<D, M> {
    pub fn new(device: D, mem: M, config: CacheConfig) -> Self {
        Self {
            device,
            mem,
            clut: ClutTracker::new(),
            textures: TextureCache::new(),
            framebuffers: FramebufferManager::new(),
            readback: ReadbackPipeline::new(),
            replacer: Box::new(NoReplacements),
            stats: CacheStats::new(),
            config,
            frame: 0,
        }
    }

    pub fn set_replacement_provider(&mut self, provider: Box<dyn ReplacementProvider>) {
        self.replacer = provider;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn texture_entry_count(&self) -> usize {
        self.textures.entry_count()
    }

    pub fn current_framebuffer(&self) -> Option<&VirtualFramebuffer> {
        self.framebuffers.current()
    }

    /// Starts a new guest frame: resets the per-frame counters and runs the
    /// decimation sweep over both stores.
    pub fn begin_frame(&mut self) {
        self.frame += 1;
        self.stats.begin_frame();
        let frame = self.frame;
        let Self {
            device,
            textures,
            framebuffers,
            stats,
            config,
            ..
        } = self;
        textures.decimate(device, config, stats, frame);
        framebuffers.decimate(device, config, stats, frame);
    }

    /// End-of-frame housekeeping: finalizes completed async readbacks.
    pub fn end_frame(&mut self) {
        let Self {
            device,
            mem,
            readback,
            ..
        } = self;
        readback.service(device, mem);
    }

    /// Per-draw texture bind. A live framebuffer overlapping the address
    /// takes priority over the texture cache; `flags` control how partial
    /// overlaps are resolved.
    pub fn set_texture(
        &mut self,
        state: &TextureState,
        flags: BindFlags,
    ) -> Result<TextureBinding, DeviceError> {
        match self.framebuffers.find_for_texture(state.address) {
            FramebufferMatch::Exact(i) => self.bind_framebuffer_index(i, Some(state)),
            FramebufferMatch::Near(i) if flags.contains(BindFlags::ALLOW_NEAR_MATCH) => {
                self.bind_framebuffer_index(i, Some(state))
            }
            FramebufferMatch::Near(i) if flags.contains(BindFlags::FALLBACK_READBACK) => {
                // Exactness over GPU round-trip cost: pull the rendered
                // pixels into guest memory, then decode like any texture.
                {
                    let Self {
                        device,
                        mem,
                        framebuffers,
                        readback,
                        stats,
                        ..
                    } = self;
                    let fb = framebuffers.get_mut(i);
                    let (w, h) = (fb.width, fb.height);
                    readback.read_color_sync(device, mem, fb, 0, 0, w, h, stats)?;
                }
                self.bind_from_cache(state)
            }
            _ => self.bind_from_cache(state),
        }
    }

    /// Binds a texture sampler input that may alias a live render target.
    /// Returns `None` when no live framebuffer matches under `flags`.
    pub fn bind_framebuffer_color(
        &mut self,
        stage: u32,
        address: u32,
        flags: BindFlags,
    ) -> Result<Option<TextureBinding>, DeviceError> {
        trace!(stage, "framebuffer color bind at 0x{address:08x}");
        match self.framebuffers.find_for_texture(address) {
            FramebufferMatch::Exact(i) => self.bind_framebuffer_index(i, None).map(Some),
            FramebufferMatch::Near(i) if flags.contains(BindFlags::ALLOW_NEAR_MATCH) => {
                self.bind_framebuffer_index(i, None).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn bind_framebuffer_index(
        &mut self,
        index: usize,
        state: Option<&TextureState>,
    ) -> Result<TextureBinding, DeviceError> {
        let frame = self.frame;
        let Self {
            device,
            framebuffers,
            stats,
            ..
        } = self;
        let binding = framebuffers.bind_color(device, stats, frame, index)?;
        let source = match binding {
            FramebufferBinding::Direct(rt) => TextureSource::Framebuffer(rt),
            FramebufferBinding::Copied(tex) => TextureSource::FramebufferCopy(tex),
        };
        // Framebuffer sampling never wraps; the attachment is not tileable.
        let sampler = SamplerParams {
            mag_linear: state.map_or(true, |s| s.mag_filter_linear),
            min_linear: state.map_or(true, |s| s.min_filter_linear),
            wrap_u: WrapMode::Clamp,
            wrap_v: WrapMode::Clamp,
            max_anisotropy: 1,
        };
        Ok(TextureBinding {
            source,
            sampler,
            alpha: AlphaStatus::Unknown,
        })
    }

    fn bind_from_cache(&mut self, state: &TextureState) -> Result<TextureBinding, DeviceError> {
        let frame = self.frame;
        let Self {
            device,
            mem,
            clut,
            textures,
            replacer,
            config,
            stats,
            ..
        } = self;
        textures.bind(device, mem, clut, replacer.as_ref(), config, stats, frame, state)
    }

    /// Switches the current render target, creating or reinterpreting a
    /// virtual framebuffer as needed.
    pub fn set_render_target(&mut self, params: &RenderTargetParams) -> Result<(), DeviceError> {
        let frame = self.frame;
        let Self {
            device,
            framebuffers,
            stats,
            config,
            ..
        } = self;
        framebuffers.set_render_target(device, config, stats, frame, params)?;
        Ok(())
    }

    /// Copies rendered pixels back into the framebuffer's guest memory
    /// region. `sync` forces the blocking path; otherwise the transfer goes
    /// through the round-robined async slots when the device supports them.
    pub fn read_framebuffer_to_memory(
        &mut self,
        address: u32,
        sync: bool,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    ) -> Result<(), DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(());
        };
        let Self {
            device,
            mem,
            framebuffers,
            readback,
            stats,
            ..
        } = self;
        let fb = framebuffers.get_mut(i);
        if sync || !device.caps().supports_async_readback {
            readback.read_color_sync(device, mem, fb, x, y, w, h, stats)
        } else {
            readback.read_color_async(device, mem, fb, x, y, w, h, stats)
        }
    }

    /// Depth variant: writes 16-bit depth values to the target's z address.
    pub fn read_depth_to_memory(&mut self, address: u32) -> Result<(), DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(());
        };
        let Self {
            device,
            mem,
            framebuffers,
            stats,
            ..
        } = self;
        readback::read_depth_sync(device, mem, framebuffers.get(i), stats)
    }

    /// Stencil variant: patches stencil values into the alpha bits of the
    /// color region.
    pub fn read_stencil_to_memory(&mut self, address: u32) -> Result<(), DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(());
        };
        let Self {
            device,
            mem,
            framebuffers,
            stats,
            ..
        } = self;
        readback::read_stencil_sync(device, mem, framebuffers.get(i), stats)
    }

    /// Loads the active palette from guest memory. A CLUT sourced from
    /// inside a live, dirty framebuffer forces a synchronous readback first
    /// so the palette hash sees rendered data.
    pub fn load_clut(
        &mut self,
        address: u32,
        entries: usize,
        format: ClutFormat,
    ) -> Result<(), DeviceError> {
        if let FramebufferMatch::Exact(i) | FramebufferMatch::Near(i) =
            self.framebuffers.find_for_texture(address)
        {
            if self.framebuffers.get(i).dirty {
                debug!("palette at 0x{address:08x} sourced from a live framebuffer, downloading");
                let Self {
                    device,
                    mem,
                    framebuffers,
                    readback,
                    stats,
                    ..
                } = self;
                let fb = framebuffers.get_mut(i);
                let (w, h) = (fb.width, fb.height);
                readback.read_color_sync(device, mem, fb, 0, 0, w, h, stats)?;
            }
        }
        self.clut.load(&self.mem, address, entries, format);
        Ok(())
    }

    /// Signals guest writes to `[address, address+size)`; overlapping
    /// texture entries revalidate on their next bind.
    pub fn invalidate(&mut self, address: u32, size: u32) {
        self.textures.invalidate(address, size);
    }

    pub fn invalidate_all(&mut self) {
        let frame = self.frame;
        self.textures.invalidate_all(&mut self.stats, frame);
    }

    /// The backend's sampler bindings were clobbered externally; the next
    /// bind revalidates even for an unchanged key.
    pub fn forget_last_texture(&mut self) {
        self.textures.forget_last_texture();
    }

    /// Full teardown (profile switch): every entry and backend object goes.
    pub fn clear(&mut self) {
        debug!("full cache clear");
        let Self {
            device,
            textures,
            framebuffers,
            readback,
            ..
        } = self;
        textures.clear(device);
        framebuffers.clear(device);
        readback.discard(device);
    }

    /// Device loss: all GPU-backed state is torn down unconditionally.
    /// Logical framebuffer entries are retained for lazy reconstruction;
    /// in-flight readbacks are discarded without finalizing.
    pub fn device_lost(&mut self) {
        debug!("device lost, releasing all GPU-backed state");
        let Self {
            device,
            textures,
            framebuffers,
            readback,
            ..
        } = self;
        textures.clear(device);
        framebuffers.release_all_backings(device);
        readback.discard(device);
    }

    /// Surface resize: backing render targets are released and lazily
    /// rebuilt; texture entries survive.
    pub fn resized(&mut self) {
        debug!("surface resized, releasing framebuffer backings");
        let Self {
            device,
            framebuffers,
            readback,
            ..
        } = self;
        framebuffers.release_all_backings(device);
        readback.discard(device);
    }

    // -----------------------------------------------------------------
    // Pull-only debug/UI accessors. These read device objects but never
    // mutate cache state.
    // -----------------------------------------------------------------

    /// Decodes the texture a state would bind, without touching the cache.
    pub fn decode_texture_for_debug(&self, state: &TextureState) -> PixelBuffer {
        let level = texbuild::decode_level(
            &self.mem,
            &self.clut,
            state.address,
            state.format,
            state.width.max(1),
            state.height.max(1),
            0,
        );
        PixelBuffer {
            width: level.width,
            height: level.height,
            kind: PixelBufferKind::Rgba8,
            data: level.rgba,
        }
    }

    pub fn get_framebuffer_pixels(
        &mut self,
        address: u32,
    ) -> Result<Option<PixelBuffer>, DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(None);
        };
        self.framebuffer_pixels_at(i)
    }

    /// The final output image: the current render target's contents.
    pub fn get_output_pixels(&mut self) -> Result<Option<PixelBuffer>, DeviceError> {
        let Some(i) = self.framebuffers.current_index() else {
            return Ok(None);
        };
        self.framebuffer_pixels_at(i)
    }

    fn framebuffer_pixels_at(&mut self, index: usize) -> Result<Option<PixelBuffer>, DeviceError> {
        let Self {
            device,
            framebuffers,
            ..
        } = self;
        let fb = framebuffers.get(index);
        let Some(rt) = fb.render_target() else {
            return Ok(None);
        };
        let scale = (fb.render_width / fb.width.max(1)).max(1);
        let data = device.read_color_sync(rt, Rect::new(0, 0, fb.render_width, fb.render_height))?;

        let mut out = Vec::with_capacity((fb.width * fb.height * 4) as usize);
        let scaled_w = fb.render_width as usize;
        for y in 0..fb.height as usize {
            for x in 0..fb.width as usize {
                let src = ((y * scale as usize) * scaled_w + x * scale as usize) * 4;
                if src + 4 <= data.len() {
                    out.extend_from_slice(&data[src..src + 4]);
                } else {
                    out.extend_from_slice(&[0, 0, 0, 0]);
                }
            }
        }
        Ok(Some(PixelBuffer {
            width: fb.width,
            height: fb.height,
            kind: PixelBufferKind::Rgba8,
            data: out,
        }))
    }

    pub fn get_depth_pixels(&mut self, address: u32) -> Result<Option<PixelBuffer>, DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(None);
        };
        let Self {
            device,
            framebuffers,
            ..
        } = self;
        let fb = framebuffers.get(i);
        let (Some(rt), true) = (fb.render_target(), fb.has_depth()) else {
            return Ok(None);
        };
        let scale = (fb.render_width / fb.width.max(1)).max(1);
        let depth = device.read_depth_sync(rt, Rect::new(0, 0, fb.render_width, fb.render_height))?;

        let mut vals = Vec::with_capacity((fb.width * fb.height) as usize);
        let scaled_w = fb.render_width as usize;
        for y in 0..fb.height as usize {
            for x in 0..fb.width as usize {
                vals.push(
                    depth
                        .get((y * scale as usize) * scaled_w + x * scale as usize)
                        .copied()
                        .unwrap_or(0),
                );
            }
        }
        Ok(Some(PixelBuffer {
            width: fb.width,
            height: fb.height,
            kind: PixelBufferKind::Depth16,
            data: bytemuck::cast_slice(&vals).to_vec(),
        }))
    }

    pub fn get_stencil_pixels(&mut self, address: u32) -> Result<Option<PixelBuffer>, DeviceError> {
        let Some(i) = self.framebuffers.find_by_address(address) else {
            return Ok(None);
        };
        let Self {
            device,
            framebuffers,
            ..
        } = self;
        let fb = framebuffers.get(i);
        let Some(rt) = fb.render_target() else {
            return Ok(None);
        };
        let scale = (fb.render_width / fb.width.max(1)).max(1);
        let stencil =
            device.read_stencil_sync(rt, Rect::new(0, 0, fb.render_width, fb.render_height))?;

        let mut out = Vec::with_capacity((fb.width * fb.height) as usize);
        let scaled_w = fb.render_width as usize;
        for y in 0..fb.height as usize {
            for x in 0..fb.width as usize {
                out.push(
                    stencil
                        .get((y * scale as usize) * scaled_w + x * scale as usize)
                        .copied()
                        .unwrap_or(0),
                );
            }
        }
        Ok(Some(PixelBuffer {
            width: fb.width,
            height: fb.height,
            kind: PixelBufferKind::Stencil8,
            data: out,
        }))
    }

    pub fn framebuffer_list(&self) -> Vec<FramebufferInfo> {
        self.framebuffers.framebuffer_list()
    }
}
