//! Virtual framebuffer registry and the framebuffer-as-texture binder.
//!
//! A [`VirtualFramebuffer`] is the manager's logical record of a guest render
//! target, independent of its current backing GPU object. The registry keeps
//! logical entries across device loss so state can be lazily reconstructed
//! instead of replaying guest history. At most one framebuffer is the current
//! render target; the rest are retained for later texture sampling or
//! re-targeting until decimation ages them out.

use bitflags::bitflags;
use tracing::debug;

use crate::config::CacheConfig;
use crate::device::{DeviceError, GpuDevice, RenderTargetDesc, RenderTargetId, TextureDesc, TextureId};
use crate::formats::{BufferFormat, HostFormat};
use crate::stats::CacheStats;

bitflags! {
    /// Binder policy for texture addresses that only partially overlap a
    /// live framebuffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        /// Accept a framebuffer whose range merely contains the address.
        const ALLOW_NEAR_MATCH = 1 << 0;
        /// Route partial overlaps through a CPU readback so the ordinary
        /// texture cache sees fresh memory (exactness over speed).
        const FALLBACK_READBACK = 1 << 1;
    }
}

/// Parameters of a render-target switch.
#[derive(Clone, Copy, Debug)]
pub struct RenderTargetParams {
    pub address: u32,
    pub stride: u32,
    pub format: BufferFormat,
    pub width: u32,
    pub height: u32,
    /// Depth buffer base address; 0 means no depth attachment.
    pub z_address: u32,
    pub z_stride: u32,
}

impl RenderTargetParams {
    pub fn color_only(address: u32, stride: u32, format: BufferFormat, width: u32, height: u32) -> Self {
        Self {
            address,
            stride,
            format,
            width,
            height,
            z_address: 0,
            z_stride: 0,
        }
    }
}

#[derive(Debug)]
pub struct VirtualFramebuffer {
    pub address: u32,
    pub stride: u32,
    pub format: BufferFormat,
    /// Logical guest dimensions.
    pub width: u32,
    pub height: u32,
    /// Backing dimensions; differ from logical under render upscaling.
    pub render_width: u32,
    pub render_height: u32,
    pub z_address: u32,
    pub z_stride: u32,
    color: Option<RenderTargetId>,
    /// Duplicate color copy used to break the self-sampling hazard.
    self_copy: Option<TextureId>,
    /// Pixel capacity the current backing was allocated with. Reinterpreting
    /// a smaller layout reuses the allocation.
    backing_capacity: u32,
    pub last_frame_used: u64,
    /// Rendered-to since the last full readback.
    pub dirty: bool,
}

impl VirtualFramebuffer {
    fn new(params: &RenderTargetParams, render_scale: u32) -> Self {
        Self {
            address: params.address,
            stride: params.stride,
            format: params.format,
            width: params.width,
            height: params.height,
            render_width: params.width * render_scale,
            render_height: params.height * render_scale,
            z_address: params.z_address,
            z_stride: params.z_stride,
            color: None,
            self_copy: None,
            backing_capacity: 0,
            last_frame_used: 0,
            dirty: false,
        }
    }

    pub fn render_target(&self) -> Option<RenderTargetId> {
        self.color
    }

    pub fn has_depth(&self) -> bool {
        self.z_address != 0
    }

    /// Guest memory footprint of the color plane.
    pub fn byte_span(&self) -> u32 {
        self.stride * self.height * self.format.bytes_per_pixel() as u32
    }

    pub fn contains_address(&self, address: u32) -> bool {
        address >= self.address && address < self.address + self.byte_span().max(1)
    }

    fn release_backing<D: GpuDevice>(&mut self, device: &mut D) {
        if let Some(rt) = self.color.take() {
            device.destroy_render_target(rt);
        }
        if let Some(tex) = self.self_copy.take() {
            device.destroy_texture(tex);
        }
        self.backing_capacity = 0;
    }
}

/// Result of an address lookup on behalf of a texture bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramebufferMatch {
    /// Texture base address equals a live framebuffer's base address.
    Exact(usize),
    /// Address falls inside a live framebuffer's range (sub-rectangle read).
    Near(usize),
    None,
}

/// What the binder produced for a framebuffer-backed texture bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramebufferBinding {
    /// The live color attachment, sampled zero-copy.
    Direct(RenderTargetId),
    /// A duplicate copy; the framebuffer is also the current render target.
    Copied(TextureId),
}

/// Debug enumeration entry.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub address: u32,
    pub stride: u32,
    pub format: BufferFormat,
    pub width: u32,
    pub height: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub is_current: bool,
}

#[derive(Debug, Default)]
pub struct FramebufferManager {
    framebuffers: Vec<VirtualFramebuffer>,
    current: Option<usize>,
}

impl FramebufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&VirtualFramebuffer> {
        self.current.map(|i| &self.framebuffers[i])
    }

    pub fn get(&self, index: usize) -> &VirtualFramebuffer {
        &self.framebuffers[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut VirtualFramebuffer {
        &mut self.framebuffers[index]
    }

    pub fn find_by_target(&self, address: u32, stride: u32) -> Option<usize> {
        self.framebuffers
            .iter()
            .position(|fb| fb.address == address && fb.stride == stride)
    }

    pub fn find_by_address(&self, address: u32) -> Option<usize> {
        self.framebuffers.iter().position(|fb| fb.address == address)
    }

    /// Address lookup on behalf of a texture bind. Exact base-address
    /// matches win; otherwise the most recently used containing framebuffer
    /// is reported as a near match.
    pub fn find_for_texture(&self, address: u32) -> FramebufferMatch {
        if let Some(i) = self.find_by_address(address) {
            return FramebufferMatch::Exact(i);
        }
        self.framebuffers
            .iter()
            .enumerate()
            .filter(|(_, fb)| fb.contains_address(address))
            .max_by_key(|(_, fb)| fb.last_frame_used)
            .map(|(i, _)| FramebufferMatch::Near(i))
            .unwrap_or(FramebufferMatch::None)
    }

    /// Switches the current render target, creating or reinterpreting a
    /// virtual framebuffer as needed, and returns its backing target.
    pub fn set_render_target<D: GpuDevice>(
        &mut self,
        device: &mut D,
        config: &CacheConfig,
        stats: &mut CacheStats,
        frame: u64,
        params: &RenderTargetParams,
    ) -> Result<RenderTargetId, DeviceError> {
        let scale = config.render_scale.max(1);
        let prev = self.current;

        let index = match self.find_by_target(params.address, params.stride) {
            Some(i) => {
                let fb = &mut self.framebuffers[i];
                let new_rw = params.width * scale;
                let new_rh = params.height * scale;
                if fb.format != params.format || fb.width != params.width || fb.height != params.height
                {
                    // The guest re-declared this address with a different
                    // layout: reinterpret in place, reusing the backing
                    // allocation when it is large enough.
                    if new_rw * new_rh > fb.backing_capacity {
                        debug!(
                            "framebuffer 0x{:08x} reinterpret exceeds backing capacity, reallocating",
                            params.address
                        );
                        fb.release_backing(device);
                    } else {
                        debug!(
                            "framebuffer 0x{:08x} reinterpreted in place as {:?}",
                            params.address, params.format
                        );
                    }
                    fb.format = params.format;
                    fb.width = params.width;
                    fb.height = params.height;
                    fb.render_width = new_rw;
                    fb.render_height = new_rh;
                }
                // Gaining a depth attachment needs a new backing object; the
                // existing one was allocated without one.
                if params.z_address != 0 && fb.z_address == 0 && fb.color.is_some() {
                    fb.release_backing(device);
                }
                fb.z_address = params.z_address;
                fb.z_stride = params.z_stride;
                i
            }
            None => {
                self.framebuffers.push(VirtualFramebuffer::new(params, scale));
                stats.totals.fb_created += 1;
                debug!(
                    "virtual framebuffer created at 0x{:08x} stride {} ({}x{})",
                    params.address, params.stride, params.width, params.height
                );
                self.framebuffers.len() - 1
            }
        };

        let target = self.ensure_backing(device, index)?;

        // Depth travels with the z address: when the new target shares the
        // previous target's depth buffer, carry the contents across.
        if let Some(p) = prev {
            if p != index {
                let share_z = {
                    let prev_fb = &self.framebuffers[p];
                    let new_fb = &self.framebuffers[index];
                    new_fb.has_depth()
                        && prev_fb.has_depth()
                        && prev_fb.z_address == new_fb.z_address
                };
                if share_z {
                    if let Some(src) = self.framebuffers[p].color {
                        device.blit_depth(src, target)?;
                    }
                }
            }
        }

        let fb = &mut self.framebuffers[index];
        fb.last_frame_used = frame;
        fb.dirty = true;
        self.current = Some(index);
        Ok(target)
    }

    /// Creates the backing render target if it is missing (first use, or
    /// lazily after device loss).
    pub fn ensure_backing<D: GpuDevice>(
        &mut self,
        device: &mut D,
        index: usize,
    ) -> Result<RenderTargetId, DeviceError> {
        let fb = &mut self.framebuffers[index];
        if let Some(rt) = fb.color {
            return Ok(rt);
        }
        let rt = device.create_render_target(&RenderTargetDesc {
            width: fb.render_width.max(1),
            height: fb.render_height.max(1),
            with_depth: fb.has_depth(),
        })?;
        fb.color = Some(rt);
        fb.backing_capacity = fb.render_width * fb.render_height;
        Ok(rt)
    }

    /// Binds a framebuffer's color contents for texture sampling. If the
    /// framebuffer is also the current render target, the contents are
    /// duplicated into a side texture first; reading and writing the same
    /// attachment within one draw is not portable across backends.
    pub fn bind_color<D: GpuDevice>(
        &mut self,
        device: &mut D,
        stats: &mut CacheStats,
        frame: u64,
        index: usize,
    ) -> Result<FramebufferBinding, DeviceError> {
        let target = self.ensure_backing(device, index)?;
        let is_current = self.current == Some(index);
        let fb = &mut self.framebuffers[index];
        fb.last_frame_used = frame;
        stats.frame.framebuffer_binds += 1;

        if !is_current {
            return Ok(FramebufferBinding::Direct(target));
        }

        let copy = match fb.self_copy {
            Some(tex) => tex,
            None => {
                let tex = device.create_texture(&TextureDesc {
                    width: fb.render_width.max(1),
                    height: fb.render_height.max(1),
                    mip_levels: 1,
                    format: HostFormat::Rgba8,
                })?;
                fb.self_copy = Some(tex);
                tex
            }
        };
        device.copy_color_to_texture(target, copy)?;
        stats.frame.self_sample_copies += 1;
        debug!(
            "self-sampling framebuffer 0x{:08x} duplicated into side texture",
            fb.address
        );
        Ok(FramebufferBinding::Copied(copy))
    }

    /// Ages out framebuffers unused past the retention threshold. The
    /// current target is never decimated.
    pub fn decimate<D: GpuDevice>(
        &mut self,
        device: &mut D,
        config: &CacheConfig,
        stats: &mut CacheStats,
        frame: u64,
    ) {
        let current_key = self.current.map(|i| {
            let fb = &self.framebuffers[i];
            (fb.address, fb.stride)
        });

        let mut kept = Vec::with_capacity(self.framebuffers.len());
        for mut fb in self.framebuffers.drain(..) {
            let is_current = current_key == Some((fb.address, fb.stride));
            let idle = frame.saturating_sub(fb.last_frame_used);
            if !is_current && idle > config.fb_retention_frames {
                debug!(
                    "virtual framebuffer 0x{:08x} decimated after {idle} idle frames",
                    fb.address
                );
                fb.release_backing(device);
                stats.totals.fb_evicted += 1;
            } else {
                kept.push(fb);
            }
        }
        self.framebuffers = kept;
        self.current = current_key.and_then(|(addr, stride)| self.find_by_target(addr, stride));
    }

    /// Global invalidation (device loss, surface resize): releases every
    /// backing GPU object but keeps the logical entries so they can be
    /// reconstructed lazily on next use.
    pub fn release_all_backings<D: GpuDevice>(&mut self, device: &mut D) {
        for fb in &mut self.framebuffers {
            fb.release_backing(device);
        }
    }

    /// Full teardown: backings and logical entries.
    pub fn clear<D: GpuDevice>(&mut self, device: &mut D) {
        for fb in &mut self.framebuffers {
            fb.release_backing(device);
        }
        self.framebuffers.clear();
        self.current = None;
    }

    pub fn framebuffer_list(&self) -> Vec<FramebufferInfo> {
        self.framebuffers
            .iter()
            .enumerate()
            .map(|(i, fb)| FramebufferInfo {
                address: fb.address,
                stride: fb.stride,
                format: fb.format,
                width: fb.width,
                height: fb.height,
                render_width: fb.render_width,
                render_height: fb.render_height,
                is_current: self.current == Some(i),
            })
            .collect()
    }
}
