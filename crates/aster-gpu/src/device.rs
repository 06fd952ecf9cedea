//! Backend graphics device abstraction.
//!
//! The cache/manager drives every GPU object it owns through [`GpuDevice`];
//! per-API adapters (wgpu, GL, ...) live outside this crate. Handles are
//! opaque typed ids owned by the device, never raw pointers, so a stale or
//! foreign handle can be rejected instead of reinterpreted.
//!
//! [`SimDevice`] is a software implementation used by the test suites. It
//! stores real pixel data for textures and render targets, which lets the
//! integration tests validate readback round-trips without a GPU.

use hashbrown::HashMap;
use thiserror::Error;

use crate::formats::HostFormat;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device lost")]
    Lost,
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("transfer not ready")]
    TransferNotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Subset of device capabilities the cache layer cares about.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub max_anisotropy: u8,
    pub supports_async_readback: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: HostFormat,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub with_depth: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Ready,
}

/// Opaque creation/destruction of backend objects plus the copy and readback
/// primitives the cache needs. All pixel traffic at this boundary is RGBA8
/// (color), 16-bit (depth) or 8-bit (stencil), tightly packed rows.
pub trait GpuDevice {
    fn caps(&self) -> DeviceCaps;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError>;
    fn upload_texture_level(
        &mut self,
        texture: TextureId,
        level: u32,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<(), DeviceError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, DeviceError>;
    fn destroy_render_target(&mut self, target: RenderTargetId);

    /// Copies a render target's color contents into level 0 of `dst`
    /// (used to break the self-sampling hazard).
    fn copy_color_to_texture(
        &mut self,
        src: RenderTargetId,
        dst: TextureId,
    ) -> Result<(), DeviceError>;

    /// Copies depth contents between two render targets with depth backing.
    fn blit_depth(&mut self, src: RenderTargetId, dst: RenderTargetId)
        -> Result<(), DeviceError>;

    /// Blocking readbacks. Rows are tightly packed, top-down.
    fn read_color_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u8>, DeviceError>;
    fn read_depth_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u16>, DeviceError>;
    fn read_stencil_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Non-blocking readback into a previously created transfer buffer. The
    /// submitting side polls for completion; it never awaits.
    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferId, DeviceError>;
    fn destroy_transfer_buffer(&mut self, transfer: TransferId);
    fn begin_color_read(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
        transfer: TransferId,
    ) -> Result<(), DeviceError>;
    fn poll_transfer(&mut self, transfer: TransferId) -> TransferStatus;
    /// Blocks until the transfer completes (the back-pressure boundary).
    fn wait_transfer(&mut self, transfer: TransferId) -> Result<(), DeviceError>;
    /// Takes the completed transfer's bytes and returns the buffer to idle.
    fn take_transfer_data(&mut self, transfer: TransferId) -> Result<Vec<u8>, DeviceError>;
}

// ---------------------------------------------------------------------------
// Software device for tests.
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SimTexture {
    desc: TextureDesc,
    levels: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct SimRenderTarget {
    desc: RenderTargetDesc,
    color: Vec<u8>,
    depth: Vec<u16>,
    stencil: Vec<u8>,
}

#[derive(Debug)]
struct SimTransfer {
    size: usize,
    /// `Some` while a readback is in flight or ready to be taken.
    data: Option<Vec<u8>>,
    polls_until_ready: u32,
}

/// Deterministic software device. Async readbacks become ready after
/// `readback_latency_polls` poll calls, which lets tests exercise both the
/// happy path and the blocked-slot back-pressure path.
#[derive(Debug)]
pub struct SimDevice {
    caps: DeviceCaps,
    next_id: u64,
    textures: HashMap<u64, SimTexture>,
    render_targets: HashMap<u64, SimRenderTarget>,
    transfers: HashMap<u64, SimTransfer>,
    pub readback_latency_polls: u32,
    pub texture_uploads: u64,
    pub textures_created: u64,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            caps: DeviceCaps {
                max_anisotropy: 16,
                supports_async_readback: true,
            },
            next_id: 1,
            textures: HashMap::new(),
            render_targets: HashMap::new(),
            transfers: HashMap::new(),
            readback_latency_polls: 1,
            texture_uploads: 0,
            textures_created: 0,
        }
    }

    pub fn without_async_readback() -> Self {
        let mut dev = Self::new();
        dev.caps.supports_async_readback = false;
        dev
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn textures_alive(&self) -> usize {
        self.textures.len()
    }

    pub fn render_targets_alive(&self) -> usize {
        self.render_targets.len()
    }

    pub fn transfers_alive(&self) -> usize {
        self.transfers.len()
    }

    /// Test hook: returns the stored pixel data of a texture level.
    pub fn texture_level(&self, texture: TextureId, level: u32) -> Option<&[u8]> {
        self.textures
            .get(&texture.0)
            .and_then(|t| t.levels.get(level as usize))
            .map(|v| v.as_slice())
    }

    /// Test hook: "renders" by filling the whole color attachment.
    pub fn fill_color(&mut self, target: RenderTargetId, rgba: [u8; 4]) {
        if let Some(rt) = self.render_targets.get_mut(&target.0) {
            for px in rt.color.chunks_exact_mut(4) {
                px.copy_from_slice(&rgba);
            }
        }
    }

    /// Test hook: "renders" a single pixel.
    pub fn write_color_pixel(&mut self, target: RenderTargetId, x: u32, y: u32, rgba: [u8; 4]) {
        if let Some(rt) = self.render_targets.get_mut(&target.0) {
            if x < rt.desc.width && y < rt.desc.height {
                let off = ((y * rt.desc.width + x) * 4) as usize;
                rt.color[off..off + 4].copy_from_slice(&rgba);
            }
        }
    }

    /// Test hook: fills the depth attachment.
    pub fn fill_depth(&mut self, target: RenderTargetId, value: u16) {
        if let Some(rt) = self.render_targets.get_mut(&target.0) {
            rt.depth.fill(value);
        }
    }

    /// Test hook: fills the stencil attachment.
    pub fn fill_stencil(&mut self, target: RenderTargetId, value: u8) {
        if let Some(rt) = self.render_targets.get_mut(&target.0) {
            rt.stencil.fill(value);
        }
    }

    fn copy_rect(rt: &SimRenderTarget, rect: Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity((rect.w * rect.h * 4) as usize);
        for row in 0..rect.h {
            let y = rect.y + row;
            if y >= rt.desc.height {
                out.extend(std::iter::repeat(0u8).take((rect.w * 4) as usize));
                continue;
            }
            for col in 0..rect.w {
                let x = rect.x + col;
                if x >= rt.desc.width {
                    out.extend_from_slice(&[0, 0, 0, 0]);
                    continue;
                }
                let off = ((y * rt.desc.width + x) * 4) as usize;
                out.extend_from_slice(&rt.color[off..off + 4]);
            }
        }
        out
    }
}

impl GpuDevice for SimDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(DeviceError::Allocation(format!(
                "invalid texture desc: {}x{} levels={}",
                desc.width, desc.height, desc.mip_levels
            )));
        }
        let id = self.alloc_id();
        let levels = (0..desc.mip_levels)
            .map(|l| {
                let w = (desc.width >> l).max(1);
                let h = (desc.height >> l).max(1);
                vec![0u8; (w * h * 4) as usize]
            })
            .collect();
        self.textures.insert(id, SimTexture { desc: *desc, levels });
        self.textures_created += 1;
        Ok(TextureId(id))
    }

    fn upload_texture_level(
        &mut self,
        texture: TextureId,
        level: u32,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<(), DeviceError> {
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })?;
        let slot = tex
            .levels
            .get_mut(level as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: "texture level",
                id: level as u64,
            })?;
        let len = (width * height * 4) as usize;
        slot.clear();
        slot.resize(len, 0);
        let n = len.min(rgba.len());
        slot[..n].copy_from_slice(&rgba[..n]);
        self.texture_uploads += 1;
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::Allocation(format!(
                "invalid render target desc: {}x{}",
                desc.width, desc.height
            )));
        }
        let id = self.alloc_id();
        let pixels = (desc.width * desc.height) as usize;
        self.render_targets.insert(
            id,
            SimRenderTarget {
                desc: *desc,
                color: vec![0u8; pixels * 4],
                depth: if desc.with_depth {
                    vec![0u16; pixels]
                } else {
                    Vec::new()
                },
                stencil: if desc.with_depth {
                    vec![0u8; pixels]
                } else {
                    Vec::new()
                },
            },
        );
        Ok(RenderTargetId(id))
    }

    fn destroy_render_target(&mut self, target: RenderTargetId) {
        self.render_targets.remove(&target.0);
    }

    fn copy_color_to_texture(
        &mut self,
        src: RenderTargetId,
        dst: TextureId,
    ) -> Result<(), DeviceError> {
        let rt = self
            .render_targets
            .get(&src.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: src.0,
            })?;
        let data = rt.color.clone();
        let (w, h) = (rt.desc.width, rt.desc.height);
        self.upload_texture_level(dst, 0, w, h, &data)
    }

    fn blit_depth(
        &mut self,
        src: RenderTargetId,
        dst: RenderTargetId,
    ) -> Result<(), DeviceError> {
        let depth = self
            .render_targets
            .get(&src.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: src.0,
            })?
            .depth
            .clone();
        let out = self
            .render_targets
            .get_mut(&dst.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: dst.0,
            })?;
        let n = depth.len().min(out.depth.len());
        out.depth[..n].copy_from_slice(&depth[..n]);
        Ok(())
    }

    fn read_color_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u8>, DeviceError> {
        let rt = self
            .render_targets
            .get(&target.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: target.0,
            })?;
        Ok(Self::copy_rect(rt, rect))
    }

    fn read_depth_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u16>, DeviceError> {
        let rt = self
            .render_targets
            .get(&target.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: target.0,
            })?;
        let mut out = Vec::with_capacity((rect.w * rect.h) as usize);
        for row in 0..rect.h {
            for col in 0..rect.w {
                let (x, y) = (rect.x + col, rect.y + row);
                if x < rt.desc.width && y < rt.desc.height && !rt.depth.is_empty() {
                    out.push(rt.depth[(y * rt.desc.width + x) as usize]);
                } else {
                    out.push(0);
                }
            }
        }
        Ok(out)
    }

    fn read_stencil_sync(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
    ) -> Result<Vec<u8>, DeviceError> {
        let rt = self
            .render_targets
            .get(&target.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "render target",
                id: target.0,
            })?;
        let mut out = Vec::with_capacity((rect.w * rect.h) as usize);
        for row in 0..rect.h {
            for col in 0..rect.w {
                let (x, y) = (rect.x + col, rect.y + row);
                if x < rt.desc.width && y < rt.desc.height && !rt.stencil.is_empty() {
                    out.push(rt.stencil[(y * rt.desc.width + x) as usize]);
                } else {
                    out.push(0);
                }
            }
        }
        Ok(out)
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferId, DeviceError> {
        let id = self.alloc_id();
        self.transfers.insert(
            id,
            SimTransfer {
                size,
                data: None,
                polls_until_ready: 0,
            },
        );
        Ok(TransferId(id))
    }

    fn destroy_transfer_buffer(&mut self, transfer: TransferId) {
        self.transfers.remove(&transfer.0);
    }

    fn begin_color_read(
        &mut self,
        target: RenderTargetId,
        rect: Rect,
        transfer: TransferId,
    ) -> Result<(), DeviceError> {
        let data = self.read_color_sync(target, rect)?;
        let latency = self.readback_latency_polls;
        let tr = self
            .transfers
            .get_mut(&transfer.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "transfer",
                id: transfer.0,
            })?;
        let mut data = data;
        data.truncate(tr.size);
        tr.data = Some(data);
        tr.polls_until_ready = latency;
        Ok(())
    }

    fn poll_transfer(&mut self, transfer: TransferId) -> TransferStatus {
        match self.transfers.get_mut(&transfer.0) {
            Some(tr) if tr.data.is_some() => {
                if tr.polls_until_ready > 0 {
                    tr.polls_until_ready -= 1;
                    TransferStatus::Pending
                } else {
                    TransferStatus::Ready
                }
            }
            _ => TransferStatus::Ready,
        }
    }

    fn wait_transfer(&mut self, transfer: TransferId) -> Result<(), DeviceError> {
        if let Some(tr) = self.transfers.get_mut(&transfer.0) {
            tr.polls_until_ready = 0;
        }
        Ok(())
    }

    fn take_transfer_data(&mut self, transfer: TransferId) -> Result<Vec<u8>, DeviceError> {
        let tr = self
            .transfers
            .get_mut(&transfer.0)
            .ok_or(DeviceError::UnknownHandle {
                kind: "transfer",
                id: transfer.0,
            })?;
        if tr.polls_until_ready > 0 {
            return Err(DeviceError::TransferNotReady);
        }
        tr.data.take().ok_or(DeviceError::TransferNotReady)
    }
}
