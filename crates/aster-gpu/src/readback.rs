//! Readback pipeline: copies rendered pixels back into guest memory.
//!
//! The synchronous path blocks and writes immediately; the guest is about to
//! read that memory. The asynchronous path issues into one of a fixed pair of
//! round-robined transfer slots and finalizes the guest write during a later
//! frame's housekeeping. Issuing into a slot that is still in flight waits
//! for it first; bounded in-flight depth beats unbounded deferral.
//!
//! Depth and stencil follow the same contract with a different source
//! attachment and destination interpretation: depth writes 16-bit values to
//! the z address, stencil patches the alpha bits of the color region.

use tracing::{debug, warn};

use crate::device::{DeviceError, GpuDevice, Rect, TransferId, TransferStatus};
use crate::formats::{encode_row, BufferFormat};
use crate::framebuffer::VirtualFramebuffer;
use crate::guest_memory::GuestMemory;
use crate::stats::CacheStats;

pub const NUM_READBACK_SLOTS: usize = 2;

#[derive(Clone, Copy, Debug)]
struct PendingReadback {
    address: u32,
    stride: u32,
    format: BufferFormat,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    scale: u32,
}

#[derive(Debug, Default)]
struct Slot {
    transfer: Option<TransferId>,
    capacity: usize,
    pending: Option<PendingReadback>,
}

/// Fixed double-buffered async readback slots plus the shared conversion
/// helpers used by both paths.
#[derive(Debug, Default)]
pub struct ReadbackPipeline {
    slots: [Slot; NUM_READBACK_SLOTS],
    next: usize,
}

/// Clamps a requested rectangle to a framebuffer's logical dimensions.
fn clamp_rect(fb: &VirtualFramebuffer, x: u32, y: u32, w: u32, h: u32) -> Option<(u32, u32, u32, u32)> {
    if x >= fb.width || y >= fb.height {
        return None;
    }
    let w = w.min(fb.width - x);
    let h = h.min(fb.height - y);
    if w == 0 || h == 0 {
        return None;
    }
    Some((x, y, w, h))
}

fn render_scale(fb: &VirtualFramebuffer) -> u32 {
    (fb.render_width / fb.width.max(1)).max(1)
}

/// Converts RGBA8 rows read at render resolution into the guest's declared
/// format/stride and writes them. Upscaled targets are sampled back down by
/// picking every `scale`-th pixel.
fn write_color_to_guest<M: GuestMemory>(mem: &M, meta: &PendingReadback, data: &[u8]) {
    let bpp = meta.format.bytes_per_pixel();
    let scaled_w = (meta.w * meta.scale) as usize;
    let mut rgba_row = vec![0u8; (meta.w * 4) as usize];
    let mut guest_row = vec![0u8; meta.w as usize * bpp];

    for row in 0..meta.h {
        let src_row = (row * meta.scale) as usize;
        for col in 0..meta.w as usize {
            let src = (src_row * scaled_w + col * meta.scale as usize) * 4;
            if src + 4 > data.len() {
                rgba_row[col * 4..col * 4 + 4].copy_from_slice(&[0, 0, 0, 0]);
            } else {
                rgba_row[col * 4..col * 4 + 4].copy_from_slice(&data[src..src + 4]);
            }
        }
        encode_row(meta.format, &rgba_row, &mut guest_row);
        let addr = meta
            .address
            .wrapping_add(((meta.y + row) * meta.stride + meta.x) * bpp as u32);
        if mem.write(addr, &guest_row).is_err() {
            debug!("readback row at 0x{addr:08x} landed outside guest memory, dropped");
        }
    }
}

impl ReadbackPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocking color readback of a framebuffer sub-rectangle.
    #[allow(clippy::too_many_arguments)]
    pub fn read_color_sync<D: GpuDevice, M: GuestMemory>(
        &mut self,
        device: &mut D,
        mem: &M,
        fb: &mut VirtualFramebuffer,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        stats: &mut CacheStats,
    ) -> Result<(), DeviceError> {
        let Some(rt) = fb.render_target() else {
            // Nothing has been rendered into this target yet.
            return Ok(());
        };
        let Some((x, y, w, h)) = clamp_rect(fb, x, y, w, h) else {
            return Ok(());
        };
        let scale = render_scale(fb);
        let data = device.read_color_sync(rt, Rect::new(x * scale, y * scale, w * scale, h * scale))?;
        let meta = PendingReadback {
            address: fb.address,
            stride: fb.stride,
            format: fb.format,
            x,
            y,
            w,
            h,
            scale,
        };
        write_color_to_guest(mem, &meta, &data);
        stats.frame.readbacks_sync += 1;
        if x == 0 && y == 0 && w == fb.width && h == fb.height {
            fb.dirty = false;
        }
        Ok(())
    }

    /// Non-blocking color readback into the next round-robined slot. Falls
    /// back to waiting when the slot is still in flight.
    #[allow(clippy::too_many_arguments)]
    pub fn read_color_async<D: GpuDevice, M: GuestMemory>(
        &mut self,
        device: &mut D,
        mem: &M,
        fb: &mut VirtualFramebuffer,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        stats: &mut CacheStats,
    ) -> Result<(), DeviceError> {
        let Some(rt) = fb.render_target() else {
            return Ok(());
        };
        let Some((x, y, w, h)) = clamp_rect(fb, x, y, w, h) else {
            return Ok(());
        };
        let scale = render_scale(fb);

        let index = self.next;
        self.next = (self.next + 1) % NUM_READBACK_SLOTS;
        let slot = &mut self.slots[index];

        // Back-pressure boundary: drain the slot before reusing it.
        if let Some(pending) = slot.pending.take() {
            if let Some(transfer) = slot.transfer {
                warn!(slot = index, "async readback slot still in flight, waiting");
                device.wait_transfer(transfer)?;
                let data = device.take_transfer_data(transfer)?;
                write_color_to_guest(mem, &pending, &data);
            }
        }

        let bytes = (w * scale * h * scale * 4) as usize;
        let transfer = match slot.transfer {
            Some(t) if slot.capacity >= bytes => t,
            existing => {
                if let Some(t) = existing {
                    device.destroy_transfer_buffer(t);
                }
                let t = device.create_transfer_buffer(bytes)?;
                slot.transfer = Some(t);
                slot.capacity = bytes;
                t
            }
        };

        device.begin_color_read(rt, Rect::new(x * scale, y * scale, w * scale, h * scale), transfer)?;
        slot.pending = Some(PendingReadback {
            address: fb.address,
            stride: fb.stride,
            format: fb.format,
            x,
            y,
            w,
            h,
            scale,
        });
        stats.frame.readbacks_async += 1;
        Ok(())
    }

    /// End-of-frame housekeeping: finalizes any completed transfers.
    pub fn service<D: GpuDevice, M: GuestMemory>(&mut self, device: &mut D, mem: &M) {
        for slot in &mut self.slots {
            let (Some(transfer), Some(_)) = (slot.transfer, slot.pending.as_ref()) else {
                continue;
            };
            if device.poll_transfer(transfer) != TransferStatus::Ready {
                continue;
            }
            let pending = slot.pending.take();
            match (device.take_transfer_data(transfer), pending) {
                (Ok(data), Some(pending)) => write_color_to_guest(mem, &pending, &data),
                (Err(err), _) => {
                    debug!(%err, "async readback finalize failed, dropping");
                }
                _ => {}
            }
        }
    }

    /// Whether any slot still has an unfinalized transfer.
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|s| s.pending.is_some())
    }

    /// Device loss / teardown: in-flight readbacks are discarded without
    /// finalizing their guest write. Partial-frame data beats corruption.
    pub fn discard<D: GpuDevice>(&mut self, device: &mut D) {
        for slot in &mut self.slots {
            if let Some(transfer) = slot.transfer.take() {
                device.destroy_transfer_buffer(transfer);
            }
            slot.capacity = 0;
            slot.pending = None;
        }
        self.next = 0;
    }
}

/// Blocking depth readback: writes 16-bit depth values to the framebuffer's
/// z address using the z stride.
pub fn read_depth_sync<D: GpuDevice, M: GuestMemory>(
    device: &mut D,
    mem: &M,
    fb: &VirtualFramebuffer,
    stats: &mut CacheStats,
) -> Result<(), DeviceError> {
    let (Some(rt), true) = (fb.render_target(), fb.has_depth()) else {
        return Ok(());
    };
    let scale = render_scale(fb);
    let data = device.read_depth_sync(
        rt,
        Rect::new(0, 0, fb.width * scale, fb.height * scale),
    )?;
    let scaled_w = (fb.width * scale) as usize;
    let mut row_vals = vec![0u16; fb.width as usize];
    for row in 0..fb.height {
        let src_row = (row * scale) as usize;
        for (col, out) in row_vals.iter_mut().enumerate() {
            *out = data
                .get(src_row * scaled_w + col * scale as usize)
                .copied()
                .unwrap_or(0);
        }
        let addr = fb.z_address.wrapping_add(row * fb.z_stride * 2);
        if mem.write(addr, bytemuck::cast_slice(&row_vals)).is_err() {
            debug!("depth readback row at 0x{addr:08x} landed outside guest memory, dropped");
        }
    }
    stats.frame.readbacks_sync += 1;
    Ok(())
}

/// Blocking stencil readback: patches the stencil value into the alpha bits
/// of the color region, which is where this guest keeps stencil data.
pub fn read_stencil_sync<D: GpuDevice, M: GuestMemory>(
    device: &mut D,
    mem: &M,
    fb: &VirtualFramebuffer,
    stats: &mut CacheStats,
) -> Result<(), DeviceError> {
    let Some(rt) = fb.render_target() else {
        return Ok(());
    };
    if fb.format == BufferFormat::Rgb565 {
        // No alpha bits to carry stencil in.
        return Ok(());
    }
    let scale = render_scale(fb);
    let data = device.read_stencil_sync(
        rt,
        Rect::new(0, 0, fb.width * scale, fb.height * scale),
    )?;
    let scaled_w = (fb.width * scale) as usize;
    let bpp = fb.format.bytes_per_pixel();
    let mut row = vec![0u8; fb.width as usize * bpp];
    for y in 0..fb.height {
        let addr = fb.address.wrapping_add(y * fb.stride * bpp as u32);
        mem.read_clamped(addr, &mut row);
        let src_row = (y * scale) as usize;
        for x in 0..fb.width as usize {
            let s = data
                .get(src_row * scaled_w + x * scale as usize)
                .copied()
                .unwrap_or(0);
            match fb.format {
                BufferFormat::Rgba8888 => row[x * 4 + 3] = s,
                BufferFormat::Rgba5551 => {
                    // Stencil is the single alpha bit.
                    if s >= 0x80 {
                        row[x * 2 + 1] |= 0x80;
                    } else {
                        row[x * 2 + 1] &= 0x7F;
                    }
                }
                BufferFormat::Rgba4444 => {
                    row[x * 2 + 1] = (row[x * 2 + 1] & 0x0F) | (s & 0xF0);
                }
                BufferFormat::Rgb565 => unreachable!(),
            }
        }
        if mem.write(addr, &row).is_err() {
            debug!("stencil readback row at 0x{addr:08x} landed outside guest memory, dropped");
        }
    }
    stats.frame.readbacks_sync += 1;
    Ok(())
}
