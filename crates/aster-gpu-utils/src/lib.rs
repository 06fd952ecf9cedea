//! Test utilities shared by the `aster-gpu` test suites: deterministic RGBA
//! pattern generators and pixel-buffer comparison helpers.
//!
//! Everything here operates on tightly packed RGBA8 byte buffers (4 bytes per
//! pixel, row-major, no padding) so it stays independent of the cache crate's
//! own format machinery.

#![forbid(unsafe_code)]

/// Fills a `w x h` RGBA8 buffer with a single color.
pub fn solid(w: u32, h: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity((w * h * 4) as usize);
    for _ in 0..w * h {
        out.extend_from_slice(&rgba);
    }
    out
}

/// A `cell`-sized checkerboard of two colors, the classic upload test image.
pub fn checkerboard(w: u32, h: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    let cell = cell.max(1);
    let mut out = Vec::with_capacity((w * h * 4) as usize);
    for y in 0..h {
        for x in 0..w {
            let color = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
            out.extend_from_slice(&color);
        }
    }
    out
}

/// Horizontal gradient in the red channel, constant green/blue/alpha.
/// Every column differs, which makes single-pixel corruption visible.
pub fn hgradient(w: u32, h: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((w * h * 4) as usize);
    for _y in 0..h {
        for x in 0..w {
            let r = if w > 1 { ((x * 255) / (w - 1)) as u8 } else { 0 };
            out.extend_from_slice(&[r, 0x40, 0x80, 0xFF]);
        }
    }
    out
}

/// Number of pixels whose channels differ by more than `tolerance`.
pub fn diff_count(a: &[u8], b: &[u8], tolerance: u8) -> usize {
    assert_eq!(a.len(), b.len(), "buffer sizes differ: {} vs {}", a.len(), b.len());
    a.chunks_exact(4)
        .zip(b.chunks_exact(4))
        .filter(|(pa, pb)| {
            pa.iter()
                .zip(pb.iter())
                .any(|(&ca, &cb)| ca.abs_diff(cb) > tolerance)
        })
        .count()
}

/// Asserts two RGBA8 buffers match within `tolerance`, reporting the first
/// mismatching pixel on failure.
pub fn assert_rgba_eq(actual: &[u8], expected: &[u8], width: u32, tolerance: u8) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "buffer sizes differ: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (i, (pa, pb)) in actual
        .chunks_exact(4)
        .zip(expected.chunks_exact(4))
        .enumerate()
    {
        let close = pa
            .iter()
            .zip(pb.iter())
            .all(|(&ca, &cb)| ca.abs_diff(cb) <= tolerance);
        if !close {
            let x = i as u32 % width.max(1);
            let y = i as u32 / width.max(1);
            panic!(
                "pixel mismatch at ({x}, {y}): actual {:?}, expected {:?} (tolerance {tolerance})",
                pa, pb
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let buf = checkerboard(4, 4, 2, [255, 0, 0, 255], [0, 255, 0, 255]);
        // (0,0) and (2,2) are color a; (2,0) and (0,2) are color b.
        assert_eq!(&buf[0..4], &[255, 0, 0, 255]);
        assert_eq!(&buf[2 * 4..2 * 4 + 4], &[0, 255, 0, 255]);
        assert_eq!(&buf[(2 * 4) * 4..(2 * 4) * 4 + 4], &[0, 255, 0, 255]);
        assert_eq!(&buf[(2 * 4 + 2) * 4..(2 * 4 + 2) * 4 + 4], &[255, 0, 0, 255]);
    }

    #[test]
    fn diff_count_respects_tolerance() {
        let a = solid(2, 2, [10, 10, 10, 255]);
        let b = solid(2, 2, [12, 10, 10, 255]);
        assert_eq!(diff_count(&a, &b, 2), 0);
        assert_eq!(diff_count(&a, &b, 1), 4);
    }
}
