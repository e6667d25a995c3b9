//! Pixel format conversion between packed RGB and planar I420 (BT.601)

use crate::types::{PixelFormat, VideoFrame};

/// Convert packed RGB24 to I420. Odd dimensions round the chroma planes up.
pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let y_size = w * h;
    let uv_size = cw * ch;
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Top-left pixel of each 2x2 block carries the chroma sample
            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * cw + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

/// Convert I420 to packed RGB24
pub fn i420_to_rgb(yuv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let (y_plane, uv_planes) = yuv.split_at(w * h);
    let (u_plane, v_plane) = uv_planes.split_at(cw * ch);

    let mut rgb = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let uv_idx = (y / 2) * cw + (x / 2);
            let c = y_plane[y * w + x] as i32 - 16;
            let d = u_plane[uv_idx] as i32 - 128;
            let e = v_plane[uv_idx] as i32 - 128;

            let idx = (y * w + x) * 3;
            rgb[idx] = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u8;
            rgb[idx + 1] = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u8;
            rgb[idx + 2] = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u8;
        }
    }

    rgb
}

/// Packed RGB24 pixels of `frame`, or `None` if the buffer is too short
pub fn frame_to_rgb(frame: &VideoFrame) -> Option<Vec<u8>> {
    if !frame.is_well_formed() {
        return None;
    }
    let len = frame.format.frame_len(frame.width, frame.height);
    match frame.format {
        PixelFormat::Rgb24 => Some(frame.data[..len].to_vec()),
        PixelFormat::I420 => Some(i420_to_rgb(&frame.data[..len], frame.width, frame.height)),
    }
}

/// I420 planes of `frame`, or `None` if the buffer is too short
pub fn frame_to_i420(frame: &VideoFrame) -> Option<Vec<u8>> {
    if !frame.is_well_formed() {
        return None;
    }
    let len = frame.format.frame_len(frame.width, frame.height);
    match frame.format {
        PixelFormat::Rgb24 => Some(rgb_to_i420(&frame.data[..len], frame.width, frame.height)),
        PixelFormat::I420 => Some(frame.data[..len].to_vec()),
    }
}
