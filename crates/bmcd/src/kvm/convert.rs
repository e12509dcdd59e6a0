//! Pixel-format conversion for the capture pipeline.
//!
//! BT.601 full-range math. YUYV packs two pixels as `(Y0, U, Y1, V)` with
//! shared chroma.
use super::KvmError;

/// Convert a packed YUYV frame to RGBA8888.
pub fn yuyv_to_rgba(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, KvmError> {
    let pixels = (width as usize) * (height as usize);
    if width % 2 != 0 || yuyv.len() < pixels * 2 {
        return Err(KvmError::BadFrame {
            expected: pixels * 2,
            got: yuyv.len(),
        });
    }
    let mut rgba = vec![0u8; pixels * 4];
    for (pair, out) in yuyv[..pixels * 2].chunks_exact(4).zip(rgba.chunks_exact_mut(8)) {
        let [y0, u, y1, v] = [pair[0], pair[1], pair[2], pair[3]];
        let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
        let (r1, g1, b1) = yuv_to_rgb(y1, u, v);
        out[0] = r0;
        out[1] = g0;
        out[2] = b0;
        out[3] = 255;
        out[4] = r1;
        out[5] = g1;
        out[6] = b1;
        out[7] = 255;
    }
    Ok(rgba)
}

/// Convert a packed YUYV frame to RGB888, the JPEG encoder's input.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, KvmError> {
    let pixels = (width as usize) * (height as usize);
    if width % 2 != 0 || yuyv.len() < pixels * 2 {
        return Err(KvmError::BadFrame {
            expected: pixels * 2,
            got: yuyv.len(),
        });
    }
    let mut rgb = vec![0u8; pixels * 3];
    for (pair, out) in yuyv[..pixels * 2].chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let [y0, u, y1, v] = [pair[0], pair[1], pair[2], pair[3]];
        let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
        let (r1, g1, b1) = yuv_to_rgb(y1, u, v);
        out[..3].copy_from_slice(&[r0, g0, b0]);
        out[3..].copy_from_slice(&[r1, g1, b1]);
    }
    Ok(rgb)
}

/// Convert an RGBA frame back to YUYV. Chroma is taken from the first
/// pixel of each pair, matching the forward conversion's sharing.
pub fn rgba_to_yuyv(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, KvmError> {
    let pixels = (width as usize) * (height as usize);
    if width % 2 != 0 || rgba.len() < pixels * 4 {
        return Err(KvmError::BadFrame {
            expected: pixels * 4,
            got: rgba.len(),
        });
    }
    let mut yuyv = vec![0u8; pixels * 2];
    for (pair, out) in rgba[..pixels * 4].chunks_exact(8).zip(yuyv.chunks_exact_mut(4)) {
        let (y0, u0, v0) = rgb_to_yuv(pair[0], pair[1], pair[2]);
        let (y1, u1, v1) = rgb_to_yuv(pair[4], pair[5], pair[6]);
        out[0] = y0;
        out[1] = avg(u0, u1);
        out[2] = y1;
        out[3] = avg(v0, v1);
    }
    Ok(yuyv)
}

/// Encode a YUYV frame as a baseline JPEG at `quality` in [1, 100].
pub fn yuyv_to_jpeg(yuyv: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, KvmError> {
    let rgb = yuyv_to_rgb(yuyv, width, height)?;
    rgb_to_jpeg(&rgb, width, height, quality)
}

/// Encode an RGB888 frame as a baseline JPEG at `quality` in [1, 100].
pub fn rgb_to_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, KvmError> {
    let mut jpeg = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg, quality.clamp(1, 100));
    encoder
        .encode(rgb, width as u16, height as u16, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| KvmError::EncodeFailed(e.to_string()))?;
    Ok(jpeg)
}

/// Widen RGB888 to RGBA8888 with an opaque alpha channel.
pub fn rgb_to_rgba(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, KvmError> {
    let pixels = (width as usize) * (height as usize);
    if rgb.len() < pixels * 3 {
        return Err(KvmError::BadFrame {
            expected: pixels * 3,
            got: rgb.len(),
        });
    }
    let mut rgba = Vec::with_capacity(pixels * 4);
    for px in rgb[..pixels * 3].chunks_exact(3) {
        rgba.extend_from_slice(px);
        rgba.push(255);
    }
    Ok(rgba)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344 * u - 0.714 * v;
    let b = y + 1.772 * u;
    (clamp(r), clamp(g), clamp(b))
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.169 * r - 0.331 * g + 0.500 * b + 128.0;
    let v = 0.500 * r - 0.419 * g - 0.081 * b + 128.0;
    (clamp(y), clamp(u), clamp(v))
}

fn clamp(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16) / 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 4x2 frame of solid mid-grey YUYV.
    fn grey_frame() -> Vec<u8> {
        let mut frame = Vec::new();
        for _ in 0..4 {
            frame.extend_from_slice(&[128, 128, 128, 128]);
        }
        frame
    }

    #[test]
    fn grey_converts_to_grey() {
        let rgba = yuyv_to_rgba(&grey_frame(), 4, 2).unwrap();
        assert_eq!(rgba.len(), 4 * 2 * 4);
        for px in rgba.chunks_exact(4) {
            assert_eq!(px[0], 128);
            assert_eq!(px[1], 128);
            assert_eq!(px[2], 128);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn black_and_white_extremes() {
        // Y=16 is dark, Y=235 bright; with neutral chroma output stays
        // monochrome.
        let yuyv = [16u8, 128, 235, 128];
        let rgba = yuyv_to_rgba(&yuyv, 2, 1).unwrap();
        assert_eq!(&rgba[..3], &[16, 16, 16]);
        assert_eq!(&rgba[4..7], &[235, 235, 235]);
    }

    #[test]
    fn round_trip_within_bt601_tolerance() {
        // An in-gamut ramp with varied chroma; the round trip may wobble a
        // couple of counts from 4:2:2 subsampling and rounding.
        let mut yuyv = Vec::new();
        for i in 0..32u32 {
            yuyv.extend_from_slice(&[
                (60 + 4 * i) as u8,
                (118 + i % 10) as u8,
                (62 + 4 * i) as u8,
                (125 + i % 6) as u8,
            ]);
        }
        let rgba = yuyv_to_rgba(&yuyv, 64, 1).unwrap();
        let back = rgba_to_yuyv(&rgba, 64, 1).unwrap();
        for (a, b) in yuyv.iter().zip(back.iter()) {
            assert!(
                (*a as i16 - *b as i16).abs() <= 3,
                "round trip drifted: {a} vs {b}"
            );
        }
    }

    #[test]
    fn short_buffer_rejected() {
        let err = yuyv_to_rgba(&[0; 8], 4, 2).unwrap_err();
        assert!(matches!(err, KvmError::BadFrame { expected: 16, got: 8 }));
    }

    #[test]
    fn odd_width_rejected() {
        assert!(yuyv_to_rgba(&[0; 6], 3, 1).is_err());
    }

    #[test]
    fn jpeg_output_has_magic_and_quality_scales_size() {
        let mut yuyv = Vec::new();
        for i in 0..(64 * 64 / 2) {
            yuyv.extend_from_slice(&[(i % 256) as u8, 90, ((i * 7) % 256) as u8, 170]);
        }
        let low = yuyv_to_jpeg(&yuyv, 64, 64, 10).unwrap();
        let high = yuyv_to_jpeg(&yuyv, 64, 64, 95).unwrap();
        assert_eq!(&low[..2], &[0xFF, 0xD8]);
        assert_eq!(&high[..2], &[0xFF, 0xD8]);
        assert!(high.len() > low.len());
    }
}
