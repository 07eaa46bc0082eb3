use anyhow::{anyhow, Result};

/// Pixel layouts a camera driver may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    /// Packed 4:2:2, `Y0 U Y1 V`.
    Yuyv,
}

/// Convert a driver buffer to packed RGB8.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    let expected = match format {
        PixelFormat::Rgb24 => plane * 3,
        PixelFormat::Nv12 => plane + plane / 2,
        PixelFormat::Yuyv => plane * 2,
    };
    if pixels.len() < expected {
        return Err(anyhow!(
            "{:?} frame too short: expected {} bytes, got {}",
            format,
            expected,
            pixels.len()
        ));
    }

    match format {
        PixelFormat::Rgb24 => Ok(pixels[..expected].to_vec()),
        PixelFormat::Nv12 => {
            let mut rgb = vec![0u8; plane * 3];
            for j in 0..h {
                for i in 0..w {
                    let uv = plane + (j / 2) * w + (i / 2) * 2;
                    let offset = (j * w + i) * 3;
                    rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(
                        pixels[j * w + i],
                        pixels[uv],
                        pixels[uv + 1],
                    ));
                }
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv => {
            let mut rgb = Vec::with_capacity(plane * 3);
            for chunk in pixels[..expected].chunks_exact(4) {
                let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            Ok(rgb)
        }
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
