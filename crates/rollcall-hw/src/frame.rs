//! Raw buffer to grayscale conversion for the supported pixel formats.

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, downscaled to 8 bits.
    Y16,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format:?} buffer too short: expected {expected}, got {actual}")]
    InvalidLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Convert one raw capture buffer to `width * height` grayscale bytes.
pub fn to_grayscale(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let bytes_per_pixel = match format {
        PixelFormat::Grey => 1,
        PixelFormat::Yuyv | PixelFormat::Y16 => 2,
    };
    let expected = pixels * bytes_per_pixel;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }

    let gray = match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        // YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        // High byte of each little-endian sample.
        PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
    };
    Ok(gray)
}
