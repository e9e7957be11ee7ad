//! Raw capture buffer → 8-bit grayscale conversions.

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("{format} buffer too short: expected {expected}, got {actual}")]
    TooShort {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::TooShort {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = width as usize * height as usize * 2;
    check_len("YUYV", yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Keep the high byte of each 16-bit little-endian sample.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("Y16", y16, pixels * 2)?;
    Ok(y16[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}

/// GREY is already 8-bit; drivers may pad the buffer past the image.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("GREY", grey, pixels)?;
    Ok(grey[..pixels].to_vec())
}
