//! Upload validation and decoding.
//!
//! Everything that can go wrong with the caller's bytes is reported here as an
//! [`InputError`], before the recognition engine sees the image.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("empty upload")]
    Empty,
    #[error("upload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("upload is not an image: {0}")]
    NotAnImage(String),
    #[error("cannot decode image: {0}")]
    Undecodable(#[from] image::ImageError),
    #[error("image has no pixels ({width}x{height})")]
    NoPixels { width: u32, height: u32 },
}

/// Decode an uploaded file into an RGB image.
pub fn decode_upload(bytes: &[u8], max_bytes: usize) -> Result<RgbImage, InputError> {
    if bytes.is_empty() {
        return Err(InputError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(InputError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let format = image::guess_format(bytes).map_err(|e| InputError::NotAnImage(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;

    tracing::debug!(
        ?format,
        width = decoded.width(),
        height = decoded.height(),
        "upload decoded"
    );
    ensure_pixels(decoded.to_rgb8())
}

fn ensure_pixels(image: RgbImage) -> Result<RgbImage, InputError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(InputError::NoPixels { width, height });
    }
    Ok(image)
}
