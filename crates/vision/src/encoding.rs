//! Compressing frames for transport.

use image::{RgbImage, codecs::jpeg::JpegEncoder};

use crate::error::EncodeError;

/// Turns a frame into bytes of a single image format.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError>;

    /// MIME type of the encoded bytes.
    fn content_type(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: i32) -> Self {
        Self {
            quality: quality.clamp(1, 100) as u8,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(85)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut buffer, self.quality)
            .encode_image(image)
            .map_err(|err| EncodeError(err.to_string()))?;
        Ok(buffer)
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
        let bytes = JpegFrameEncoder::default().encode(&image).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegFrameEncoder::new(0).quality(), 1);
        assert_eq!(JpegFrameEncoder::new(250).quality(), 100);
    }
}
