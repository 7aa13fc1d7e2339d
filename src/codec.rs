//! Raster surface encoding.
//!
//! The compressor talks to encoders through [`SurfaceEncoder`] so the pass
//! logic can be exercised without real codecs.

use crate::error::CompressError;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use oxipng::{Options, StripChunks, optimize_from_memory};
use std::time::Duration;

pub const FALLBACK_MIME_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    /// Resolves the encode target for a declared MIME type. Missing or
    /// unsupported types encode as JPEG.
    pub fn for_declared_type(declared: Option<&str>) -> Self {
        let Some(declared) = declared else {
            return Self::Jpeg;
        };

        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/png" => Self::Png,
            "image/webp" => Self::WebP,
            _ => Self::Jpeg,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => FALLBACK_MIME_TYPE,
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

pub trait SurfaceEncoder: Send + Sync {
    fn encode(
        &self,
        surface: &RgbImage,
        format: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CompressError>;
}

/// Maps a (0, 1] quality onto the JPEG 1..=100 scale.
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Lower quality asks for more PNG optimisation effort (oxipng preset 0..=6).
pub fn png_preset(quality: f32) -> u8 {
    ((1.0 - quality) * 6.0).round().clamp(0.0, 6.0) as u8
}

pub struct CodecEncoder {
    png_timeout: Duration,
}

impl Default for CodecEncoder {
    fn default() -> Self {
        Self {
            png_timeout: Duration::from_secs(10),
        }
    }
}

impl CodecEncoder {
    pub fn new(png_timeout: Duration) -> Self {
        Self { png_timeout }
    }

    fn encode_jpeg(&self, surface: &RgbImage, quality: f32) -> Result<Vec<u8>, CompressError> {
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, jpeg_quality(quality));

        encoder
            .write_image(
                surface.as_raw(),
                surface.width(),
                surface.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| CompressError::encode(OutputFormat::Jpeg.mime_type(), e))?;

        Ok(buffer)
    }

    fn encode_png(&self, surface: &RgbImage, quality: f32) -> Result<Vec<u8>, CompressError> {
        let mut buffer = Vec::new();

        PngEncoder::new(&mut buffer)
            .write_image(
                surface.as_raw(),
                surface.width(),
                surface.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| CompressError::encode(OutputFormat::Png.mime_type(), e))?;

        let mut options = Options::from_preset(png_preset(quality));
        options.strip = StripChunks::Safe;
        options.timeout = Some(self.png_timeout);

        optimize_from_memory(&buffer, &options)
            .map_err(|e| CompressError::encode(OutputFormat::Png.mime_type(), e))
    }

    fn encode_webp(&self, surface: &RgbImage) -> Result<Vec<u8>, CompressError> {
        let mut buffer = Vec::new();

        WebPEncoder::new_lossless(&mut buffer)
            .write_image(
                surface.as_raw(),
                surface.width(),
                surface.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| CompressError::encode(OutputFormat::WebP.mime_type(), e))?;

        Ok(buffer)
    }
}

impl SurfaceEncoder for CodecEncoder {
    fn encode(
        &self,
        surface: &RgbImage,
        format: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CompressError> {
        match format {
            OutputFormat::Jpeg => self.encode_jpeg(surface, quality),
            OutputFormat::Png => self.encode_png(surface, quality),
            // lossless only, quality has no effect
            OutputFormat::WebP => self.encode_webp(surface),
        }
    }
}
