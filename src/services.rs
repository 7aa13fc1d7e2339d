use crate::codec::{CodecEncoder, OutputFormat, SurfaceEncoder};
use crate::error::CompressError;
use crate::models::*;
use crate::utils::{format_size, is_size_acceptable};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbImage, RgbaImage};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Quality multiplier applied on the single fallback pass.
pub const FALLBACK_QUALITY_FACTOR: f32 = 0.5;

/// Result of the encode step. There is no state after `EncodedFallback`.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Encoded { bytes: Vec<u8>, quality: f32 },
    EncodedFallback { bytes: Vec<u8>, quality: f32 },
}

impl EncodeOutcome {
    pub fn pass(&self) -> CompressionPass {
        match self {
            Self::Encoded { .. } => CompressionPass::Encoded,
            Self::EncodedFallback { .. } => CompressionPass::EncodedFallback,
        }
    }

    pub fn quality(&self) -> f32 {
        match self {
            Self::Encoded { quality, .. } | Self::EncodedFallback { quality, .. } => *quality,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Encoded { bytes, .. } | Self::EncodedFallback { bytes, .. } => bytes,
        }
    }
}

#[derive(Clone)]
pub struct ImageCompressor {
    encoder: Arc<dyn SurfaceEncoder>,
}

impl Default for ImageCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCompressor {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(CodecEncoder::default()))
    }

    pub fn with_encoder(encoder: Arc<dyn SurfaceEncoder>) -> Self {
        Self { encoder }
    }

    /// Compresses `source` on the blocking pool. Every failure is returned to
    /// the caller; the original file is never substituted here.
    pub async fn compress(
        &self,
        source: SourceImage,
        options: &CompressionOptions,
    ) -> Result<OutputImage, CompressError> {
        options.validate()?;

        let encoder = Arc::clone(&self.encoder);
        let options = options.clone();

        tokio::task::spawn_blocking(move || run_pipeline(encoder.as_ref(), source, &options))
            .await
            .map_err(CompressError::Worker)?
    }

    pub fn compress_blocking(
        &self,
        source: SourceImage,
        options: &CompressionOptions,
    ) -> Result<OutputImage, CompressError> {
        options.validate()?;
        run_pipeline(self.encoder.as_ref(), source, options)
    }
}

fn run_pipeline(
    encoder: &dyn SurfaceEncoder,
    source: SourceImage,
    options: &CompressionOptions,
) -> Result<OutputImage, CompressError> {
    let decoded = decode_image(&source.bytes)?;
    let (width, height) = decoded.dimensions();
    let target = target_dimensions(
        ImageDimensions { width, height },
        options.max_width,
        options.max_height,
    );

    debug!(
        name = %source.name,
        original = %format_size(source.size() as u64),
        "resizing {}x{} to {}x{}",
        width,
        height,
        target.width,
        target.height
    );

    let surface = render_surface(&decoded, target);
    drop(decoded);

    let format = OutputFormat::for_declared_type(source.declared_type());
    let outcome = encode_with_fallback(
        encoder,
        &surface,
        format,
        options.quality,
        options.max_size_mb,
    )?;

    let pass = outcome.pass();
    let quality_used = outcome.quality();
    let original_size = source.size();

    Ok(OutputImage {
        name: source.name,
        mime_type: format.mime_type().to_string(),
        bytes: outcome.into_bytes(),
        last_modified: SystemTime::now(),
        dimensions: target,
        original_size,
        pass,
        quality_used,
    })
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, CompressError> {
    image::load_from_memory(bytes).map_err(CompressError::ImageDecode)
}

/// Fits `source` inside `max_width` x `max_height` with one uniform scale
/// factor. Images already inside the bounds are never upscaled.
pub fn target_dimensions(
    source: ImageDimensions,
    max_width: u32,
    max_height: u32,
) -> ImageDimensions {
    let ImageDimensions { width, height } = source;
    if width <= max_width && height <= max_height {
        return source;
    }

    let ratio = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );

    ImageDimensions {
        width: ((width as f64 * ratio).round() as u32).min(max_width).max(1),
        height: ((height as f64 * ratio).round() as u32).min(max_height).max(1),
    }
}

/// Draws `image` at `target` size over an opaque white background.
pub fn render_surface(image: &DynamicImage, target: ImageDimensions) -> RgbImage {
    let resized = if image.dimensions() == (target.width, target.height) {
        image.to_rgba8()
    } else {
        imageops::resize(image, target.width, target.height, FilterType::Triangle)
    };

    let mut canvas =
        RgbaImage::from_pixel(target.width, target.height, Rgba([255, 255, 255, 255]));
    imageops::overlay(&mut canvas, &resized, 0, 0);

    DynamicImage::ImageRgba8(canvas).to_rgb8()
}

/// Encodes `surface` once at `quality`; if the result is above
/// `max_size_mb`, encodes the same surface once more at half quality and
/// returns that regardless of its size.
pub fn encode_with_fallback(
    encoder: &dyn SurfaceEncoder,
    surface: &RgbImage,
    format: OutputFormat,
    quality: f32,
    max_size_mb: f64,
) -> Result<EncodeOutcome, CompressError> {
    let bytes = encoder.encode(surface, format, quality)?;
    if is_size_acceptable(bytes.len() as u64, max_size_mb) {
        return Ok(EncodeOutcome::Encoded { bytes, quality });
    }

    let fallback_quality = quality * FALLBACK_QUALITY_FACTOR;
    debug!(
        size = %format_size(bytes.len() as u64),
        max_size_mb,
        fallback_quality,
        "first pass over size ceiling, re-encoding"
    );

    let bytes = encoder.encode(surface, format, fallback_quality)?;
    if !is_size_acceptable(bytes.len() as u64, max_size_mb) {
        warn!(
            size = %format_size(bytes.len() as u64),
            max_size_mb,
            "fallback pass still over size ceiling"
        );
    }

    Ok(EncodeOutcome::EncodedFallback {
        bytes,
        quality: fallback_quality,
    })
}
