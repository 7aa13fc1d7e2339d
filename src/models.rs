use crate::error::CompressError;
use crate::utils::{BYTES_PER_MB, mime_type_from_path};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_MAX_HEIGHT: u32 = 1920;
pub const DEFAULT_QUALITY: f32 = 0.8;
pub const DEFAULT_MAX_SIZE_MB: f64 = 2.0;

/// A user-selected file as handed over by an upload form.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    /// Declared MIME type, possibly empty.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SourceImage {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Reads a file from disk, guessing the declared type from its extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CompressError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(CompressError::FileRead)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = mime_type_from_path(path).unwrap_or_default();

        Ok(Self::new(name, mime_type, bytes))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn declared_type(&self) -> Option<&str> {
        let trimmed = self.mime_type.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    pub max_width: u32,
    pub max_height: u32,
    /// Initial encoder quality in (0, 1].
    pub quality: f32,
    /// Ceiling that triggers the fallback pass, 1 MB = 1024 * 1024 bytes.
    pub max_size_mb: f64,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            quality: DEFAULT_QUALITY,
            max_size_mb: DEFAULT_MAX_SIZE_MB,
        }
    }
}

impl CompressionOptions {
    pub fn validate(&self) -> Result<(), CompressError> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err(CompressError::InvalidOptions(format!(
                "max dimensions must be positive, got {}x{}",
                self.max_width, self.max_height
            )));
        }

        if !self.quality.is_finite() || self.quality <= 0.0 || self.quality > 1.0 {
            return Err(CompressError::InvalidOptions(format!(
                "quality must be in (0, 1], got {}",
                self.quality
            )));
        }

        if !self.max_size_mb.is_finite() || self.max_size_mb <= 0.0 {
            return Err(CompressError::InvalidOptions(format!(
                "max_size_mb must be positive, got {}",
                self.max_size_mb
            )));
        }

        Ok(())
    }

    pub fn max_size_bytes(&self) -> f64 {
        self.max_size_mb * BYTES_PER_MB
    }
}

/// Per-request overrides layered on top of configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompressionOverrides {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub quality: Option<f32>,
    pub max_size_mb: Option<f64>,
}

impl CompressionOverrides {
    pub fn apply(&self, base: &CompressionOptions) -> CompressionOptions {
        CompressionOptions {
            max_width: self.max_width.unwrap_or(base.max_width),
            max_height: self.max_height.unwrap_or(base.max_height),
            quality: self.quality.unwrap_or(base.quality),
            max_size_mb: self.max_size_mb.unwrap_or(base.max_size_mb),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// Which encode pass produced the returned bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPass {
    Encoded,
    EncodedFallback,
}

impl CompressionPass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encoded => "encoded",
            Self::EncodedFallback => "encoded_fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub last_modified: SystemTime,
    pub dimensions: ImageDimensions,
    pub original_size: usize,
    pub pass: CompressionPass,
    pub quality_used: f32,
}

impl OutputImage {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CompressRequest {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    pub data: String, // base64, data URLs accepted
    #[serde(flatten)]
    pub overrides: CompressionOverrides,
}

#[derive(Serialize, Debug, Clone)]
pub struct CompressResponse {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub data: String,
    pub original_size: usize,
    pub compressed_size: usize,
    pub original_size_human: String,
    pub compressed_size_human: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<CompressionPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_used: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

fn default_name() -> String {
    "image".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upload_form_settings() {
        let options = CompressionOptions::default();
        assert_eq!(options.max_width, 1920);
        assert_eq!(options.max_height, 1920);
        assert_eq!(options.quality, 0.8);
        assert_eq!(options.max_size_mb, 2.0);
        assert!(options.validate().is_ok());
        assert_eq!(options.max_size_bytes(), 2.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn rejects_out_of_range_options() {
        let base = CompressionOptions::default();
        let cases = [
            CompressionOptions { max_width: 0, ..base.clone() },
            CompressionOptions { max_height: 0, ..base.clone() },
            CompressionOptions { quality: 0.0, ..base.clone() },
            CompressionOptions { quality: 1.5, ..base.clone() },
            CompressionOptions { quality: f32::NAN, ..base.clone() },
            CompressionOptions { max_size_mb: 0.0, ..base.clone() },
            CompressionOptions { max_size_mb: f64::INFINITY, ..base.clone() },
        ];

        for options in cases {
            assert!(
                matches!(options.validate(), Err(CompressError::InvalidOptions(_))),
                "{options:?} should be rejected"
            );
        }

        let full_quality = CompressionOptions { quality: 1.0, ..base };
        assert!(full_quality.validate().is_ok());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let overrides = CompressionOverrides {
            max_width: Some(1280),
            quality: Some(0.7),
            ..Default::default()
        };
        let options = overrides.apply(&CompressionOptions::default());
        assert_eq!(options.max_width, 1280);
        assert_eq!(options.max_height, 1920);
        assert_eq!(options.quality, 0.7);
        assert_eq!(options.max_size_mb, 2.0);
    }

    #[test]
    fn partial_json_options_fill_defaults() {
        let options: CompressionOptions =
            serde_json::from_str(r#"{"max_width": 800, "max_size_mb": 1}"#).unwrap();
        assert_eq!(options.max_width, 800);
        assert_eq!(options.max_height, 1920);
        assert_eq!(options.max_size_mb, 1.0);
    }

    #[test]
    fn request_accepts_type_field_and_flattened_overrides() {
        let request: CompressRequest = serde_json::from_str(
            r#"{"name": "altar.png", "type": "image/png", "data": "aGk=", "quality": 0.5}"#,
        )
        .unwrap();
        assert_eq!(request.name, "altar.png");
        assert_eq!(request.mime_type, "image/png");
        assert_eq!(request.overrides.quality, Some(0.5));
        assert_eq!(request.overrides.max_width, None);

        let bare: CompressRequest = serde_json::from_str(r#"{"data": "aGk="}"#).unwrap();
        assert_eq!(bare.name, "image");
        assert_eq!(bare.mime_type, "");
    }

    #[tokio::test]
    async fn from_path_reads_bytes_and_guesses_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offering.JPG");
        tokio::fs::write(&path, b"not really a jpeg").await.unwrap();

        let source = SourceImage::from_path(&path).await.unwrap();
        assert_eq!(source.name, "offering.JPG");
        assert_eq!(source.mime_type, "image/jpeg");
        assert_eq!(source.size(), 17);
    }

    #[tokio::test]
    async fn from_path_reports_missing_file_as_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SourceImage::from_path(dir.path().join("missing.png")).await;
        assert!(matches!(result, Err(CompressError::FileRead(_))));
    }

    #[test]
    fn declared_type_ignores_blank_values() {
        assert_eq!(SourceImage::new("a", "  ", vec![]).declared_type(), None);
        assert_eq!(
            SourceImage::new("a", "image/png", vec![]).declared_type(),
            Some("image/png")
        );
    }
}
