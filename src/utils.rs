use base64::{Engine as _, engine::general_purpose};
use std::path::Path;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
pub const DEFAULT_ACCEPTABLE_SIZE_MB: f64 = 4.0;

/// Decodes a base64 payload, tolerating a `data:<mime>;base64,` prefix.
pub fn decode_base64(base64_data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match base64_data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => base64_data,
    };

    general_purpose::STANDARD.decode(payload.trim())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Identifies the image MIME type from magic bytes.
pub fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }

    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }

    if bytes.len() >= 12
        && bytes[0..4] == [0x52, 0x49, 0x46, 0x46]
        && bytes[8..12] == [0x57, 0x45, 0x42, 0x50]
    {
        return Some("image/webp");
    }

    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }

    if bytes.starts_with(b"BM") && bytes.len() >= 14 {
        return Some("image/bmp");
    }

    None
}

pub fn mime_type_from_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" | "jpe" | "jfif" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

pub fn is_image_mime_type(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

/// `true` when `file_size_bytes` fits within `max_size_mb` (inclusive).
pub fn is_size_acceptable(file_size_bytes: u64, max_size_mb: f64) -> bool {
    file_size_bytes as f64 / BYTES_PER_MB <= max_size_mb
}

/// Human readable size in base 1024, at most two decimals: `1536` -> `"1.5 KB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["Bytes", "KB", "MB", "GB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    let rounded = format!("{:.2}", size);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');

    format!("{} {}", trimmed, UNITS[unit_index])
}
