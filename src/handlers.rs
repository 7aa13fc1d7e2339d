use crate::config::{AppConfig, CorsConfig};
use crate::models::*;
use crate::services::ImageCompressor;
use crate::utils::{
    BYTES_PER_MB, decode_base64, encode_base64, format_size, is_image_mime_type,
    is_size_acceptable, mime_type_from_path, sniff_mime_type,
};
use bytes::BytesMut;
use futures_util::StreamExt;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use hyper::http::response::Builder;
use hyper::{Body, Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Room for multipart headers and JSON fields around the image bytes.
const ENVELOPE_ALLOWANCE: u64 = 64 * 1024;

const EXPOSED_HEADERS: &str = "X-Original-Size, X-Compressed-Size, X-Compression-Pass, \
X-Output-Width, X-Output-Height, X-Compression-Warning";

/// What the upload caller ends up sending on.
enum Delivery {
    Compressed(OutputImage),
    Original { source: SourceImage, warning: String },
}

pub struct ImageHandler {
    compressor: ImageCompressor,
    defaults: CompressionOptions,
    cors_config: CorsConfig,
    max_upload_mb: f64,
    timeout: Duration,
}

impl ImageHandler {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_compressor(config, ImageCompressor::new())
    }

    pub fn with_compressor(config: &AppConfig, compressor: ImageCompressor) -> Self {
        Self {
            compressor,
            defaults: config.compression.defaults.clone(),
            cors_config: config.cors.clone(),
            max_upload_mb: config.compression.max_upload_mb,
            timeout: config.compression.timeout(),
        }
    }

    pub async fn handle_http_request(
        &self,
        req: Request<Body>,
    ) -> Result<Response<Body>, Infallible> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if req.method() == Method::OPTIONS {
            return Ok(self.create_cors_response(StatusCode::OK, Body::empty(), origin.as_deref()));
        }

        if req.method() != Method::POST || req.uri().path() != "/compress" {
            return Ok(self.create_cors_response(
                StatusCode::NOT_FOUND,
                Body::from(self.wrap_error_json("Not Found".to_string())),
                origin.as_deref(),
            ));
        }

        let content_type = self.get_content_type(req.headers());
        if self.is_multipart_content_type(content_type.as_deref()) {
            match self.process_multipart(req, content_type.as_deref()).await {
                Ok(delivery) => Ok(self.create_binary_response(delivery, origin.as_deref())),
                Err(error_body) => Ok(self.create_cors_response(
                    StatusCode::BAD_REQUEST,
                    Body::from(self.wrap_error_json(error_body)),
                    origin.as_deref(),
                )),
            }
        } else {
            match self.process_json(req).await {
                Ok(response_body) => Ok(self.create_cors_response(
                    StatusCode::OK,
                    Body::from(response_body),
                    origin.as_deref(),
                )),
                Err(error_body) => Ok(self.create_cors_response(
                    StatusCode::BAD_REQUEST,
                    Body::from(self.wrap_error_json(error_body)),
                    origin.as_deref(),
                )),
            }
        }
    }

    async fn process_multipart(
        &self,
        req: Request<Body>,
        content_type: Option<&str>,
    ) -> Result<Delivery, String> {
        let query_params = self.parse_query_params(req.uri().query().unwrap_or(""));
        let options = self.build_options(&query_params)?;

        let content_type = content_type.ok_or_else(|| "Content-Type required".to_string())?;
        let source = self
            .extract_multipart_file(content_type, req.into_body())
            .await?;

        self.compress_or_fallback(source, options).await
    }

    async fn process_json(&self, req: Request<Body>) -> Result<String, String> {
        let limit = self.json_body_limit();
        let declared_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if declared_length.is_some_and(|length| length > limit) {
            return Err(self.payload_too_large());
        }

        let body_bytes = self.read_body_limited(req.into_body(), limit).await?;

        let request: CompressRequest = serde_json::from_slice(&body_bytes)
            .map_err(|e| format!("Invalid JSON request: {e}"))?;

        let bytes =
            decode_base64(&request.data).map_err(|_| "Invalid base64 image data".to_string())?;
        let options = request.overrides.apply(&self.defaults);
        let source = SourceImage::new(request.name, request.mime_type, bytes);

        let response = match self.compress_or_fallback(source, options).await? {
            Delivery::Compressed(output) => CompressResponse {
                original_size_human: format_size(output.original_size as u64),
                compressed_size_human: format_size(output.size() as u64),
                original_size: output.original_size,
                compressed_size: output.size(),
                width: Some(output.dimensions.width),
                height: Some(output.dimensions.height),
                pass: Some(output.pass),
                quality_used: Some(output.quality_used),
                warning: None,
                data: encode_base64(&output.bytes),
                name: output.name,
                mime_type: output.mime_type,
            },
            Delivery::Original { source, warning } => CompressResponse {
                original_size_human: format_size(source.size() as u64),
                compressed_size_human: format_size(source.size() as u64),
                original_size: source.size(),
                compressed_size: source.size(),
                width: None,
                height: None,
                pass: None,
                quality_used: None,
                warning: Some(warning),
                data: encode_base64(&source.bytes),
                name: source.name,
                mime_type: source.mime_type,
            },
        };

        serde_json::to_string(&response).map_err(|_| "Error serializing response".to_string())
    }

    /// Validates the upload, runs the compressor under a timeout and falls
    /// back to the original file when compression fails.
    async fn compress_or_fallback(
        &self,
        mut source: SourceImage,
        options: CompressionOptions,
    ) -> Result<Delivery, String> {
        options.validate().map_err(|e| e.to_string())?;

        if source.bytes.is_empty() {
            return Err("No image data provided".to_string());
        }

        if !is_size_acceptable(source.size() as u64, self.max_upload_mb) {
            return Err(self.payload_too_large());
        }

        if source.declared_type().is_none() {
            let guessed = sniff_mime_type(&source.bytes)
                .or_else(|| mime_type_from_path(Path::new(&source.name)));
            source.mime_type = guessed.unwrap_or_default().to_string();
        }

        if !is_image_mime_type(&source.mime_type) {
            return Err(format!(
                "Unsupported file type {:?}, expected image/*",
                source.mime_type
            ));
        }

        let original = source.clone();
        let warning =
            match tokio::time::timeout(self.timeout, self.compressor.compress(source, &options))
                .await
            {
                Ok(Ok(output)) => {
                    info!(
                        name = %output.name,
                        pass = output.pass.as_str(),
                        "compressed {} -> {}",
                        format_size(output.original_size as u64),
                        format_size(output.size() as u64)
                    );
                    return Ok(Delivery::Compressed(output));
                }
                Ok(Err(e)) if !e.allows_original_fallback() => return Err(e.chain()),
                Ok(Err(e)) => format!("Compression failed, sending original file: {}", e.chain()),
                Err(_) => format!(
                    "Compression timed out after {}s, sending original file",
                    self.timeout.as_secs()
                ),
            };

        warn!(name = %original.name, "{warning}");
        Ok(Delivery::Original {
            source: original,
            warning,
        })
    }

    async fn extract_multipart_file(
        &self,
        content_type: &str,
        body: Body,
    ) -> Result<SourceImage, String> {
        let boundary = multer::parse_boundary(content_type)
            .map_err(|_| "Invalid boundary in Content-Type".to_string())?;
        let file_limit = self.upload_limit_bytes();
        let constraints = multer::Constraints::new().size_limit(
            multer::SizeLimit::new()
                .per_field(file_limit)
                .whole_stream(file_limit + ENVELOPE_ALLOWANCE),
        );
        let mut multipart = multer::Multipart::with_constraints(body, boundary, constraints);

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| self.multipart_error(e, "Error reading multipart"))?
        {
            if field.name() == Some("file") {
                let name = field.file_name().unwrap_or("image").to_string();
                let mime_type = field
                    .content_type()
                    .map(|mime| mime.essence_str().to_string())
                    .unwrap_or_default();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| self.multipart_error(e, "Error reading file"))?;

                return Ok(SourceImage::new(name, mime_type, bytes.to_vec()));
            }
        }

        Err("No file field found in multipart".to_string())
    }

    /// Reads at most `limit` bytes of `body`, rejecting the request as soon
    /// as the stream goes past it.
    async fn read_body_limited(&self, mut body: Body, limit: u64) -> Result<BytesMut, String> {
        let mut buffer = BytesMut::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|_| "Error reading request body".to_string())?;
            if (buffer.len() + chunk.len()) as u64 > limit {
                return Err(self.payload_too_large());
            }
            buffer.extend_from_slice(&chunk);
        }

        Ok(buffer)
    }

    fn upload_limit_bytes(&self) -> u64 {
        (self.max_upload_mb * BYTES_PER_MB) as u64
    }

    /// Base64 inflates the image by 4/3.
    fn json_body_limit(&self) -> u64 {
        self.upload_limit_bytes().div_ceil(3) * 4 + ENVELOPE_ALLOWANCE
    }

    fn payload_too_large(&self) -> String {
        format!("Payload too large: upload limit is {} MB", self.max_upload_mb)
    }

    fn multipart_error(&self, error: multer::Error, context: &str) -> String {
        match error {
            multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
                self.payload_too_large()
            }
            _ => context.to_string(),
        }
    }

    fn parse_query_params(&self, query: &str) -> HashMap<String, String> {
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    fn build_options(&self, params: &HashMap<String, String>) -> Result<CompressionOptions, String> {
        let overrides = CompressionOverrides {
            max_width: self.parse_optional(params, "w")?,
            max_height: self.parse_optional(params, "h")?,
            quality: self.parse_optional(params, "q")?,
            max_size_mb: self.parse_optional(params, "mb")?,
        };

        Ok(overrides.apply(&self.defaults))
    }

    fn parse_optional<T: std::str::FromStr>(
        &self,
        params: &HashMap<String, String>,
        key: &str,
    ) -> Result<Option<T>, String> {
        match params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| format!("Invalid parameter {key}")),
        }
    }

    fn create_cors_response(
        &self,
        status: StatusCode,
        body: Body,
        origin: Option<&str>,
    ) -> Response<Body> {
        let builder = self
            .cors_builder(status, origin)
            .header(CONTENT_TYPE, "application/json");

        self.finish(builder, body)
    }

    fn create_binary_response(&self, delivery: Delivery, origin: Option<&str>) -> Response<Body> {
        let builder = self
            .cors_builder(StatusCode::OK, origin)
            .header("Access-Control-Expose-Headers", EXPOSED_HEADERS);

        match delivery {
            Delivery::Compressed(output) => {
                let builder = builder
                    .header(CONTENT_TYPE, output.mime_type.as_str())
                    .header("X-Original-Size", output.original_size.to_string())
                    .header("X-Compressed-Size", output.size().to_string())
                    .header("X-Compression-Pass", output.pass.as_str())
                    .header("X-Output-Width", output.dimensions.width.to_string())
                    .header("X-Output-Height", output.dimensions.height.to_string());

                self.finish(builder, Body::from(output.bytes))
            }
            Delivery::Original { source, warning } => {
                let builder = builder
                    .header(CONTENT_TYPE, source.mime_type.as_str())
                    .header("X-Original-Size", source.size().to_string())
                    .header("X-Compressed-Size", source.size().to_string())
                    .header("X-Compression-Pass", "none")
                    .header("X-Compression-Warning", header_safe(&warning));

                self.finish(builder, Body::from(source.bytes))
            }
        }
    }

    fn cors_builder(&self, status: StatusCode, origin: Option<&str>) -> Builder {
        Response::builder()
            .status(status)
            .header("Access-Control-Allow-Origin", self.get_allowed_origin(origin))
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization",
            )
    }

    fn finish(&self, builder: Builder, body: Body) -> Response<Body> {
        builder.body(body).unwrap_or_else(|e| {
            error!("Failed to build response: {e}");
            let mut response = Response::new(Body::from(
                self.wrap_error_json("Internal error".to_string()),
            ));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
    }

    fn get_allowed_origin(&self, origin: Option<&str>) -> String {
        let allows_any = self.cors_config.allowed_origins.iter().any(|o| o == "*");

        match origin {
            _ if allows_any => "*".to_string(),
            Some(origin_value)
                if self
                    .cors_config
                    .allowed_origins
                    .iter()
                    .any(|o| o == origin_value) =>
            {
                origin_value.to_string()
            }
            _ => "null".to_string(),
        }
    }

    fn get_content_type(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    }

    fn is_multipart_content_type(&self, content_type: Option<&str>) -> bool {
        content_type
            .map(|value| value.to_lowercase().starts_with("multipart/form-data"))
            .unwrap_or(false)
    }

    fn wrap_error_json(&self, message: String) -> String {
        serde_json::to_string(&ErrorResponse { error: message })
            .unwrap_or_else(|_| r#"{"error":"Internal error"}"#.to_string())
    }
}

/// Header values must be visible ASCII.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_with(pairs: &[(&str, &str)]) -> ImageHandler {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImageHandler::new(&AppConfig::from_lookup(|key| vars.get(key).cloned()))
    }

    #[test]
    fn query_overrides_layer_on_defaults() {
        let handler = handler_with(&[("COMPRESS_MAX_WIDTH", "1000")]);
        let params = handler.parse_query_params("w=1280&q=0.7&mb=1");
        let options = handler.build_options(&params).unwrap();

        assert_eq!(options.max_width, 1280);
        assert_eq!(options.max_height, 1920);
        assert_eq!(options.quality, 0.7);
        assert_eq!(options.max_size_mb, 1.0);
    }

    #[test]
    fn rejects_unparsable_query_values() {
        let handler = handler_with(&[]);
        let params = handler.parse_query_params("h=tall");
        assert_eq!(handler.build_options(&params).unwrap_err(), "Invalid parameter h");
    }

    #[test]
    fn origin_echo_follows_allow_list() {
        let handler = handler_with(&[("CORS_ALLOWED_ORIGINS", "https://admin.vihara.test")]);
        assert_eq!(
            handler.get_allowed_origin(Some("https://admin.vihara.test")),
            "https://admin.vihara.test"
        );
        assert_eq!(handler.get_allowed_origin(Some("https://evil.test")), "null");
        assert_eq!(handler.get_allowed_origin(None), "null");

        let open = handler_with(&[]);
        assert_eq!(open.get_allowed_origin(Some("https://evil.test")), "*");
    }

    #[test]
    fn header_safe_replaces_control_and_non_ascii() {
        assert_eq!(header_safe("bad\nvalue ü"), "bad?value ?");
    }

    #[tokio::test]
    async fn untyped_upload_is_typed_from_its_bytes() {
        let handler = handler_with(&[]);
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 4))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let delivery = handler
            .compress_or_fallback(
                SourceImage::new("blob", "", png),
                CompressionOptions::default(),
            )
            .await
            .unwrap();

        match delivery {
            Delivery::Compressed(output) => assert_eq!(output.mime_type, "image/png"),
            Delivery::Original { warning, .. } => panic!("unexpected fallback: {warning}"),
        }
    }

    #[tokio::test]
    async fn unidentifiable_untyped_upload_is_rejected() {
        let handler = handler_with(&[]);
        let result = handler
            .compress_or_fallback(
                SourceImage::new("notes", "", b"plain text".to_vec()),
                CompressionOptions::default(),
            )
            .await;

        assert!(result.is_err());
    }
}
