use crate::models::CompressionOptions;
use crate::utils::DEFAULT_ACCEPTABLE_SIZE_MB;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_COMPRESSION_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub compression: CompressionConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub defaults: CompressionOptions,
    pub max_upload_mb: f64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fallback = CompressionOptions::default();
        let mut defaults = CompressionOptions {
            max_width: parse_or(&lookup, "COMPRESS_MAX_WIDTH", fallback.max_width),
            max_height: parse_or(&lookup, "COMPRESS_MAX_HEIGHT", fallback.max_height),
            quality: parse_or(&lookup, "COMPRESS_QUALITY", fallback.quality),
            max_size_mb: parse_or(&lookup, "COMPRESS_MAX_SIZE_MB", fallback.max_size_mb),
        };

        if let Err(e) = defaults.validate() {
            warn!("{e}, using built-in compression defaults");
            defaults = fallback;
        }

        let mut max_upload_mb = parse_or(&lookup, "MAX_UPLOAD_MB", DEFAULT_ACCEPTABLE_SIZE_MB);
        if !max_upload_mb.is_finite() || max_upload_mb <= 0.0 {
            warn!("MAX_UPLOAD_MB must be positive, using {DEFAULT_ACCEPTABLE_SIZE_MB}");
            max_upload_mb = DEFAULT_ACCEPTABLE_SIZE_MB;
        }

        let mut timeout_seconds = parse_or(
            &lookup,
            "COMPRESSION_TIMEOUT",
            DEFAULT_COMPRESSION_TIMEOUT_SECONDS,
        );
        if timeout_seconds == 0 {
            warn!(
                "COMPRESSION_TIMEOUT must be positive, using {DEFAULT_COMPRESSION_TIMEOUT_SECONDS}"
            );
            timeout_seconds = DEFAULT_COMPRESSION_TIMEOUT_SECONDS;
        }

        let allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| vec!["*".to_string()]);

        Self {
            server: ServerConfig {
                host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or(&lookup, "PORT", 8080),
            },
            compression: CompressionConfig {
                defaults,
                max_upload_mb,
                timeout_seconds,
            },
            cors: CorsConfig { allowed_origins },
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl CompressionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default {default}");
            default
        }),
    }
}
