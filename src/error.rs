use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of a single compression call. None of them are retried.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("failed to read image bytes")]
    FileRead(#[source] std::io::Error),

    #[error("failed to decode image")]
    ImageDecode(#[source] image::ImageError),

    #[error("failed to encode {mime_type} surface")]
    Encode {
        mime_type: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("invalid compression options: {0}")]
    InvalidOptions(String),

    #[error("compression worker aborted")]
    Worker(#[source] tokio::task::JoinError),
}

impl CompressError {
    pub fn encode(mime_type: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Encode {
            mime_type,
            source: source.into(),
        }
    }

    /// Renders this error and its sources as `outer: inner: ...`.
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }

    /// Errors after which an upload caller may still send the original file.
    pub fn allows_original_fallback(&self) -> bool {
        !matches!(self, Self::InvalidOptions(_))
    }
}
