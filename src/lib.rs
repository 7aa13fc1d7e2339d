//! Upload-side image compression for the Vihara admin console.
//!
//! [`ImageCompressor`] bounds an image's dimensions, flattens it onto a white
//! background and re-encodes it, trying one half-quality pass when the first
//! result is above the configured size ceiling.

pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use codec::{CodecEncoder, OutputFormat, SurfaceEncoder};
pub use error::CompressError;
pub use models::{CompressionOptions, CompressionPass, OutputImage, SourceImage};
pub use services::{EncodeOutcome, ImageCompressor};
pub use utils::{format_size, is_size_acceptable};
