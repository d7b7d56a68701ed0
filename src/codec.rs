//! # Codec Module
//!
//! Contratto con il codec esterno e implementazione basata sul crate `image`.
//!
//! ## Responsabilità:
//! - Definisce `TargetFormat`, i formati di destinazione riconosciuti
//! - Definisce il trait `Codec`: dimensioni dall'header + encode dei byte grezzi
//! - `ImageCodec`: decode, resize Lanczos3 uniforme ed encode tramite `image`
//!
//! La pipeline non ispeziona mai i pixel: passa byte grezzi, qualità,
//! fattore di scala opzionale e politica metadata, e riceve byte codificati.
//!
//! ## Formati
//!
//! | Formato | Encode | Qualità |
//! |---------|--------|---------|
//! | PNG     | ✅     | ignorata (lossless) |
//! | JPEG    | ✅     | ✅ |
//! | WebP    | ✅     | ignorata (encoder lossless) |
//! | TIFF    | ✅     | ignorata |
//! | GIF     | ✅     | ignorata |
//! | AVIF    | ✅     | ✅ |
//! | HEIF    | ❌     | `UnsupportedFormat` |

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::error::LimitErrorKind;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageEncoder, ImageError, ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

use crate::config::MetadataPolicy;
use crate::error::ConvertError;

/// Speed preset handed to the AVIF encoder (1 = slowest, 10 = fastest)
const AVIF_SPEED: u8 = 6;

/// Target formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Png,
    Jpeg,
    WebP,
    Tiff,
    Gif,
    Avif,
    Heif,
}

/// Every spelling accepted on the command line.
pub const SUPPORTED_TARGET_FORMATS: &[&str] =
    &["png", "jpg", "jpeg", "webp", "tiff", "gif", "avif", "heif"];

impl TargetFormat {
    /// Parse a (case-insensitive) format name; `jpg` and `jpeg` are the same format.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            "tiff" | "tif" => Some(Self::Tiff),
            "gif" => Some(Self::Gif),
            "avif" => Some(Self::Avif),
            "heif" | "heic" => Some(Self::Heif),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::WebP => "webp",
            Self::Tiff => "tiff",
            Self::Gif => "gif",
            Self::Avif => "avif",
            Self::Heif => "heif",
        }
    }
}

/// Everything the codec needs to produce the output bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub format: TargetFormat,
    /// 1-100
    pub quality: u8,
    /// Uniform downscale factor in (0, 1); None keeps the original size
    pub scale: Option<f64>,
    pub metadata: MetadataPolicy,
}

/// Codec failures, each mapped onto a pipeline error kind.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("corrupted image: {0}")]
    Corrupted(String),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("encoding failed: {0}")]
    Encode(String),

    /// The codec ran out of memory; no later image can be expected to fare better.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl From<CodecError> for ConvertError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupted(msg) => ConvertError::CorruptedImage(msg),
            CodecError::Unsupported(msg) => ConvertError::UnsupportedFormat(msg),
            CodecError::Encode(msg) => ConvertError::Other(format!("encoding failed: {}", msg)),
            CodecError::OutOfMemory(msg) => ConvertError::Fatal(format!("codec out of memory: {}", msg)),
        }
    }
}

/// External image codec.
///
/// Implementations are called from blocking worker threads and must be
/// shareable across all of them.
pub trait Codec: Send + Sync {
    /// Width and height, read from the header where possible.
    fn dimensions(&self, data: &[u8]) -> Result<(u32, u32), CodecError>;

    /// Decode `data`, apply the request and return the encoded bytes.
    fn encode(&self, data: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, CodecError>;
}

/// Codec backed by the pure Rust `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCodec;

impl ImageCodec {
    pub fn new() -> Self {
        Self
    }

    fn reader(data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, CodecError> {
        ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| CodecError::Corrupted(e.to_string()))
    }

    /// Decode pixels plus the ICC profile (when the decoder exposes one).
    fn decode(data: &[u8]) -> Result<(DynamicImage, Option<Vec<u8>>), CodecError> {
        let mut decoder = Self::reader(data)?
            .into_decoder()
            .map_err(map_decode_error)?;
        let icc = decoder.icc_profile().unwrap_or(None);
        let image = DynamicImage::from_decoder(decoder).map_err(map_decode_error)?;
        Ok((image, icc))
    }
}

impl Codec for ImageCodec {
    fn dimensions(&self, data: &[u8]) -> Result<(u32, u32), CodecError> {
        Self::reader(data)?
            .into_dimensions()
            .map_err(map_decode_error)
    }

    fn encode(&self, data: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, CodecError> {
        if request.format == TargetFormat::Heif {
            return Err(heif_unsupported());
        }

        let (mut image, icc) = Self::decode(data)?;

        if let Some(scale) = request.scale {
            let width = ((image.width() as f64 * scale).round() as u32).max(1);
            let height = ((image.height() as f64 * scale).round() as u32).max(1);
            debug!(
                "Resizing {}x{} -> {}x{} (scale {:.4})",
                image.width(),
                image.height(),
                width,
                height,
                scale
            );
            image = image.resize_exact(width, height, FilterType::Lanczos3);
        }

        let icc = match request.metadata.effective() {
            MetadataPolicy::Strip => None,
            _ => icc,
        };

        let mut out = Cursor::new(Vec::new());
        match request.format {
            TargetFormat::Png => write_with(PngEncoder::new(&mut out), &image, icc)?,
            TargetFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                write_with(JpegEncoder::new_with_quality(&mut out, request.quality), &rgb, icc)?
            }
            TargetFormat::WebP => {
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                write_with(WebPEncoder::new_lossless(&mut out), &rgba, icc)?
            }
            TargetFormat::Tiff => {
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                write_with(TiffEncoder::new(&mut out), &rgba, icc)?
            }
            TargetFormat::Avif => {
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                let encoder =
                    AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, request.quality);
                write_with(encoder, &rgba, icc)?
            }
            TargetFormat::Gif => {
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                rgba.write_to(&mut out, ImageFormat::Gif)
                    .map_err(map_encode_error)?
            }
            TargetFormat::Heif => return Err(heif_unsupported()),
        }

        Ok(out.into_inner())
    }
}

fn write_with<E: ImageEncoder>(
    mut encoder: E,
    image: &DynamicImage,
    icc: Option<Vec<u8>>,
) -> Result<(), CodecError> {
    if let Some(icc) = icc {
        if encoder.set_icc_profile(icc).is_err() {
            debug!("Encoder does not support ICC profiles, dropping it");
        }
    }
    encoder
        .write_image(
            image.as_bytes(),
            image.width(),
            image.height(),
            image.color().into(),
        )
        .map_err(map_encode_error)
}

fn heif_unsupported() -> CodecError {
    CodecError::Unsupported("heif encoding is not available in this build".to_string())
}

fn is_out_of_memory(err: &ImageError) -> bool {
    matches!(err, ImageError::Limits(e) if e.kind() == LimitErrorKind::InsufficientMemory)
}

fn map_decode_error(err: ImageError) -> CodecError {
    match err {
        ImageError::Unsupported(e) => CodecError::Unsupported(e.to_string()),
        ref e if is_out_of_memory(e) => CodecError::OutOfMemory(e.to_string()),
        other => CodecError::Corrupted(other.to_string()),
    }
}

fn map_encode_error(err: ImageError) -> CodecError {
    match err {
        ImageError::Unsupported(e) => CodecError::Unsupported(e.to_string()),
        ref e if is_out_of_memory(e) => CodecError::OutOfMemory(e.to_string()),
        other => CodecError::Encode(other.to_string()),
    }
}
