//! Budgeted image compression for note attachments.
//!
//! An upload is decoded once, fitted inside [`MAX_DIMENSION`], and then
//! re-encoded as JPEG in a bounded search that first lowers quality and,
//! once quality is already low, shrinks the canvas. The last encode is
//! returned as a `data:` URL whether or not it met the byte budget.

use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use exif::{In, Reader, Tag, Value};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use log::{debug, info, warn};
use mime::Mime;
use serde::{Deserialize, Serialize};

use crate::errors::CompressError;

/// Default byte budget for one attachment (2 MiB).
pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;
/// Longest edge an attachment is rendered at before the size search starts.
pub const MAX_DIMENSION: u32 = 1920;
pub const MAX_ATTEMPTS: u32 = 8;

/// Raw upload bytes plus the MIME type the client declared for them.
#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub data: Bytes,
    pub mime: Option<Mime>,
}

impl ImageBytes {
    pub fn new(data: impl Into<Bytes>, mime: Option<Mime>) -> Self {
        Self {
            data: data.into(),
            mime,
        }
    }

    /// Builds an upload from a raw `Content-Type` value; unparsable types are dropped.
    pub fn with_content_type(data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        let mime = content_type.and_then(|ct| ct.parse::<Mime>().ok());
        Self::new(data, mime)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Declared type, or the type sniffed from the magic bytes.
    pub fn effective_mime(&self) -> Option<Mime> {
        self.mime.clone().or_else(|| sniff_mime(&self.data))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JpegEncoderKind {
    #[default]
    Mozjpeg,
    JpegEncoder,
}

impl FromStr for JpegEncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mozjpeg" => Ok(JpegEncoderKind::Mozjpeg),
            "jpeg-encoder" => Ok(JpegEncoderKind::JpegEncoder),
            other => Err(format!("Unknown JPEG encoder '{}'", other)),
        }
    }
}

/// Knobs of the size search. Qualities are integer percent (92 == 0.92).
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOptions {
    pub max_dimension: u32,
    pub initial_quality: u8,
    pub quality_step: u8,
    pub min_quality: u8,
    pub shrink_threshold: u8,
    pub shrink_factor: f64,
    pub max_attempts: u32,
    pub encoder: JpegEncoderKind,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            initial_quality: 92,
            quality_step: 12,
            min_quality: 35,
            shrink_threshold: 40,
            shrink_factor: 0.85,
            max_attempts: MAX_ATTEMPTS,
            encoder: JpegEncoderKind::Mozjpeg,
        }
    }
}

/// One encode performed during the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct CompressionReport {
    pub data_url: String,
    pub mime: Mime,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub size: usize,
    pub within_budget: bool,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttemptState {
    width: u32,
    height: u32,
    quality: u8,
    index: u32,
}

impl AttemptState {
    fn next(self, options: &CompressionOptions) -> Self {
        let quality = self
            .quality
            .saturating_sub(options.quality_step)
            .max(options.min_quality);

        let (width, height) = if quality <= options.shrink_threshold {
            scale_dimensions(self.width, self.height, options.shrink_factor)
        } else {
            (self.width, self.height)
        };

        Self {
            width,
            height,
            quality,
            index: self.index + 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageCompressor {
    options: CompressionOptions,
}

impl ImageCompressor {
    pub fn new(options: CompressionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    /// Compresses `input` towards `target_max_bytes` and returns a `data:` URL.
    pub fn compress(&self, input: &ImageBytes, target_max_bytes: usize) -> Result<String, CompressError> {
        self.compress_with_report(input, target_max_bytes)
            .map(|report| report.data_url)
    }

    pub fn compress_with_report(
        &self,
        input: &ImageBytes,
        target_max_bytes: usize,
    ) -> Result<CompressionReport, CompressError> {
        let total_start = Instant::now();
        let budget = target_max_bytes.max(1);
        let options = &self.options;

        let canvas = decode_canvas(&input.data)?;
        let (source_width, source_height) = canvas.dimensions();
        let mime = output_mime(input.effective_mime().as_ref());

        let (width, height) = fit_within(source_width, source_height, options.max_dimension);
        info!(
            "Compressing {} byte upload {}x{} -> {}x{} as {}, budget {} bytes",
            input.len(),
            source_width,
            source_height,
            width,
            height,
            mime,
            budget
        );

        let mut state = AttemptState {
            width,
            height,
            quality: options.initial_quality,
            index: 0,
        };
        let mut attempts = Vec::new();
        let mut last: Option<(AttemptState, Vec<u8>)> = None;

        while state.index < options.max_attempts {
            let encode_start = Instant::now();
            let encoded = match render_and_encode(&canvas, state, &mime, options.encoder) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("Encode attempt {} failed: {}", state.index + 1, e);
                    break;
                }
            };

            let size = encoded.len();
            debug!(
                "Attempt {}: {}x{} q={} -> {} bytes in {:.2}ms",
                state.index + 1,
                state.width,
                state.height,
                state.quality,
                size,
                encode_start.elapsed().as_secs_f64() * 1000.0
            );
            attempts.push(AttemptRecord {
                index: state.index,
                width: state.width,
                height: state.height,
                quality: state.quality,
                size,
            });
            last = Some((state, encoded));

            if size <= budget {
                break;
            }
            state = state.next(options);
        }

        let (accepted, encoded) = last.ok_or_else(|| {
            CompressError::CompressionFailure("encoder produced no output".to_string())
        })?;

        let size = encoded.len();
        let within_budget = size <= budget;
        if !within_budget {
            warn!(
                "Budget of {} bytes not met after {} attempts, keeping {} bytes",
                budget,
                attempts.len(),
                size
            );
        }

        info!(
            "Compression finished - {} -> {} bytes, {}x{} q={}, {} attempt(s), {:.2}ms",
            input.len(),
            size,
            accepted.width,
            accepted.height,
            accepted.quality,
            attempts.len(),
            total_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(CompressionReport {
            data_url: to_data_url(&mime, &encoded),
            mime,
            width: accepted.width,
            height: accepted.height,
            quality: accepted.quality,
            size,
            within_budget,
            attempts,
        })
    }
}

/// Compresses with the default search settings.
pub fn compress(input: &ImageBytes, target_max_bytes: usize) -> Result<String, CompressError> {
    ImageCompressor::default().compress(input, target_max_bytes)
}

/// Data URL of the untouched upload, used when compression fails.
pub fn fallback_data_url(input: &ImageBytes) -> String {
    let mime = input
        .effective_mime()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    to_data_url(&mime, &input.data)
}

pub fn to_data_url(mime: &Mime, payload: &[u8]) -> String {
    format!("data:{};base64,{}", mime.essence_str(), STANDARD.encode(payload))
}

/// Splits a base64 `data:` URL into its MIME type and decoded payload.
pub fn decode_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let bytes = STANDARD.decode(payload).ok()?;
    Some((mime.to_string(), bytes))
}

/// Scales `(width, height)` so the longer edge equals `max_dimension` when it is exceeded.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height);
    }

    if width >= height {
        let scaled = (height as f64 * max_dimension as f64 / width as f64).round() as u32;
        (max_dimension, scaled.max(1))
    } else {
        let scaled = (width as f64 * max_dimension as f64 / height as f64).round() as u32;
        (scaled.max(1), max_dimension)
    }
}

fn scale_dimensions(width: u32, height: u32, factor: f64) -> (u32, u32) {
    let w = ((width as f64 * factor).round() as u32).max(1);
    let h = ((height as f64 * factor).round() as u32).max(1);
    (w, h)
}

/// PNG, unknown and absent types become JPEG. WebP keeps its type and goes
/// through the lossy WebP encoder; other types without an encoder here are
/// re-encoded as JPEG.
fn output_mime(source: Option<&Mime>) -> Mime {
    match source {
        Some(m) if is_webp(m) => m.clone(),
        Some(m) if m.type_() == mime::IMAGE && (m.subtype() == mime::JPEG || m.subtype() == "jpg") => {
            mime::IMAGE_JPEG
        }
        Some(m) if m.type_() == mime::IMAGE && m.subtype() == mime::PNG => mime::IMAGE_JPEG,
        Some(m) => {
            debug!("No lossy encoder for {}, re-encoding as JPEG", m);
            mime::IMAGE_JPEG
        }
        None => mime::IMAGE_JPEG,
    }
}

fn is_webp(m: &Mime) -> bool {
    m.type_() == mime::IMAGE && m.subtype() == "webp"
}

fn sniff_mime(data: &[u8]) -> Option<Mime> {
    let essence = match image::guess_format(data).ok()? {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::Ico => "image/x-icon",
        _ => return None,
    };
    essence.parse().ok()
}

/// Decodes the upload once into an RGB canvas with EXIF orientation applied.
fn decode_canvas(data: &[u8]) -> Result<DynamicImage, CompressError> {
    let load_start = Instant::now();

    let img = image::load_from_memory(data)
        .map_err(|e| CompressError::Decode(format!("Failed to decode image: {}", e)))?;

    let img = match read_exif_orientation(data) {
        Some(orientation) => apply_exif_orientation(img, orientation),
        None => img,
    };

    debug!(
        "Decoded {}x{} canvas in {:.2}ms",
        img.width(),
        img.height(),
        load_start.elapsed().as_secs_f64() * 1000.0
    );

    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

fn read_exif_orientation(data: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(data);

    let exif = match Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        Err(e) => {
            debug!("No EXIF data: {}", e);
            return None;
        }
    };

    match exif.get_field(Tag::Orientation, In::PRIMARY).map(|f| &f.value) {
        Some(Value::Short(values)) if !values.is_empty() => Some(values[0]),
        _ => None,
    }
}

fn apply_exif_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    debug!("Applying EXIF orientation {}", orientation);
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn render_and_encode(
    canvas: &DynamicImage,
    state: AttemptState,
    mime: &Mime,
    encoder: JpegEncoderKind,
) -> Result<Vec<u8>, String> {
    let rendered: RgbImage = if (state.width, state.height) == (canvas.width(), canvas.height()) {
        canvas.to_rgb8()
    } else {
        canvas
            .resize_exact(state.width, state.height, FilterType::Lanczos3)
            .to_rgb8()
    };

    if is_webp(mime) {
        return do_webp_compression(&rendered, state.quality);
    }
    match encoder {
        JpegEncoderKind::Mozjpeg => do_mozjpeg_compression(&rendered, state.quality),
        JpegEncoderKind::JpegEncoder => do_jpeg_encoder_compression(&rendered, state.quality),
    }
}

fn do_mozjpeg_compression(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let (width, height) = rgb.dimensions();
    let row_len = width as usize * 3;

    // mozjpeg reports libjpeg errors by unwinding
    let result = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<u8>, String> {
        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(quality as f32);
        comp.set_mem_dest();
        comp.start_compress();

        for line in rgb.as_raw().chunks(row_len) {
            if !comp.write_scanlines(line) {
                return Err("mozjpeg rejected a scanline".to_string());
            }
        }

        comp.finish_compress();
        comp.data_to_vec()
            .map_err(|_| "mozjpeg produced no output".to_string())
    }));

    match result {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(format!("mozjpeg failed: {}", e)),
        Err(_) => Err("mozjpeg aborted while encoding".to_string()),
    }
}

fn do_webp_compression(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let (width, height) = rgb.dimensions();
    let encoder = webp::Encoder::from_rgb(rgb.as_raw(), width, height);
    let encoded = encoder
        .encode_simple(false, quality as f32)
        .map_err(|e| format!("WebP encoder failed: {:?}", e))?;
    Ok(encoded.to_vec())
}

fn do_jpeg_encoder_compression(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    use jpeg_encoder::{ColorType, Encoder};

    let (width, height) = rgb.dimensions();
    let width = u16::try_from(width).map_err(|_| format!("Width {} too large for JPEG", width))?;
    let height = u16::try_from(height).map_err(|_| format!("Height {} too large for JPEG", height))?;

    let mut output = Vec::new();
    let encoder = Encoder::new(&mut output, quality);
    encoder
        .encode(rgb.as_raw(), width, height, ColorType::Rgb)
        .map_err(|e| format!("JPEG encoder failed: {:?}", e))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_within_keeps_small_images() {
        assert_eq!(fit_within(800, 600, 1920), (800, 600));
        assert_eq!(fit_within(1920, 1920, 1920), (1920, 1920));
    }

    #[test]
    fn test_fit_within_preserves_aspect_ratio() {
        assert_eq!(fit_within(3840, 2160, 1920), (1920, 1080));
        assert_eq!(fit_within(1000, 4000, 1920), (480, 1920));
        assert_eq!(fit_within(10000, 1, 1920), (1920, 1));
    }

    #[test]
    fn test_attempt_schedule() {
        let options = CompressionOptions::default();
        let mut state = AttemptState {
            width: 1000,
            height: 500,
            quality: options.initial_quality,
            index: 0,
        };

        let mut qualities = vec![state.quality];
        let mut widths = vec![state.width];
        for _ in 1..options.max_attempts {
            state = state.next(&options);
            qualities.push(state.quality);
            widths.push(state.width);
        }

        assert_eq!(qualities, vec![92, 80, 68, 56, 44, 35, 35, 35]);
        assert_eq!(widths, vec![1000, 1000, 1000, 1000, 1000, 850, 723, 615]);
        assert_eq!(state.index, 7);
    }

    #[test]
    fn test_mozjpeg_writes_every_scanline() {
        let rgb = RgbImage::from_fn(37, 21, |x, y| image::Rgb([(x * 6) as u8, (y * 12) as u8, 90]));
        let data = do_mozjpeg_compression(&rgb, 80).unwrap();

        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (37, 21));
    }

    #[test]
    fn test_webp_encoder_output() {
        let rgb = RgbImage::from_fn(40, 30, |x, y| image::Rgb([(x * 6) as u8, (y * 8) as u8, 40]));
        let data = do_webp_compression(&rgb, 75).unwrap();

        assert_eq!(&data[..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_output_mime_selection() {
        assert_eq!(output_mime(Some(&mime::IMAGE_PNG)), mime::IMAGE_JPEG);
        assert_eq!(output_mime(Some(&mime::IMAGE_JPEG)), mime::IMAGE_JPEG);
        assert_eq!(output_mime(None), mime::IMAGE_JPEG);
        let gif: Mime = "image/gif".parse().unwrap();
        assert_eq!(output_mime(Some(&gif)), mime::IMAGE_JPEG);
        let webp: Mime = "image/webp".parse().unwrap();
        assert_eq!(output_mime(Some(&webp)), webp);
    }

    #[test]
    fn test_data_url_helpers() {
        let url = to_data_url(&mime::IMAGE_PNG, b"abc");
        assert_eq!(url, "data:image/png;base64,YWJj");
        assert_eq!(
            decode_data_url(&url),
            Some(("image/png".to_string(), b"abc".to_vec()))
        );
        assert_eq!(decode_data_url("not a data url"), None);
    }

    #[test]
    fn test_fallback_uses_declared_mime() {
        let input = ImageBytes::with_content_type(vec![1u8, 2, 3], Some("image/heic"));
        assert_eq!(fallback_data_url(&input), "data:image/heic;base64,AQID");

        let unknown = ImageBytes::new(vec![1u8, 2, 3], None);
        assert!(fallback_data_url(&unknown).starts_with("data:application/octet-stream;base64,"));
    }

    #[test]
    fn test_encoder_kind_parsing() {
        assert_eq!("mozjpeg".parse::<JpegEncoderKind>(), Ok(JpegEncoderKind::Mozjpeg));
        assert_eq!(
            "JPEG-ENCODER".parse::<JpegEncoderKind>(),
            Ok(JpegEncoderKind::JpegEncoder)
        );
        assert!("png-quantized".parse::<JpegEncoderKind>().is_err());
    }
}
