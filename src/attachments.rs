use std::sync::Arc;

use futures::future::join_all;
use log::warn;
use serde::Serialize;

use crate::compression::{fallback_data_url, ImageBytes, ImageCompressor};

/// A note carries at most this many images.
pub const MAX_IMAGES_PER_NOTE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedImage {
    pub data_url: String,
    /// False when the original bytes were kept because compression failed.
    pub compressed: bool,
}

fn is_image(file: &ImageBytes) -> bool {
    file.effective_mime()
        .map(|m| m.type_() == mime::IMAGE)
        .unwrap_or(false)
}

/// Compresses up to [`MAX_IMAGES_PER_NOTE`] image uploads concurrently.
///
/// Non-image files are skipped. Every task runs to completion; a file whose
/// compression fails is returned as a data URL of its original bytes. Output
/// order follows input order.
pub async fn prepare_attachments(
    compressor: Arc<ImageCompressor>,
    files: Vec<ImageBytes>,
    max_bytes: usize,
) -> Vec<PreparedImage> {
    let tasks = files
        .into_iter()
        .filter(is_image)
        .take(MAX_IMAGES_PER_NOTE)
        .map(|file| {
            let compressor = Arc::clone(&compressor);
            async move {
                let input = file.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || compressor.compress(&input, max_bytes)).await;

                match outcome {
                    Ok(Ok(data_url)) => PreparedImage {
                        data_url,
                        compressed: true,
                    },
                    Ok(Err(e)) => {
                        warn!("Keeping original {} byte upload: {}", file.len(), e);
                        PreparedImage {
                            data_url: fallback_data_url(&file),
                            compressed: false,
                        }
                    }
                    Err(e) => {
                        warn!("Compression task for {} byte upload failed: {}", file.len(), e);
                        PreparedImage {
                            data_url: fallback_data_url(&file),
                            compressed: false,
                        }
                    }
                }
            }
        });

    join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::decode_data_url;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        let mut buffer = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageOutputFormat::Png,
        )
        .expect("Failed to encode test PNG");
        buffer
    }

    #[tokio::test]
    async fn test_failed_file_falls_back_without_cancelling_others() {
        let files = vec![
            ImageBytes::with_content_type(png_bytes(40, 30), Some("image/png")),
            ImageBytes::with_content_type(b"definitely not an image".to_vec(), Some("image/png")),
            ImageBytes::with_content_type(png_bytes(20, 20), Some("image/png")),
        ];

        let prepared =
            prepare_attachments(Arc::new(ImageCompressor::default()), files, 1024 * 1024).await;

        assert_eq!(prepared.len(), 3);
        assert!(prepared[0].compressed);
        assert!(prepared[0].data_url.starts_with("data:image/jpeg;base64,"));
        assert!(!prepared[1].compressed);
        assert_eq!(
            decode_data_url(&prepared[1].data_url),
            Some(("image/png".to_string(), b"definitely not an image".to_vec()))
        );
        assert!(prepared[2].compressed);
    }

    #[tokio::test]
    async fn test_skips_non_images_and_caps_count() {
        let mut files = vec![ImageBytes::with_content_type(
            b"hello".to_vec(),
            Some("text/plain"),
        )];
        for _ in 0..5 {
            files.push(ImageBytes::new(png_bytes(10, 10), None));
        }

        let prepared =
            prepare_attachments(Arc::new(ImageCompressor::default()), files, 1024 * 1024).await;

        assert_eq!(prepared.len(), MAX_IMAGES_PER_NOTE);
        assert!(prepared.iter().all(|p| p.compressed));
    }
}
