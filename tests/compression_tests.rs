#[cfg(test)]
mod compression_tests {
    use everyfirst::attachments::prepare_attachments;
    use everyfirst::compression::{
        decode_data_url, fallback_data_url, CompressionOptions, ImageBytes, ImageCompressor,
        JpegEncoderKind,
    };
    use everyfirst::CompressError;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};
    use std::sync::Arc;

    // Noise defeats JPEG well enough that small budgets force several attempts
    fn noisy_image(width: u32, height: u32, format: ImageOutputFormat) -> Vec<u8> {
        let mut seed: u32 = 0x2545_f491;
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });

        let mut buffer = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buffer), format)
            .expect("Failed to encode test image");
        buffer
    }

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });

        let mut buffer = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buffer), ImageOutputFormat::Png)
            .expect("Failed to encode test PNG");
        buffer
    }

    fn noisy_webp(width: u32, height: u32) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });
        webp::Encoder::from_rgb(img.as_raw(), width, height)
            .encode(95.0)
            .to_vec()
    }

    fn jpeg_upload(data: Vec<u8>) -> ImageBytes {
        ImageBytes::with_content_type(data, Some("image/jpeg"))
    }

    #[test]
    fn test_result_meets_budget_or_uses_every_attempt() {
        let input = jpeg_upload(noisy_image(600, 400, ImageOutputFormat::Jpeg(95)));
        let compressor = ImageCompressor::default();

        for budget in [1, 20_000, 60_000, 2 * 1024 * 1024] {
            let report = compressor.compress_with_report(&input, budget).unwrap();
            assert!(
                report.size <= budget || report.attempts.len() == 8,
                "budget {} missed after {} attempts",
                budget,
                report.attempts.len()
            );
            assert_eq!(report.within_budget, report.size <= budget);

            let (_, bytes) = decode_data_url(&report.data_url).unwrap();
            assert_eq!(bytes.len(), report.size);
        }
    }

    #[test]
    fn test_impossible_budget_keeps_last_attempt() {
        let input = jpeg_upload(noisy_image(300, 200, ImageOutputFormat::Jpeg(95)));
        let report = ImageCompressor::default()
            .compress_with_report(&input, 1)
            .unwrap();

        assert_eq!(report.attempts.len(), 8);
        assert!(!report.within_budget);
        let last = report.attempts.last().unwrap();
        assert_eq!((report.width, report.height, report.quality), (last.width, last.height, last.quality));
        assert_eq!(report.quality, 35);
    }

    #[test]
    fn test_small_input_accepted_on_first_attempt() {
        let input = ImageBytes::with_content_type(gradient_png(64, 48), Some("image/png"));
        let report = ImageCompressor::default()
            .compress_with_report(&input, 2 * 1024 * 1024)
            .unwrap();

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.quality, 92);
        assert_eq!((report.width, report.height), (64, 48));
        assert!(report.within_budget);
    }

    #[test]
    fn test_attempts_are_monotonic() {
        let input = jpeg_upload(noisy_image(500, 500, ImageOutputFormat::Jpeg(95)));
        let report = ImageCompressor::default()
            .compress_with_report(&input, 1)
            .unwrap();

        for pair in report.attempts.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            assert!(next.quality <= prev.quality);
            if next.quality <= 40 {
                assert!(next.width <= prev.width);
                assert!(next.height <= prev.height);
            } else {
                assert_eq!((next.width, next.height), (prev.width, prev.height));
            }
        }
        let last = report.attempts.last().unwrap();
        assert!(last.width < 500);
    }

    #[test]
    fn test_same_input_gives_identical_output() {
        let input = jpeg_upload(noisy_image(320, 240, ImageOutputFormat::Jpeg(90)));
        let compressor = ImageCompressor::default();

        let a = compressor.compress(&input, 30_000).unwrap();
        let b = compressor.compress(&input, 30_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_png_is_reencoded_as_jpeg() {
        let input = ImageBytes::with_content_type(gradient_png(120, 80), Some("image/png"));
        let url = everyfirst::compress(&input, 2 * 1024 * 1024).unwrap();

        let (mime, bytes) = decode_data_url(&url).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_webp_stays_webp() {
        let input = ImageBytes::with_content_type(noisy_webp(160, 120), Some("image/webp"));
        let report = ImageCompressor::default()
            .compress_with_report(&input, 2 * 1024 * 1024)
            .unwrap();

        assert!(report.data_url.starts_with("data:image/webp;base64,"));
        let (mime, bytes) = decode_data_url(&report.data_url).unwrap();
        assert_eq!(mime, "image/webp");
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn test_webp_search_shrinks_under_tight_budget() {
        let input = ImageBytes::with_content_type(noisy_webp(300, 200), None);
        let report = ImageCompressor::default()
            .compress_with_report(&input, 1)
            .unwrap();

        assert_eq!(report.mime, "image/webp");
        assert_eq!(report.attempts.len(), 8);
        assert!(report.width < 300);
    }

    #[test]
    fn test_large_image_fits_max_dimension() {
        let input = ImageBytes::with_content_type(gradient_png(2400, 1200), None);
        let report = ImageCompressor::default()
            .compress_with_report(&input, 8 * 1024 * 1024)
            .unwrap();

        assert_eq!((report.width, report.height), (1920, 960));
        let (_, bytes) = decode_data_url(&report.data_url).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1920, 960));
    }

    #[test]
    fn test_jpeg_encoder_backend() {
        let options = CompressionOptions {
            encoder: JpegEncoderKind::JpegEncoder,
            ..CompressionOptions::default()
        };
        let input = jpeg_upload(noisy_image(200, 150, ImageOutputFormat::Jpeg(95)));
        let report = ImageCompressor::new(options)
            .compress_with_report(&input, 1)
            .unwrap();

        assert_eq!(report.attempts.len(), 8);
        assert!(report.data_url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_undecodable_input_falls_back_to_original_bytes() {
        let input = jpeg_upload(vec![0xFF, 0xD8, 0x00, 0x01, 0x02]);
        let err = ImageCompressor::default().compress(&input, 1024).unwrap_err();
        assert!(matches!(err, CompressError::Decode(_)));

        let url = fallback_data_url(&input);
        let (mime, bytes) = decode_data_url(&url).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes, vec![0xFF, 0xD8, 0x00, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_attachments_keep_order_with_fallback() {
        let files = vec![
            ImageBytes::with_content_type(gradient_png(40, 40), Some("image/png")),
            jpeg_upload(b"not really a jpeg".to_vec()),
            jpeg_upload(noisy_image(60, 60, ImageOutputFormat::Jpeg(90))),
        ];

        let prepared =
            prepare_attachments(Arc::new(ImageCompressor::default()), files, 2 * 1024 * 1024).await;

        assert_eq!(prepared.len(), 3);
        assert!(prepared[0].compressed);
        assert!(!prepared[1].compressed);
        assert!(prepared[2].compressed);
        assert!(prepared.iter().all(|p| p.data_url.starts_with("data:image/")));
    }
}
