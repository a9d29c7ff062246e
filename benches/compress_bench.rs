use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use everyfirst::compression::{CompressionOptions, ImageBytes, ImageCompressor, JpegEncoderKind};
use image::{ImageBuffer, ImageOutputFormat, Rgb};
use std::time::Duration;

/// Photo-like JPEG: smooth gradients with a little pseudo-random grain.
fn sample_photo(width: u32, height: u32) -> ImageBytes {
    let mut seed: u32 = 7;
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |x, y| {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let grain = (seed >> 24) as u8 / 8;
        Rgb([
            ((x * 255 / width) as u8).saturating_add(grain),
            ((y * 255 / height) as u8).saturating_add(grain),
            (((x + y) * 127 / (width + height)) as u8).saturating_add(grain),
        ])
    });

    let mut buffer = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buffer), ImageOutputFormat::Jpeg(95))
        .expect("Failed to encode sample photo");
    ImageBytes::with_content_type(buffer, Some("image/jpeg"))
}

fn bench_encoders(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress_encoder");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    let input = sample_photo(1600, 1200);
    for encoder in [JpegEncoderKind::Mozjpeg, JpegEncoderKind::JpegEncoder] {
        let compressor = ImageCompressor::new(CompressionOptions {
            encoder,
            ..CompressionOptions::default()
        });
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", encoder)),
            &input,
            |b, input| b.iter(|| compressor.compress(black_box(input), 2 * 1024 * 1024)),
        );
    }

    group.finish();
}

fn bench_budgets(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress_budget");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    let input = sample_photo(2400, 1800);
    let compressor = ImageCompressor::default();
    for budget_kb in [2048usize, 256, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(budget_kb), &budget_kb, |b, &kb| {
            b.iter(|| compressor.compress(black_box(&input), kb * 1024))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encoders, bench_budgets);
criterion_main!(benches);
