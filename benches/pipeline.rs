//! Filter and compositing throughput.
//!
//! Run with: cargo bench --bench pipeline

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use image::{Rgba, RgbaImage};
use std::hint::black_box;

use knoux_studio::canvas::{BlendMode, CanvasState, Layer};
use knoux_studio::ops::{Filter, JobContext, apply_filter, apply_filters};

fn test_image(size: u32) -> RgbaImage {
    RgbaImage::from_fn(size, size, |x, y| {
        let v = ((x + y) % 255) as u8;
        Rgba([v, 255u8.saturating_sub(v), v / 2 + 60, 255])
    })
}

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filters");
    let ctx = JobContext::new();
    let filters = [
        Filter::Brightness { amount: 20.0 },
        Filter::Saturation { amount: 30.0 },
        Filter::GaussianBlur { sigma: 3.0 },
        Filter::Sharpen { amount: 1.5, radius: 1.0 },
        Filter::Denoise { amount: 50.0 },
    ];

    for size in [256u32, 1024] {
        let img = test_image(size);
        group.throughput(Throughput::Elements(u64::from(size) * u64::from(size)));
        for filter in &filters {
            group.bench_with_input(BenchmarkId::new(filter.name(), format!("{size}x{size}")), &img, |b, img| {
                b.iter(|| apply_filter(black_box(img), filter, None, &ctx));
            });
        }
    }
    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let img = test_image(512);
    let ctx = JobContext::new();
    let chain = vec![
        Filter::AutoLevels,
        Filter::Clarity { amount: 40.0 },
        Filter::Vignette { amount: 30.0, feather: 50.0 },
    ];
    c.bench_function("chain_512", |b| {
        b.iter(|| apply_filters(black_box(&img), &chain, None, &ctx));
    });
}

fn bench_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite");
    for mode in [BlendMode::Normal, BlendMode::Multiply, BlendMode::SoftLight, BlendMode::HardMix] {
        let mut canvas = CanvasState::from_image(test_image(1024));
        for _ in 0..3 {
            let layer = Layer::new("L", 1024, 1024, Rgba([200, 80, 40, 180])).with_blend(mode, 0.7);
            canvas.add_layer(layer).unwrap();
        }
        group.bench_function(mode.name(), |b| b.iter(|| black_box(canvas.composite())));
    }
    group.finish();
}

criterion_group!(benches, bench_filters, bench_chain, bench_composite);
criterion_main!(benches);
