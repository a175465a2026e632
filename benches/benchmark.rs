use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, Rgba, RgbaImage};
use print_endpoint::{
    dither_image, DriverType, PrintCommands, RasterEncoder, RenderContext, TemplateRenderer,
};
use serde_json::json;
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

// A receipt-sized bitmap with alternating black and white bands
fn receipt_bitmap() -> DynamicImage {
    let image = RgbaImage::from_fn(380, 1200, |_, y| {
        if (y / 24) % 2 == 0 {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    });
    DynamicImage::ImageRgba8(image)
}

fn benchmark_template_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("template");
    configure_fast_group(&mut group);

    let renderer = TemplateRenderer::new();
    let template = r#"{% data "shop" %}{"name": "Corner Cafe", "footer": "*Thank you!*"}{% enddata %}
<div id="content">
  <h1>{{ shop.name }}</h1>
  {% for line in it.lines %}<p>{{ line.qty }} x {{ line.name }} {{ line.price }}</p>{% endfor %}
  {{ shop.footer | markdown }}
</div>"#;
    let lines: Vec<_> = (0..20)
        .map(|i| json!({"qty": i % 3 + 1, "name": format!("Item {i}"), "price": "2.50"}))
        .collect();
    let context = RenderContext::new(json!({ "lines": lines }));

    group.bench_function("receipt", |b| {
        b.iter(|| {
            let html = renderer.render(black_box(template), &context);
            let _ = black_box(html);
        });
    });

    group.bench_function("markdown", |b| {
        b.iter(|| {
            let html = print_endpoint::render_markdown(black_box("**Total**: _12.50_\n\n- tea\n- cake"));
            black_box(html);
        });
    });

    group.finish();
}

fn benchmark_dither(c: &mut Criterion) {
    let mut group = c.benchmark_group("dither");
    configure_fast_group(&mut group);

    let logo = DynamicImage::ImageRgba8(RgbaImage::from_fn(400, 200, |x, y| {
        let v = ((x + y) % 256) as u8;
        Rgba([v, v, v, 255])
    }));

    for scale in [1i64, 2] {
        group.bench_function(format!("scale_{scale}"), |b| {
            b.iter(|| {
                let dithered = dither_image(black_box(&logo), scale, None);
                black_box(dithered);
            });
        });
    }

    group.finish();
}

fn benchmark_encoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoder");
    configure_fast_group(&mut group);

    let bitmap = receipt_bitmap();
    for driver in [DriverType::Epson, DriverType::EpsonEscStar, DriverType::Star] {
        let encoder = RasterEncoder::new(driver, PrintCommands::default());
        group.bench_function(format!("{driver:?}"), |b| {
            b.iter(|| {
                let buffer = encoder.encode(black_box(&bitmap));
                let _ = black_box(buffer);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_template_render,
    benchmark_dither,
    benchmark_encoder
);
criterion_main!(benches);
