use criterion::{black_box, criterion_group, criterion_main, Criterion};
use octx::codec::{ufloat16, FloatLut, IntensityTransform};
use octx::record::Schema;
use std::io::Cursor;

/// One 512 x 496 B-scan of raw Heidelberg pixels.
fn bscan() -> Vec<u16> {
    (0u32..512 * 496).map(|i| i.wrapping_mul(7919) as u16).collect()
}

fn bench_intensity(c: &mut Criterion) {
    let raw = bscan();
    let lut = FloatLut::new(IntensityTransform::Current);

    c.bench_function("lut_map_bscan", |b| b.iter(|| lut.map_pixels(black_box(&raw))));
    c.bench_function("direct_map_bscan", |b| {
        b.iter(|| {
            black_box(&raw)
                .iter()
                .map(|&p| IntensityTransform::Current.apply(ufloat16(p)))
                .collect::<Vec<f32>>()
        })
    });
    c.bench_function("lut_build", |b| b.iter(|| FloatLut::new(black_box(IntensityTransform::Legacy))));
}

fn bench_record_decode(c: &mut Criterion) {
    let schema: &Schema = &octx::formats::heidelberg::CHUNK_HEADER;
    let mut bytes = b"MDbData\0\0\0\0\0".to_vec();
    bytes.resize(60, 0);

    c.bench_function("decode_e2e_chunk_header", |b| {
        b.iter(|| schema.decode(&mut Cursor::new(black_box(&bytes))).unwrap())
    });
}

criterion_group!(benches, bench_intensity, bench_record_decode);
criterion_main!(benches);
