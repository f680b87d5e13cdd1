use criterion::{criterion_group, criterion_main, Criterion};
use resopatch_scanner::*;

fn image_sized(c: &mut Criterion) {
    use rand::prelude::*;
    let size = 4 * 1024 * 1024;
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let needle = b"\x60\x6a\x00\x68\x0a\x00\x00\x00\x68\x38\x00\x00\x00\x68\x1e\x00\x00\x00";

    let mut data: Vec<u8> = (0..size - needle.len()).map(|_| rng.gen::<u8>()).collect();
    data.extend(needle);

    let pattern = Pattern::new("60 6A 00 68 ?? ?? 00 00 68 ?? ?? 00 00 68 1E 00 00 00").unwrap();

    let result = scan_pattern(&[&pattern], 0, &data);
    assert_eq!(result, [vec![size - needle.len()]]);

    c.bench_function("image scan_pattern", |b| {
        b.iter(|| scan_pattern(&[&pattern], 0, &data))
    });
    c.bench_function("image scan_xref", |b| {
        b.iter(|| scan_xref(&[&Xref(0x45A3F0)], 0x400000, &data))
    });
    c.bench_function("image find_zero_runs", |b| {
        b.iter(|| find_zero_runs(&data, 0, 64))
    });
}

criterion_group!(benches, image_sized);
criterion_main!(benches);
