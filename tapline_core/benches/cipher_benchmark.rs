use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tapline_core::crypto::{TunnelCipher, TunnelKey};

fn cipher_benchmark(c: &mut Criterion) {
    let cipher = TunnelCipher::new(TunnelKey::generate());

    let mut group = c.benchmark_group("envelope");
    for size in [64usize, 576, 1500, 4096] {
        let frame = vec![0x5Au8; size];
        let envelope = cipher.encrypt(&frame).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &frame, |b, frame| {
            b.iter(|| cipher.encrypt(black_box(frame)).unwrap())
        });

        // Pre-sealed envelope: measures tag check plus decryption only.
        group.bench_with_input(BenchmarkId::new("decrypt", size), &envelope, |b, envelope| {
            b.iter(|| cipher.decrypt(black_box(envelope)).unwrap())
        });
    }
    group.finish();

    let forged = TunnelCipher::new(TunnelKey::generate())
        .encrypt(&[0u8; 1500])
        .unwrap();
    c.bench_function("reject_forged_1500", |b| {
        b.iter(|| cipher.decrypt(black_box(&forged)).unwrap_err())
    });
}

criterion_group!(benches, cipher_benchmark);
criterion_main!(benches);
