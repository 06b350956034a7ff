use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use sixtun_core::{EnvelopeCodec, EnvelopeVariant, decode, encode, internet_checksum, validate};
use std::net::Ipv4Addr;

const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);

fn bench_encode_sizes(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (40, "40_bytes"),
        (576, "576_bytes"),
        (1280, "1280_bytes"),
        (1480, "1480_bytes"),
        (9000, "9000_bytes"),
    ];

    let mut group = c.benchmark_group("envelope_encode");
    for (size, name) in sizes {
        let inner = vec![0x60; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| encode(black_box(SRC), black_box(DST), black_box(&inner)))
        });
    }
    group.finish();
}

fn bench_encode_into_reused(c: &mut Criterion) {
    let codec = EnvelopeCodec::plain();
    let inner = vec![0x60; 1280];
    let mut out = Vec::with_capacity(2048);

    let mut group = c.benchmark_group("envelope_encode_into");
    group.throughput(Throughput::Bytes(inner.len() as u64));
    group.bench_function("plain_1280_bytes", |b| {
        b.iter(|| codec.encode_into(SRC, DST, black_box(&inner), &mut out))
    });

    let mimic = EnvelopeCodec::new(EnvelopeVariant::TcpMimic {
        src_port: 443,
        dst_port: 51000,
    });
    group.bench_function("tcp_mimic_1280_bytes", |b| {
        b.iter(|| mimic.encode_into(SRC, DST, black_box(&inner), &mut out))
    });
    group.finish();
}

fn bench_decode_and_validate(c: &mut Criterion) {
    let envelope = encode(SRC, DST, &vec![0x60; 1280]).unwrap();

    let mut group = c.benchmark_group("envelope_decode");
    group.throughput(Throughput::Bytes(envelope.len() as u64));
    group.bench_function("decode_1300_bytes", |b| {
        b.iter(|| decode(black_box(&envelope)))
    });
    group.bench_function("validate_1300_bytes", |b| {
        b.iter(|| validate(black_box(&envelope)))
    });
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let envelope = encode(SRC, DST, b"").unwrap();
    let header = &envelope[..20];

    c.bench_function("internet_checksum_20_bytes", |b| {
        b.iter(|| internet_checksum(black_box(header)))
    });
}

criterion_group!(
    benches,
    bench_encode_sizes,
    bench_encode_into_reused,
    bench_decode_and_validate,
    bench_checksum
);
criterion_main!(benches);
