//! Line codec throughput benchmark.
//!
//! Measures encoding and decoding of newline-delimited JSON frames plus
//! frame classification, using Criterion.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use synego_base::envelope::Frame;
use synego_base::transport::codec::{encode_line, line_codec, strip_proxy_header};
use tokio_util::codec::{Decoder, Encoder};

const MAX_FRAME: usize = 5 * 1024 * 1024;

fn request(size: usize) -> serde_json::Value {
    json!({"event": "/bench/echo", "rid": "r1", "data": "x".repeat(size)})
}

fn bench_encode(c: &mut Criterion) {
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("encode_line");
    for &size in payload_sizes {
        let frame = request(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            let mut codec = line_codec(MAX_FRAME);
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(size + 64);
                let line = encode_line(black_box(f)).unwrap();
                codec.encode(line, &mut buf).unwrap();
                buf
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("decode_frame");
    for &size in payload_sizes {
        let mut wire = encode_line(&request(size)).unwrap();
        wire.push('\n');

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            let mut codec = line_codec(MAX_FRAME);
            b.iter(|| {
                let mut buf = BytesMut::from(black_box(w.as_bytes()));
                let line = codec.decode(&mut buf).unwrap().unwrap();
                Frame::decode_slice(line.as_bytes()).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_proxy_header(c: &mut Criterion) {
    let datagram = b"PROXY UDP4 203.0.113.9 10.0.0.1 5555 3003\r\n{\"event\":\"/bench\",\"data\":1}";
    c.bench_function("strip_proxy_header", |b| {
        b.iter(|| strip_proxy_header(black_box(datagram)))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_proxy_header);
criterion_main!(benches);
