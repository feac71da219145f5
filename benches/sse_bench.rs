//! SSE framing benchmark.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netmanager::sse::SseDecoder;

fn stream_bytes(events: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..events {
        out.extend_from_slice(format!("event: tick\ndata: {{\"seq\":{}}}\n\n", i).as_bytes());
    }
    out
}

fn sse_decode(c: &mut Criterion) {
    let input = stream_bytes(1000);
    let mut group = c.benchmark_group("sse");
    group.throughput(Throughput::Bytes(input.len() as u64));

    group.bench_function("feed_whole", |b| {
        b.iter(|| {
            let mut decoder = SseDecoder::default();
            black_box(decoder.feed(&input))
        })
    });

    group.bench_function("feed_small_reads", |b| {
        b.iter(|| {
            let mut decoder = SseDecoder::default();
            let mut count = 0;
            for piece in input.chunks(37) {
                count += decoder.feed(piece).len();
            }
            black_box(count)
        })
    });
    group.finish();
}

criterion_group!(benches, sse_decode);
criterion_main!(benches);
