use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weft::{Buffer, Drained, Pipeline, Term, BUFSIZ};

fn bench_pipeline_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.bench_function("add_then_drain", |b| {
        b.iter_batched(
            || {
                let mut rng = StdRng::seed_from_u64(7);
                let mut p = Pipeline::new();
                for _ in 0..1000 {
                    p.add(vec![0u8; 256], rng.gen_range(0..10));
                }
                p
            },
            |mut p| {
                while let Drained::Data(chunk) = p.read(BUFSIZ) {
                    black_box(chunk);
                }
                p
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_buffer_term_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    group.bench_function("feed_until_crlf", |b| {
        let mut line = vec![b'x'; 4096];
        line.extend_from_slice(b"\r\n");
        b.iter_batched(
            || {
                let mut buf = Buffer::new();
                buf.set_term(Term::delimiter("\r\n"));
                buf
            },
            |mut buf| {
                for chunk in line.chunks(512) {
                    if let Some(matched) = buf.feed(chunk) {
                        black_box(matched);
                    }
                }
                buf
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_pipeline_merge, bench_buffer_term_scan);
criterion_main!(benches);
