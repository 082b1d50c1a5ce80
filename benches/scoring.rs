use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dealrank::{knn_density, value_scores, Product};
use std::hint::black_box;

// Deterministic 2-D points on a jittered grid.
fn points(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let j = (i * 7919 % 101) as f64 / 101.0;
            vec![(i % 16) as f64 + j, (i / 16) as f64 - j]
        })
        .collect()
}

fn products(n: usize) -> Vec<Product> {
    (0..n)
        .map(|i| {
            let price = 5.0 + (i * 37 % 200) as f64;
            let rating = 1.0 + (i * 13 % 40) as f64 / 10.0;
            Product::new(format!("p{i}"), price, rating)
        })
        .collect()
}

fn bench_density(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_density");
    for n in [16usize, 64, 256] {
        let pts = points(n);
        group.bench_with_input(BenchmarkId::new("k3", n), &pts, |b, pts| {
            b.iter(|| black_box(knn_density(pts, 3)))
        });
    }
    group.finish();
}

fn bench_value_scores(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_scores");
    for n in [10usize, 100, 1000] {
        let ps = products(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &ps, |b, ps| {
            b.iter(|| black_box(value_scores(ps)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_density, bench_value_scores);
criterion_main!(benches);
