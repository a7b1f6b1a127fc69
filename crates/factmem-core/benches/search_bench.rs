//! Benchmarks for the ranking primitives the retrieval pipeline and
//! consolidation passes share. Run with: cargo bench -p factmem-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use factmem_core::search::fts::build_fts_query;
use factmem_core::search::hybrid::reciprocal_rank_fusion;

fn bench_rrf_fusion(c: &mut Criterion) {
    let vector: Vec<i64> = (0..50).collect();
    let fts: Vec<i64> = (25..75).collect();

    c.bench_function("rrf_50x50", |b| {
        b.iter(|| {
            black_box(reciprocal_rank_fusion(&[vector.clone(), fts.clone()], 60.0));
        })
    });
}

fn bench_build_fts_query(c: &mut Criterion) {
    c.bench_function("build_fts_query", |b| {
        b.iter(|| {
            black_box(build_fts_query("what is the capital of France and its history"));
        })
    });
}

fn bench_cosine_similarity(c: &mut Criterion) {
    let a: Vec<f32> = (0..768).map(|i| (i as f32).sin()).collect();
    let b: Vec<f32> = (0..768).map(|i| (i as f32).cos()).collect();

    c.bench_function("cosine_similarity_768d", |bench| {
        bench.iter(|| {
            let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            black_box(dot / (norm_a * norm_b));
        })
    });
}

criterion_group!(benches, bench_rrf_fusion, bench_build_fts_query, bench_cosine_similarity);
criterion_main!(benches);
