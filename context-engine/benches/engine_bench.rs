use std::sync::Arc;

use context_engine::{
    config::IndexConfig, ContextEngine, EngineConfig, HashingEmbedder, MetadataInput, Metric,
    NodeId, VectorIndex,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const DIMENSION: usize = 64;

fn vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            (0..DIMENSION)
                .map(|_| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
                })
                .collect()
        })
        .collect()
}

fn index_with(n: usize, threshold: usize) -> VectorIndex {
    let config = IndexConfig {
        brute_force_threshold: threshold,
        ..IndexConfig::default()
    };
    let mut index = VectorIndex::new(DIMENSION, Metric::Cosine, config);
    index
        .extend(
            vectors(n, 1)
                .into_iter()
                .enumerate()
                .map(|(i, v)| (NodeId::from_content(&format!("doc {i}")), v)),
        )
        .unwrap();
    index
}

fn bench_index_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_query");
    let queries = vectors(32, 42);

    for &n in &[512usize, 4096] {
        let exact = index_with(n, usize::MAX);
        let approximate = index_with(n, 256);

        group.bench_with_input(BenchmarkId::new("brute_force", n), &n, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % queries.len();
                black_box(exact.query(&queries[i], 10, None).unwrap())
            })
        });
        group.bench_with_input(BenchmarkId::new("hnsw", n), &n, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % queries.len();
                black_box(approximate.query(&queries[i], 10, None).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_add_node(c: &mut Criterion) {
    c.bench_function("add_node_hashing_embedder", |b| {
        let engine = ContextEngine::new(
            EngineConfig::with_dimension(DIMENSION),
            Arc::new(HashingEmbedder::new(DIMENSION)),
        )
        .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let content = format!("note {i}: connection pool exhausted on shard {}", i % 7);
            black_box(engine.add_node(content, None, MetadataInput::new()).unwrap())
        })
    });
}

fn bench_cached_query(c: &mut Criterion) {
    let engine = ContextEngine::new(
        EngineConfig::with_dimension(DIMENSION),
        Arc::new(HashingEmbedder::new(DIMENSION)),
    )
    .unwrap();
    for (i, v) in vectors(1000, 5).into_iter().enumerate() {
        engine
            .add_node(format!("doc {i}"), Some(v), MetadataInput::new())
            .unwrap();
    }
    let query = vectors(1, 9).remove(0);

    c.bench_function("engine_query_repeated", |b| {
        b.iter(|| black_box(engine.query(&query, 10, None).unwrap()))
    });
}

criterion_group!(benches, bench_index_query, bench_add_node, bench_cached_query);
criterion_main!(benches);
