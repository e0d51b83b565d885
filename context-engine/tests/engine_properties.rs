use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use context_engine::{
    CacheConfig, Clock, ContextEngine, ContextError, EngineConfig, HashingEmbedder, IndexMode,
    ManualClock, MetadataInput, Metric, NodeId, QueryFilter, TieredCache,
};
use tempfile::tempdir;

fn engine_with(config: EngineConfig) -> (ContextEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let embedder = Arc::new(HashingEmbedder::new(config.dimension));
    let engine = ContextEngine::open(config, embedder, clock.clone()).unwrap();
    (engine, clock)
}

fn engine(dimension: usize) -> (ContextEngine, Arc<ManualClock>) {
    engine_with(EngineConfig::with_dimension(dimension))
}

fn add(engine: &ContextEngine, content: &str, vector: &[f32]) -> NodeId {
    engine
        .add_node(content, Some(vector.to_vec()), MetadataInput::new())
        .unwrap()
}

/// Deterministic pseudo-random vectors
fn vectors(n: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            (0..dimension)
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

#[test]
fn property_add_node_is_idempotent() {
    let (engine, _) = engine(2);
    let e = vec![0.6, 0.8];

    let first = engine.add_node("c", Some(e.clone()), MetadataInput::new()).unwrap();
    let second = engine.add_node("c", Some(e), MetadataInput::new()).unwrap();

    assert_eq!(first, second);
    assert_eq!(engine.stats().node_count, 1);
    assert_eq!(engine.stats().index_size, 1);
}

#[test]
fn scenario_hello_twice_counts_once() {
    let (engine, _) = engine(2);
    let before = engine.stats().node_count;

    let a = add(&engine, "hello", &[1.0, 0.0]);
    let b = add(&engine, "hello", &[1.0, 0.0]);

    assert_eq!(a, b);
    assert_eq!(engine.stats().node_count, before + 1);
}

#[test]
fn property_dimension_mismatch_is_rejected() {
    let (engine, _) = engine(3);
    match engine.add_node("x", Some(vec![1.0, 0.0]), MetadataInput::new()) {
        Err(ContextError::DimensionMismatch { expected, actual }) => {
            assert_eq!((expected, actual), (3, 2));
        }
        other => panic!("expected dimension mismatch, got {other:?}"),
    }
    assert!(engine.query(&[1.0], 1, None).is_err());
}

#[test]
fn scenario_query_returns_a_then_c() {
    let (engine, _) = engine(2);
    let a = add(&engine, "A", &[1.0, 0.0]);
    let _b = add(&engine, "B", &[0.0, 1.0]);
    let c = add(&engine, "C", &[0.9, 0.1]);

    let hits = engine.query(&[1.0, 0.0], 2, None).unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.id.clone()).collect();
    assert_eq!(ids, vec![a, c]);
}

#[test]
fn property_query_results_are_ranked() {
    let (engine, _) = engine(8);
    for (i, v) in vectors(200, 8, 7).into_iter().enumerate() {
        add(&engine, &format!("node {i}"), &v);
    }

    for query in vectors(10, 8, 99) {
        let hits = engine.query(&query, 15, None).unwrap();
        assert_eq!(hits.len(), 15);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score, "results out of order");
        }
    }
    assert!(engine.query(&[0.0; 8], 0, None).unwrap().is_empty());
}

#[test]
fn property_ties_break_by_lower_id() {
    let (engine, _) = engine(2);
    let x = add(&engine, "x", &[1.0, 0.0]);
    let y = add(&engine, "y", &[1.0, 0.0]);

    let hits = engine.query(&[1.0, 0.0], 2, None).unwrap();
    let mut expected = vec![x, y];
    expected.sort();
    assert_eq!(hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>(), expected);
}

#[test]
fn property_approximate_index_keeps_contract() {
    let mut config = EngineConfig::with_dimension(16);
    config.index.brute_force_threshold = 64;
    let (engine, _) = engine_with(config);

    let data = vectors(300, 16, 3);
    let ids: Vec<NodeId> = data
        .iter()
        .enumerate()
        .map(|(i, v)| add(&engine, &format!("doc {i}"), v))
        .collect();
    assert_eq!(engine.stats().index_mode, IndexMode::Approximate);

    // delete a third of the nodes, then make sure none of them come back
    let deleted: Vec<NodeId> = ids.iter().step_by(3).cloned().collect();
    for id in &deleted {
        assert!(engine.delete_node(id));
    }

    for query in data.iter().take(20) {
        let hits = engine.query(query, 10, None).unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() <= 10);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            assert!(!deleted.contains(&hit.id), "deleted id returned");
        }
    }
}

#[test]
fn property_cache_put_get_and_expiry() {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = TieredCache::in_memory(8, clock.clone());

    cache.put("k", b"v".to_vec(), Duration::from_secs(30)).unwrap();
    assert_eq!(cache.get("k"), Some(b"v".to_vec()));

    clock.advance(chrono::Duration::seconds(30));
    assert_eq!(cache.get("k"), None);
}

#[test]
fn property_eviction_bound() {
    let capacity = 5;
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
    let cache = TieredCache::in_memory(capacity, clock);

    for i in 0..capacity {
        cache.put(format!("k{i}"), vec![i as u8], Duration::from_secs(60)).unwrap();
    }
    // k0 is refreshed, leaving k1 as the least recently used original
    assert!(cache.get("k0").is_some());
    cache.put("extra", vec![0], Duration::from_secs(60)).unwrap();

    assert_eq!(cache.len(), capacity);
    assert!(cache.get("k1").is_none());
    assert!(cache.get("k0").is_some());
    assert!(cache.get("extra").is_some());
}

#[test]
fn property_disk_tier_survives_restart() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        capacity: 4,
        disk_path: Some(dir.path().join("cache").join("tier.bin")),
        ..CacheConfig::default()
    };
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

    let cache = TieredCache::open(&config, Arc::clone(&clock)).unwrap();
    cache.put("node:1", b"payload".to_vec(), Duration::from_secs(60)).unwrap();
    cache.shutdown().unwrap();
    drop(cache);

    let reopened = TieredCache::open(&config, clock).unwrap();
    assert_eq!(reopened.get("node:1"), Some(b"payload".to_vec()));
    reopened.shutdown().unwrap();
}

#[test]
fn property_consolidation_protects_hubs() {
    let (engine, clock) = engine(2);
    let stale = add(&engine, "stale", &[1.0, 0.0]);
    let hub = add(&engine, "hub", &[0.0, 1.0]);
    let spoke = add(&engine, "spoke", &[0.7, 0.7]);
    engine.add_edge(&spoke, &hub, "depends_on", 0.9).unwrap();

    clock.advance(chrono::Duration::days(60));
    let report = engine.consolidate();

    assert_eq!(report.pruned_count, 1);
    assert_eq!(report.pruned_ids, vec![stale.clone()]);
    assert!(engine.get_node(&hub).is_ok());
    assert!(engine.get_node(&spoke).is_ok());
    assert!(matches!(engine.get_node(&stale), Err(ContextError::NotFound(_))));
}

#[test]
fn property_accessed_nodes_outlive_ignored_ones() {
    let (engine, clock) = engine(2);
    let ignored = add(&engine, "ignored", &[1.0, 0.0]);
    let recalled = add(&engine, "recalled", &[0.0, 1.0]);

    for _ in 0..6 {
        clock.advance(chrono::Duration::hours(12));
        engine.get_node(&recalled).unwrap();
    }
    clock.advance(chrono::Duration::hours(72));

    let report = engine.consolidate();
    assert!(report.pruned_ids.contains(&ignored));
    assert!(!report.pruned_ids.contains(&recalled));
}

#[test]
fn property_referential_integrity_after_delete() {
    let (engine, _) = engine(2);
    let a = add(&engine, "a", &[1.0, 0.0]);
    let b = add(&engine, "b", &[0.9, 0.1]);
    let c = add(&engine, "c", &[0.0, 1.0]);
    engine.add_edge(&a, &b, "next", 1.0).unwrap();
    engine.add_edge(&c, &b, "next", 1.0).unwrap();
    engine.add_edge(&b, &a, "back", 1.0).unwrap();

    // warm the result cache before deleting
    assert_eq!(engine.query(&[1.0, 0.0], 3, None).unwrap().len(), 3);
    engine.delete_node(&b);
    engine.delete_node(&b);

    assert!(engine.query(&[1.0, 0.0], 3, None).unwrap().iter().all(|h| h.id != b));
    assert!(engine.neighbors(&a, None).unwrap().all(|id| id != b));
    assert!(engine.neighbors(&c, None).unwrap().all(|id| id != b));
    assert!(engine.incoming(&a, None).unwrap().all(|id| id != b));
    assert!(matches!(engine.neighbors(&b, None), Err(ContextError::NotFound(_))));
}

#[test]
fn property_reinsert_after_delete_is_fresh() {
    let (engine, _) = engine(2);
    let id = add(&engine, "again", &[1.0, 0.0]);
    engine.get_node(&id).unwrap();
    engine.delete_node(&id);

    let back = add(&engine, "again", &[1.0, 0.0]);
    assert_eq!(back, id);
    assert_eq!(engine.get_node(&id).unwrap().metadata.access_count, 1);
}

#[test]
fn property_text_queries_use_injected_embedder() {
    let (engine, _) = engine(256);
    let db = engine
        .add_node("database connection pool exhausted", None, MetadataInput::new())
        .unwrap();
    engine
        .add_node("sunny weather forecast for the weekend", None, MetadataInput::new())
        .unwrap();

    let hits = engine.query_text("connection pool", 1, None).unwrap();
    assert_eq!(hits[0].id, db);
}

#[test]
fn property_tag_filter_and_lookup() {
    let (engine, _) = engine(2);
    let tagged = engine
        .add_node(
            "tagged",
            Some(vec![0.0, 1.0]),
            MetadataInput::new().tags(["infra", "nginx"]).position([1.0, 2.0, 3.0]),
        )
        .unwrap();
    add(&engine, "plain", &[1.0, 0.0]);

    assert_eq!(engine.find_by_tag("nginx"), vec![tagged.clone()]);
    let filter = QueryFilter::new().tag("infra").tag("nginx");
    let hits = engine.query(&[1.0, 0.0], 5, Some(&filter)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, tagged);

    let near_origin = QueryFilter::new()
        .predicate(|_, meta| meta.position.map_or(false, |p| p[0] < 0.5));
    assert!(engine.query(&[1.0, 0.0], 5, Some(&near_origin)).unwrap().is_empty());
}

#[test]
fn property_inner_product_metric() {
    let mut config = EngineConfig::with_dimension(2);
    config.metric = Metric::InnerProduct;
    let (engine, _) = engine_with(config);

    let long = add(&engine, "long", &[3.0, 0.0]);
    add(&engine, "unit", &[1.0, 0.0]);

    // inner product favors magnitude, cosine would tie
    let hits = engine.query(&[1.0, 0.0], 2, None).unwrap();
    assert_eq!(hits[0].id, long);
    assert!((hits[0].score - 3.0).abs() < 1e-6);
}

#[test]
fn property_snapshot_roundtrip_through_engine() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.bin");
    let (engine, clock) = engine(2);
    let a = add(&engine, "a", &[1.0, 0.0]);
    let b = add(&engine, "b", &[0.0, 1.0]);
    let edge = engine.add_edge(&a, &b, "cites", 0.5).unwrap();
    engine.get_node(&a).unwrap();
    engine.save_snapshot(&path).unwrap();

    let restored = ContextEngine::restore(
        EngineConfig::with_dimension(2),
        Arc::new(HashingEmbedder::new(2)),
        clock,
        &path,
    )
    .unwrap();

    assert_eq!(restored.get_edge(edge).unwrap().relation, "cites");
    // one access before the snapshot, one now
    assert_eq!(restored.get_node(&a).unwrap().metadata.access_count, 2);
    assert_eq!(add(&restored, "a", &[1.0, 0.0]), a);
    assert_eq!(restored.stats().node_count, 2);
}

#[test]
fn property_stats_serialize() {
    let (engine, _) = engine(2);
    add(&engine, "a", &[1.0, 0.0]);
    engine.query(&[1.0, 0.0], 1, None).unwrap();
    engine.query(&[1.0, 0.0], 1, None).unwrap();

    let stats = engine.stats();
    assert!(stats.cache_hit_rate > 0.0);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["node_count"], 1);
    assert_eq!(json["index_mode"], "brute_force");

    let report = serde_json::to_value(engine.consolidate()).unwrap();
    assert_eq!(report["pruned_count"], 0);
}

#[test]
fn property_large_magnitude_vectors_rank_by_direction() {
    let (engine, _) = engine(2);
    let a = add(&engine, "A", &[1.0, 1.0]);
    let x = add(&engine, "X", &[1e30, -1e30]);

    let hits = engine.query(&[1e20, 1e20], 2, None).unwrap();
    assert_eq!(hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>(), vec![a, x]);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert!(hits[1].score.abs() < 1e-6);
}

#[test]
fn property_importance_hint_out_of_range_is_rejected() {
    let (engine, _) = engine(2);
    let metadata = MetadataInput {
        importance_hint: Some(50.0),
        ..MetadataInput::default()
    };

    let result = engine.add_node("h", Some(vec![1.0, 0.0]), metadata);
    assert!(matches!(result, Err(ContextError::InvalidInput(_))));
    assert_eq!(engine.stats().node_count, 0);
}

fn race_writers_and_readers(threshold: usize) {
    let mut config = EngineConfig::with_dimension(8);
    config.index.brute_force_threshold = threshold;
    let (engine, _) = engine_with(config);

    let seeded: Vec<NodeId> = vectors(240, 8, 11)
        .iter()
        .enumerate()
        .map(|(i, v)| add(&engine, &format!("seed {i}"), v))
        .collect();
    let doomed: Vec<NodeId> = seeded.iter().step_by(3).cloned().collect();
    let fresh = vectors(120, 8, 12);
    let queries = vectors(16, 8, 13);
    let deleted_so_far = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for (i, id) in doomed.iter().enumerate() {
                assert!(engine.delete_node(id));
                deleted_so_far.store(i + 1, AtomicOrdering::Release);
            }
        });
        scope.spawn(|| {
            for (i, v) in fresh.iter().enumerate() {
                add(&engine, &format!("fresh {i}"), v);
            }
        });

        for reader in 0..3 {
            let (engine, doomed, queries, deleted_so_far) =
                (&engine, &doomed, &queries, &deleted_so_far);
            scope.spawn(move || {
                for round in 0..100 {
                    let done = deleted_so_far.load(AtomicOrdering::Acquire);
                    let query = &queries[(round + reader) % queries.len()];
                    let hits = engine.query(query, 10, None).unwrap();

                    for pair in hits.windows(2) {
                        assert!(pair[0].score >= pair[1].score);
                    }
                    for hit in &hits {
                        assert!(
                            !doomed[..done].contains(&hit.id),
                            "deleted id returned after its delete completed"
                        );
                        // anything indexed and never deleted must be fully stored
                        if !doomed.contains(&hit.id) {
                            assert!(engine.get_node(&hit.id).is_ok());
                        }
                    }
                }
            });
        }
    });

    let stats = engine.stats();
    assert_eq!(stats.node_count, 240 - doomed.len() + 120);
    assert_eq!(stats.index_size, stats.node_count);
    let expected_mode = if stats.node_count >= threshold {
        IndexMode::Approximate
    } else {
        IndexMode::BruteForce
    };
    assert_eq!(stats.index_mode, expected_mode);
    for query in &queries {
        let hits = engine.query(query, 20, None).unwrap();
        assert!(hits.iter().all(|hit| !doomed.contains(&hit.id)));
    }
}

#[test]
fn property_concurrent_writes_stay_consistent_exact() {
    race_writers_and_readers(usize::MAX);
}

#[test]
fn property_concurrent_writes_stay_consistent_approximate() {
    race_writers_and_readers(64);
}
