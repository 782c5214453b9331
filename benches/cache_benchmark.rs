use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rpc_session::cache::{Fingerprint, ResultCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use serde_json::json;

fn bench_fingerprint(c: &mut Criterion) {
    let payload = json!({
        "fname": "list_files",
        "path": "/data/projects",
        "filters": {"hidden": false, "types": ["json", "csv"]},
    });
    c.bench_function("fingerprint payload", |b| {
        b.iter(|| Fingerprint::of(black_box(&payload)))
    });
}

fn bench_cache_churn(c: &mut Criterion) {
    let keys: Vec<Fingerprint> = (0..2 * DEFAULT_CACHE_CAPACITY)
        .map(|n| Fingerprint::of(&json!({ "fname": "get_item", "n": n })))
        .collect();
    c.bench_function("cache set and get past capacity", |b| {
        b.iter(|| {
            let mut cache = ResultCache::new(DEFAULT_CACHE_CAPACITY);
            for key in &keys {
                cache.set(*key, (Some(json!(1)), None), DEFAULT_CACHE_TTL);
                black_box(cache.get(key));
            }
        })
    });
}

criterion_group!(benches, bench_fingerprint, bench_cache_churn);
criterion_main!(benches);
