use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tephra_index::{CancellationToken, SparseIndexProvider, SparseIndexProviderConfig};
use tephra_types::{BuildParams, SearchParams, SegmentFieldKey, WeightScale};

const DOCS: u32 = 10_000;
const DIMENSIONS: u32 = 512;
const NONZEROS: usize = 32;

fn seeded_index(directory: &std::path::Path) -> (SparseIndexProvider, SegmentFieldKey) {
    let mut config = SparseIndexProviderConfig::with_limit_bytes(256 << 20);
    config.index_thread_qty = Some(2);
    let provider = SparseIndexProvider::new(&config, 0).unwrap();
    let key = SegmentFieldKey::new("_0", "embedding");
    provider
        .create_index(key.clone(), DOCS, WeightScale::from_max_weight(1.0), 0, None)
        .unwrap();
    let params = BuildParams::new(4_000, 0.4, 0.1, 16, 42).unwrap();
    let mut writer = provider.writer(&key, params).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for doc_id in 0..DOCS {
        let entries: Vec<(u32, f32)> = (0..NONZEROS)
            .map(|_| (rng.gen_range(0..DIMENSIONS), rng.gen::<f32>()))
            .collect();
        writer.add_document(doc_id, &entries);
    }
    writer.commit(directory).unwrap();
    (provider, key)
}

fn bench_search(criterion: &mut Criterion) {
    let directory = tempfile::tempdir().unwrap();
    let (provider, key) = seeded_index(directory.path());
    let searcher = provider.searcher(&key).unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    let query: Vec<(u32, f32)> = (0..NONZEROS)
        .map(|_| (rng.gen_range(0..DIMENSIONS), rng.gen::<f32>()))
        .collect();

    let mut group = criterion.benchmark_group("sparse_ann_search");
    for heap_factor in [0.5f32, 1.0, 2.0] {
        group.bench_with_input(
            BenchmarkId::from_parameter(heap_factor),
            &heap_factor,
            |bencher, &heap_factor| {
                let params = SearchParams::new(10, 8, heap_factor).unwrap();
                bencher.iter(|| {
                    searcher
                        .search(&query, &params, None, &CancellationToken::new())
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
