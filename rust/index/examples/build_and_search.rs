//! Builds a tiny sparse index in a temporary directory and runs one query
//! against it, printing the scored hits.
//!
//! ```bash
//! cargo run --example build_and_search -p tephra-index
//! ```

use tephra_index::{CancellationToken, SparseIndexProvider, SparseIndexProviderConfig};
use tephra_types::{BuildParams, SearchParams, SegmentFieldKey, WeightScale};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let directory = tempfile::tempdir()?;
    let config = SparseIndexProviderConfig::with_limit_bytes(16 << 20);
    let provider = SparseIndexProvider::new(&config, 0)?;
    let key = SegmentFieldKey::new("_0", "embedding");

    provider.create_index(key.clone(), 64, WeightScale::from_max_weight(1.0), 0, None)?;
    let params = BuildParams::new(16, 0.4, 0.25, 4, 0)?;
    let mut writer = provider.writer(&key, params)?;
    for doc_id in 0..32u32 {
        // Two overlapping topic groups over a handful of dimensions.
        let base = if doc_id % 2 == 0 { 100 } else { 200 };
        let strength = (doc_id % 8 + 1) as f32 / 8.0;
        writer.add_document(
            doc_id,
            &[(base, strength), (base + 1, strength / 2.0), (300, 0.1)],
        );
    }
    let files = writer.commit(directory.path())?;
    println!(
        "committed {} and {}",
        files.terms.display(),
        files.postings.display()
    );

    let searcher = provider.searcher(&key).expect("index has postings");
    let response = searcher.search(
        &[(100, 0.9), (300, 0.2)],
        &SearchParams::new(5, 2, 1.0)?,
        None,
        &CancellationToken::new(),
    )?;
    for hit in &response.hits {
        println!("doc {:>3}  score {:.4}", hit.doc_id, hit.score);
    }
    println!(
        "traversed {} terms, pruned {} clusters, scored {} documents",
        response.stats.terms_traversed,
        response.stats.clusters_pruned,
        response.stats.documents_scored
    );
    Ok(())
}
