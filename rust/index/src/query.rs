use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use roaring::RoaringBitmap;
use tephra_codec::CodecReadError;
use tephra_error::{ErrorCodes, TephraError};
use tephra_types::{encode_dimension, PostingClusters, SearchParams, SparseVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Codec(#[from] CodecReadError),
    #[error("filter references doc {filter_max} beyond max_doc {max_doc}")]
    FilterOutOfRange { filter_max: u32, max_doc: u32 },
}

impl TephraError for QueryError {
    fn code(&self) -> ErrorCodes {
        match self {
            QueryError::Codec(error) => error.code(),
            QueryError::FilterOutOfRange { .. } => ErrorCodes::InvalidArgument,
        }
    }
}

/// Host-driven cancellation flag, checked at every cluster boundary. A
/// tripped query returns whatever the heap holds at that point.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// One scored hit; `score` is already scaled back to float space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDoc {
    pub doc_id: u32,
    pub score: f32,
}

/// Traversal counters for one query, mostly exercised by tests and debug
/// logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub terms_traversed: usize,
    pub clusters_pruned: u64,
    pub clusters_evaluated: u64,
    pub documents_scored: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub hits: Vec<ScoredDoc>,
    pub stats: QueryStats,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    score: u32,
    doc_id: u32,
}

// Reverse order so the heap top is the current worst hit: lowest score, and
// among equal scores the largest doc id (smaller doc ids rank higher).
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then(other.doc_id.cmp(&self.doc_id))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl HeapEntry {
    fn beats(&self, other: &HeapEntry) -> bool {
        self.score > other.score || (self.score == other.score && self.doc_id < other.doc_id)
    }
}

/// Runs one ANN query against a single segment.
///
/// `source` resolves a term's posting clusters (resident or lazily decoded);
/// `vectors` resolves a doc's stored vector. The traversal walks the query's
/// heaviest `query_cut` coordinates, prunes clusters whose scaled summary
/// bound cannot beat the current k-th score, and scores each surviving
/// document exactly once against the full query.
pub fn execute<S, V>(
    query: &SparseVector,
    params: &SearchParams,
    max_doc: u32,
    score_scale: f32,
    filter: Option<&RoaringBitmap>,
    cancellation: &CancellationToken,
    source: &S,
    vectors: &V,
) -> Result<QueryResponse, QueryError>
where
    S: Fn(&[u8]) -> Result<Option<Arc<PostingClusters>>, QueryError>,
    V: Fn(u32) -> Option<Arc<SparseVector>>,
{
    if let Some(filter) = filter {
        if let Some(filter_max) = filter.max() {
            if filter_max >= max_doc {
                return Err(QueryError::FilterOutOfRange {
                    filter_max,
                    max_doc,
                });
            }
        }
    }

    let mut coordinates: Vec<(u32, u8)> = query.iter().collect();
    coordinates.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    coordinates.truncate(params.query_cut);

    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(params.k);
    let mut visited = RoaringBitmap::new();
    let mut stats = QueryStats::default();

    'terms: for (dimension, _) in coordinates {
        let term = encode_dimension(dimension);
        let Some(clusters) = source(&term)? else {
            continue;
        };
        stats.terms_traversed += 1;

        for cluster in clusters.clusters.iter() {
            if cancellation.is_cancelled() {
                break 'terms;
            }
            if heap.len() == params.k && !cluster.should_not_skip {
                let bound = query.dot(&cluster.summary) as f32 * params.heap_factor;
                let worst = heap.peek().expect("heap is full").score as f32;
                if bound < worst {
                    stats.clusters_pruned += 1;
                    continue;
                }
            }
            stats.clusters_evaluated += 1;

            for member in cluster.members.iter() {
                let doc_id = member.doc_id;
                if filter.is_some_and(|filter| !filter.contains(doc_id)) {
                    continue;
                }
                if visited.contains(doc_id) {
                    continue;
                }
                visited.insert(doc_id);
                let Some(vector) = vectors(doc_id) else {
                    tracing::debug!(doc_id, "skipping doc with no stored vector");
                    continue;
                };
                stats.documents_scored += 1;
                let entry = HeapEntry {
                    score: query.dot(&vector),
                    doc_id,
                };
                if heap.len() < params.k {
                    heap.push(entry);
                } else if entry.beats(heap.peek().expect("heap is full")) {
                    heap.pop();
                    heap.push(entry);
                }
            }
        }
    }

    let hits = heap
        .into_sorted_vec()
        .into_iter()
        .map(|entry| ScoredDoc {
            doc_id: entry.doc_id,
            score: entry.score as f32 * score_scale,
        })
        .collect();
    Ok(QueryResponse { hits, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tephra_types::{DocumentCluster, Posting};

    struct Fixture {
        terms: HashMap<Box<[u8]>, Arc<PostingClusters>>,
        vectors: HashMap<u32, Arc<SparseVector>>,
        max_doc: u32,
    }

    impl Fixture {
        fn new(max_doc: u32) -> Self {
            Self {
                terms: HashMap::new(),
                vectors: HashMap::new(),
                max_doc,
            }
        }

        fn doc(&mut self, doc_id: u32, entries: Vec<(u32, u8)>) -> &mut Self {
            self.vectors
                .insert(doc_id, Arc::new(SparseVector::from_quantized(entries)));
            self
        }

        fn term(&mut self, dimension: u32, clusters: Vec<DocumentCluster>) -> &mut Self {
            self.terms.insert(
                encode_dimension(dimension),
                Arc::new(PostingClusters::new(clusters)),
            );
            self
        }

        fn search(
            &self,
            query: Vec<(u32, u8)>,
            params: SearchParams,
            filter: Option<&RoaringBitmap>,
        ) -> QueryResponse {
            self.search_with_cancel(query, params, filter, &CancellationToken::new())
        }

        fn search_with_cancel(
            &self,
            query: Vec<(u32, u8)>,
            params: SearchParams,
            filter: Option<&RoaringBitmap>,
            cancellation: &CancellationToken,
        ) -> QueryResponse {
            let query = SparseVector::from_quantized(query);
            execute(
                &query,
                &params,
                self.max_doc,
                1.0,
                filter,
                cancellation,
                &|term: &[u8]| Ok(self.terms.get(term).cloned()),
                &|doc_id| self.vectors.get(&doc_id).cloned(),
            )
            .unwrap()
        }
    }

    fn cluster(members: &[(u32, u8)], summary: Vec<(u32, u8)>, should_not_skip: bool) -> DocumentCluster {
        let mut members: Vec<Posting> = members
            .iter()
            .map(|&(doc_id, weight)| Posting { doc_id, weight })
            .collect();
        members.sort_unstable_by(|a, b| b.weight.cmp(&a.weight).then(a.doc_id.cmp(&b.doc_id)));
        DocumentCluster {
            summary: SparseVector::from_quantized(summary),
            members: members.into_boxed_slice(),
            should_not_skip,
        }
    }

    /// Four docs on dimension 7 with weights 10, 20, 30, 40.
    fn ramp_fixture() -> Fixture {
        let mut fixture = Fixture::new(8);
        for doc_id in 1..=4u32 {
            fixture.doc(doc_id, vec![(7, doc_id as u8 * 10)]);
        }
        fixture.term(
            7,
            vec![cluster(
                &[(1, 10), (2, 20), (3, 30), (4, 40)],
                vec![(7, 40)],
                false,
            )],
        );
        fixture
    }

    #[test]
    fn test_top_k_descending_order() {
        let fixture = ramp_fixture();
        let response = fixture.search(
            vec![(7, 2)],
            SearchParams::new(2, 4, 1.0).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![4, 3]);
        assert!(response.hits[0].score > response.hits[1].score);
    }

    #[test]
    fn test_equal_scores_prefer_smaller_doc_id() {
        let mut fixture = Fixture::new(8);
        for doc_id in [5u32, 2, 7] {
            fixture.doc(doc_id, vec![(1, 50)]);
        }
        fixture.term(
            1,
            vec![cluster(&[(5, 50), (2, 50), (7, 50)], vec![(1, 50)], false)],
        );
        let response = fixture.search(
            vec![(1, 1)],
            SearchParams::new(2, 1, 1.0).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![2, 5]);
    }

    #[test]
    fn test_visited_documents_score_once() {
        let mut fixture = Fixture::new(8);
        fixture.doc(1, vec![(1, 10), (2, 10)]);
        fixture.term(1, vec![cluster(&[(1, 10)], vec![(1, 10)], false)]);
        fixture.term(2, vec![cluster(&[(1, 10)], vec![(2, 10)], false)]);
        let response = fixture.search(
            vec![(1, 5), (2, 5)],
            SearchParams::new(4, 2, 1.0).unwrap(),
            None,
        );
        assert_eq!(response.stats.documents_scored, 1);
        assert_eq!(response.hits.len(), 1);
    }

    #[test]
    fn test_heap_factor_controls_pruning() {
        let mut fixture = Fixture::new(16);
        // Strong cluster on docs 1-2, weak cluster on docs 3-4.
        fixture.doc(1, vec![(1, 200)]);
        fixture.doc(2, vec![(1, 190)]);
        fixture.doc(3, vec![(1, 5)]);
        fixture.doc(4, vec![(1, 4)]);
        fixture.term(
            1,
            vec![
                cluster(&[(1, 200), (2, 190)], vec![(1, 200)], false),
                cluster(&[(3, 5), (4, 4)], vec![(1, 5)], false),
            ],
        );

        let aggressive = fixture.search(
            vec![(1, 100)],
            SearchParams::new(2, 1, 1e-6).unwrap(),
            None,
        );
        assert_eq!(aggressive.stats.clusters_pruned, 1);
        assert_eq!(aggressive.stats.documents_scored, 2);

        let lenient = fixture.search(
            vec![(1, 100)],
            SearchParams::new(2, 1, 1e5).unwrap(),
            None,
        );
        assert_eq!(lenient.stats.clusters_pruned, 0);
        assert_eq!(lenient.stats.documents_scored, 4);
        // Both agree on the winners.
        assert_eq!(aggressive.hits, lenient.hits);
    }

    #[test]
    fn test_should_not_skip_forces_evaluation() {
        let mut fixture = Fixture::new(16);
        fixture.doc(1, vec![(1, 200)]);
        fixture.doc(2, vec![(1, 190)]);
        fixture.doc(3, vec![(1, 255)]);
        fixture.term(
            1,
            vec![
                cluster(&[(1, 200), (2, 190)], vec![(1, 200)], false),
                // Summary lies about this cluster; the flag saves it.
                cluster(&[(3, 255)], vec![(1, 1)], true),
            ],
        );
        let response = fixture.search(
            vec![(1, 100)],
            SearchParams::new(2, 1, 1e-6).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![3, 1]);
    }

    #[test]
    fn test_filter_excludes_documents() {
        let fixture = ramp_fixture();
        let filter = RoaringBitmap::from_iter([1u32, 3]);
        let response = fixture.search(
            vec![(7, 2)],
            SearchParams::new(4, 1, 1.0).unwrap(),
            Some(&filter),
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![3, 1]);
    }

    #[test]
    fn test_filter_out_of_range_rejected() {
        let fixture = ramp_fixture();
        let filter = RoaringBitmap::from_iter([100u32]);
        let query = SparseVector::from_quantized(vec![(7, 2)]);
        let error = execute(
            &query,
            &SearchParams::new(4, 1, 1.0).unwrap(),
            fixture.max_doc,
            1.0,
            Some(&filter),
            &CancellationToken::new(),
            &|term: &[u8]| Ok(fixture.terms.get(term).cloned()),
            &|doc_id| fixture.vectors.get(&doc_id).cloned(),
        )
        .unwrap_err();
        assert_eq!(error.code(), ErrorCodes::InvalidArgument);
    }

    #[test]
    fn test_cancelled_query_returns_partial_heap() {
        let fixture = ramp_fixture();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let response = fixture.search_with_cancel(
            vec![(7, 2)],
            SearchParams::new(4, 1, 1.0).unwrap(),
            None,
            &cancellation,
        );
        assert!(response.hits.is_empty());
        assert_eq!(response.stats.clusters_evaluated, 0);
    }

    #[test]
    fn test_missing_vector_is_soft_skip() {
        let mut fixture = Fixture::new(8);
        fixture.doc(1, vec![(1, 10)]);
        // Doc 2 is referenced by the cluster but has no stored vector.
        fixture.term(1, vec![cluster(&[(1, 10), (2, 20)], vec![(1, 20)], false)]);
        let response = fixture.search(
            vec![(1, 5)],
            SearchParams::new(4, 1, 1.0).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![1]);
    }

    #[test]
    fn test_query_cut_limits_terms() {
        let mut fixture = Fixture::new(8);
        fixture.doc(1, vec![(1, 10)]);
        fixture.doc(2, vec![(2, 10)]);
        fixture.term(1, vec![cluster(&[(1, 10)], vec![(1, 10)], false)]);
        fixture.term(2, vec![cluster(&[(2, 10)], vec![(2, 10)], false)]);
        // Dimension 2 carries the heavier query weight, so it wins the cut.
        let response = fixture.search(
            vec![(1, 5), (2, 9)],
            SearchParams::new(4, 1, 1.0).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![2]);
    }

    #[test]
    fn test_no_prune_matches_exact_top_k() {
        use itertools::Itertools;
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut fixture = Fixture::new(64);
        let mut postings: HashMap<u32, Vec<(u32, u8)>> = HashMap::new();
        for doc_id in 0..64u32 {
            let entries: Vec<(u32, u8)> = (0..4)
                .map(|_| (rng.gen_range(0..8u32), rng.gen_range(1..=255u8)))
                .collect();
            fixture.doc(doc_id, entries.clone());
            for (dimension, weight) in entries {
                postings.entry(dimension).or_default().push((doc_id, weight));
            }
        }
        for (&dimension, members) in &postings {
            // Arbitrary two-way split with honest summaries.
            let clusters = members
                .chunks((members.len() / 2).max(1))
                .map(|chunk| {
                    let summary = chunk
                        .iter()
                        .filter_map(|(doc_id, _)| fixture.vectors.get(doc_id))
                        .fold(SparseVector::default(), |acc, vector| acc.max_merge(vector));
                    cluster(chunk, summary.iter().collect(), false)
                })
                .collect();
            fixture.term(dimension, clusters);
        }

        let query_entries = vec![(0u32, 200u8), (3, 150), (5, 90)];
        let query = SparseVector::from_quantized(query_entries.clone());
        let expected: Vec<u32> = fixture
            .vectors
            .iter()
            .map(|(&doc_id, vector)| (doc_id, query.dot(vector)))
            .filter(|&(_, score)| score > 0)
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .take(10)
            .map(|(doc_id, _)| doc_id)
            .collect();

        let response = fixture.search(
            query_entries,
            SearchParams::new(10, 8, f32::INFINITY).unwrap(),
            None,
        );
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, expected);
    }
}
