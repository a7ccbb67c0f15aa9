use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use roaring::RoaringBitmap;
use tephra_cache::{BudgetSnapshot, Evictor, LruCache, MemoryBudget};
use tephra_codec::{
    CodecReadError, CodecWriteError, SegmentFieldFiles, SparsePostingsReader,
    SparsePostingsWriter,
};
use tephra_error::{ErrorCodes, TephraError};
use tephra_types::{
    encode_dimension, BuildParams, DocumentKey, PostingClusters, SearchParams, SegmentFieldKey,
    SparseVector, TermKey, WeightScale,
};
use thiserror::Error;

use crate::build;
use crate::config::SparseIndexProviderConfig;
use crate::forward::ForwardIndex;
use crate::query::{self, CancellationToken, QueryError, QueryResponse};
use crate::store::{ClusteredPostingStore, TermPostings};

/// Host hook for re-materializing stored vectors after eviction, e.g. from
/// the segment's stored fields. Entries are raw float weights; the provider
/// quantizes them with the field's scale.
pub trait VectorSource: Send + Sync {
    fn vector(&self, doc_id: u32) -> Option<Vec<(u32, f32)>>;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sparse index {0} already registered")]
    AlreadyExists(SegmentFieldKey),
    #[error("no sparse index registered for {0}")]
    UnknownIndex(SegmentFieldKey),
    #[error(transparent)]
    Codec(#[from] CodecReadError),
    #[error("failed to start build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl TephraError for ProviderError {
    fn code(&self) -> ErrorCodes {
        match self {
            ProviderError::AlreadyExists(_) => ErrorCodes::AlreadyExists,
            ProviderError::UnknownIndex(_) => ErrorCodes::NotFound,
            ProviderError::Codec(error) => error.code(),
            ProviderError::WorkerPool(_) => ErrorCodes::Internal,
        }
    }
}

struct SegmentState {
    key: SegmentFieldKey,
    max_doc: u32,
    scale: WeightScale,
    field_number: u32,
    forward: ForwardIndex,
    postings: Arc<TermPostings>,
    reader: Option<SparsePostingsReader>,
    source: Option<Arc<dyn VectorSource>>,
}

/// Point-in-time counters for stats surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStats {
    pub budget: BudgetSnapshot,
    pub index_count: usize,
    pub resident_documents: usize,
    pub resident_terms: usize,
}

/// Host-owned service tying the whole sparse retrieval core together: the
/// circuit-breaker budget, the two recency caches, the forward indexes and
/// clustered posting containers per (segment, field), and the open codec
/// readers. One instance per process replaces the usual pile of singletons;
/// everything threads through this handle.
pub struct SparseIndexProvider {
    budget: MemoryBudget,
    documents: LruCache<DocumentKey>,
    terms: LruCache<TermKey>,
    store: ClusteredPostingStore,
    segments: DashMap<SegmentFieldKey, Arc<SegmentState>>,
    pool: rayon::ThreadPool,
}

struct DocumentEvictor<'a> {
    provider: &'a SparseIndexProvider,
}

impl Evictor<DocumentKey> for DocumentEvictor<'_> {
    fn evict(&self, key: &DocumentKey) -> u64 {
        match self.provider.segments.get(&key.index) {
            Some(state) => state.forward.erase(key.doc_id, &self.provider.budget),
            None => 0,
        }
    }
}

struct TermEvictor<'a> {
    provider: &'a SparseIndexProvider,
}

impl Evictor<TermKey> for TermEvictor<'_> {
    fn evict(&self, key: &TermKey) -> u64 {
        match self.provider.store.get(&key.index) {
            Some(container) => container.erase(&key.term, &self.provider.budget),
            None => 0,
        }
    }
}

impl SparseIndexProvider {
    pub fn new(
        config: &SparseIndexProviderConfig,
        heap_bytes: u64,
    ) -> Result<Self, ProviderError> {
        let limit = config.circuit_breaker.effective_limit(heap_bytes);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.index_threads())
            .thread_name(|index| format!("tephra-build-{index}"))
            .build()?;
        tracing::debug!(
            limit_bytes = limit,
            build_threads = config.index_threads(),
            "starting sparse index provider"
        );
        Ok(Self {
            budget: MemoryBudget::new(limit),
            documents: LruCache::new(),
            terms: LruCache::new(),
            store: ClusteredPostingStore::new(),
            segments: DashMap::new(),
            pool,
        })
    }

    /// Registers an empty per-segment index to be populated by a writer.
    pub fn create_index(
        &self,
        key: SegmentFieldKey,
        max_doc: u32,
        scale: WeightScale,
        field_number: u32,
        source: Option<Arc<dyn VectorSource>>,
    ) -> Result<(), ProviderError> {
        self.register(key, max_doc, scale, field_number, None, source)
    }

    /// Opens a previously committed index from its segment files. The codec
    /// verifies both file footers here; clusters materialize lazily per term
    /// under the memory budget.
    pub fn open_index(
        &self,
        key: SegmentFieldKey,
        directory: &Path,
        max_doc: u32,
        scale: WeightScale,
        source: Option<Arc<dyn VectorSource>>,
    ) -> Result<(), ProviderError> {
        let reader = SparsePostingsReader::open(directory, &key.segment, &key.field)?;
        let field_number = reader.field_number();
        self.register(key, max_doc, scale, field_number, Some(reader), source)
    }

    fn register(
        &self,
        key: SegmentFieldKey,
        max_doc: u32,
        scale: WeightScale,
        field_number: u32,
        reader: Option<SparsePostingsReader>,
        source: Option<Arc<dyn VectorSource>>,
    ) -> Result<(), ProviderError> {
        let state = Arc::new(SegmentState {
            key: key.clone(),
            max_doc,
            scale,
            field_number,
            forward: ForwardIndex::new(key.clone(), max_doc, scale),
            postings: self.store.get_or_create(&key),
            reader,
            source,
        });
        match self.segments.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Err(ProviderError::AlreadyExists(occupied.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(state);
                Ok(())
            }
        }
    }

    /// Build entry point: returns a writer that collects the host's document
    /// stream for one (segment, field) and commits it through the codec.
    pub fn writer(
        &self,
        key: &SegmentFieldKey,
        params: BuildParams,
    ) -> Result<SegmentIndexWriter<'_>, ProviderError> {
        let state = self
            .segments
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProviderError::UnknownIndex(key.clone()))?;
        Ok(SegmentIndexWriter {
            provider: self,
            state,
            params,
            postings: BTreeMap::new(),
            vectors: HashMap::new(),
        })
    }

    /// Query entry point. `None` means this (segment, field) has no sparse
    /// index at all and the host should fall back to its exact scorer.
    pub fn searcher(&self, key: &SegmentFieldKey) -> Option<SegmentSearcher<'_>> {
        let state = self.segments.get(key).map(|entry| Arc::clone(entry.value()))?;
        let has_postings = state.postings.term_count() > 0
            || state
                .reader
                .as_ref()
                .is_some_and(|reader| reader.term_count() > 0);
        if !has_postings {
            return None;
        }
        Some(SegmentSearcher {
            provider: self,
            state,
        })
    }

    /// Whole-segment drop: forgets the index, purges both recency caches,
    /// and releases every accounted byte. Returns the bytes freed.
    pub fn remove_index(&self, key: &SegmentFieldKey) -> u64 {
        let mut freed = 0;
        if let Some((_, state)) = self.segments.remove(key) {
            freed += state.forward.clear(&self.budget);
        }
        freed += self.store.remove(key, &self.budget);
        self.documents.remove_index(key);
        self.terms.remove_index(key);
        tracing::debug!(index = %key, bytes = freed, "removed sparse index");
        freed
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            budget: self.budget.snapshot(),
            index_count: self.segments.len(),
            resident_documents: self.documents.len(),
            resident_terms: self.terms.len(),
        }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

/// Collects one segment's documents, clusters every term on the build pool,
/// and commits the result through the codec. The vectors seen during the
/// build are offered to the forward index as they arrive so the segment is
/// warm for queries; the writer keeps its own copy so a mid-build eviction
/// cannot lose build input.
pub struct SegmentIndexWriter<'a> {
    provider: &'a SparseIndexProvider,
    state: Arc<SegmentState>,
    params: BuildParams,
    postings: BTreeMap<u32, Vec<(u32, u8)>>,
    vectors: HashMap<u32, Arc<SparseVector>>,
}

impl SegmentIndexWriter<'_> {
    /// Feeds one document. Ids at or beyond `max_doc`, repeats, and vectors
    /// that quantize away entirely are ignored.
    pub fn add_document(&mut self, doc_id: u32, entries: &[(u32, f32)]) {
        if doc_id >= self.state.max_doc {
            tracing::warn!(
                index = %self.state.key,
                doc_id,
                max_doc = self.state.max_doc,
                "dropping document beyond segment max_doc"
            );
            return;
        }
        if self.vectors.contains_key(&doc_id) {
            return;
        }
        let vector = Arc::new(SparseVector::quantize_entries(
            entries.iter().copied(),
            &self.state.scale,
        ));
        if vector.is_empty() {
            return;
        }
        for (dimension, weight) in vector.iter() {
            self.postings
                .entry(dimension)
                .or_default()
                .push((doc_id, weight));
        }
        self.vectors.insert(doc_id, vector.clone());
        let evictor = DocumentEvictor {
            provider: self.provider,
        };
        self.state.forward.insert(
            doc_id,
            vector,
            &self.provider.budget,
            &self.provider.documents,
            &evictor,
        );
    }

    pub fn document_count(&self) -> usize {
        self.vectors.len()
    }

    /// Clusters every collected term and writes the segment files. The
    /// resulting clusters are also offered to the posting cache so the
    /// freshly built segment serves queries without a disk round-trip.
    pub fn commit(mut self, directory: &Path) -> Result<SegmentFieldFiles, CodecWriteError> {
        let vectors = std::mem::take(&mut self.vectors);
        let postings = std::mem::take(&mut self.postings);
        let terms: Vec<(Box<[u8]>, Vec<(u32, u8)>)> = postings
            .into_iter()
            .map(|(dimension, posting)| (encode_dimension(dimension), posting))
            .collect();

        let resolve = |doc_id: u32| vectors.get(&doc_id).cloned();
        let built = build::build_terms(&self.params, &self.provider.pool, &terms, &resolve);

        let mut writer = SparsePostingsWriter::create(
            directory,
            &self.state.key.segment,
            &self.state.key.field,
            self.state.field_number,
        )?;
        for (term, clusters) in &built {
            if clusters.is_empty() {
                continue;
            }
            writer.write_term(term, clusters)?;
        }
        let files = writer.finish()?;
        tracing::debug!(
            index = %self.state.key,
            terms = built.len(),
            documents = vectors.len(),
            "committed sparse index"
        );

        let evictor = TermEvictor {
            provider: self.provider,
        };
        for (term, clusters) in built {
            if clusters.is_empty() {
                continue;
            }
            self.state.postings.insert(
                &term,
                Arc::new(clusters),
                &self.provider.budget,
                &self.provider.terms,
                &evictor,
            );
        }
        Ok(files)
    }
}

/// Single-segment query surface. The host runs one of these per segment and
/// merges across segments itself.
pub struct SegmentSearcher<'a> {
    provider: &'a SparseIndexProvider,
    state: Arc<SegmentState>,
}

impl SegmentSearcher<'_> {
    /// Quantizes the float query, runs the ANN traversal, and returns scored
    /// hits in descending order, at most `params.k` of them.
    pub fn search(
        &self,
        query_entries: &[(u32, f32)],
        params: &SearchParams,
        filter: Option<&RoaringBitmap>,
        cancellation: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        let max_weight = query_entries
            .iter()
            .map(|&(_, weight)| weight)
            .fold(0.0f32, f32::max);
        let query_scale = WeightScale::from_max_weight(max_weight);
        let query = SparseVector::quantize_entries(query_entries.iter().copied(), &query_scale);
        let score_scale = self.state.scale.score_scale(&query_scale);
        query::execute(
            &query,
            params,
            self.state.max_doc,
            score_scale,
            filter,
            cancellation,
            &|term: &[u8]| self.resolve_term(term),
            &|doc_id| self.resolve_vector(doc_id),
        )
    }

    pub fn index_key(&self) -> &SegmentFieldKey {
        &self.state.key
    }

    /// Resident clusters win; otherwise the codec decodes the term and the
    /// result is offered to the cache (used uncached when the budget says
    /// no).
    fn resolve_term(&self, term: &[u8]) -> Result<Option<Arc<PostingClusters>>, QueryError> {
        if let Some(resident) = self.state.postings.read(term, &self.provider.terms) {
            return Ok(Some(resident));
        }
        let Some(reader) = self.state.reader.as_ref() else {
            return Ok(None);
        };
        let Some(clusters) = reader.read_term(term).map_err(QueryError::from)? else {
            return Ok(None);
        };
        let evictor = TermEvictor {
            provider: self.provider,
        };
        let (clusters, _) = self.state.postings.insert(
            term,
            Arc::new(clusters),
            &self.provider.budget,
            &self.provider.terms,
            &evictor,
        );
        Ok(Some(clusters))
    }

    fn resolve_vector(&self, doc_id: u32) -> Option<Arc<SparseVector>> {
        if let Some(vector) = self.state.forward.read(doc_id, &self.provider.documents) {
            return Some(vector);
        }
        let source = self.state.source.as_ref()?;
        let entries = source.vector(doc_id)?;
        let vector = Arc::new(SparseVector::quantize_entries(entries, &self.state.scale));
        if vector.is_empty() {
            return None;
        }
        let evictor = DocumentEvictor {
            provider: self.provider,
        };
        self.state.forward.insert(
            doc_id,
            vector.clone(),
            &self.provider.budget,
            &self.provider.documents,
            &evictor,
        );
        Some(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with_limit(limit_bytes: u64) -> SparseIndexProvider {
        let mut config = SparseIndexProviderConfig::with_limit_bytes(limit_bytes);
        config.index_thread_qty = Some(2);
        SparseIndexProvider::new(&config, 0).unwrap()
    }

    fn key() -> SegmentFieldKey {
        SegmentFieldKey::new("_0", "embedding")
    }

    fn build_params() -> BuildParams {
        BuildParams::new(8, 0.5, 0.5, 2, 7).unwrap()
    }

    fn index_eight_docs(provider: &SparseIndexProvider, directory: &Path) -> SegmentFieldFiles {
        provider
            .create_index(key(), 16, WeightScale::new(100.0), 0, None)
            .unwrap();
        let mut writer = provider.writer(&key(), build_params()).unwrap();
        for doc_id in 1..=8u32 {
            let weight = doc_id as f32 / 10.0;
            writer.add_document(doc_id, &[(1000, weight), (2000, weight)]);
        }
        writer.commit(directory).unwrap()
    }

    #[test]
    fn test_build_commit_search_roundtrip() {
        let directory = tempfile::tempdir().unwrap();
        let provider = provider_with_limit(1 << 20);
        let files = index_eight_docs(&provider, directory.path());
        assert!(files.terms.exists() && files.postings.exists());

        let searcher = provider.searcher(&key()).unwrap();
        let response = searcher
            .search(
                &[(1000, 0.1), (2000, 0.2)],
                &SearchParams::new(3, 2, 1.0).unwrap(),
                None,
                &CancellationToken::new(),
            )
            .unwrap();
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![8, 7, 6]);
        assert!(response.hits[0].score > response.hits[2].score);
    }

    #[test]
    fn test_searcher_is_none_for_unknown_or_empty_index() {
        let provider = provider_with_limit(1 << 20);
        assert!(provider.searcher(&key()).is_none());
        provider
            .create_index(key(), 16, WeightScale::identity(), 0, None)
            .unwrap();
        // Registered but has no postings: the host keeps its exact scorer.
        assert!(provider.searcher(&key()).is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let provider = provider_with_limit(1 << 20);
        provider
            .create_index(key(), 16, WeightScale::identity(), 0, None)
            .unwrap();
        let error = provider
            .create_index(key(), 16, WeightScale::identity(), 0, None)
            .unwrap_err();
        assert_eq!(error.code(), ErrorCodes::AlreadyExists);
    }

    #[test]
    fn test_remove_index_releases_all_bytes() {
        let directory = tempfile::tempdir().unwrap();
        let provider = provider_with_limit(1 << 20);
        index_eight_docs(&provider, directory.path());
        assert!(provider.stats().budget.used_bytes > 0);

        let freed = provider.remove_index(&key());
        assert!(freed > 0);
        let stats = provider.stats();
        assert_eq!(stats.budget.used_bytes, 0);
        assert_eq!(stats.index_count, 0);
        assert_eq!(stats.resident_documents, 0);
        assert_eq!(stats.resident_terms, 0);
    }

    #[test]
    fn test_open_index_serves_queries_lazily() {
        struct MapSource(HashMap<u32, Vec<(u32, f32)>>);
        impl VectorSource for MapSource {
            fn vector(&self, doc_id: u32) -> Option<Vec<(u32, f32)>> {
                self.0.get(&doc_id).cloned()
            }
        }

        let directory = tempfile::tempdir().unwrap();
        let builder = provider_with_limit(1 << 20);
        index_eight_docs(&builder, directory.path());

        let stored: HashMap<u32, Vec<(u32, f32)>> = (1..=8u32)
            .map(|doc_id| {
                let weight = doc_id as f32 / 10.0;
                (doc_id, vec![(1000, weight), (2000, weight)])
            })
            .collect();
        let reader_side = provider_with_limit(1 << 20);
        reader_side
            .open_index(
                key(),
                directory.path(),
                16,
                WeightScale::new(100.0),
                Some(Arc::new(MapSource(stored))),
            )
            .unwrap();
        assert_eq!(reader_side.stats().budget.used_bytes, 0);

        let searcher = reader_side.searcher(&key()).unwrap();
        let response = searcher
            .search(
                &[(1000, 0.1), (2000, 0.2)],
                &SearchParams::new(2, 2, 1.0).unwrap(),
                None,
                &CancellationToken::new(),
            )
            .unwrap();
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![8, 7]);
        // The traversed terms and their vectors are now cached.
        let stats = reader_side.stats();
        assert!(stats.budget.used_bytes > 0);
        assert!(stats.resident_terms > 0);
        assert!(stats.resident_documents > 0);
    }

    #[test]
    fn test_zero_limit_disables_caching_but_not_queries() {
        struct MapSource(HashMap<u32, Vec<(u32, f32)>>);
        impl VectorSource for MapSource {
            fn vector(&self, doc_id: u32) -> Option<Vec<(u32, f32)>> {
                self.0.get(&doc_id).cloned()
            }
        }

        let directory = tempfile::tempdir().unwrap();
        let builder = provider_with_limit(1 << 20);
        index_eight_docs(&builder, directory.path());

        let stored: HashMap<u32, Vec<(u32, f32)>> = (1..=8u32)
            .map(|doc_id| {
                let weight = doc_id as f32 / 10.0;
                (doc_id, vec![(1000, weight), (2000, weight)])
            })
            .collect();
        let uncached = provider_with_limit(0);
        uncached
            .open_index(
                key(),
                directory.path(),
                16,
                WeightScale::new(100.0),
                Some(Arc::new(MapSource(stored))),
            )
            .unwrap();
        let searcher = uncached.searcher(&key()).unwrap();
        let response = searcher
            .search(
                &[(1000, 0.1), (2000, 0.2)],
                &SearchParams::new(2, 2, 1.0).unwrap(),
                None,
                &CancellationToken::new(),
            )
            .unwrap();
        let doc_ids: Vec<u32> = response.hits.iter().map(|hit| hit.doc_id).collect();
        assert_eq!(doc_ids, vec![8, 7]);
        // Nothing stuck to the caches.
        let stats = uncached.stats();
        assert_eq!(stats.budget.used_bytes, 0);
        assert_eq!(stats.resident_documents, 0);
        assert_eq!(stats.resident_terms, 0);
    }

    #[test]
    fn test_eviction_keeps_budget_under_limit() {
        let directory = tempfile::tempdir().unwrap();
        // A limit small enough that eight documents cannot all stay resident.
        let provider = provider_with_limit(600);
        provider
            .create_index(key(), 16, WeightScale::new(100.0), 0, None)
            .unwrap();
        let mut writer = provider.writer(&key(), build_params()).unwrap();
        for doc_id in 1..=8u32 {
            let weight = doc_id as f32 / 10.0;
            writer.add_document(doc_id, &[(1000, weight), (2000, weight)]);
        }
        writer.commit(directory.path()).unwrap();
        let stats = provider.stats();
        assert!(stats.budget.used_bytes <= 600);
    }
}
