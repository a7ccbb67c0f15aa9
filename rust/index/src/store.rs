use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tephra_cache::{Evictor, LruCache, MemoryBudget};
use tephra_types::{PostingClusters, RamUsage, SegmentFieldKey, TermKey};

/// Fixed per-entry overhead: the map slot, the term key clone, and the Arc
/// header, charged on top of the cluster payload.
const TERM_ENTRY_HEADER_BYTES: usize = 64;

fn entry_cost(term: &[u8], clusters: &PostingClusters) -> u64 {
    (clusters.ram_bytes_used() + term.len() + TERM_ENTRY_HEADER_BYTES) as u64
}

/// term → posting clusters for one (segment, field). Values are immutable
/// once published; replacing a term means erase-then-insert during a rebuild.
pub struct TermPostings {
    key: SegmentFieldKey,
    map: DashMap<Box<[u8]>, Arc<PostingClusters>>,
    used_bytes: AtomicU64,
}

impl TermPostings {
    pub fn new(key: SegmentFieldKey) -> Self {
        Self {
            key,
            map: DashMap::new(),
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &SegmentFieldKey {
        &self.key
    }

    pub fn term_count(&self) -> usize {
        self.map.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Publishes clusters for a term with insert-if-absent semantics. The
    /// term bytes are cloned so the caller's buffer is not retained. Bytes
    /// are reserved first, with one eviction-and-retry through the term LRU;
    /// a concurrent winner keeps its slot and the loser's reservation is
    /// returned. The first element of the return is always usable (the
    /// freshly published value, the resident winner, or the caller's value
    /// handed back uncached); the second says whether it is resident.
    pub fn insert(
        &self,
        term: &[u8],
        clusters: Arc<PostingClusters>,
        budget: &MemoryBudget,
        terms: &LruCache<TermKey>,
        evictor: &dyn Evictor<TermKey>,
    ) -> (Arc<PostingClusters>, bool) {
        let cost = entry_cost(term, &clusters);
        if budget.reserve(cost, "posting_clusters").is_err() {
            terms.evict(cost, evictor);
            if let Err(refused) = budget.reserve(cost, "posting_clusters") {
                tracing::warn!(
                    index = %self.key,
                    bytes = cost,
                    used = refused.used,
                    limit = refused.limit,
                    "memory budget refused posting clusters after eviction"
                );
                return (clusters, false);
            }
        }

        let published = match self.map.entry(term.into()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                budget.release(cost);
                existing.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(clusters.clone());
                self.used_bytes.fetch_add(cost, Ordering::AcqRel);
                clusters
            }
        };
        terms.touch(TermKey {
            index: self.key.clone(),
            term: term.into(),
        });
        (published, true)
    }

    /// Cluster list for a term, refreshing its recency on hit.
    pub fn read(&self, term: &[u8], terms: &LruCache<TermKey>) -> Option<Arc<PostingClusters>> {
        let clusters = Arc::clone(self.map.get(term)?.value());
        terms.touch(TermKey {
            index: self.key.clone(),
            term: term.into(),
        });
        Some(clusters)
    }

    /// Removes a term and returns the bytes reclaimed. Idempotent.
    pub fn erase(&self, term: &[u8], budget: &MemoryBudget) -> u64 {
        let Some((stored_term, clusters)) = self.map.remove(term) else {
            return 0;
        };
        let cost = entry_cost(&stored_term, &clusters);
        self.used_bytes.fetch_sub(cost, Ordering::AcqRel);
        budget.release(cost);
        cost
    }

    /// Snapshot of the currently resident terms. Entries evicted after the
    /// snapshot is taken simply read as misses.
    pub fn terms(&self) -> Vec<Box<[u8]>> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drops every resident term, releasing all accounted bytes.
    pub fn clear(&self, budget: &MemoryBudget) -> u64 {
        let mut freed = 0;
        for term in self.terms() {
            freed += self.erase(&term, budget);
        }
        freed
    }
}

/// Top-level mapping from (segment, field) to its term container.
pub struct ClusteredPostingStore {
    containers: DashMap<SegmentFieldKey, Arc<TermPostings>>,
}

impl Default for ClusteredPostingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusteredPostingStore {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, key: &SegmentFieldKey) -> Arc<TermPostings> {
        Arc::clone(
            self.containers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(TermPostings::new(key.clone())))
                .value(),
        )
    }

    pub fn get(&self, key: &SegmentFieldKey) -> Option<Arc<TermPostings>> {
        self.containers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops a whole per-segment container, releasing its bytes. The caller
    /// purges the term LRU separately.
    pub fn remove(&self, key: &SegmentFieldKey, budget: &MemoryBudget) -> u64 {
        match self.containers.remove(key) {
            Some((_, container)) => container.clear(budget),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}
