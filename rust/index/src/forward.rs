use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tephra_cache::{Evictor, LruCache, MemoryBudget};
use tephra_types::{DocumentKey, RamUsage, SegmentFieldKey, SparseVector, WeightScale};

/// docId → stored sparse vector for one (segment, field). The slot array is
/// fixed at `max_doc`; slots hold `Arc` payloads so an evicter can clear a
/// slot while an in-flight reader still owns the vector. Writes are
/// write-once: the first vector published for a doc is canonical until the
/// slot is erased.
pub struct ForwardIndex {
    key: SegmentFieldKey,
    scale: WeightScale,
    slots: Box<[RwLock<Option<Arc<SparseVector>>>]>,
    used_bytes: AtomicU64,
    resident: AtomicUsize,
}

impl ForwardIndex {
    pub fn new(key: SegmentFieldKey, max_doc: u32, scale: WeightScale) -> Self {
        let slots = (0..max_doc)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            key,
            scale,
            slots,
            used_bytes: AtomicU64::new(0),
            resident: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &SegmentFieldKey {
        &self.key
    }

    pub fn scale(&self) -> &WeightScale {
        &self.scale
    }

    pub fn max_doc(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn resident_len(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Caches a vector for `doc_id`. Out-of-range ids, occupied slots, and
    /// empty vectors are no-ops. The entry's bytes are reserved against the
    /// budget first; a refusal triggers one eviction-and-retry through the
    /// document LRU, and a second refusal skips the insert (the index stays
    /// consistent, the vector just is not cached). Returns whether the vector
    /// was published.
    pub fn insert(
        &self,
        doc_id: u32,
        vector: Arc<SparseVector>,
        budget: &MemoryBudget,
        documents: &LruCache<DocumentKey>,
        evictor: &dyn Evictor<DocumentKey>,
    ) -> bool {
        if doc_id >= self.max_doc() || vector.is_empty() {
            return false;
        }
        if self.slots[doc_id as usize].read().is_some() {
            return false;
        }
        let cost = vector.ram_bytes_used() as u64;
        if budget.reserve(cost, "forward_index").is_err() {
            documents.evict(cost, evictor);
            if let Err(refused) = budget.reserve(cost, "forward_index") {
                tracing::warn!(
                    index = %self.key,
                    doc_id,
                    bytes = cost,
                    used = refused.used,
                    limit = refused.limit,
                    "memory budget refused forward index entry after eviction"
                );
                return false;
            }
        }

        let mut slot = self.slots[doc_id as usize].write();
        if slot.is_some() {
            // Lost the publish race; the winner's bytes stay accounted.
            budget.release(cost);
            return false;
        }
        *slot = Some(vector);
        drop(slot);
        self.used_bytes.fetch_add(cost, Ordering::AcqRel);
        self.resident.fetch_add(1, Ordering::AcqRel);
        documents.touch(DocumentKey {
            index: self.key.clone(),
            doc_id,
        });
        true
    }

    /// O(1) slot read. A hit refreshes the document's recency.
    pub fn read(
        &self,
        doc_id: u32,
        documents: &LruCache<DocumentKey>,
    ) -> Option<Arc<SparseVector>> {
        if doc_id >= self.max_doc() {
            return None;
        }
        let vector = self.slots[doc_id as usize].read().clone()?;
        documents.touch(DocumentKey {
            index: self.key.clone(),
            doc_id,
        });
        Some(vector)
    }

    /// Clears a slot and returns the bytes reclaimed. Idempotent; concurrent
    /// readers holding the `Arc` keep the payload alive until they drop it.
    pub fn erase(&self, doc_id: u32, budget: &MemoryBudget) -> u64 {
        if doc_id >= self.max_doc() {
            return 0;
        }
        let Some(vector) = self.slots[doc_id as usize].write().take() else {
            return 0;
        };
        let cost = vector.ram_bytes_used() as u64;
        self.used_bytes.fetch_sub(cost, Ordering::AcqRel);
        self.resident.fetch_sub(1, Ordering::AcqRel);
        budget.release(cost);
        cost
    }

    /// Drops every resident vector, releasing all accounted bytes. Used on
    /// whole-segment removal after the LRU has been purged.
    pub fn clear(&self, budget: &MemoryBudget) -> u64 {
        let mut freed = 0;
        for doc_id in 0..self.max_doc() {
            freed += self.erase(doc_id, budget);
        }
        freed
    }
}
