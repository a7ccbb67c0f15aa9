use std::sync::Arc;

/// Identity of one per-segment sparse index: the owning segment and the
/// mapped field. Cloning is two Arc bumps, so keys are passed by value
/// throughout the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentFieldKey {
    pub segment: Arc<str>,
    pub field: Arc<str>,
}

impl SegmentFieldKey {
    pub fn new(segment: impl Into<Arc<str>>, field: impl Into<Arc<str>>) -> Self {
        Self {
            segment: segment.into(),
            field: field.into(),
        }
    }
}

impl std::fmt::Display for SegmentFieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.segment, self.field)
    }
}

/// Recency key for one cached forward-index vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub index: SegmentFieldKey,
    pub doc_id: u32,
}

/// Recency key for one cached clustered posting list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TermKey {
    pub index: SegmentFieldKey,
    pub term: Box<[u8]>,
}

/// Lets the LRU layer purge every entry belonging to a dropped segment index
/// without knowing the concrete key type.
pub trait HasIndexKey {
    fn index_key(&self) -> &SegmentFieldKey;
}

impl HasIndexKey for DocumentKey {
    fn index_key(&self) -> &SegmentFieldKey {
        &self.index
    }
}

impl HasIndexKey for TermKey {
    fn index_key(&self) -> &SegmentFieldKey {
        &self.index
    }
}
