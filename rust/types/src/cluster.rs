use crate::ram::RamUsage;
use crate::sparse_vector::SparseVector;

/// One (doc_id, weight) entry of a clustered posting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub doc_id: u32,
    pub weight: u8,
}

/// A group of documents posting the same term, bounded from above by a
/// summary sketch. Members are kept in descending-weight order so member
/// scans can terminate early; the summary keeps only the heaviest prefix of
/// the coordinate-wise max (see the build engine for the pruning rule).
///
/// `should_not_skip` marks clusters whose summary bound cannot be trusted,
/// forcing the query executor to evaluate them regardless of the bound.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentCluster {
    pub summary: SparseVector,
    pub members: Box<[Posting]>,
    pub should_not_skip: bool,
}

impl DocumentCluster {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl RamUsage for DocumentCluster {
    fn ram_bytes_used(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.summary.ram_bytes_used()
            + self.members.len() * std::mem::size_of::<Posting>()
    }
}

/// All clusters for one term. Cluster order carries no meaning; the query
/// executor treats the sequence as a set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostingClusters {
    pub clusters: Box<[DocumentCluster]>,
}

impl PostingClusters {
    pub fn new(clusters: Vec<DocumentCluster>) -> Self {
        Self {
            clusters: clusters.into_boxed_slice(),
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn document_count(&self) -> usize {
        self.clusters.iter().map(DocumentCluster::member_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl RamUsage for PostingClusters {
    fn ram_bytes_used(&self) -> usize {
        std::mem::size_of::<Self>() + self.clusters.ram_bytes_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_count_sums_members() {
        let cluster = |doc_ids: &[u32]| DocumentCluster {
            summary: SparseVector::default(),
            members: doc_ids
                .iter()
                .map(|&doc_id| Posting { doc_id, weight: 1 })
                .collect(),
            should_not_skip: false,
        };
        let clusters = PostingClusters::new(vec![cluster(&[1, 2, 3]), cluster(&[4])]);
        assert_eq!(clusters.cluster_count(), 2);
        assert_eq!(clusters.document_count(), 4);
    }

    #[test]
    fn test_ram_usage_grows_with_members() {
        let small = DocumentCluster {
            summary: SparseVector::default(),
            members: Box::new([]),
            should_not_skip: true,
        };
        let large = DocumentCluster {
            summary: SparseVector::from_quantized(vec![(1, 1), (2, 2)]),
            members: (0..16).map(|doc_id| Posting { doc_id, weight: 1 }).collect(),
            should_not_skip: false,
        };
        assert!(large.ram_bytes_used() > small.ram_bytes_used());
    }
}
