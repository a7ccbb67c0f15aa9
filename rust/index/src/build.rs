use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tephra_types::{BuildParams, DocumentCluster, Posting, PostingClusters, SparseVector};

/// Mixes the build seed with an FNV-1a fold of the term bytes so every term
/// draws from its own deterministic stream, independent of build order and
/// thread schedule.
fn term_seed(seed: u64, term: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in term {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^ seed
}

fn sort_members_descending(members: &mut [Posting]) {
    members.sort_unstable_by(|a, b| b.weight.cmp(&a.weight).then(a.doc_id.cmp(&b.doc_id)));
}

/// Groups one term's documents into clusters with summary sketches.
///
/// The pipeline per term: keep the top `n_postings` documents by weight,
/// pick `ceil(cluster_ratio * retained)` random representatives, assign each
/// document to its highest-dot representative, run one mean-centroid
/// refinement pass, then summarize each cluster with an energy-pruned
/// coordinate-wise max. Terms with fewer than `approximate_threshold`
/// documents skip all of that and come back as a single unclustered group
/// whose flag forces exact evaluation.
pub struct ClusterBuilder<'a> {
    params: &'a BuildParams,
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(params: &'a BuildParams) -> Self {
        Self { params }
    }

    pub fn build_term<R>(&self, term: &[u8], posting: &[(u32, u8)], vectors: &R) -> PostingClusters
    where
        R: Fn(u32) -> Option<Arc<SparseVector>>,
    {
        if posting.is_empty() {
            return PostingClusters::default();
        }

        if posting.len() < self.params.approximate_threshold as usize {
            return self.passthrough(posting, vectors);
        }

        let retained = self.top_postings(posting);
        let mut documents: Vec<(Posting, Arc<SparseVector>)> = Vec::with_capacity(retained.len());
        for entry in retained {
            match vectors(entry.doc_id) {
                Some(vector) => documents.push((entry, vector)),
                None => {
                    // Racing an eviction during build loses the document, not
                    // the build.
                    tracing::debug!(doc_id = entry.doc_id, "no stored vector for posting");
                }
            }
        }
        if documents.is_empty() {
            return PostingClusters::default();
        }

        let cluster_count = ((self.params.cluster_ratio as f64 * documents.len() as f64).ceil()
            as usize)
            .clamp(1, documents.len());

        let mut rng = StdRng::seed_from_u64(term_seed(self.params.seed, term));
        let representatives =
            rand::seq::index::sample(&mut rng, documents.len(), cluster_count).into_vec();

        let mut assignments = self.assign_by_representatives(&documents, &representatives);
        assignments = self.refine_once(&documents, assignments, cluster_count);

        let mut memberships: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
        for (document, cluster) in assignments.iter().enumerate() {
            memberships[*cluster].push(document);
        }

        let clusters = memberships
            .into_iter()
            .filter(|members| !members.is_empty())
            .map(|members| self.finish_cluster(&documents, &members))
            .collect();
        PostingClusters::new(clusters)
    }

    /// Sub-threshold terms keep their raw posting as one always-evaluated
    /// cluster, preserving exact scoring for short lists.
    fn passthrough<R>(&self, posting: &[(u32, u8)], vectors: &R) -> PostingClusters
    where
        R: Fn(u32) -> Option<Arc<SparseVector>>,
    {
        let mut members: Vec<Posting> = posting
            .iter()
            .map(|&(doc_id, weight)| Posting { doc_id, weight })
            .collect();
        sort_members_descending(&mut members);
        let member_vectors: Vec<Arc<SparseVector>> = members
            .iter()
            .filter_map(|member| vectors(member.doc_id))
            .collect();
        let (summary, _) = self.summarize(&member_vectors);
        PostingClusters::new(vec![DocumentCluster {
            summary,
            members: members.into_boxed_slice(),
            should_not_skip: true,
        }])
    }

    /// Top `n_postings` documents by weight; ties resolve to smaller doc ids
    /// so retention is deterministic.
    fn top_postings(&self, posting: &[(u32, u8)]) -> Vec<Posting> {
        let mut retained: Vec<Posting> = posting
            .iter()
            .map(|&(doc_id, weight)| Posting { doc_id, weight })
            .collect();
        sort_members_descending(&mut retained);
        retained.truncate(self.params.n_postings as usize);
        retained
    }

    fn assign_by_representatives(
        &self,
        documents: &[(Posting, Arc<SparseVector>)],
        representatives: &[usize],
    ) -> Vec<usize> {
        documents
            .iter()
            .map(|(_, vector)| {
                let mut best_cluster = 0;
                let mut best_score = 0u32;
                let mut first = true;
                for (cluster, &representative) in representatives.iter().enumerate() {
                    let score = vector.dot(&documents[representative].1);
                    if first || score > best_score {
                        best_cluster = cluster;
                        best_score = score;
                        first = false;
                    }
                }
                best_cluster
            })
            .collect()
    }

    /// Single refinement pass: re-assign against the coordinate-wise mean of
    /// each cluster's members. Further passes are intentionally not taken.
    fn refine_once(
        &self,
        documents: &[(Posting, Arc<SparseVector>)],
        assignments: Vec<usize>,
        cluster_count: usize,
    ) -> Vec<usize> {
        let mut sums: Vec<HashMap<u32, u64>> = vec![HashMap::new(); cluster_count];
        let mut sizes = vec![0u64; cluster_count];
        for (document, &cluster) in assignments.iter().enumerate() {
            sizes[cluster] += 1;
            for (index, weight) in documents[document].1.iter() {
                *sums[cluster].entry(index).or_insert(0) += weight as u64;
            }
        }
        let centroids: Vec<HashMap<u32, f64>> = sums
            .into_iter()
            .zip(&sizes)
            .map(|(sum, &size)| {
                sum.into_iter()
                    .map(|(index, total)| (index, total as f64 / size.max(1) as f64))
                    .collect()
            })
            .collect();

        documents
            .iter()
            .zip(assignments)
            .map(|((_, vector), previous)| {
                let mut best_cluster = previous;
                let mut best_score = f64::MIN;
                for (cluster, centroid) in centroids.iter().enumerate() {
                    if sizes[cluster] == 0 {
                        continue;
                    }
                    let score: f64 = vector
                        .iter()
                        .filter_map(|(index, weight)| {
                            centroid.get(&index).map(|mean| weight as f64 * mean)
                        })
                        .sum();
                    if score > best_score {
                        best_cluster = cluster;
                        best_score = score;
                    }
                }
                best_cluster
            })
            .collect()
    }

    fn finish_cluster(
        &self,
        documents: &[(Posting, Arc<SparseVector>)],
        members: &[usize],
    ) -> DocumentCluster {
        let mut postings: Vec<Posting> = members
            .iter()
            .map(|&document| documents[document].0)
            .collect();
        sort_members_descending(&mut postings);
        let vectors: Vec<Arc<SparseVector>> = members
            .iter()
            .map(|&document| documents[document].1.clone())
            .collect();
        let (summary, kept_mass) = self.summarize(&vectors);
        DocumentCluster {
            summary,
            should_not_skip: postings.len() < 2 || kept_mass == 0,
            members: postings.into_boxed_slice(),
        }
    }

    /// Coordinate-wise max over member vectors, pruned to the smallest
    /// heaviest-first prefix whose mass reaches `summary_prune_ratio` of the
    /// total, then re-sorted by index. Returns the sketch and its kept mass.
    fn summarize(&self, vectors: &[Arc<SparseVector>]) -> (SparseVector, u64) {
        let mut maxima: HashMap<u32, u8> = HashMap::new();
        for vector in vectors {
            for (index, weight) in vector.iter() {
                maxima
                    .entry(index)
                    .and_modify(|current| *current = (*current).max(weight))
                    .or_insert(weight);
            }
        }
        let total_mass: u64 = maxima.values().map(|&weight| weight as u64).sum();
        let mut coordinates: Vec<(u32, u8)> = maxima.into_iter().collect();
        coordinates.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let target = self.params.summary_prune_ratio as f64 * total_mass as f64;
        let mut kept_mass = 0u64;
        let mut kept = 0;
        for (_, weight) in &coordinates {
            kept_mass += *weight as u64;
            kept += 1;
            if kept_mass as f64 >= target {
                break;
            }
        }
        coordinates.truncate(kept);
        coordinates.sort_unstable_by_key(|&(index, _)| index);

        let (indices, weights) = coordinates.into_iter().unzip::<_, _, Vec<_>, Vec<_>>();
        (SparseVector::from_sorted_parts(indices, weights), kept_mass)
    }
}

/// Clusters every term on the given pool. Terms are independent, so this is
/// a straight parallel map; output order matches input order.
pub fn build_terms<R>(
    params: &BuildParams,
    pool: &rayon::ThreadPool,
    terms: &[(Box<[u8]>, Vec<(u32, u8)>)],
    vectors: &R,
) -> Vec<(Box<[u8]>, PostingClusters)>
where
    R: Fn(u32) -> Option<Arc<SparseVector>> + Sync,
{
    let builder = ClusterBuilder::new(params);
    pool.install(|| {
        terms
            .par_iter()
            .map(|(term, posting)| (term.clone(), builder.build_term(term, posting, vectors)))
            .collect()
    })
}
