use serde::Deserialize;
use tephra_error::{ErrorCodes, TephraError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvalidParams {
    #[error("{name} must be in (0, 1], got {value}")]
    RatioOutOfRange { name: &'static str, value: f32 },
    #[error("{name} must be at least 1")]
    ZeroCount { name: &'static str },
    #[error("heap_factor must be non-negative, got {0}")]
    NegativeHeapFactor(f32),
}

impl TephraError for InvalidParams {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

fn check_ratio(name: &'static str, value: f32) -> Result<(), InvalidParams> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(InvalidParams::RatioOutOfRange { name, value })
    }
}

/// Validated build-time knobs for one (segment, field). Constructed once at
/// the API boundary; the build engine consumes it untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawBuildParams")]
pub struct BuildParams {
    /// Cap on documents kept per term before clustering.
    pub n_postings: u32,
    /// Fraction of summary mass preserved when pruning sketches.
    pub summary_prune_ratio: f32,
    /// Cluster count as a fraction of retained documents.
    pub cluster_ratio: f32,
    /// Posting length below which a term is stored unclustered.
    pub approximate_threshold: u32,
    /// Seed for representative selection; fixed seed means bit-identical
    /// clustering across runs.
    pub seed: u64,
}

#[derive(Deserialize)]
struct RawBuildParams {
    n_postings: u32,
    summary_prune_ratio: f32,
    cluster_ratio: f32,
    approximate_threshold: u32,
    #[serde(default)]
    seed: u64,
}

impl TryFrom<RawBuildParams> for BuildParams {
    type Error = InvalidParams;

    fn try_from(raw: RawBuildParams) -> Result<Self, InvalidParams> {
        BuildParams::new(
            raw.n_postings,
            raw.summary_prune_ratio,
            raw.cluster_ratio,
            raw.approximate_threshold,
            raw.seed,
        )
    }
}

impl BuildParams {
    pub fn new(
        n_postings: u32,
        summary_prune_ratio: f32,
        cluster_ratio: f32,
        approximate_threshold: u32,
        seed: u64,
    ) -> Result<Self, InvalidParams> {
        if n_postings == 0 {
            return Err(InvalidParams::ZeroCount { name: "n_postings" });
        }
        check_ratio("summary_prune_ratio", summary_prune_ratio)?;
        check_ratio("cluster_ratio", cluster_ratio)?;
        Ok(Self {
            n_postings,
            summary_prune_ratio,
            cluster_ratio,
            approximate_threshold,
            seed,
        })
    }
}

/// Validated query-time knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Result count bound.
    pub k: usize,
    /// Max number of query coordinates traversed, heaviest first.
    pub query_cut: usize,
    /// Multiplier on the summary upper bound when deciding to prune; larger
    /// means less pruning.
    pub heap_factor: f32,
}

impl SearchParams {
    pub fn new(k: usize, query_cut: usize, heap_factor: f32) -> Result<Self, InvalidParams> {
        if k == 0 {
            return Err(InvalidParams::ZeroCount { name: "k" });
        }
        if query_cut == 0 {
            return Err(InvalidParams::ZeroCount { name: "query_cut" });
        }
        if !(heap_factor >= 0.0) {
            return Err(InvalidParams::NegativeHeapFactor(heap_factor));
        }
        Ok(Self {
            k,
            query_cut,
            heap_factor,
        })
    }
}
