use serde::{Deserialize, Serialize};

use crate::ram::RamUsage;

/// Multiplier mapping raw float term weights onto the u8 range stored in the
/// index. One scale is recorded per (segment, field) so the original float
/// score is recoverable at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightScale {
    scale: f32,
}

impl WeightScale {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    /// Scale chosen so the largest observed weight lands on u8::MAX.
    pub fn from_max_weight(max_weight: f32) -> Self {
        if max_weight <= 0.0 {
            return Self::identity();
        }
        Self {
            scale: u8::MAX as f32 / max_weight,
        }
    }

    pub fn identity() -> Self {
        Self { scale: 1.0 }
    }

    /// Positive weights never collapse to zero: anything above 0.0 maps to at
    /// least 1 so rare low-weight postings stay retrievable.
    pub fn quantize(&self, weight: f32) -> u8 {
        if weight <= 0.0 {
            return 0;
        }
        (weight * self.scale).round().clamp(1.0, u8::MAX as f32) as u8
    }

    pub fn dequantize(&self, weight: u8) -> f32 {
        weight as f32 / self.scale
    }

    /// Factor taking a u32 dot product of quantized weights back to float.
    pub fn score_scale(&self, query_scale: &WeightScale) -> f32 {
        1.0 / (self.scale * query_scale.scale)
    }
}

/// A sparse learned vector: (index, weight) items sorted ascending by index
/// with no duplicates. Weights are post-quantization u8 magnitudes; zero
/// weights are never stored. Indices and weights live in parallel slices so
/// the codec can stream either side without re-packing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SparseVector {
    indices: Box<[u32]>,
    weights: Box<[u8]>,
}

impl SparseVector {
    /// Builds from arbitrary-order float entries. Duplicate indices keep the
    /// largest weight; entries that quantize to zero are dropped.
    pub fn quantize_entries(
        entries: impl IntoIterator<Item = (u32, f32)>,
        scale: &WeightScale,
    ) -> Self {
        let quantized = entries
            .into_iter()
            .map(|(index, weight)| (index, scale.quantize(weight)));
        Self::from_quantized(quantized)
    }

    /// Builds from arbitrary-order quantized entries, dropping zeros and
    /// keeping the max weight per index.
    pub fn from_quantized(entries: impl IntoIterator<Item = (u32, u8)>) -> Self {
        let mut items: Vec<(u32, u8)> = entries
            .into_iter()
            .filter(|(_, weight)| *weight > 0)
            .collect();
        items.sort_unstable();
        items.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                // Sorted order puts the max weight last within an index run.
                earlier.1 = later.1;
                true
            } else {
                false
            }
        });
        let (indices, weights) = items.into_iter().unzip::<_, _, Vec<_>, Vec<_>>();
        Self {
            indices: indices.into_boxed_slice(),
            weights: weights.into_boxed_slice(),
        }
    }

    /// Assembles from already index-sorted, deduplicated, nonzero parts.
    /// The codec read path uses this to avoid a redundant normalization pass.
    pub fn from_sorted_parts(indices: Vec<u32>, weights: Vec<u8>) -> Self {
        debug_assert_eq!(indices.len(), weights.len());
        debug_assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
        Self {
            indices: indices.into_boxed_slice(),
            weights: weights.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn weights(&self) -> &[u8] {
        &self.weights
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.indices
            .iter()
            .copied()
            .zip(self.weights.iter().copied())
    }

    pub fn get(&self, index: u32) -> Option<u8> {
        self.indices
            .binary_search(&index)
            .ok()
            .map(|position| self.weights[position])
    }

    /// Two-pointer merge dot product over the quantized weights. Accumulates
    /// as u32 so u8 * u8 products cannot overflow.
    pub fn dot(&self, other: &SparseVector) -> u32 {
        let mut sum = 0u32;
        let mut own = 0;
        let mut their = 0;
        while own < self.indices.len() && their < other.indices.len() {
            match self.indices[own].cmp(&other.indices[their]) {
                std::cmp::Ordering::Less => own += 1,
                std::cmp::Ordering::Greater => their += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.weights[own] as u32 * other.weights[their] as u32;
                    own += 1;
                    their += 1;
                }
            }
        }
        sum
    }

    /// Coordinate-wise max of two vectors, used when folding members into a
    /// cluster summary sketch.
    pub fn max_merge(&self, other: &SparseVector) -> SparseVector {
        let mut indices = Vec::with_capacity(self.len() + other.len());
        let mut weights = Vec::with_capacity(self.len() + other.len());
        let mut own = 0;
        let mut their = 0;
        while own < self.indices.len() || their < other.indices.len() {
            if their == other.indices.len()
                || (own < self.indices.len() && self.indices[own] < other.indices[their])
            {
                indices.push(self.indices[own]);
                weights.push(self.weights[own]);
                own += 1;
            } else if own == self.indices.len() || other.indices[their] < self.indices[own] {
                indices.push(other.indices[their]);
                weights.push(other.weights[their]);
                their += 1;
            } else {
                indices.push(self.indices[own]);
                weights.push(self.weights[own].max(other.weights[their]));
                own += 1;
                their += 1;
            }
        }
        Self {
            indices: indices.into_boxed_slice(),
            weights: weights.into_boxed_slice(),
        }
    }

    /// Sum of all stored weights, the "mass" used by summary pruning.
    pub fn mass(&self) -> u64 {
        self.weights.iter().map(|weight| *weight as u64).sum()
    }
}

impl RamUsage for SparseVector {
    fn ram_bytes_used(&self) -> usize {
        // Two boxed slices plus 5 bytes per stored coordinate.
        std::mem::size_of::<Self>() + self.len() * (std::mem::size_of::<u32>() + 1)
    }
}
