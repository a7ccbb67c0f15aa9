use serde::Deserialize;
use tephra_cache::{CircuitBreakerConfig, MemoryLimit};

/// Host-facing configuration for a [`crate::SparseIndexProvider`].
#[derive(Deserialize, Debug, Clone)]
pub struct SparseIndexProviderConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Build worker count; defaults to half the available cores, minimum 1.
    #[serde(default)]
    pub index_thread_qty: Option<usize>,
}

impl SparseIndexProviderConfig {
    pub fn with_limit_bytes(limit_bytes: u64) -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig {
                limit: MemoryLimit::Bytes(limit_bytes),
                overhead: 1.0,
            },
            index_thread_qty: None,
        }
    }

    pub fn index_threads(&self) -> usize {
        self.index_thread_qty
            .unwrap_or_else(|| (num_cpus::get() / 2).max(1))
    }
}
