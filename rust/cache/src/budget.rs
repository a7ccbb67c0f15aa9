use std::sync::atomic::{AtomicI64, Ordering};

use tephra_error::{ErrorCodes, TephraError};
use thiserror::Error;

#[derive(Debug, Error)]
#[error(
    "memory budget refused {requested} bytes for {label}: {used} of {limit} bytes in use"
)]
pub struct BudgetExceededError {
    pub label: &'static str,
    pub requested: u64,
    pub used: i64,
    pub limit: i64,
}

impl TephraError for BudgetExceededError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::ResourceExhausted
    }

    // Refusals are an expected steady state near the limit; callers log them.
    fn should_trace_error(&self) -> bool {
        false
    }
}

/// Process-wide tracked-byte counter with a hard limit, shared by every
/// byte-accounted container. All updates are lock-free; `reserve` is a
/// compare-and-add that leaves the counter untouched on refusal.
///
/// A limit of zero disables caching entirely: every `reserve` refuses and
/// callers are expected to operate uncached.
#[derive(Debug)]
pub struct MemoryBudget {
    used_bytes: AtomicI64,
    limit_bytes: AtomicI64,
}

impl MemoryBudget {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            used_bytes: AtomicI64::new(0),
            limit_bytes: AtomicI64::new(limit_bytes.min(i64::MAX as u64) as i64),
        }
    }

    /// Attempts to account `bytes` against the limit. On refusal the counter
    /// is unchanged and the caller decides between eviction-and-retry and
    /// operating uncached.
    pub fn reserve(&self, bytes: u64, label: &'static str) -> Result<(), BudgetExceededError> {
        let requested = bytes.min(i64::MAX as u64) as i64;
        let limit = self.limit_bytes.load(Ordering::Relaxed);
        let mut used = self.used_bytes.load(Ordering::Relaxed);
        loop {
            if limit == 0 || used.saturating_add(requested) > limit {
                return Err(BudgetExceededError {
                    label,
                    requested: bytes,
                    used,
                    limit,
                });
            }
            match self.used_bytes.compare_exchange_weak(
                used,
                used + requested,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    /// Unconditional accounting for allocations whose failure would cascade
    /// (container headers). Can push `used` past the limit; later reserves
    /// will refuse until the overshoot drains.
    pub fn reserve_unchecked(&self, bytes: u64) {
        self.used_bytes
            .fetch_add(bytes.min(i64::MAX as u64) as i64, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: u64) {
        let released = bytes.min(i64::MAX as u64) as i64;
        let previous = self.used_bytes.fetch_sub(released, Ordering::AcqRel);
        debug_assert!(previous >= released, "released more bytes than reserved");
    }

    /// Replaces the limit. `overhead` is a safety multiplier applied to the
    /// raw limit before it takes effect.
    pub fn set_limit(&self, limit_bytes: u64, overhead: f64) {
        let effective = (limit_bytes as f64 * overhead).min(i64::MAX as f64) as i64;
        self.limit_bytes.store(effective.max(0), Ordering::Release);
    }

    pub fn used_bytes(&self) -> i64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn limit_bytes(&self) -> i64 {
        self.limit_bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            used_bytes: self.used_bytes(),
            limit_bytes: self.limit_bytes(),
        }
    }
}

/// Point-in-time view of the budget for stats surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub used_bytes: i64,
    pub limit_bytes: i64,
}
