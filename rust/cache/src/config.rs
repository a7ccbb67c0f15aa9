use serde::Deserialize;
use tephra_error::{ErrorCodes, TephraError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryLimitParseError {
    #[error("unparseable memory limit: {0:?}")]
    Unparseable(String),
    #[error("memory limit percentage must be in [0, 100], got {0}")]
    PercentOutOfRange(f64),
}

impl TephraError for MemoryLimitParseError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Circuit-breaker limit, either absolute bytes (`"512mb"`, `"2gb"`, plain
/// byte count) or a percentage of the host-reported heap (`"10%"`). `0` or
/// `"0%"` disables caching.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "LimitRepr")]
pub enum MemoryLimit {
    Bytes(u64),
    HeapPercent(f64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<LimitRepr> for MemoryLimit {
    type Error = MemoryLimitParseError;

    fn try_from(repr: LimitRepr) -> Result<Self, MemoryLimitParseError> {
        match repr {
            LimitRepr::Number(bytes) => Ok(MemoryLimit::Bytes(bytes)),
            LimitRepr::Text(text) => text.parse(),
        }
    }
}

impl std::str::FromStr for MemoryLimit {
    type Err = MemoryLimitParseError;

    fn from_str(raw: &str) -> Result<Self, MemoryLimitParseError> {
        let text = raw.trim().to_ascii_lowercase();
        if let Some(percent) = text.strip_suffix('%') {
            let value: f64 = percent
                .trim()
                .parse()
                .map_err(|_| MemoryLimitParseError::Unparseable(raw.to_string()))?;
            if !(0.0..=100.0).contains(&value) {
                return Err(MemoryLimitParseError::PercentOutOfRange(value));
            }
            return Ok(MemoryLimit::HeapPercent(value));
        }
        let (digits, multiplier) = if let Some(rest) = text.strip_suffix("kb") {
            (rest, 1u64 << 10)
        } else if let Some(rest) = text.strip_suffix("mb") {
            (rest, 1u64 << 20)
        } else if let Some(rest) = text.strip_suffix("gb") {
            (rest, 1u64 << 30)
        } else if let Some(rest) = text.strip_suffix('b') {
            (rest, 1)
        } else {
            (text.as_str(), 1)
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| MemoryLimitParseError::Unparseable(raw.to_string()))?;
        Ok(MemoryLimit::Bytes(value.saturating_mul(multiplier)))
    }
}

impl MemoryLimit {
    /// Resolves to a byte count against the host-reported heap size.
    pub fn resolve(&self, heap_bytes: u64) -> u64 {
        match self {
            MemoryLimit::Bytes(bytes) => *bytes,
            MemoryLimit::HeapPercent(percent) => {
                ((heap_bytes as f64) * percent / 100.0) as u64
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitBreakerConfig {
    pub limit: MemoryLimit,
    /// Safety multiplier applied to the resolved limit.
    #[serde(default = "default_overhead")]
    pub overhead: f64,
}

fn default_overhead() -> f64 {
    1.0
}

impl CircuitBreakerConfig {
    pub fn effective_limit(&self, heap_bytes: u64) -> u64 {
        (self.limit.resolve(heap_bytes) as f64 * self.overhead) as u64
    }
}
