/// Accounted heap footprint of a cache-resident value. Containers sum these
/// to drive the circuit-breaker budget, so implementations must be stable for
/// the lifetime of the value.
pub trait RamUsage {
    fn ram_bytes_used(&self) -> usize;
}

impl<T: RamUsage> RamUsage for [T] {
    fn ram_bytes_used(&self) -> usize {
        self.iter().map(RamUsage::ram_bytes_used).sum()
    }
}
