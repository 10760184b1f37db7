use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the next retry of `item`; records one more failure
    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // 2^31 * base overflows long before it matters; clamp the shift.
        let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}
