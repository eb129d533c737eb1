//! Splitting a partition into sequential batches.

/// Splits one partition's units into batches of at most `workers × batch_size` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    workers: usize,
    batch_size: usize,
}

impl BatchPlanner {
    pub fn new(workers: usize, batch_size: usize) -> Self {
        Self {
            workers: workers.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.workers.saturating_mul(self.batch_size)
    }

    /// Consecutive chunks in original order. Empty input yields no batches.
    pub fn plan<T>(&self, units: Vec<T>) -> Vec<Vec<T>> {
        let threshold = self.threshold();
        if units.len() <= threshold {
            return if units.is_empty() { Vec::new() } else { vec![units] };
        }

        let mut batches = Vec::with_capacity(units.len().div_ceil(threshold));
        let mut remaining = units.into_iter().peekable();
        while remaining.peek().is_some() {
            batches.push(remaining.by_ref().take(threshold).collect());
        }
        batches
    }
}
