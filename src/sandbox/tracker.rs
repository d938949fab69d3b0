use std::collections::VecDeque;

/// Sliding average over the last `limit` spawn durations.
///
/// The window size doubles as the warm-up: no average is reported until
/// `limit` samples have been seen.
#[derive(Debug, Clone)]
pub struct SpawnTracker {
    limit: usize,
    sum: f64,
    values: VecDeque<f64>,
}

impl SpawnTracker {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            sum: 0.0,
            values: VecDeque::with_capacity(limit),
        }
    }

    pub fn add(&mut self, value_ms: f64) {
        if self.values.len() >= self.limit {
            if let Some(discarded) = self.values.pop_front() {
                self.sum -= discarded;
            }
        }
        self.values.push_back(value_ms);
        self.sum += value_ms;
    }

    pub fn average(&self) -> Option<f64> {
        self.enough_data().then(|| self.sum / self.limit as f64)
    }

    pub fn enough_data(&self) -> bool {
        self.values.len() == self.limit
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
