//! Rolling latency window.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of samples kept.
pub const DEFAULT_LATENCY_WINDOW: usize = 20;

/// One latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingSample {
    /// Measurement time (ms since epoch).
    pub timestamp: i64,
    pub latency_ms: u64,
}

/// Bounded window of recent samples for a moving average.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<PingSample>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl LatencyWindow {
    /// Create a window holding at most `capacity` samples (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest once full.
    pub fn push(&mut self, sample: PingSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn latest(&self) -> Option<PingSample> {
        self.samples.back().copied()
    }

    /// Rounded mean latency, 0 when empty.
    #[must_use]
    pub fn average_ms(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u128 = self.samples.iter().map(|s| u128::from(s.latency_ms)).sum();
        let len = self.samples.len() as u128;
        u64::try_from((sum + len / 2) / len).unwrap_or(u64::MAX)
    }

    /// Snapshot, oldest first.
    #[must_use]
    pub fn samples(&self) -> Vec<PingSample> {
        self.samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, latency_ms: u64) -> PingSample {
        PingSample {
            timestamp: ts,
            latency_ms,
        }
    }

    #[test]
    fn test_window_never_exceeds_bound() {
        let mut window = LatencyWindow::new(3);
        for i in 0..4 {
            window.push(sample(i, 10 * (i as u64 + 1)));
        }
        assert_eq!(window.len(), 3);
        let kept: Vec<i64> = window.samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn test_average_rounds() {
        let mut window = LatencyWindow::new(5);
        assert_eq!(window.average_ms(), 0);
        window.push(sample(0, 10));
        window.push(sample(1, 15));
        assert_eq!(window.average_ms(), 13);
        assert_eq!(window.latest().map(|s| s.latency_ms), Some(15));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = LatencyWindow::new(0);
        window.push(sample(0, 1));
        window.push(sample(1, 2));
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.samples(), vec![sample(1, 2)]);
        window.clear();
        assert!(window.is_empty());
    }
}
