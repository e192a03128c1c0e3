//! Rolling delivery latency samples.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    pub destination: String,
    /// Time spent waiting on the upstream call.
    pub network: Duration,
    /// Time from task start to outcome, including local work.
    pub total: Duration,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_network_ms: f64,
    pub min_network_ms: f64,
    pub max_network_ms: f64,
    pub avg_total_ms: f64,
    pub min_total_ms: f64,
    pub max_total_ms: f64,
    pub avg_processing_ms: f64,
}

#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<LatencySample>,
    max_samples: usize,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(DEFAULT_MAX_SAMPLES)),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, destination: impl Into<String>, network: Duration, total: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(LatencySample {
            destination: destination.into(),
            network,
            total: total.max(network),
            recorded_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn stats(&self) -> LatencyStats {
        summarize(self.samples.iter())
    }

    pub fn stats_for(&self, destination: &str) -> LatencyStats {
        summarize(self.samples.iter().filter(|s| s.destination == destination))
    }

    /// Drops every sample. Returns how many were held.
    pub fn reset(&mut self) -> usize {
        let cleared = self.samples.len();
        self.samples.clear();
        tracing::info!(cleared, "latency statistics reset");
        cleared
    }
}

fn summarize<'a>(samples: impl Iterator<Item = &'a LatencySample>) -> LatencyStats {
    let mut stats = LatencyStats {
        min_network_ms: f64::INFINITY,
        min_total_ms: f64::INFINITY,
        ..LatencyStats::default()
    };
    let mut network_sum = 0.0;
    let mut total_sum = 0.0;

    for sample in samples {
        let network = millis(sample.network);
        let total = millis(sample.total);
        stats.count += 1;
        network_sum += network;
        total_sum += total;
        stats.min_network_ms = stats.min_network_ms.min(network);
        stats.max_network_ms = stats.max_network_ms.max(network);
        stats.min_total_ms = stats.min_total_ms.min(total);
        stats.max_total_ms = stats.max_total_ms.max(total);
    }

    if stats.count == 0 {
        return LatencyStats::default();
    }
    let count = stats.count as f64;
    stats.avg_network_ms = network_sum / count;
    stats.avg_total_ms = total_sum / count;
    stats.avg_processing_ms = (total_sum - network_sum) / count;
    stats
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_reports_zeros() {
        let tracker = LatencyTracker::default();
        assert_eq!(tracker.stats(), LatencyStats::default());
        assert_eq!(tracker.stats_for("VIP").count, 0);
    }

    #[test]
    fn stats_cover_all_and_per_destination_samples() {
        let mut tracker = LatencyTracker::default();
        tracker.record("VIP", Duration::from_millis(100), Duration::from_millis(110));
        tracker.record("VIP", Duration::from_millis(300), Duration::from_millis(330));
        tracker.record("Sams", Duration::from_millis(50), Duration::from_millis(50));

        let all = tracker.stats();
        assert_eq!(all.count, 3);
        assert_eq!(all.min_network_ms, 50.0);
        assert_eq!(all.max_network_ms, 300.0);
        assert_eq!(all.avg_network_ms, 150.0);
        assert_eq!(all.max_total_ms, 330.0);

        let vip = tracker.stats_for("VIP");
        assert_eq!(vip.count, 2);
        assert_eq!(vip.avg_total_ms, 220.0);
        assert_eq!(vip.avg_processing_ms, 20.0);
    }

    #[test]
    fn keeps_only_the_most_recent_samples() {
        let mut tracker = LatencyTracker::new(2);
        for ms in [10, 20, 30] {
            tracker.record("x", Duration::from_millis(ms), Duration::from_millis(ms));
        }
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.stats().min_network_ms, 20.0);

        tracker.reset();
        assert!(tracker.is_empty());
    }
}
