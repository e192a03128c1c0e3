//! Bounded, time- and size-evicted membership set for inbound event ids.
//!
//! Every id is admitted at most once. Entries expire after a retention window
//! and the set is capped; when either limit bites, the oldest entries by
//! first-seen time go first.

use crate::types::EventId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub expiration: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_EXPIRATION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Ordering key: first-seen time, then admission sequence for ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Stamp {
    first_seen: Instant,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStatus {
    pub entries: usize,
    pub oldest_age: Option<Duration>,
}

#[derive(Debug)]
pub struct Deduplicator {
    config: DedupConfig,
    entries: HashMap<EventId, Stamp>,
    by_age: BTreeMap<Stamp, EventId>,
    next_seq: u64,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Records `id` and returns true the first time it is seen; false afterwards.
    pub fn admit(&mut self, id: &EventId) -> bool {
        self.admit_at(id, Instant::now())
    }

    pub fn admit_at(&mut self, id: &EventId, now: Instant) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }

        while self.entries.len() >= self.config.max_entries {
            if self.evict_oldest().is_none() {
                break;
            }
        }

        let stamp = Stamp {
            first_seen: now,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert(id.clone(), stamp);
        self.by_age.insert(stamp, id.clone());
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry first seen more than the expiration window before `now`.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.config.expiration) else {
            return 0;
        };

        let mut removed = 0;
        while let Some((stamp, _)) = self.by_age.first_key_value() {
            if stamp.first_seen >= cutoff {
                break;
            }
            self.evict_oldest();
            removed += 1;
        }

        tracing::info!(
            removed,
            remaining = self.entries.len(),
            "dedup expiry sweep completed"
        );
        removed
    }

    /// Evicts oldest-first until at most `max_entries` remain.
    pub fn enforce_capacity(&mut self, max_entries: usize) -> usize {
        let mut removed = 0;
        while self.entries.len() > max_entries {
            if self.evict_oldest().is_none() {
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(
                removed,
                max_entries,
                remaining = self.entries.len(),
                "dedup size limit enforced"
            );
        }
        removed
    }

    pub fn status(&self, now: Instant) -> DedupStatus {
        DedupStatus {
            entries: self.entries.len(),
            oldest_age: self
                .by_age
                .first_key_value()
                .map(|(stamp, _)| now.saturating_duration_since(stamp.first_seen)),
        }
    }

    fn evict_oldest(&mut self) -> Option<EventId> {
        let (_, id) = self.by_age.pop_first()?;
        self.entries.remove(&id);
        Some(id)
    }
}

/// Periodic expiry and capacity sweep over a shared [`Deduplicator`].
pub struct DedupSweeper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl DedupSweeper {
    pub fn start(dedup: Arc<Mutex<Deduplicator>>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("dedup sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let mut guard = dedup.lock().await;
                        let max_entries = guard.config().max_entries;
                        guard.evict_expired(Instant::now());
                        guard.enforce_capacity(max_entries);
                    }
                }
            }
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "dedup sweeper task join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> DedupConfig {
        DedupConfig {
            max_entries,
            ..DedupConfig::default()
        }
    }

    #[test]
    fn second_admit_is_rejected_without_side_effects() {
        let mut dedup = Deduplicator::new(config(10));
        let now = Instant::now();
        let id = EventId::new("01HTICKET");

        assert!(dedup.admit_at(&id, now));
        let before = dedup.status(now);
        assert!(!dedup.admit_at(&id, now + Duration::from_secs(5)));
        assert!(!dedup.admit_at(&id, now + Duration::from_secs(10)));
        assert_eq!(dedup.status(now), before);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_by_first_seen() {
        let mut dedup = Deduplicator::new(config(3));
        let base = Instant::now();
        // Admission order differs from first-seen order on purpose.
        dedup.admit_at(&EventId::new("b"), base + Duration::from_secs(2));
        dedup.admit_at(&EventId::new("a"), base + Duration::from_secs(1));
        dedup.admit_at(&EventId::new("c"), base + Duration::from_secs(3));
        dedup.admit_at(&EventId::new("d"), base + Duration::from_secs(4));

        assert_eq!(dedup.len(), 3);
        assert!(!dedup.contains(&EventId::new("a")));
        assert!(dedup.contains(&EventId::new("b")));
        assert!(dedup.contains(&EventId::new("c")));
        assert!(dedup.contains(&EventId::new("d")));
    }

    #[test]
    fn evicted_id_can_be_admitted_again() {
        let mut dedup = Deduplicator::new(config(1));
        let now = Instant::now();
        assert!(dedup.admit_at(&EventId::new("a"), now));
        assert!(dedup.admit_at(&EventId::new("b"), now));
        assert!(dedup.admit_at(&EventId::new("a"), now));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn expiry_removes_only_entries_past_the_window() {
        let mut dedup = Deduplicator::new(DedupConfig {
            expiration: Duration::from_secs(60),
            ..DedupConfig::default()
        });
        let base = Instant::now();
        dedup.admit_at(&EventId::new("old"), base);
        dedup.admit_at(&EventId::new("edge"), base + Duration::from_secs(40));
        dedup.admit_at(&EventId::new("new"), base + Duration::from_secs(90));

        let removed = dedup.evict_expired(base + Duration::from_secs(100));
        assert_eq!(removed, 1);
        assert!(!dedup.contains(&EventId::new("old")));
        assert!(dedup.contains(&EventId::new("edge")));
        assert!(dedup.contains(&EventId::new("new")));
    }

    #[test]
    fn enforce_capacity_trims_to_cap_oldest_first() {
        let mut dedup = Deduplicator::new(config(100));
        let base = Instant::now();
        for i in 0..10u64 {
            dedup.admit_at(
                &EventId::new(format!("id-{i}")),
                base + Duration::from_secs(10 - i),
            );
        }

        assert_eq!(dedup.enforce_capacity(4), 6);
        assert_eq!(dedup.len(), 4);
        for i in 0..4u64 {
            assert!(dedup.contains(&EventId::new(format!("id-{i}"))));
        }
        assert_eq!(dedup.enforce_capacity(4), 0);
    }

    #[test]
    fn status_reports_oldest_age() {
        let mut dedup = Deduplicator::new(config(10));
        let base = Instant::now();
        assert_eq!(dedup.status(base).oldest_age, None);
        dedup.admit_at(&EventId::new("a"), base);
        dedup.admit_at(&EventId::new("b"), base + Duration::from_secs(3));
        let status = dedup.status(base + Duration::from_secs(5));
        assert_eq!(status.entries, 2);
        assert_eq!(status.oldest_age, Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_entries_on_its_interval() {
        let dedup = Arc::new(Mutex::new(Deduplicator::new(DedupConfig {
            expiration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            max_entries: 10,
        })));
        dedup.lock().await.admit(&EventId::new("a"));

        let sweeper = DedupSweeper::start(dedup.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(dedup.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(dedup.lock().await.is_empty());

        sweeper.stop().await;
    }
}
