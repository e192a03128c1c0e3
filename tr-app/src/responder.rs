//! Ticket responder: the event feed drains into one pipeline of
//! filter, pause gate, dedup, policy, delay and rate-limited delivery.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tr_channels::DeliveryAction;
use tr_dispatch::{
    DeliveryError, DestinationId, DestinationPolicy, DispatchError, Dispatcher, DispatcherStatus,
    Deduplicator, LatencyStats, LatencyTracker, SendReceipt, TicketEvent, inject_delay,
};

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    NotTarget,
    Paused,
    Duplicate,
    Rejected(DispatchError),
    Delivered(SendReceipt),
    Failed(DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PauseOutcome {
    pub was_paused: bool,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponderStatus {
    pub paused: bool,
    pub discard_queue_on_pause: bool,
    pub targets: usize,
    pub dispatcher: DispatcherStatus,
    pub dedup_entries: usize,
    pub dedup_oldest_age_seconds: Option<u64>,
    pub latency: LatencyStats,
    /// Keyed by destination id; display names need not be unique.
    pub latency_by_destination: BTreeMap<String, DestinationLatency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationLatency {
    pub name: String,
    #[serde(flatten)]
    pub stats: LatencyStats,
}

/// Every pause bumps `epoch`, so a reply admitted before a pause can tell
/// that one happened while it was waiting out its delay.
#[derive(Debug, Default)]
struct PauseGate {
    paused: bool,
    epoch: u64,
}

pub struct Responder {
    targets: HashSet<DestinationId>,
    gate: std::sync::Mutex<PauseGate>,
    discard_queue_on_pause: bool,
    dedup: Arc<Mutex<Deduplicator>>,
    policy: DestinationPolicy,
    dispatcher: Dispatcher<SendReceipt>,
    delivery: Arc<dyn DeliveryAction>,
    latency: Arc<std::sync::Mutex<LatencyTracker>>,
}

impl Responder {
    pub fn new(
        targets: impl IntoIterator<Item = DestinationId>,
        policy: DestinationPolicy,
        dedup: Arc<Mutex<Deduplicator>>,
        dispatcher: Dispatcher<SendReceipt>,
        delivery: Arc<dyn DeliveryAction>,
        discard_queue_on_pause: bool,
    ) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            gate: std::sync::Mutex::new(PauseGate::default()),
            discard_queue_on_pause,
            dedup,
            policy,
            dispatcher,
            delivery,
            latency: Arc::new(std::sync::Mutex::new(LatencyTracker::default())),
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, PauseGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.lock_gate().paused
    }

    /// Closes the admission gate, flushing queued replies when configured to.
    ///
    /// With discarding on, replies still sitting out their delay are dropped
    /// too once the delay ends.
    pub fn pause(&self) -> PauseOutcome {
        let (was_paused, discarded) = {
            let mut gate = self.lock_gate();
            let was_paused = std::mem::replace(&mut gate.paused, true);
            gate.epoch += 1;
            let discarded = if self.discard_queue_on_pause {
                self.dispatcher.clear()
            } else {
                0
            };
            (was_paused, discarded)
        };
        tracing::info!(
            was_paused,
            discarded,
            queue_length = self.dispatcher.status().queue_length,
            "responder paused"
        );
        PauseOutcome {
            was_paused,
            discarded,
        }
    }

    /// Reopens the admission gate. Returns whether it was closed.
    pub fn resume(&self) -> bool {
        let was_paused = std::mem::replace(&mut self.lock_gate().paused, false);
        tracing::info!(was_paused, "responder resumed");
        was_paused
    }

    pub async fn status(&self) -> ResponderStatus {
        let dedup = self.dedup.lock().await.status(Instant::now());
        let latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        let latency_by_destination = self
            .policy
            .rules()
            .into_iter()
            .map(|rule| {
                let entry = DestinationLatency {
                    name: self.policy.name_of(&rule.id).to_string(),
                    stats: latency.stats_for(rule.id.as_str()),
                };
                (rule.id.to_string(), entry)
            })
            .collect();

        ResponderStatus {
            paused: self.is_paused(),
            discard_queue_on_pause: self.discard_queue_on_pause,
            targets: self.targets.len(),
            dispatcher: self.dispatcher.status(),
            dedup_entries: dedup.entries,
            dedup_oldest_age_seconds: dedup.oldest_age.map(|age| age.as_secs()),
            latency: latency.stats(),
            latency_by_destination,
        }
    }

    pub fn reset_latency(&self) -> usize {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset()
    }

    pub fn start(
        self: Arc<Self>,
        feed: mpsc::Receiver<TicketEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(feed, shutdown).await })
    }

    /// Handles each event on its own task so one event's delay never holds up another.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut feed: mpsc::Receiver<TicketEvent>,
        shutdown: CancellationToken,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("responder received shutdown signal");
                    break;
                }
                next = feed.recv() => {
                    let Some(event) = next else {
                        tracing::info!("responder event feed closed");
                        break;
                    };
                    let responder = self.clone();
                    in_flight.spawn(async move { responder.handle_event(event).await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "event handler task failed");
                    }
                }
            }
        }

        let abandoned = in_flight.len();
        in_flight.shutdown().await;
        if abandoned > 0 {
            tracing::warn!(abandoned, "responder stopped with events in flight");
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(event_id = %event.id, destination = %event.destination)
    )]
    pub async fn handle_event(&self, event: TicketEvent) -> EventOutcome {
        let handled_at = Instant::now();

        if !self.targets.contains(&event.destination) {
            tracing::trace!("ignoring event for non-target destination");
            return EventOutcome::NotTarget;
        }
        let admitted_epoch = {
            let gate = self.lock_gate();
            if gate.paused {
                tracing::debug!(label = %event.label, "responder paused; dropping event");
                return EventOutcome::Paused;
            }
            gate.epoch
        };
        if !self.dedup.lock().await.admit(&event.id) {
            tracing::debug!("duplicate event dropped");
            return EventOutcome::Duplicate;
        }

        let resolution = self.policy.resolve(&event.destination, &event.label);
        let destination_name = self.policy.name_of(&event.destination).to_string();
        let delayed = inject_delay(resolution.delay).await;

        let delivery = self.delivery.clone();
        let latency = self.latency.clone();
        let channel = event.channel.clone();
        let message = resolution.message.clone();
        let destination = event.destination.to_string();
        let task = move || async move {
            let sent_at = Instant::now();
            let result = delivery.send(&channel, &message).await;
            let network = sent_at.elapsed();
            if matches!(&result, Ok(_) | Err(DeliveryError::Rejected { .. })) {
                latency
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(destination, network, handled_at.elapsed());
            }
            result
        };

        // Checked and submitted under the gate so a concurrent pause either
        // sees this task in the queue or is seen here.
        let submitted = {
            let gate = self.lock_gate();
            if self.discard_queue_on_pause && gate.epoch != admitted_epoch {
                tracing::info!(
                    destination_name = %destination_name,
                    channel = %event.channel,
                    delay_ms = delayed.as_millis() as u64,
                    "responder paused during reply delay; reply discarded"
                );
                return EventOutcome::Failed(DeliveryError::Discarded);
            }
            self.dispatcher.submit(resolution.priority, task)
        };

        let pending = match submitted {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(
                    destination_name = %destination_name,
                    error = %e,
                    "reply not queued; dropped"
                );
                return EventOutcome::Rejected(e);
            }
        };

        match pending.await {
            Ok(receipt) => {
                tracing::info!(
                    destination_name = %destination_name,
                    channel = %event.channel,
                    label = %event.label,
                    reply = %resolution.message,
                    priority = resolution.priority,
                    delay_ms = delayed.as_millis() as u64,
                    total_ms = handled_at.elapsed().as_millis() as u64,
                    message_id = ?receipt.message_id,
                    "ticket reply delivered"
                );
                EventOutcome::Delivered(receipt)
            }
            Err(e) => {
                tracing::warn!(
                    destination_name = %destination_name,
                    channel = %event.channel,
                    label = %event.label,
                    error = %e,
                    "ticket reply failed"
                );
                EventOutcome::Failed(e)
            }
        }
    }
}
