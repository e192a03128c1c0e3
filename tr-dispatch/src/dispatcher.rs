//! Token-bucket gated priority queue with a single drain loop.
//!
//! Tasks are queued FIFO within two classes; priority tasks are inserted
//! ahead of every queued non-priority task but behind earlier priority tasks.
//! One drain loop at a time refills the bucket, pops the head once a token is
//! available and runs it to completion before looking at the next task.

use crate::error::{DeliveryError, DeliveryResult, DispatchError, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub const DEFAULT_REFILL_RATE: f64 = 8.0;
pub const DEFAULT_BUCKET_SIZE: u32 = 15;
pub const DEFAULT_TOKEN_COST: u32 = 1;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    /// Tokens added per second.
    pub refill_rate: f64,
    pub bucket_size: u32,
    pub token_cost: u32,
    pub max_queue_size: usize,
    /// Sleep between refill attempts while the bucket is dry.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            refill_rate: DEFAULT_REFILL_RATE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            token_cost: DEFAULT_TOKEN_COST,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(DispatchError::InvalidConfig(reason));
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return invalid(format!(
                "refill_rate must be a positive number, got {}",
                self.refill_rate
            ));
        }
        if self.bucket_size == 0 {
            return invalid("bucket_size must be > 0".to_string());
        }
        if self.token_cost == 0 || self.token_cost > self.bucket_size {
            return invalid(format!(
                "token_cost must be in 1..={}, got {}",
                self.bucket_size, self.token_cost
            ));
        }
        if self.max_queue_size == 0 {
            return invalid("max_queue_size must be > 0".to_string());
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be > 0".to_string());
        }
        Ok(())
    }
}

/// Whole-token bucket: refills `floor(elapsed * rate)` tokens at a time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            last_refill: now,
        }
    }

    /// Adds the whole tokens accrued since the last refill and returns how many.
    ///
    /// The refill clock only moves forward by the time those whole tokens
    /// represent, so a partially accrued token carries over.
    pub fn refill(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let whole = (elapsed * self.refill_rate).floor();
        if whole < 1.0 {
            return 0;
        }
        self.tokens = (self.tokens + whole).min(self.capacity);
        let advance = Duration::from_secs_f64(whole / self.refill_rate);
        self.last_refill = (self.last_refill + advance).min(now);
        whole as u64
    }

    pub fn try_consume(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispatcherStatus {
    pub available_tokens: f64,
    pub queue_length: usize,
    pub priority_queued: usize,
    pub is_draining: bool,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub discarded: u64,
}

type Job<T> = Box<dyn FnOnce() -> BoxFuture<'static, DeliveryResult<T>> + Send>;

struct QueuedTask<T> {
    job: Job<T>,
    priority: bool,
    submitted_at: Instant,
    reply: oneshot::Sender<DeliveryResult<T>>,
}

struct State<T> {
    queue: VecDeque<QueuedTask<T>>,
    bucket: TokenBucket,
    draining: bool,
    succeeded: u64,
    failed: u64,
    rejected: u64,
    discarded: u64,
}

struct Inner<T> {
    config: DispatcherConfig,
    state: Mutex<State<T>>,
}

/// Rate-limited priority dispatcher. Cheap to clone; clones share one queue.
pub struct Dispatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Rejects configs whose queue could never drain, such as a token cost
    /// larger than the bucket or a non-positive refill rate.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let bucket = TokenBucket::new(config.bucket_size, config.refill_rate, Instant::now());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    bucket,
                    draining: false,
                    succeeded: 0,
                    failed: 0,
                    rejected: 0,
                    discarded: 0,
                }),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Queues `task` and starts the drain loop if it is idle.
    ///
    /// `task` is not invoked until a token has been consumed for it. Must be
    /// called from within a tokio runtime.
    pub fn submit<F, Fut>(&self, priority: bool, task: F) -> Result<PendingDelivery<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DeliveryResult<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.inner.lock_state();
            let capacity = self.inner.config.max_queue_size;
            if state.queue.len() >= capacity {
                state.rejected += 1;
                return Err(DispatchError::QueueFull { capacity });
            }

            let queued = QueuedTask {
                job: Box::new(move || task().boxed()),
                priority,
                submitted_at: Instant::now(),
                reply,
            };
            if priority {
                let position = state
                    .queue
                    .iter()
                    .position(|queued| !queued.priority)
                    .unwrap_or(state.queue.len());
                state.queue.insert(position, queued);
            } else {
                state.queue.push_back(queued);
            }

            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drain().await });
        }
        Ok(PendingDelivery { rx })
    }

    /// Drops every queued task that has not started; their submitters see
    /// [`DeliveryError::Discarded`]. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let flushed: Vec<QueuedTask<T>> = {
            let mut state = self.inner.lock_state();
            let flushed: Vec<_> = state.queue.drain(..).collect();
            state.discarded += flushed.len() as u64;
            flushed
        };
        let count = flushed.len();
        for queued in flushed {
            let _ = queued.reply.send(Err(DeliveryError::Discarded));
        }
        if count > 0 {
            tracing::info!(discarded = count, "dispatch queue cleared");
        }
        count
    }

    pub fn status(&self) -> DispatcherStatus {
        let state = self.inner.lock_state();
        DispatcherStatus {
            available_tokens: state.bucket.available(),
            queue_length: state.queue.len(),
            priority_queued: state.queue.iter().filter(|queued| queued.priority).count(),
            is_draining: state.draining,
            succeeded: state.succeeded,
            failed: state.failed,
            rejected: state.rejected,
            discarded: state.discarded,
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain(self: Arc<Self>) {
        let cost = f64::from(self.config.token_cost);
        tracing::debug!("dispatch drain loop started");
        loop {
            let next = {
                let mut state = self.lock_state();
                if state.queue.is_empty() {
                    state.draining = false;
                    tracing::debug!(
                        available_tokens = state.bucket.available(),
                        "dispatch drain loop idle"
                    );
                    return;
                }
                if state.bucket.try_consume(cost, Instant::now()) {
                    state.queue.pop_front()
                } else {
                    None
                }
            };

            match next {
                Some(queued) => self.execute(queued).await,
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }

    async fn execute(&self, queued: QueuedTask<T>) {
        let QueuedTask {
            job,
            priority,
            submitted_at,
            reply,
        } = queued;
        let queued_for = submitted_at.elapsed();

        let outcome = match AssertUnwindSafe(async move { job().await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::Panicked),
        };

        {
            let mut state = self.lock_state();
            if outcome.is_ok() {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
        }

        match &outcome {
            Ok(_) => tracing::debug!(
                priority,
                queued_ms = queued_for.as_millis() as u64,
                "dispatch task succeeded"
            ),
            Err(e) => tracing::warn!(
                priority,
                queued_ms = queued_for.as_millis() as u64,
                error = %e,
                "dispatch task failed"
            ),
        }

        if reply.send(outcome).is_err() {
            tracing::debug!("dispatch submitter went away before the outcome arrived");
        }
    }
}

/// Resolves with the outcome of a submitted task.
pub struct PendingDelivery<T> {
    rx: oneshot::Receiver<DeliveryResult<T>>,
}

impl<T> Future for PendingDelivery<T> {
    type Output = DeliveryResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeliveryError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(refill_rate: f64, bucket_size: u32, max_queue_size: usize) -> DispatcherConfig {
        DispatcherConfig {
            refill_rate,
            bucket_size,
            max_queue_size,
            ..DispatcherConfig::default()
        }
    }

    fn record(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, DeliveryResult<()>> + Send + 'static {
        let log = log.clone();
        move || {
            async move {
                log.lock().expect("log lock").push(name);
                Ok(())
            }
            .boxed()
        }
    }

    #[test]
    fn bucket_never_exceeds_capacity_or_goes_negative() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, 10.0, start);
        assert_eq!(bucket.refill(start + Duration::from_secs(3600)), 36_000);
        assert_eq!(bucket.available(), 3.0);

        let now = start + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(bucket.try_consume(1.0, now));
        }
        assert!(!bucket.try_consume(1.0, now));
        assert_eq!(bucket.available(), 0.0);
    }

    #[test]
    fn bucket_keeps_partial_token_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(5, 2.0, start);
        for _ in 0..5 {
            assert!(bucket.try_consume(1.0, start));
        }

        assert_eq!(bucket.refill(start + Duration::from_millis(750)), 1);
        // 250ms of the first 750ms still counts toward the next token.
        assert_eq!(bucket.refill(start + Duration::from_millis(1000)), 1);
        assert_eq!(bucket.available(), 2.0);
        assert_eq!(bucket.refill(start + Duration::from_millis(1400)), 0);
    }

    #[test]
    fn burst_of_thirty_then_dry_at_zero_elapsed() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(30, 20.0, start);
        let granted = (0..40).filter(|_| bucket.try_consume(1.0, start)).count();
        assert_eq!(granted, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_executes_at_most_bucket_size_before_waiting() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(20.0, 30, 100)).expect("dispatcher");
        let executed = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut pending = Vec::new();
        for _ in 0..40 {
            let executed = executed.clone();
            pending.push(
                dispatcher
                    .submit(false, move || async move {
                        executed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, DeliveryError>(())
                    })
                    .expect("submit"),
            );
        }

        let rest = pending.split_off(30);
        for delivery in pending {
            delivery.await.expect("burst delivery");
        }
        assert_eq!(executed.load(Ordering::SeqCst), 30);
        assert_eq!(started.elapsed(), Duration::ZERO);
        let status = dispatcher.status();
        assert_eq!(status.queue_length, 10);
        assert_eq!(status.available_tokens, 0.0);
        assert!(status.is_draining);

        for delivery in rest {
            delivery.await.expect("refilled delivery");
        }
        assert_eq!(executed.load(Ordering::SeqCst), 40);
        assert!(started.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn priority_tasks_run_first_and_keep_fifo_within_class() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(1.0, 1, 100)).expect("dispatcher");
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for (name, priority) in [
            ("n1", false),
            ("n2", false),
            ("p1", true),
            ("p2", true),
            ("n3", false),
            ("p3", true),
        ] {
            pending.push(
                dispatcher
                    .submit(priority, record(&log, name))
                    .expect("submit"),
            );
        }
        assert_eq!(dispatcher.status().priority_queued, 3);

        for delivery in pending {
            delivery.await.expect("delivery");
        }
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["p1", "p2", "p3", "n1", "n2", "n3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn priority_task_waits_for_the_executing_one() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(1.0, 1, 100)).expect("dispatcher");
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = log.clone();
        let a = dispatcher
            .submit(false, move || async move {
                slow_log.lock().expect("log lock").push("a-start");
                tokio::time::sleep(Duration::from_millis(100)).await;
                slow_log.lock().expect("log lock").push("a-end");
                Ok::<_, DeliveryError>(())
            })
            .expect("submit a");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b = dispatcher.submit(false, record(&log, "b")).expect("submit b");
        let c = dispatcher.submit(true, record(&log, "c")).expect("submit c");
        a.await.expect("a");
        b.await.expect("b");
        c.await.expect("c");

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["a-start", "a-end", "c", "b"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_without_mutating() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(1.0, 1, 2)).expect("dispatcher");
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = dispatcher.submit(false, record(&log, "a")).expect("submit a");
        let b = dispatcher.submit(false, record(&log, "b")).expect("submit b");
        let err = dispatcher
            .submit(true, record(&log, "c"))
            .err()
            .expect("third submit must be rejected");
        assert_eq!(err, DispatchError::QueueFull { capacity: 2 });

        let status = dispatcher.status();
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.priority_queued, 0);
        assert_eq!(status.rejected, 1);

        a.await.expect("a");
        b.await.expect("b");
        assert_eq!(*log.lock().expect("log lock"), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_token_bucket_spaces_tasks_by_refills() {
        let dispatcher: Dispatcher<Duration> =
            Dispatcher::new(config(1.0, 1, 100)).expect("dispatcher");
        let started = Instant::now();

        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(
                dispatcher
                    .submit(false, move || async move {
                        Ok::<_, DeliveryError>(started.elapsed())
                    })
                    .expect("submit"),
            );
        }

        let mut ran_at = Vec::new();
        for delivery in pending {
            ran_at.push(delivery.await.expect("delivery"));
        }
        assert_eq!(ran_at[0], Duration::ZERO);
        assert!(ran_at[1] >= Duration::from_secs(1));
        assert!(ran_at[2] >= Duration::from_secs(2));
        assert!(ran_at[0] < ran_at[1] && ran_at[1] < ran_at[2]);
    }

    async fn explode() -> DeliveryResult<&'static str> {
        panic!("upstream client blew up")
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_does_not_stop_the_loop() {
        let dispatcher: Dispatcher<&'static str> =
            Dispatcher::new(config(10.0, 5, 100)).expect("dispatcher");

        let failing = dispatcher
            .submit(false, || async {
                Err::<&'static str, _>(DeliveryError::Rejected {
                    status: 403,
                    body: "missing permission".to_string(),
                })
            })
            .expect("submit failing");
        let panicking = dispatcher.submit(false, explode).expect("submit panicking");
        let ok = dispatcher
            .submit(false, || async { Ok::<_, DeliveryError>("sent") })
            .expect("submit ok");

        assert!(matches!(
            failing.await,
            Err(DeliveryError::Rejected { status: 403, .. })
        ));
        assert_eq!(panicking.await, Err(DeliveryError::Panicked));
        assert_eq!(ok.await, Ok("sent"));

        let status = dispatcher.status();
        assert_eq!(status.succeeded, 1);
        assert_eq!(status.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_length_drops_by_one_per_execution() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(1.0, 1, 100)).expect("dispatcher");
        let log = Arc::new(Mutex::new(Vec::new()));

        let pending: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| dispatcher.submit(false, record(&log, name)).expect("submit"))
            .collect();
        assert_eq!(dispatcher.status().queue_length, 3);

        let mut expected = 3;
        for delivery in pending {
            delivery.await.expect("delivery");
            expected -= 1;
            assert_eq!(dispatcher.status().queue_length, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_tasks_that_have_not_started() {
        let dispatcher: Dispatcher<()> =
            Dispatcher::new(config(1.0, 1, 100)).expect("dispatcher");
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = dispatcher.submit(false, record(&log, "a")).expect("submit a");
        let b = dispatcher.submit(false, record(&log, "b")).expect("submit b");
        let c = dispatcher.submit(true, record(&log, "c")).expect("submit c");

        // c has priority, so it runs with the only token; a and b wait.
        c.await.expect("c");
        assert_eq!(dispatcher.clear(), 2);
        assert_eq!(a.await, Err(DeliveryError::Discarded));
        assert_eq!(b.await, Err(DeliveryError::Discarded));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = dispatcher.status();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.discarded, 2);
        assert!(!status.is_draining);
        assert_eq!(*log.lock().expect("log lock"), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_loop_restarts_after_going_idle() {
        let dispatcher: Dispatcher<u32> =
            Dispatcher::new(config(1.0, 2, 100)).expect("dispatcher");
        let first = dispatcher
            .submit(false, || async { Ok::<_, DeliveryError>(1) })
            .expect("submit first");
        assert_eq!(first.await, Ok(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!dispatcher.status().is_draining);

        let second = dispatcher
            .submit(false, || async { Ok::<_, DeliveryError>(2) })
            .expect("submit second");
        assert_eq!(second.await, Ok(2));
    }

    #[test]
    fn configs_that_can_never_drain_are_rejected() {
        let oversized_cost = DispatcherConfig {
            token_cost: 5,
            ..config(1.0, 2, 100)
        };
        assert!(matches!(
            Dispatcher::<()>::new(oversized_cost),
            Err(DispatchError::InvalidConfig(_))
        ));

        for refill_rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(
                Dispatcher::<()>::new(config(refill_rate, 1, 100)).is_err(),
                "refill_rate {refill_rate} accepted"
            );
        }
        assert!(Dispatcher::<()>::new(config(1.0, 0, 100)).is_err());
        assert!(Dispatcher::<()>::new(config(1.0, 1, 0)).is_err());

        let exact_cost = DispatcherConfig {
            token_cost: 2,
            ..config(1.0, 2, 100)
        };
        assert!(Dispatcher::<()>::new(exact_cost).is_ok());
    }
}
