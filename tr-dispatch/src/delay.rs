use crate::policy::DelayRange;
use std::time::Duration;

/// Draws a delay from `range`: `min + random * (max - min)` milliseconds.
pub fn sample_delay(range: DelayRange) -> Duration {
    sample_delay_with(range, fastrand::f64())
}

/// `unit` is expected in `[0, 1)`; values outside are clamped.
pub fn sample_delay_with(range: DelayRange, unit: f64) -> Duration {
    if range.is_fixed() {
        return Duration::from_millis(range.min_ms);
    }
    let (min, max) = if range.min_ms <= range.max_ms {
        (range.min_ms, range.max_ms)
    } else {
        (range.max_ms, range.min_ms)
    };
    let span = (max - min) as f64;
    let millis = min as f64 + unit.clamp(0.0, 1.0) * span;
    Duration::from_micros((millis * 1000.0).round() as u64)
}

/// Suspends the caller for a delay drawn from `range` and returns it.
pub async fn inject_delay(range: DelayRange) -> Duration {
    let delay = sample_delay(range);
    if !delay.is_zero() {
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            min_ms = range.min_ms,
            max_ms = range.max_ms,
            "injecting destination delay"
        );
        tokio::time::sleep(delay).await;
    }
    delay
}
