//! Dispatch core for ticket replies.
//!
//! Inbound ticket events are admitted once by the [`Deduplicator`], mapped to
//! a reply by the [`DestinationPolicy`], optionally delayed, and delivered
//! through the rate-limited priority [`Dispatcher`]. Nothing here knows about
//! the upstream transport.

mod dedup;
mod delay;
mod dispatcher;
mod error;
mod latency;
mod policy;
mod types;

pub use dedup::{
    DEFAULT_EXPIRATION, DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_INTERVAL, DedupConfig, DedupStatus,
    DedupSweeper, Deduplicator,
};
pub use delay::{inject_delay, sample_delay, sample_delay_with};
pub use dispatcher::{
    DEFAULT_BUCKET_SIZE, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_REFILL_RATE,
    DEFAULT_TOKEN_COST, Dispatcher, DispatcherConfig, DispatcherStatus, PendingDelivery,
    TokenBucket,
};
pub use error::{DeliveryError, DeliveryResult, DispatchError, ParseError, PolicyError, Result};
pub use latency::{DEFAULT_MAX_SAMPLES, LatencySample, LatencyStats, LatencyTracker};
pub use policy::{
    DelayRange, DestinationPolicy, DestinationRule, MessageTemplate, Resolution,
    UNKNOWN_DESTINATION_NAME, extract_ticket_number,
};
pub use types::{ChannelId, DestinationId, EventId, MessageId, SendReceipt, TicketEvent};
