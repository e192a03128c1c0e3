//! Upstream adapters for the ticket responder.
//!
//! Adapters are pure I/O: they turn platform frames into [`tr_dispatch::TicketEvent`]s
//! and post replies. Rate limiting, ordering and dedup live in `tr-dispatch`.

mod revolt;
mod traits;

pub use revolt::{FeedFrame, REVOLT_API_BASE_URL, REVOLT_EVENTS_URL, RevoltAdapter, parse_feed_frame};
pub use traits::{DeliveryAction, EventSource};
