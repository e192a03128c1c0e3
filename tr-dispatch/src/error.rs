use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;
pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// Errors raised when a dispatcher cannot be built or a task cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("invalid dispatcher config: {0}")]
    InvalidConfig(String),
}

/// Errors observed by a submitter after its task left the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("upstream rejected message: status={status} body={body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("delivery task panicked")]
    Panicked,

    #[error("task discarded before execution")]
    Discarded,

    #[error("dispatcher dropped the task")]
    Dropped,
}

/// Malformed inbound frame from an event feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(String),

    #[error("event {kind} missing field `{field}`")]
    MissingField { kind: String, field: &'static str },
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Invalid destination policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("destination {id}: delay_min_ms ({min}) exceeds delay_max_ms ({max})")]
    InvertedDelay { id: String, min: u64, max: u64 },

    #[error("destination {id}: random_choice needs at least one choice")]
    EmptyChoices { id: String },

    #[error("destination {id} configured more than once")]
    Duplicate { id: String },
}
