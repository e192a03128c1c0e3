use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tr_dispatch::{ChannelId, DeliveryResult, SendReceipt, TicketEvent};

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Upstream identifier: "revolt".
    fn source_id(&self) -> &str;

    /// Start receiving creation events. Push each parsed event to `tx`.
    async fn start(&self, tx: mpsc::Sender<TicketEvent>) -> Result<()>;
}

#[async_trait]
pub trait DeliveryAction: Send + Sync {
    /// Post `content` into `channel`. Any non-success upstream status is an error.
    async fn send(&self, channel: &ChannelId, content: &str) -> DeliveryResult<SendReceipt>;
}
