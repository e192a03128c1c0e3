use crate::traits::{DeliveryAction, EventSource};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tr_dispatch::{
    ChannelId, DeliveryError, DeliveryResult, DestinationId, EventId, MessageId, ParseError,
    SendReceipt, TicketEvent,
};

pub const REVOLT_API_BASE_URL: &str = "https://api.revolt.chat";
pub const REVOLT_EVENTS_URL: &str = "wss://ws.revolt.chat/?version=1&format=json";
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One decoded frame from the events socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    ChannelCreate(TicketEvent),
    Authenticated,
    Error(String),
    Other(String),
}

#[derive(Clone)]
pub struct RevoltAdapter {
    http: reqwest::Client,
    session_token: String,
    api_base_url: String,
    events_url: String,
    ping_interval: Duration,
    reconnect_delay: Duration,
}

impl RevoltAdapter {
    pub fn new(session_token: &str, http_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            http,
            session_token: session_token.to_string(),
            api_base_url: REVOLT_API_BASE_URL.to_string(),
            events_url: REVOLT_EVENTS_URL.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    pub fn with_api_base_url(mut self, api_base_url: &str) -> Self {
        self.api_base_url = api_base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_events_url(mut self, events_url: &str) -> Self {
        self.events_url = events_url.to_string();
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }
}

#[async_trait::async_trait]
impl EventSource for RevoltAdapter {
    fn source_id(&self) -> &str {
        "revolt"
    }

    async fn start(&self, tx: mpsc::Sender<TicketEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_events_loop(tx).await;
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeliveryAction for RevoltAdapter {
    async fn send(&self, channel: &ChannelId, content: &str) -> DeliveryResult<SendReceipt> {
        let url = self.api_url(&format!("/channels/{channel}/messages"));
        let body = serde_json::json!({
            "content": content,
            "nonce": ulid::Ulid::new().to_string(),
            "replies": [],
        });
        let resp = self
            .http
            .post(url)
            .header("x-session-token", &self.session_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DeliveryError::ResponseFormat(e.to_string()))?;
        let message_id = v
            .get("_id")
            .and_then(|id| id.as_str())
            .map(MessageId::from);
        if message_id.is_none() {
            tracing::warn!(%channel, "revolt accepted message without returning an id");
        }
        Ok(SendReceipt { message_id })
    }
}

impl RevoltAdapter {
    async fn run_events_loop(&self, tx: mpsc::Sender<TicketEvent>) {
        loop {
            match self.run_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("revolt event feed receiver closed; stopping");
                    return;
                }
                Err(e) => tracing::warn!(%e, "revolt event stream ended"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
            tracing::info!(events_url = %self.events_url, "revolt event stream reconnecting");
        }
    }

    /// Returns `Ok(())` only when the receiving side of `tx` has gone away.
    async fn run_events_once(&self, tx: &mpsc::Sender<TicketEvent>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.events_url.as_str()).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        let authenticate = serde_json::json!({
            "type": "Authenticate",
            "token": self.session_token,
        });
        write
            .lock()
            .await
            .send(Message::Text(authenticate.to_string().into()))
            .await?;

        // Keepalive.
        let ping_task = {
            let write = write.clone();
            let ping_interval = self.ping_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ping_interval);
                loop {
                    interval.tick().await;
                    let payload = serde_json::json!({
                        "type": "Ping",
                        "data": Utc::now().timestamp_millis(),
                    });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let outcome = self.read_frames(&mut read, tx).await;
        ping_task.abort();
        outcome
    }

    async fn read_frames<S>(&self, read: &mut S, tx: &mpsc::Sender<TicketEvent>) -> Result<()>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = read.next().await {
            let txt = match msg? {
                Message::Text(txt) => txt,
                Message::Close(frame) => {
                    return Err(anyhow::anyhow!("revolt closed the event stream: {frame:?}"));
                }
                _ => continue,
            };

            match parse_feed_frame(txt.as_str(), Utc::now()) {
                Ok(FeedFrame::ChannelCreate(event)) => {
                    tracing::debug!(
                        event_id = %event.id,
                        destination = %event.destination,
                        label = %event.label,
                        "revolt channel created"
                    );
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(FeedFrame::Authenticated) => tracing::info!("revolt event stream authenticated"),
                Ok(FeedFrame::Error(error)) => {
                    return Err(anyhow::anyhow!("revolt event stream error: {error}"));
                }
                Ok(FeedFrame::Other(_)) => {}
                Err(e) => tracing::warn!(error = %e, "dropping malformed revolt frame"),
            }
        }

        Err(anyhow::anyhow!("revolt event stream ended unexpectedly"))
    }
}

#[derive(Debug, Deserialize)]
struct RevoltChannelCreate {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Decodes one text frame from the events socket.
///
/// `ChannelCreate` frames without a `server` (DMs, groups) are not tickets
/// and come back as [`FeedFrame::Other`].
pub fn parse_feed_frame(text: &str, received_at: DateTime<Utc>) -> Result<FeedFrame, ParseError> {
    let v: serde_json::Value = serde_json::from_str(text)?;
    let kind = v
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ParseError::MissingField {
            kind: "frame".to_string(),
            field: "type",
        })?;

    match kind {
        "ChannelCreate" => {
            let payload: RevoltChannelCreate = serde_json::from_value(v.clone())?;
            let missing = |field| ParseError::MissingField {
                kind: kind.to_string(),
                field,
            };
            let id = payload.id.ok_or_else(|| missing("_id"))?;
            let Some(server) = payload.server else {
                return Ok(FeedFrame::Other(kind.to_string()));
            };
            let name = payload.name.ok_or_else(|| missing("name"))?;
            Ok(FeedFrame::ChannelCreate(TicketEvent {
                id: EventId::new(id.clone()),
                destination: DestinationId::new(server),
                channel: ChannelId::new(id),
                label: name,
                received_at,
            }))
        }
        "Authenticated" => Ok(FeedFrame::Authenticated),
        "Error" => Ok(FeedFrame::Error(
            v.get("error")
                .map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string()),
        )),
        other => Ok(FeedFrame::Other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    #[test]
    fn channel_create_frame_becomes_ticket_event() {
        let now = Utc::now();
        let frame = r#"{"type":"ChannelCreate","_id":"01HZXCHAN","channel_type":"TextChannel","server":"01JDPY161J6H6B1KBV74QWKCDM","name":"ticket-0482"}"#;
        let parsed = parse_feed_frame(frame, now).expect("parse frame");
        assert_eq!(
            parsed,
            FeedFrame::ChannelCreate(TicketEvent {
                id: EventId::new("01HZXCHAN"),
                destination: DestinationId::new("01JDPY161J6H6B1KBV74QWKCDM"),
                channel: ChannelId::new("01HZXCHAN"),
                label: "ticket-0482".to_string(),
                received_at: now,
            })
        );
    }

    #[test]
    fn serverless_channels_and_other_frames_are_not_tickets() {
        let now = Utc::now();
        let dm = r#"{"type":"ChannelCreate","_id":"01DM","channel_type":"DirectMessage"}"#;
        assert_eq!(
            parse_feed_frame(dm, now).expect("parse dm"),
            FeedFrame::Other("ChannelCreate".to_string())
        );
        assert_eq!(
            parse_feed_frame(r#"{"type":"Pong","data":1}"#, now).expect("parse pong"),
            FeedFrame::Other("Pong".to_string())
        );
        assert_eq!(
            parse_feed_frame(r#"{"type":"Authenticated"}"#, now).expect("parse auth"),
            FeedFrame::Authenticated
        );
        assert_eq!(
            parse_feed_frame(r#"{"type":"Error","error":"InvalidSession"}"#, now)
                .expect("parse error frame"),
            FeedFrame::Error("InvalidSession".to_string())
        );
    }

    #[test]
    fn malformed_frames_are_parse_errors() {
        let now = Utc::now();
        assert!(matches!(
            parse_feed_frame("{not json", now),
            Err(ParseError::Json(_))
        ));
        assert_eq!(
            parse_feed_frame(r#"{"_id":"x"}"#, now),
            Err(ParseError::MissingField {
                kind: "frame".to_string(),
                field: "type",
            })
        );
        assert_eq!(
            parse_feed_frame(r#"{"type":"ChannelCreate","server":"s","name":"n"}"#, now),
            Err(ParseError::MissingField {
                kind: "ChannelCreate".to_string(),
                field: "_id",
            })
        );
        assert_eq!(
            parse_feed_frame(r#"{"type":"ChannelCreate","_id":"c","server":"s"}"#, now),
            Err(ParseError::MissingField {
                kind: "ChannelCreate".to_string(),
                field: "name",
            })
        );
    }

    async fn spawn_upstream(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("upstream addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve upstream");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn send_posts_content_with_session_token_and_nonce() {
        let router = axum::Router::new().route(
            "/channels/{channel}/messages",
            post(
                |axum::extract::Path(channel): axum::extract::Path<String>,
                 headers: HeaderMap,
                 Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(channel, "01HZXCHAN");
                    assert_eq!(
                        headers
                            .get("x-session-token")
                            .and_then(|v| v.to_str().ok()),
                        Some("secret-token")
                    );
                    assert_eq!(body["content"], "482");
                    assert!(body["nonce"].as_str().is_some_and(|n| n.len() == 26));
                    assert_eq!(body["replies"], serde_json::json!([]));
                    Json(serde_json::json!({ "_id": "01HZXMSG" }))
                },
            ),
        );
        let base = spawn_upstream(router).await;
        let adapter = RevoltAdapter::new("secret-token", Duration::from_secs(5))
            .expect("adapter")
            .with_api_base_url(&base);

        let receipt = adapter
            .send(&ChannelId::new("01HZXCHAN"), "482")
            .await
            .expect("send");
        assert_eq!(receipt.message_id, Some(MessageId::new("01HZXMSG")));
    }

    #[tokio::test]
    async fn non_success_status_is_a_rejection() {
        let router = axum::Router::new().route(
            "/channels/{channel}/messages",
            post(|| async { (StatusCode::FORBIDDEN, "MissingPermission") }),
        );
        let base = spawn_upstream(router).await;
        let adapter = RevoltAdapter::new("secret-token", Duration::from_secs(5))
            .expect("adapter")
            .with_api_base_url(&base);

        let err = adapter
            .send(&ChannelId::new("c"), "hello")
            .await
            .expect_err("403 must fail");
        assert_eq!(
            err,
            DeliveryError::Rejected {
                status: 403,
                body: "MissingPermission".to_string(),
            }
        );
    }
}
