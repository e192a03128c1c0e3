//! Ticket responder server.
//!
//! Wires the upstream adapter, the responder pipeline and the control API.

use crate::config::TicketReplyConfig;
use crate::responder::Responder;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tr_channels::{DeliveryAction, EventSource, RevoltAdapter};
use tr_dispatch::{ChannelId, DedupSweeper, Deduplicator, Dispatcher, MessageTemplate};

const EVENT_FEED_BUFFER: usize = 1024;

pub struct AppState {
    pub responder: Arc<Responder>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    pub source_id: String,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = TicketReplyConfig::load_with_path(config_path).await?;
    let policy = cfg.policy()?;
    let bind_addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %path.display(),
        api_base_url = %cfg.upstream.api_base_url,
        events_url = %cfg.upstream.events_url,
        session_token_configured = !cfg.upstream.session_token.trim().is_empty(),
        bind_addr = %bind_addr,
        refill_rate = cfg.rate_limit.refill_rate,
        bucket_size = cfg.rate_limit.bucket_size,
        max_queue_size = cfg.rate_limit.max_queue_size,
        discard_queue_on_pause = cfg.control.discard_queue_on_pause,
        "config ok"
    );

    println!("{:<28} {:<16} {:<8} {:<12} message", "destination", "name", "priority", "delay_ms");
    for rule in policy.rules() {
        let message = match &rule.message {
            MessageTemplate::TicketNumber => "ticket number".to_string(),
            MessageTemplate::RandomChoice { choices } => format!("one of {choices:?}"),
            MessageTemplate::Template { text } => format!("template {text:?}"),
        };
        println!(
            "{:<28} {:<16} {:<8} {:<12} {message}",
            rule.id.as_str(),
            policy.name_of(&rule.id),
            rule.priority,
            format!("{}-{}", rule.delay_min_ms, rule.delay_max_ms),
        );
    }
    if let Err(e) = cfg.validate_for_serve() {
        tracing::warn!(error = %e, "config is not ready to serve");
    }
    Ok(())
}

/// Posts one message straight through the adapter, outside the rate limiter.
pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    message: &str,
) -> Result<()> {
    let cfg = TicketReplyConfig::load(config_path).await?;
    cfg.validate_for_serve()?;
    let adapter = build_adapter(&cfg)?;
    let receipt = adapter.send(&ChannelId::new(channel), message).await?;
    tracing::info!(
        channel,
        message_id = ?receipt.message_id,
        "one-shot message sent"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = TicketReplyConfig::load_with_path(config_path).await?;
    cfg.validate_for_serve()?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    let policy = cfg.policy()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        api_base_url = %cfg.upstream.api_base_url,
        events_url = %cfg.upstream.events_url,
        upstream_http_timeout_seconds = cfg.upstream.http_timeout_seconds,
        reconnect_delay_ms = cfg.upstream.reconnect_delay_ms,
        refill_rate = cfg.rate_limit.refill_rate,
        bucket_size = cfg.rate_limit.bucket_size,
        token_cost = cfg.rate_limit.token_cost,
        max_queue_size = cfg.rate_limit.max_queue_size,
        poll_interval_ms = cfg.rate_limit.poll_interval_ms,
        dedup_expiration_seconds = cfg.dedup.expiration_seconds,
        dedup_sweep_interval_seconds = cfg.dedup.sweep_interval_seconds,
        dedup_max_entries = cfg.dedup.max_entries,
        discard_queue_on_pause = cfg.control.discard_queue_on_pause,
        control_http_timeout_seconds = cfg.control.http_timeout_seconds,
        control_max_in_flight = cfg.control.max_in_flight,
        destinations = policy.len(),
        bind_addr = %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let adapter = Arc::new(build_adapter(&cfg)?);
    let dedup_config = cfg.dedup_config();
    let dedup = Arc::new(tokio::sync::Mutex::new(Deduplicator::new(dedup_config)));
    let sweeper = DedupSweeper::start(dedup.clone(), dedup_config.sweep_interval);

    let targets: Vec<_> = policy.rules().into_iter().map(|r| r.id.clone()).collect();
    let delivery: Arc<dyn DeliveryAction> = adapter.clone();
    let responder = Arc::new(Responder::new(
        targets,
        policy,
        dedup,
        Dispatcher::new(cfg.dispatcher_config())?,
        delivery,
        cfg.control.discard_queue_on_pause,
    ));

    let shutdown = CancellationToken::new();
    let (feed_tx, feed_rx) = tokio::sync::mpsc::channel(EVENT_FEED_BUFFER);
    let responder_handle = responder.clone().start(feed_rx, shutdown.child_token());
    adapter.start(feed_tx).await?;
    tracing::info!(source = adapter.source_id(), "event source started");

    let state = Arc::new(AppState {
        responder,
        shutdown: shutdown.clone(),
        started_at,
        source_id: adapter.source_id().to_string(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.control.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.control.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "ticket-reply serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    sweeper.stop().await;
    match responder_handle.await {
        Ok(()) => tracing::info!("responder shutdown completed"),
        Err(e) => tracing::error!(error = %e, "responder task join failed during shutdown"),
    }

    Ok(())
}

fn build_adapter(cfg: &TicketReplyConfig) -> Result<RevoltAdapter> {
    Ok(
        RevoltAdapter::new(&cfg.upstream.session_token, cfg.upstream_http_timeout())?
            .with_api_base_url(&cfg.upstream.api_base_url)
            .with_events_url(&cfg.upstream.events_url)
            .with_reconnect_delay(cfg.reconnect_delay()),
    )
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

/// Resolves on ctrl-c, SIGTERM, or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(ctrlc_err) = result {
                            tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {
                tracing::warn!("shutdown requested; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {
                tracing::warn!("shutdown requested; beginning graceful shutdown");
            }
        }
    }
    shutdown.cancel();
}
