//! Ticket responder configuration loader.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tr_channels::{REVOLT_API_BASE_URL, REVOLT_EVENTS_URL};
use tr_dispatch::{DedupConfig, DestinationPolicy, DestinationRule, DispatcherConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct TicketReplyConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_events_url")]
    pub events_url: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default = "default_upstream_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_api_base_url() -> String {
    REVOLT_API_BASE_URL.to_string()
}

fn default_events_url() -> String {
    REVOLT_EVENTS_URL.to_string()
}

fn default_upstream_http_timeout_seconds() -> u64 {
    30
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            events_url: default_events_url(),
            session_token: String::new(),
            http_timeout_seconds: default_upstream_http_timeout_seconds(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u32,
    #[serde(default = "default_token_cost")]
    pub token_cost: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_refill_rate() -> f64 {
    tr_dispatch::DEFAULT_REFILL_RATE
}

fn default_bucket_size() -> u32 {
    tr_dispatch::DEFAULT_BUCKET_SIZE
}

fn default_token_cost() -> u32 {
    tr_dispatch::DEFAULT_TOKEN_COST
}

fn default_max_queue_size() -> usize {
    tr_dispatch::DEFAULT_MAX_QUEUE_SIZE
}

fn default_poll_interval_ms() -> u64 {
    tr_dispatch::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_rate: default_refill_rate(),
            bucket_size: default_bucket_size(),
            token_cost: default_token_cost(),
            max_queue_size: default_max_queue_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupSection {
    #[serde(default = "default_expiration_seconds")]
    pub expiration_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_expiration_seconds() -> u64 {
    tr_dispatch::DEFAULT_EXPIRATION.as_secs()
}

fn default_sweep_interval_seconds() -> u64 {
    tr_dispatch::DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_max_entries() -> usize {
    tr_dispatch::DEFAULT_MAX_ENTRIES
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            expiration_seconds: default_expiration_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Flush queued replies when the responder is paused.
    #[serde(default = "default_discard_queue_on_pause")]
    pub discard_queue_on_pause: bool,
    #[serde(default = "default_control_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_discard_queue_on_pause() -> bool {
    true
}

fn default_control_http_timeout_seconds() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    16
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            discard_queue_on_pause: default_discard_queue_on_pause(),
            http_timeout_seconds: default_control_http_timeout_seconds(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl TicketReplyConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TICKET_REPLY_SESSION_TOKEN") {
            if !v.trim().is_empty() {
                self.upstream.session_token = v;
            }
        }
        if let Ok(v) = std::env::var("TICKET_REPLY_API_BASE_URL") {
            if !v.trim().is_empty() {
                self.upstream.api_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("TICKET_REPLY_EVENTS_URL") {
            if !v.trim().is_empty() {
                self.upstream.events_url = v;
            }
        }
        if let Ok(v) = std::env::var("TICKET_REPLY_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.control.bind_addr = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upstream.api_base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("upstream.api_base_url is required"));
        }
        if self.upstream.events_url.trim().is_empty() {
            return Err(anyhow::anyhow!("upstream.events_url is required"));
        }
        if self.upstream.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("upstream.http_timeout_seconds must be > 0"));
        }
        if !(self.rate_limit.refill_rate.is_finite() && self.rate_limit.refill_rate > 0.0) {
            return Err(anyhow::anyhow!("rate_limit.refill_rate must be > 0"));
        }
        if self.rate_limit.bucket_size == 0 {
            return Err(anyhow::anyhow!("rate_limit.bucket_size must be > 0"));
        }
        if self.rate_limit.token_cost == 0 {
            return Err(anyhow::anyhow!("rate_limit.token_cost must be > 0"));
        }
        if self.rate_limit.token_cost > self.rate_limit.bucket_size {
            return Err(anyhow::anyhow!(
                "rate_limit.token_cost ({}) must not exceed rate_limit.bucket_size ({})",
                self.rate_limit.token_cost,
                self.rate_limit.bucket_size
            ));
        }
        if self.rate_limit.max_queue_size == 0 {
            return Err(anyhow::anyhow!("rate_limit.max_queue_size must be > 0"));
        }
        if self.rate_limit.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("rate_limit.poll_interval_ms must be > 0"));
        }
        if self.dedup.expiration_seconds == 0 {
            return Err(anyhow::anyhow!("dedup.expiration_seconds must be > 0"));
        }
        if self.dedup.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("dedup.sweep_interval_seconds must be > 0"));
        }
        if self.dedup.max_entries == 0 {
            return Err(anyhow::anyhow!("dedup.max_entries must be > 0"));
        }
        if self.control.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("control.http_timeout_seconds must be > 0"));
        }
        if self.control.max_in_flight == 0 {
            return Err(anyhow::anyhow!("control.max_in_flight must be > 0"));
        }
        self.bind_addr()?;
        if self.destinations.is_empty() {
            return Err(anyhow::anyhow!(
                "at least one [[destinations]] entry is required"
            ));
        }
        self.policy()?;
        Ok(())
    }

    /// Serving also needs a credential; `doctor` only checks the shape.
    pub fn validate_for_serve(&self) -> anyhow::Result<()> {
        if self.upstream.session_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "upstream.session_token is required (or set TICKET_REPLY_SESSION_TOKEN)"
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.control
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("control.bind_addr {:?}: {e}", self.control.bind_addr))
    }

    pub fn policy(&self) -> anyhow::Result<DestinationPolicy> {
        DestinationPolicy::from_rules(self.destinations.iter().cloned())
            .map_err(|e| anyhow::anyhow!("destinations: {e}"))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            refill_rate: self.rate_limit.refill_rate,
            bucket_size: self.rate_limit.bucket_size,
            token_cost: self.rate_limit.token_cost,
            max_queue_size: self.rate_limit.max_queue_size,
            poll_interval: Duration::from_millis(self.rate_limit.poll_interval_ms),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            expiration: Duration::from_secs(self.dedup.expiration_seconds),
            sweep_interval: Duration::from_secs(self.dedup.sweep_interval_seconds),
            max_entries: self.dedup.max_entries,
        }
    }

    pub fn upstream_http_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.http_timeout_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.upstream.reconnect_delay_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".ticket-reply").join("config.toml")
}
