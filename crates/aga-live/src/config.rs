//! Runtime configuration for live sessions.
//!
//! Defaults can be overridden from the environment with [`LiveConfig::from_env`].

use std::time::Duration;

use aga_common::helpers::env_parse;
use rand::Rng;

use crate::error::LiveResult;

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000/ws";

/// Reconnection policy for the signaling channel.
///
/// Exponential backoff, capped, with optional 0-25% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (0-indexed).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms = (initial_ms * self.multiplier.powi(exponent)).min(max_ms);

        let final_ms = if self.jitter && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Configuration shared by the channel, the peer manager and the controller.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    /// Time a peer link may spend before reaching `Connected`.
    pub negotiation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Time to wait for the relay's `welcome` after the socket opened.
    pub welcome_timeout: Duration,
    /// Messages held while the relay is unreachable.
    pub outbox_capacity: usize,
    /// Capacity of each session event subscription.
    pub event_capacity: usize,
    /// Upper bound on waiting for a peer link worker to close its transport.
    pub link_close_timeout: Duration,
    pub stun_urls: Vec<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            negotiation_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            welcome_timeout: Duration::from_secs(10),
            outbox_capacity: 256,
            event_capacity: 256,
            link_close_timeout: Duration::from_secs(2),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl LiveConfig {
    /// Builds a config from `AGA_*` environment variables on top of the defaults.
    ///
    /// A numeric setting that is present but unparsable is an error.
    pub fn from_env() -> LiveResult<Self> {
        let defaults = Self::default();

        let relay_url = std::env::var("AGA_RELAY_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.relay_url);

        let stun_urls = std::env::var("AGA_STUN_URLS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or(defaults.stun_urls);

        let reconnect = ReconnectPolicy {
            max_attempts: env_parse(
                "AGA_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?
            .max(1),
            initial_backoff: Duration::from_millis(env_parse(
                "AGA_RECONNECT_INITIAL_MS",
                defaults.reconnect.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(env_parse(
                "AGA_RECONNECT_MAX_MS",
                defaults.reconnect.max_backoff.as_millis() as u64,
            )?),
            ..defaults.reconnect
        };

        Ok(Self {
            relay_url,
            negotiation_timeout: Duration::from_secs(
                env_parse(
                    "AGA_NEGOTIATION_TIMEOUT_SECS",
                    defaults.negotiation_timeout.as_secs(),
                )?
                .max(1),
            ),
            reconnect,
            outbox_capacity: env_parse("AGA_OUTBOX_CAPACITY", defaults.outbox_capacity)?.max(1),
            stun_urls,
            ..defaults
        })
    }
}
