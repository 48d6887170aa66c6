//! Client configuration.
//!
//! Every design value (timeouts, tick rates) lives here so tests can shrink
//! them and deployments can override them from the environment.

use std::time::Duration;

use crate::INPUT_TICK_RATE;

const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_secs(20);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL, e.g. `https://localhost:8443`.
    pub backend_url: String,
    /// Socket base URL when it differs from the backend URL.
    pub socket_url: Option<String>,
    /// Timeout applied to every HTTP request.
    pub http_timeout: Duration,
    /// Upper bound on the whole login, 2FA prompt included.
    pub login_timeout: Duration,
    /// Interval between access-token revalidations.
    pub revalidate_interval: Duration,
    /// How long create/join waits for the server's confirmation.
    pub confirm_timeout: Duration,
    /// How long a joinable-list request waits for its snapshot.
    pub list_timeout: Duration,
    /// Input sender tick rate (Hz).
    pub input_tick_rate: u32,
    /// A pressed key with no repeat for this long is released.
    pub key_release_timeout: Duration,
    /// Accept self-signed certificates (HTTP and WebSocket).
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: "https://localhost:8443".to_string(),
            socket_url: None,
            http_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(60),
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
            confirm_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(3),
            input_tick_rate: INPUT_TICK_RATE,
            key_release_timeout: Duration::from_millis(200),
            accept_invalid_certs: false,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend_url: std::env::var("PONG_BACKEND_URL").unwrap_or(defaults.backend_url),
            socket_url: std::env::var("PONG_SOCKET_URL").ok().or(defaults.socket_url),
            http_timeout: env_duration_ms("PONG_HTTP_TIMEOUT_MS").unwrap_or(defaults.http_timeout),
            login_timeout: env_duration_secs("PONG_LOGIN_TIMEOUT_SECS")
                .unwrap_or(defaults.login_timeout),
            revalidate_interval: env_duration_secs("PONG_REVALIDATE_SECS")
                .unwrap_or(defaults.revalidate_interval),
            accept_invalid_certs: std::env::var("PONG_INSECURE_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.accept_invalid_certs),
            ..defaults
        }
    }

    /// Use a different backend URL.
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Use a different socket base URL.
    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = Some(url.into());
        self
    }

    /// Base URL the socket URL is derived from.
    pub fn socket_base(&self) -> &str {
        self.socket_url.as_deref().unwrap_or(&self.backend_url)
    }

    /// Build an absolute API URL from a path such as `/api/sign-in`.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.backend_url.trim_end_matches('/'), path)
    }

    /// Duration between two input sender ticks. Never zero.
    pub fn input_tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.input_tick_rate.max(1) as u64).max(Duration::from_micros(1))
    }

    /// Period of the revalidation loop. A zero interval falls back to the default.
    pub fn revalidate_period(&self) -> Duration {
        if self.revalidate_interval.is_zero() {
            DEFAULT_REVALIDATE_INTERVAL
        } else {
            self.revalidate_interval
        }
    }
}

fn env_duration_ms(name: &str) -> Option<Duration> {
    parse_duration(&std::env::var(name).ok()?, Duration::from_millis)
}

fn env_duration_secs(name: &str) -> Option<Duration> {
    parse_duration(&std::env::var(name).ok()?, Duration::from_secs)
}

/// Zero or unparsable values are rejected so the default applies.
fn parse_duration(raw: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    raw.trim().parse().ok().map(unit).filter(|d: &Duration| !d.is_zero())
}
