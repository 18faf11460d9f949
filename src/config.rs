use chatcore::timeline::ReconcilePolicy;
use std::fmt;
use std::time::Duration;

/// Bearer credential for the REST API and the live channel handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Reconnect budget of the live channel.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Linear backoff capped at `max_delay`; `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub reconcile: ReconcilePolicy,
}

impl SessionConfig {
    /// Host announced in the STOMP CONNECT frame.
    pub fn stomp_host(&self) -> &str {
        let rest = self
            .ws_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.ws_url);
        rest.split(['/', ':']).next().unwrap_or(rest)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            ws_url: "ws://localhost:8080/ws".to_string(),
            page_size: 30,
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}
