use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for stream reconnection.
///
/// Attempt `n` (starting at 0) waits `min(base_delay * 2^n, max_delay)`.
/// After `max_attempts` consecutive failed attempts the client gives up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}

/// Runtime configuration for the realtime layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Base URL of the REST API, e.g. `http://localhost:3000/api`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path of the event stream, relative to `base_url`.
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Treat the stream as dropped after this long without any frame
    /// (0 = never).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Seconds a view stays open after its record is deleted.
    #[serde(default = "default_deletion_countdown_secs")]
    pub deletion_countdown_secs: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            events_path: default_events_path(),
            reconnect: ReconnectPolicy::default(),
            idle_timeout_secs: default_idle_timeout_secs(),
            deletion_countdown_secs: default_deletion_countdown_secs(),
        }
    }
}

impl RealtimeConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    /// `base_url` joined with `events_path`, without the token.
    pub fn events_url(&self) -> String {
        join_url(&self.base_url, &self.events_path)
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn default_base_url() -> String {
    "http://localhost:3000/api".to_string()
}
fn default_events_path() -> String {
    "/eventos/sse".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    90
}
fn default_deletion_countdown_secs() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let p = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..10).map(|n| p.delay_for(n).as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(64), Duration::from_millis(30_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let p = ReconnectPolicy::default();
        assert!(!p.exhausted(9));
        assert!(p.exhausted(10));
    }

    #[test]
    fn test_realtime_defaults() {
        let c = RealtimeConfig::default();
        assert_eq!(c.events_url(), "http://localhost:3000/api/eventos/sse");
        assert_eq!(c.idle_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(c.deletion_countdown_secs, 5);
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let c = RealtimeConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert!(c.idle_timeout().is_none());
    }

    #[test]
    fn test_join_url_slashes() {
        assert_eq!(join_url("http://h/api/", "/eventos/sse"), "http://h/api/eventos/sse");
        assert_eq!(join_url("http://h/api", "eventos/sse"), "http://h/api/eventos/sse");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let c: RealtimeConfig = from_json(r#"{"base_url": "https://x/api", "reconnect": {"max_attempts": 3}}"#);
        assert_eq!(c.base_url, "https://x/api");
        assert_eq!(c.reconnect.max_attempts, 3);
        assert_eq!(c.reconnect.base_delay_ms, 1000);
        assert_eq!(c.events_path, "/eventos/sse");
    }

    fn from_json(json: &str) -> RealtimeConfig {
        serde_json::from_str(json).unwrap()
    }
}
