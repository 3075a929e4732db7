//! Retry policy, session presets and queue settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds on how often a request operation re-executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; session restore attempts draw from
    /// the same budget.
    pub max_retries: u32,
    /// Successful session restores allowed per operation. Each one resets the
    /// retry counter, so this is what guarantees termination when a server
    /// keeps rejecting fresh credentials.
    pub max_session_restores: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_session_restores: 3,
        }
    }
}

/// Transport-level settings for one class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time allowed while waiting for response data.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Upper bound on the whole exchange.
    #[serde(with = "millis")]
    pub resource_timeout: Duration,
    /// Headers applied to every request before the request's own headers.
    pub default_headers: Vec<(String, String)>,
}

impl SessionConfig {
    /// JSON API traffic: data requests and payload uploads.
    pub fn json() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            resource_timeout: Duration::from_secs(80),
            default_headers: json_headers(),
        }
    }

    /// Downloads and multipart uploads.
    pub fn binary() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(120),
            default_headers: Vec::new(),
        }
    }

    /// Short-lived JSON traffic that should not linger.
    pub fn ephemeral() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(60),
            default_headers: json_headers(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::json()
    }
}

fn json_headers() -> Vec<(String, String)> {
    vec![
        ("Accept".to_string(), "application/json".to_string()),
        ("Content-Type".to_string(), "application/json".to_string()),
    ]
}

/// Which session preset each kind of request uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sessions {
    pub json: SessionConfig,
    pub binary: SessionConfig,
}

impl Default for Sessions {
    fn default() -> Self {
        Self::standard()
    }
}

impl Sessions {
    pub fn standard() -> Self {
        Self {
            json: SessionConfig::json(),
            binary: SessionConfig::binary(),
        }
    }
}

/// Settings for a `WorkQueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Operations allowed to execute at once. Clamped to at least 1.
    pub max_concurrent: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// General-purpose queue sized to the machine.
    pub fn shared() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self::new("shared", parallelism.max(4))
    }

    /// Serial queue for credential refresh work.
    pub fn auth() -> Self {
        Self::new("auth", 1)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::shared()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_session_restores, 3);
    }

    #[test]
    fn session_presets() {
        let json = SessionConfig::json();
        assert_eq!(json.request_timeout, Duration::from_secs(60));
        assert_eq!(json.resource_timeout, Duration::from_secs(80));
        assert_eq!(json.default_headers.len(), 2);

        let binary = SessionConfig::binary();
        assert_eq!(binary.resource_timeout, Duration::from_secs(120));
        assert!(binary.default_headers.is_empty());
    }

    #[test]
    fn sessions_deserialize_with_partial_input() {
        let sessions: Sessions =
            serde_json::from_str(r#"{"json":{"request_timeout":1500}}"#).unwrap();
        assert_eq!(sessions.json.request_timeout, Duration::from_millis(1500));
        assert_eq!(sessions.json.resource_timeout, Duration::from_secs(80));
        assert_eq!(sessions.binary, SessionConfig::binary());
    }

    #[test]
    fn queue_ceiling_is_at_least_one() {
        assert_eq!(QueueConfig::new("q", 0).max_concurrent, 1);
        assert_eq!(QueueConfig::auth().max_concurrent, 1);
        assert!(QueueConfig::shared().max_concurrent >= 4);
    }

    #[test]
    fn retry_policy_fills_missing_fields() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries":1}"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.max_session_restores, 3);
    }
}
