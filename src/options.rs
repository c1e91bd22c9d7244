//! Options for the model request, the HTTP transport and the agent loop.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DurationSecondsWithFrac};
use std::collections::HashMap;
use std::time::Duration;

/// Sampling parameters copied into every request body.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Temperature for sampling (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Top-p (nucleus) sampling parameter.
    pub top_p: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Transport configuration options.
///
/// Controls how requests are sent over the network.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Request timeout enforced by the HTTP client.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub timeout: Option<Duration>,
    /// HTTP proxy URL.
    pub proxy: Option<String>,
    /// Additional HTTP headers to send with every request.
    pub headers: Option<HashMap<String, String>>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Bounded exponential backoff for retryable transport failures.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first. `1` disables retries.
    pub max_attempts: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub initial_backoff: Duration,
    pub multiplier: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Configuration of the orchestration loop.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Turns allowed by [`Agent::chat`](crate::Agent::chat).
    pub max_turns: usize,
    /// Treat every tool schema as closed.
    pub strict_schema: bool,
    /// Timeout of each chat request attempt.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub request_timeout: Option<Duration>,
    /// Timeout of each tool handler invocation.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub handler_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_turns: 10,
            strict_schema: false,
            request_timeout: None,
            handler_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
