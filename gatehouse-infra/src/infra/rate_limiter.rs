use gatehouse_policy::RateLimitSignal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {0}")]
    Exceeded(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

struct TokenBucket {
    tokens: usize,
    last_refill: Instant,
    config: RateLimitConfig,
    /// Whether the most recent consume in this window was refused.
    rejected: bool,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.max_requests,
            last_refill: Instant::now(),
            config,
            rejected: false,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens > 0 {
            self.tokens -= 1;
            self.rejected = false;
            true
        } else {
            self.rejected = true;
            false
        }
    }

    fn is_limited(&mut self) -> bool {
        self.refill();
        self.rejected
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= self.config.window {
            self.tokens = self.config.max_requests;
            self.last_refill = now;
            self.rejected = false;
        }
    }
}

struct ContextBuckets {
    buckets: HashMap<(String, String), TokenBucket>,
    last_sweep: Instant,
}

impl ContextBuckets {
    /// Drops buckets whose window has passed; they would refill to a fresh
    /// bucket anyway. Runs at most once per window.
    fn sweep(&mut self, window: Duration) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < window {
            return;
        }
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < window);
        self.last_sweep = now;
        if self.buckets.len() != before {
            debug!("Pruned {} idle rate-limit buckets", before - self.buckets.len());
        }
    }
}

/// Fixed-window buckets per `(user, context)` plus one global bucket.
pub struct RateLimiter {
    per_context: Mutex<ContextBuckets>,
    global: Mutex<TokenBucket>,
    context_config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(context_config: RateLimitConfig, global_config: RateLimitConfig) -> Self {
        Self {
            per_context: Mutex::new(ContextBuckets {
                buckets: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            global: Mutex::new(TokenBucket::new(global_config)),
            context_config,
        }
    }

    pub fn check_global(&self) -> Result<(), RateLimitError> {
        let mut global = self.global.lock();

        if global.try_consume() {
            Ok(())
        } else {
            Err(RateLimitError::Exceeded("global".to_string()))
        }
    }

    pub fn check_context(&self, user_id: &str, context_id: &str) -> Result<(), RateLimitError> {
        let mut state = self.per_context.lock();
        state.sweep(self.context_config.window);
        let bucket = state
            .buckets
            .entry((user_id.to_string(), context_id.to_string()))
            .or_insert_with(|| TokenBucket::new(self.context_config.clone()));

        if bucket.try_consume() {
            Ok(())
        } else {
            Err(RateLimitError::Exceeded(format!("{}:{}", user_id, context_id)))
        }
    }

    /// Counts one request. Called once per request, before the decision.
    pub fn record(&self, user_id: &str, context_id: &str) -> Result<(), RateLimitError> {
        let result = self
            .check_global()
            .and_then(|_| self.check_context(user_id, context_id));
        if let Err(e) = &result {
            debug!("{}", e);
        }
        result
    }

    /// Number of `(user, context)` pairs currently tracked.
    pub fn tracked_contexts(&self) -> usize {
        self.per_context.lock().buckets.len()
    }
}

impl RateLimitSignal for RateLimiter {
    fn is_rate_limited(&self, user_id: &str, context_id: &str) -> bool {
        if self.global.lock().is_limited() {
            return true;
        }
        self.per_context
            .lock()
            .buckets
            .get_mut(&(user_id.to_string(), context_id.to_string()))
            .map(TokenBucket::is_limited)
            .unwrap_or(false)
    }
}
