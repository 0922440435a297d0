use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    /// Token refill rate per second.
    pub requests_per_second: f64,
    /// Maximum tokens in the bucket (burst size).
    pub bucket_capacity: f64,
    /// Base backoff in seconds for 429/503 responses.
    pub backoff_base: f64,
    pub backoff_max: f64,
    pub backoff_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            bucket_capacity: 10.0,
            backoff_base: 1.0,
            backoff_max: 60.0,
            backoff_multiplier: 2.0,
        }
    }
}

/// Token bucket plus backoff window for one domain. Tokens refill
/// continuously from elapsed wall time; the bucket starts full.
#[derive(Debug)]
pub struct DomainStats {
    pub domain: String,
    tokens: f64,
    last_refill: Instant,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    backoff_until: Option<Instant>,
    pub backoff_attempts: u32,
}

impl DomainStats {
    pub fn new(domain: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self {
            domain: domain.into(),
            tokens: config.bucket_capacity,
            last_refill: Instant::now(),
            total_requests: 0,
            rate_limit_hits: 0,
            backoff_until: None,
            backoff_attempts: 0,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second)
            .min(config.bucket_capacity);
        self.last_refill = now;
    }

    /// Seconds left in the current backoff window, if one is active.
    pub fn backoff_remaining(&self) -> Option<f64> {
        let until = self.backoff_until?;
        let now = Instant::now();
        if now < until {
            Some(until.duration_since(now).as_secs_f64())
        } else {
            None
        }
    }

    /// Take one token if available. Callers decide whether a refusal means
    /// wait or fail.
    pub fn try_consume(&mut self, config: &RateLimitConfig) -> bool {
        self.refill(config);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.total_requests += 1;
            true
        } else {
            self.rate_limit_hits += 1;
            false
        }
    }

    /// Enter (or extend) the backoff window after a 429/503.
    /// Window length is `base * multiplier^(attempts-1)`, capped.
    pub fn trigger_backoff(&mut self, config: &RateLimitConfig) -> f64 {
        self.backoff_attempts += 1;
        let backoff_secs = (config.backoff_base
            * config
                .backoff_multiplier
                .powi(self.backoff_attempts as i32 - 1))
        .min(config.backoff_max);
        self.backoff_until =
            Some(Instant::now() + std::time::Duration::from_secs_f64(backoff_secs));
        backoff_secs
    }

    /// A successful response ends the escalation.
    pub fn reset_backoff(&mut self) {
        self.backoff_until = None;
        self.backoff_attempts = 0;
    }

    pub fn current_tokens(&mut self, config: &RateLimitConfig) -> f64 {
        self.refill(config);
        self.tokens
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatsSnapshot {
    pub domain: String,
    pub total_requests: u64,
    pub current_tokens: f64,
    pub rate_limit_hits: u64,
    pub backoff_attempts: u32,
    pub backoff_remaining_secs: Option<f64>,
}

impl DomainStats {
    pub fn snapshot(&mut self, config: &RateLimitConfig) -> DomainStatsSnapshot {
        DomainStatsSnapshot {
            domain: self.domain.clone(),
            total_requests: self.total_requests,
            current_tokens: self.current_tokens(config),
            rate_limit_hits: self.rate_limit_hits,
            backoff_attempts: self.backoff_attempts,
            backoff_remaining_secs: self.backoff_remaining(),
        }
    }
}
