// Admission control: a token bucket and a sliding window, both keyed by
// `(category, identifier)`.
//
// A request is admitted only when the sliding window still has room and
// the bucket holds at least one token. Rejections are returned as a
// `RateLimitDecision`, never raised; the gateway decides how to answer.

use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::store::{MemoryStore, StateStore};

pub const DEFAULT_CATEGORY: &str = "api";

// Entries untouched for this long are dropped by `RateLimiter::sweep`.
pub const STALE_ENTRY_AGE: Duration = Duration::from_secs(5 * 60);

// One token per ~17 minutes; slower refills are a config mistake
const MIN_TOKENS_PER_SECOND: f64 = 0.001;
const MAX_REFILL_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    pub tokens_per_second: f64,
    pub max_tokens: f64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self, category: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRateLimit {
            category: category.to_string(),
            reason: reason.to_string(),
        };

        if self.max_tokens < 1.0 || !self.max_tokens.is_finite() {
            return Err(invalid("maxTokens must be at least 1"));
        }
        if self.max_requests == 0 {
            return Err(invalid("maxRequests must be at least 1"));
        }
        if self.window_ms == 0 {
            return Err(invalid("windowMs must be positive"));
        }
        if !(MIN_TOKENS_PER_SECOND..=f64::MAX).contains(&self.tokens_per_second) {
            return Err(invalid("tokensPerSecond must be at least 0.001"));
        }
        Ok(())
    }
}

// Limits shipped with the gateway; `--config` may replace them.
pub fn default_categories() -> HashMap<String, RateLimitConfig> {
    let mut categories = HashMap::new();
    categories.insert(
        "api".to_string(),
        RateLimitConfig {
            max_requests: 100,
            window_ms: 60_000,
            tokens_per_second: 2.0,
            max_tokens: 20.0,
        },
    );
    // login/registration: small budget, slow refill
    categories.insert(
        "auth".to_string(),
        RateLimitConfig {
            max_requests: 5,
            window_ms: 15 * 60_000,
            tokens_per_second: 0.1,
            max_tokens: 5.0,
        },
    );
    categories.insert(
        "search".to_string(),
        RateLimitConfig {
            max_requests: 30,
            window_ms: 60_000,
            tokens_per_second: 1.0,
            max_tokens: 10.0,
        },
    );
    categories.insert(
        "admin".to_string(),
        RateLimitConfig {
            max_requests: 50,
            window_ms: 60_000,
            tokens_per_second: 1.0,
            max_tokens: 10.0,
        },
    );
    categories
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub category: String,
    pub identifier: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub tokens: f64,
    pub last_refill: Instant,
    pub requests: VecDeque<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
    pub limit: u32,
    // `reset_at` relative to the moment of the decision
    pub reset_in: Duration,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(self.reset_in)
    }

    // Writes the `X-RateLimit-*` headers; the reset is a unix timestamp.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset_in = chrono::Duration::from_std(self.reset_in)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let reset = (chrono::Utc::now() + reset_in).timestamp();

        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(reset));
    }
}

// Whole seconds to wait, rounded up and never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

pub struct RateLimiter<S = MemoryStore<RateLimitKey, RateLimitEntry>> {
    categories: HashMap<String, RateLimitConfig>,
    fallback: RateLimitConfig,
    store: S,
}

impl RateLimiter {
    pub fn new(categories: HashMap<String, RateLimitConfig>) -> Result<Self, ConfigError> {
        Self::with_store(categories, MemoryStore::new())
    }
}

impl<S> RateLimiter<S>
where
    S: StateStore<RateLimitKey, RateLimitEntry>,
{
    pub fn with_store(
        categories: HashMap<String, RateLimitConfig>,
        store: S,
    ) -> Result<Self, ConfigError> {
        for (category, config) in &categories {
            config.validate(category)?;
        }
        let fallback = categories
            .get(DEFAULT_CATEGORY)
            .cloned()
            .ok_or_else(|| ConfigError::MissingDefaultCategory(DEFAULT_CATEGORY.to_string()))?;
        Ok(Self {
            categories,
            fallback,
            store,
        })
    }

    // Limits for `category`, falling back to the `api` limits.
    pub fn config_for(&self, category: &str) -> &RateLimitConfig {
        self.categories.get(category).unwrap_or(&self.fallback)
    }

    pub fn check(&self, identifier: &str, category: &str) -> RateLimitDecision {
        self.check_at(identifier, category, Instant::now())
    }

    pub fn check_at(&self, identifier: &str, category: &str, now: Instant) -> RateLimitDecision {
        let config = self.config_for(category);
        let window = config.window();
        let limit = config.max_requests;
        let key = RateLimitKey {
            category: category.to_string(),
            identifier: identifier.to_string(),
        };

        self.store.upsert(
            key,
            || RateLimitEntry {
                // the first request is pre-charged
                tokens: config.max_tokens - 1.0,
                last_refill: now,
                requests: VecDeque::from([now]),
            },
            |entry, created| {
                if created {
                    return accepted(entry, now, window, limit);
                }

                let elapsed = now.saturating_duration_since(entry.last_refill).as_secs_f64();
                entry.tokens = (entry.tokens + elapsed * config.tokens_per_second).min(config.max_tokens);
                entry.last_refill = now;

                while let Some(&oldest) = entry.requests.front() {
                    if now.saturating_duration_since(oldest) >= window {
                        entry.requests.pop_front();
                    } else {
                        break;
                    }
                }

                if entry.requests.len() >= limit as usize {
                    let oldest = entry.requests.front().copied().unwrap_or(now);
                    let reset_at = oldest + window;
                    return rejected(entry, now, reset_at, limit);
                }

                if entry.tokens < 1.0 {
                    let wait = (1.0 - entry.tokens) / config.tokens_per_second;
                    let wait = Duration::try_from_secs_f64(wait)
                        .map_or(MAX_REFILL_WAIT, |wait| wait.min(MAX_REFILL_WAIT));
                    let reset_at = now + wait;
                    return rejected(entry, now, reset_at, limit);
                }

                entry.tokens -= 1.0;
                entry.requests.push_back(now);
                accepted(entry, now, window, limit)
            },
        )
    }

    // Forgets `identifier` in every category; returns how many entries went.
    pub fn reset(&self, identifier: &str) -> usize {
        self.store.sweep(|key, _| key.identifier != identifier)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        self.store
            .sweep(|_, entry| now.saturating_duration_since(entry.last_refill) <= STALE_ENTRY_AGE)
    }

    pub fn tracked(&self) -> usize {
        self.store.len()
    }

    pub fn entry(&self, identifier: &str, category: &str) -> Option<RateLimitEntry> {
        self.store.get(&RateLimitKey {
            category: category.to_string(),
            identifier: identifier.to_string(),
        })
    }
}

fn accepted(entry: &RateLimitEntry, now: Instant, window: Duration, limit: u32) -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        remaining: entry.tokens.max(0.0).floor() as u32,
        reset_at: now + window,
        limit,
        reset_in: window,
    }
}

fn rejected(entry: &RateLimitEntry, now: Instant, reset_at: Instant, limit: u32) -> RateLimitDecision {
    RateLimitDecision {
        allowed: false,
        remaining: entry.tokens.max(0.0).floor() as u32,
        reset_at,
        limit,
        reset_in: reset_at.saturating_duration_since(now),
    }
}
