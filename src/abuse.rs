// Per-source burst detection with temporary bans.
//
// Each source IP gets a one-second counting window. Crossing the soft
// per-second limit throttles (429); reaching the burst threshold bans the
// source for `block_duration` (403) and raises a high-severity event.
// Runs before admission control so banned sources never reach it.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ConfigError;
use crate::metrics::ABUSE_BLOCKS_TOTAL;
use crate::rate_limit::STALE_ENTRY_AGE;
use crate::security::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity};
use crate::store::{MemoryStore, StateStore};

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    // In-window count that bans the source
    pub burst_threshold: u32,
    // In-window count above which requests are throttled
    pub max_requests_per_second: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 100,
            max_requests_per_second: 50,
            window: Duration::from_millis(1_000),
            block_duration: Duration::from_secs(60 * 60),
        }
    }
}

impl AbuseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::InvalidAbuseGuard(reason.to_string()));

        if self.max_requests_per_second == 0 {
            return invalid("max requests per second must be at least 1");
        }
        // a ban below the throttle tier would skip the warning entirely
        if self.burst_threshold < self.max_requests_per_second {
            return invalid("burst threshold must be at least max requests per second");
        }
        if self.window.is_zero() {
            return invalid("window must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AbuseEntry {
    pub count: u32,
    pub window_start: Instant,
    pub blocked_until: Option<Instant>,
}

impl AbuseEntry {
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseVerdict {
    Allow,
    Throttle { retry_after: Duration },
    Block { retry_after: Duration },
}

impl AbuseVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, AbuseVerdict::Block { .. })
    }
}

pub struct AbuseGuard<S = MemoryStore<String, AbuseEntry>> {
    config: AbuseConfig,
    store: S,
    events: Arc<dyn SecurityEventSink>,
}

impl AbuseGuard {
    pub fn new(config: AbuseConfig, events: Arc<dyn SecurityEventSink>) -> Self {
        Self::with_store(config, MemoryStore::new(), events)
    }
}

impl<S> AbuseGuard<S>
where
    S: StateStore<String, AbuseEntry>,
{
    pub fn with_store(config: AbuseConfig, store: S, events: Arc<dyn SecurityEventSink>) -> Self {
        Self {
            config,
            store,
            events,
        }
    }

    pub fn check(&self, ip: &str) -> AbuseVerdict {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: &str, now: Instant) -> AbuseVerdict {
        let config = &self.config;

        let (verdict, banned_at_count) = self.store.upsert(
            ip.to_string(),
            || AbuseEntry {
                count: 0,
                window_start: now,
                blocked_until: None,
            },
            |entry, _| {
                if let Some(until) = entry.blocked_until {
                    if now < until {
                        return (AbuseVerdict::Block { retry_after: until - now }, None);
                    }
                    // ban served, start over
                    entry.blocked_until = None;
                    entry.count = 0;
                    entry.window_start = now;
                }

                if now.saturating_duration_since(entry.window_start) > config.window {
                    entry.count = 0;
                    entry.window_start = now;
                }
                entry.count += 1;

                if entry.count >= config.burst_threshold {
                    entry.blocked_until = Some(now + config.block_duration);
                    let verdict = AbuseVerdict::Block {
                        retry_after: config.block_duration,
                    };
                    return (verdict, Some(entry.count));
                }

                if entry.count > config.max_requests_per_second {
                    let window_left = (entry.window_start + config.window).saturating_duration_since(now);
                    return (AbuseVerdict::Throttle { retry_after: window_left }, None);
                }

                (AbuseVerdict::Allow, None)
            },
        );

        // reported outside the store update
        if let Some(count) = banned_at_count {
            ABUSE_BLOCKS_TOTAL.inc();
            warn!(
                ip = ip,
                requests = count,
                block_secs = config.block_duration.as_secs(),
                "Burst detected, blocking source"
            );
            self.events.record(
                SecurityEvent::new(SecurityEventKind::DdosDetected, Severity::High, ip).with_details(json!({
                    "requests": count,
                    "windowMs": config.window.as_millis() as u64,
                    "blockedForSecs": config.block_duration.as_secs(),
                })),
            );
        }

        verdict
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        self.store
            .get(&ip.to_string())
            .is_some_and(|entry| entry.is_blocked(now))
    }

    // Lifts a ban early; returns whether the source was tracked.
    pub fn unblock(&self, ip: &str) -> bool {
        self.store.delete(&ip.to_string())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    // Drops sources that are not banned and have been quiet for a while.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.store.sweep(|_, entry| {
            entry.is_blocked(now) || now.saturating_duration_since(entry.window_start) <= STALE_ENTRY_AGE
        })
    }

    pub fn tracked(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SecurityEvent>>);

    impl SecurityEventSink for Recorder {
        fn record(&self, event: SecurityEvent) {
            self.0.lock().push(event);
        }
    }

    fn guard() -> (AbuseGuard, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (AbuseGuard::new(AbuseConfig::default(), recorder.clone()), recorder)
    }

    #[test]
    fn hundredth_request_in_a_second_bans_the_source() {
        let (guard, events) = guard();
        let start = Instant::now();

        for i in 0..99 {
            let verdict = guard.check_at("10.0.0.1", start + Duration::from_millis(i * 5));
            assert!(!verdict.is_blocked(), "request {} must not be banned", i + 1);
        }
        assert!(events.0.lock().is_empty());

        let hundredth = guard.check_at("10.0.0.1", start + Duration::from_millis(500));
        assert_eq!(
            hundredth,
            AbuseVerdict::Block {
                retry_after: Duration::from_secs(3600)
            }
        );

        let recorded = events.0.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, SecurityEventKind::DdosDetected);
        assert_eq!(recorded[0].severity, Severity::High);
    }

    #[test]
    fn ban_holds_until_expiry_then_resets() {
        let (guard, events) = guard();
        let start = Instant::now();
        for _ in 0..100 {
            guard.check_at("10.0.0.2", start);
        }

        let mid_ban = guard.check_at("10.0.0.2", start + Duration::from_secs(1800));
        assert_eq!(
            mid_ban,
            AbuseVerdict::Block {
                retry_after: Duration::from_secs(1800)
            }
        );
        // bans are only announced once
        assert_eq!(events.0.lock().len(), 1);

        let after = guard.check_at("10.0.0.2", start + Duration::from_secs(3600));
        assert_eq!(after, AbuseVerdict::Allow);
        assert_eq!(guard.store.get(&"10.0.0.2".to_string()).unwrap().count, 1);
    }

    #[test]
    fn soft_limit_throttles_before_banning() {
        let (guard, _) = guard();
        let start = Instant::now();

        for _ in 0..50 {
            assert_eq!(guard.check_at("10.0.0.3", start), AbuseVerdict::Allow);
        }
        let verdict = guard.check_at("10.0.0.3", start + Duration::from_millis(250));
        assert_eq!(
            verdict,
            AbuseVerdict::Throttle {
                retry_after: Duration::from_millis(750)
            }
        );
    }

    #[test]
    fn window_resets_after_a_second() {
        let (guard, _) = guard();
        let start = Instant::now();

        for _ in 0..60 {
            guard.check_at("10.0.0.4", start);
        }
        let next_window = guard.check_at("10.0.0.4", start + Duration::from_millis(1_001));
        assert_eq!(next_window, AbuseVerdict::Allow);
    }

    #[test]
    fn sources_are_independent() {
        let (guard, _) = guard();
        let start = Instant::now();
        for _ in 0..100 {
            guard.check_at("10.0.0.5", start);
        }
        assert_eq!(guard.check_at("10.0.0.6", start), AbuseVerdict::Allow);
    }

    #[test]
    fn sweep_keeps_active_bans() {
        let (guard, _) = guard();
        let start = Instant::now();
        for _ in 0..100 {
            guard.check_at("banned", start);
        }
        guard.check_at("quiet", start);

        assert_eq!(guard.sweep_at(start + Duration::from_secs(600)), 1);
        assert_eq!(guard.tracked(), 1);
        assert!(guard.unblock("banned"));
        assert_eq!(guard.tracked(), 0);
    }
}
