use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::abuse::AbuseGuard;
use crate::metrics::{ABUSE_ENTRIES, RATE_LIMIT_ENTRIES, SECURITY_EVENTS};
use crate::rate_limit::RateLimiter;
use crate::security::{SecurityEvent, Severity};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// Periodically drop idle rate-limit and abuse entries to bound memory
pub async fn sweep_worker(limiter: Arc<RateLimiter>, abuse: Arc<AbuseGuard>, every: Duration) {
    let mut interval = interval(every);
    info!(interval = ?every, "Sweep worker started");

    loop {
        interval.tick().await;

        let limits = limiter.sweep();
        let sources = abuse.sweep();
        RATE_LIMIT_ENTRIES.set(limiter.tracked() as f64);
        ABUSE_ENTRIES.set(abuse.tracked() as f64);

        if limits + sources > 0 {
            debug!(rate_limit_entries = limits, abuse_entries = sources, "Swept stale entries");
        }
    }
}

// Drains queued security events and logs them by severity
pub async fn security_event_worker(mut rx: mpsc::Receiver<SecurityEvent>) {
    info!("Security event worker started");

    while let Some(event) = rx.recv().await {
        SECURITY_EVENTS
            .with_label_values(&[event.severity.as_str()])
            .inc();

        let details = event.details.to_string();
        match event.severity {
            Severity::Critical | Severity::High => error!(
                kind = ?event.kind,
                severity = event.severity.as_str(),
                ip = %event.ip,
                path = ?event.path,
                user_agent = ?event.user_agent,
                details = %details,
                "Security event"
            ),
            Severity::Medium => warn!(
                kind = ?event.kind,
                severity = event.severity.as_str(),
                ip = %event.ip,
                path = ?event.path,
                details = %details,
                "Security event"
            ),
            Severity::Low => info!(
                kind = ?event.kind,
                ip = %event.ip,
                path = ?event.path,
                details = %details,
                "Security event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{ChannelEventSink, SecurityEventKind, SecurityEventSink};

    #[tokio::test]
    async fn event_worker_counts_by_severity() {
        let (sink, rx) = ChannelEventSink::new(8);
        let before = SECURITY_EVENTS.with_label_values(&["critical"]).get();

        sink.record(SecurityEvent::new(SecurityEventKind::DdosDetected, Severity::Critical, "1.2.3.4"));
        drop(sink);
        security_event_worker(rx).await;

        assert_eq!(SECURITY_EVENTS.with_label_values(&["critical"]).get(), before + 1);
    }
}
