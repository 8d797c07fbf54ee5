//! Event system for the dispatcher.
//!
//! Provides hooks for metrics, logging, and custom reactions around request
//! lifecycle activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

/// A logical request entered the queue.
#[derive(Debug, Clone)]
pub struct SubmittedEvent {
    pub request_id: u64,
    pub url: Url,
    pub timestamp: DateTime<Utc>,
}

/// A transport attempt is about to be issued.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub request_id: u64,
    pub attempt: u32,
    pub url: Url,
    pub proxy_id: Option<String>,
    pub session_id: String,
    pub fingerprint_id: String,
    pub timestamp: DateTime<Utc>,
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Blocked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub request_id: u64,
    pub attempt: u32,
    pub url: Url,
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub outcome: AttemptStatus,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub request_id: u64,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A proxied attempt failed at connection level and is retried direct.
#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub request_id: u64,
    pub proxy_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Cooldown,
    RetriesExhausted,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct RejectedEvent {
    pub request_id: u64,
    pub url: Url,
    pub reason: RejectReason,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Submitted(SubmittedEvent),
    Attempt(AttemptEvent),
    Completed(CompletedEvent),
    Retry(RetryEvent),
    Fallback(FallbackEvent),
    Rejected(RejectedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DispatchEvent);
}

/// Broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: DispatchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Submitted(submitted) => {
                log::debug!("queued #{} {}", submitted.request_id, submitted.url);
            }
            DispatchEvent::Attempt(attempt) => {
                log::debug!(
                    "-> #{} attempt {} {} via {} (session {}, fingerprint {})",
                    attempt.request_id,
                    attempt.attempt,
                    attempt.url,
                    attempt.proxy_id.as_deref().unwrap_or("direct"),
                    attempt.session_id,
                    attempt.fingerprint_id
                );
            }
            DispatchEvent::Completed(done) => {
                let status = done
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no response".into());
                log::debug!(
                    "<- #{} attempt {} {} -> {} {:?} ({:.2}s)",
                    done.request_id,
                    done.attempt,
                    done.url,
                    status,
                    done.outcome,
                    done.latency.as_secs_f64()
                );
            }
            DispatchEvent::Retry(retry) => {
                log::info!(
                    "retry #{} attempt {} after {:.2}s: {}",
                    retry.request_id,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            DispatchEvent::Fallback(fallback) => {
                log::warn!(
                    "proxy {} failed for #{} ({}), retrying direct",
                    fallback.proxy_id,
                    fallback.request_id,
                    fallback.error
                );
            }
            DispatchEvent::Rejected(rejected) => {
                log::warn!(
                    "rejected #{} {} ({:?}): {}",
                    rejected.request_id,
                    rejected.url,
                    rejected.reason,
                    rejected.error
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Attempt(attempt) => {
                self.metrics.record_attempt(attempt.url.host_str().unwrap_or(""));
            }
            DispatchEvent::Completed(done) => {
                let host = done.url.host_str().unwrap_or("");
                match (done.outcome, done.status) {
                    (AttemptStatus::Success, Some(status)) => {
                        self.metrics.record_success(host, status, done.latency)
                    }
                    (AttemptStatus::Blocked, Some(status)) => {
                        self.metrics.record_block(host, status, done.latency)
                    }
                    (AttemptStatus::Failed, Some(status)) => {
                        self.metrics.record_failure(host, status, done.latency)
                    }
                    (_, None) => self.metrics.record_transport_failure(host),
                }
            }
            DispatchEvent::Fallback(_) => self.metrics.record_fallback(),
            DispatchEvent::Rejected(rejected) => match rejected.reason {
                RejectReason::Cooldown => self.metrics.record_cooldown_rejection(),
                RejectReason::RetriesExhausted => self.metrics.record_retries_exhausted(),
                RejectReason::Fatal => {}
            },
            DispatchEvent::Submitted(_) | DispatchEvent::Retry(_) => {}
        }
    }
}
