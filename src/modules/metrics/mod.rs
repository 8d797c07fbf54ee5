//! Metrics collection utilities.
//!
//! Aggregates dispatch counters globally and per target host, with latency
//! average and p95 over a sliding window of samples.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_WINDOW: usize = 128;

/// Process-wide dispatch counters.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub attempts: u64,
    pub successes: u64,
    pub blocks: u64,
    pub failures: u64,
    pub transport_failures: u64,
    pub direct_fallbacks: u64,
    pub cooldown_rejections: u64,
    pub retries_exhausted: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            attempts: 0,
            successes: 0,
            blocks: 0,
            failures: 0,
            transport_failures: 0,
            direct_fallbacks: 0,
            cooldown_rejections: 0,
            retries_exhausted: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Host-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct HostStats {
    pub host: String,
    pub attempts: u64,
    pub successes: u64,
    pub blocks: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_status: Option<u16>,
}

impl HostStats {
    fn from_accumulator(host: &str, acc: &HostAccumulator) -> Self {
        let (avg, p95) = latency_stats(acc.latencies.iter().copied());
        Self {
            host: host.to_string(),
            attempts: acc.attempts,
            successes: acc.successes,
            blocks: acc.blocks,
            failures: acc.failures,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
}

impl MetricsSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostStats> {
        self.hosts.iter().find(|stats| stats.host == host)
    }
}

#[derive(Debug)]
struct HostAccumulator {
    attempts: u64,
    successes: u64,
    blocks: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_status: Option<u16>,
}

impl HostAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            blocks: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_status: None,
        }
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn fail(&mut self, status: Option<u16>) {
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_status = status;
    }
}

fn latency_stats(samples: impl Iterator<Item = Duration>) -> (Option<Duration>, Option<Duration>) {
    let mut samples: Vec<_> = samples.collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    hosts: HashMap<String, HostAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            hosts: HashMap::new(),
        }
    }

    fn host_mut(&mut self, host: &str) -> &mut HostAccumulator {
        let window = self.max_window;
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostAccumulator::new(window))
    }

    fn refresh_latency(&mut self) {
        let (avg, p95) = latency_stats(
            self.hosts
                .values()
                .flat_map(|host| host.latencies.iter().copied()),
        );
        self.global.average_latency = avg;
        self.global.p95_latency = p95;
    }
}

/// Thread-safe metrics collector shared by the dispatcher workers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_attempt(&self, host: &str) {
        let mut guard = self.lock();
        guard.global.attempts += 1;
        guard.host_mut(host).attempts += 1;
    }

    pub fn record_success(&self, host: &str, status: u16, latency: Duration) {
        let mut guard = self.lock();
        guard.global.successes += 1;
        let acc = guard.host_mut(host);
        acc.successes += 1;
        acc.consecutive_failures = 0;
        acc.last_status = Some(status);
        acc.push_latency(latency);
        guard.refresh_latency();
    }

    pub fn record_block(&self, host: &str, status: u16, latency: Duration) {
        let mut guard = self.lock();
        guard.global.blocks += 1;
        let acc = guard.host_mut(host);
        acc.blocks += 1;
        acc.fail(Some(status));
        acc.push_latency(latency);
        guard.refresh_latency();
    }

    /// A response that is neither success nor block (e.g. 5xx).
    pub fn record_failure(&self, host: &str, status: u16, latency: Duration) {
        let mut guard = self.lock();
        guard.global.failures += 1;
        let acc = guard.host_mut(host);
        acc.fail(Some(status));
        acc.push_latency(latency);
        guard.refresh_latency();
    }

    pub fn record_transport_failure(&self, host: &str) {
        let mut guard = self.lock();
        guard.global.failures += 1;
        guard.global.transport_failures += 1;
        guard.host_mut(host).fail(None);
    }

    pub fn record_fallback(&self) {
        self.lock().global.direct_fallbacks += 1;
    }

    pub fn record_cooldown_rejection(&self) {
        self.lock().global.cooldown_rejections += 1;
    }

    pub fn record_retries_exhausted(&self) {
        self.lock().global.retries_exhausted += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let hosts = guard
            .hosts
            .iter()
            .map(|(host, acc)| HostStats::from_accumulator(host, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            hosts,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
