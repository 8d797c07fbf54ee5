//! Rate and health governor.
//!
//! Tracks failed attempts and recent throughput for the whole process. When
//! failures accumulate past `max_errors` the governor opens a cooldown window
//! during which nothing may be sent; a throttle check separately flags bursts
//! inside the rolling throughput window.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::modules::clock::{SharedClock, saturating_add, saturating_sub};

const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Thresholds driving the governor.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Failures that open a cooldown.
    pub max_errors: u32,
    pub cooldown: Duration,
    pub throttle_window: Duration,
    /// Requests tolerated inside `throttle_window` before throttling.
    pub throttle_threshold: usize,
    pub history_limit: usize,
    /// Interval of the background counter reset.
    pub reset_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            cooldown: Duration::from_secs(60),
            throttle_window: Duration::from_secs(60),
            throttle_threshold: 30,
            history_limit: DEFAULT_HISTORY_LIMIT,
            reset_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Normal,
    /// Failures recorded but below the cooldown threshold.
    Degraded,
    Cooldown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("cooldown active for another {remaining:?}")]
    CooldownActive { remaining: Duration },
}

/// One completed attempt. `status` is `None` for connection-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: GovernorState,
    pub error_count: u32,
    pub cooldown_remaining: Option<Duration>,
    pub requests_in_window: usize,
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct HealthState {
    history: VecDeque<HistoryEntry>,
    error_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl HealthState {
    fn push(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push_back(entry);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| now < *until)
            .and_then(|until| (until - now).to_std().ok())
    }

    fn requests_since(&self, since: DateTime<Utc>) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|entry| entry.at > since)
            .count()
    }
}

/// Process-wide health tracker. Clones share state.
#[derive(Debug, Clone)]
pub struct HealthGovernor {
    config: GovernorConfig,
    clock: SharedClock,
    state: Arc<Mutex<HealthState>>,
}

impl HealthGovernor {
    pub fn new(config: GovernorConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Arc::new(Mutex::new(HealthState::default())),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails with [`GovernorError::CooldownActive`] while a cooldown is open.
    pub fn may_proceed(&self) -> Result<(), GovernorError> {
        let now = self.clock.now();
        match self.lock().cooldown_remaining(now) {
            Some(remaining) => Err(GovernorError::CooldownActive { remaining }),
            None => Ok(()),
        }
    }

    /// True when issuing one more request would exceed the throttle threshold.
    pub fn should_throttle(&self) -> bool {
        let now = self.clock.now();
        let since = saturating_sub(now, self.config.throttle_window);
        let recent = self.lock().requests_since(since);
        recent + 1 > self.config.throttle_threshold
    }

    /// Record a received response. Successes never decay the error counter.
    pub fn record_success(&self, status: u16) {
        let now = self.clock.now();
        self.lock().push(
            HistoryEntry {
                at: now,
                status: Some(status),
            },
            self.config.history_limit,
        );
    }

    /// Record a failed attempt and open a cooldown once the threshold is hit.
    pub fn record_failure(&self, status: Option<u16>) -> GovernorState {
        let now = self.clock.now();
        let mut state = self.lock();
        state.push(HistoryEntry { at: now, status }, self.config.history_limit);
        state.error_count = state.error_count.saturating_add(1);

        if state.error_count >= self.config.max_errors.max(1) {
            let until = saturating_add(now, self.config.cooldown);
            state.cooldown_until = Some(match state.cooldown_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
            state.error_count = 0;
            log::warn!(
                "error threshold reached, cooling down for {:?}",
                self.config.cooldown
            );
            return GovernorState::Cooldown;
        }

        Self::classify(&state, now)
    }

    /// Zero the error counter, leaving any open cooldown in place.
    pub fn reset_errors(&self) {
        self.lock().error_count = 0;
    }

    /// Return to a neutral state: counter cleared and cooldown lifted.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.error_count = 0;
        state.cooldown_until = None;
        log::info!("governor reset");
    }

    pub fn error_count(&self) -> u32 {
        self.lock().error_count
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.lock().cooldown_until
    }

    pub fn state(&self) -> GovernorState {
        let now = self.clock.now();
        Self::classify(&self.lock(), now)
    }

    fn classify(state: &HealthState, now: DateTime<Utc>) -> GovernorState {
        if state.cooldown_remaining(now).is_some() {
            GovernorState::Cooldown
        } else if state.error_count > 0 {
            GovernorState::Degraded
        } else {
            GovernorState::Normal
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let since = saturating_sub(now, self.config.throttle_window);
        let state = self.lock();
        HealthSnapshot {
            state: Self::classify(&state, now),
            error_count: state.error_count,
            cooldown_remaining: state.cooldown_remaining(now),
            requests_in_window: state.requests_since(since),
            history_len: state.history.len(),
        }
    }

    /// Spawn the periodic counter reset. The caller owns the handle.
    pub fn spawn_reset_task(&self) -> JoinHandle<()> {
        let governor = self.clone();
        let period = self.config.reset_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                governor.reset_errors();
                log::debug!("periodic error counter reset");
            }
        })
    }
}
