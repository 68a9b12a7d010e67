//! File-backed circuit breaker for the free-text query path.
//!
//! State lives in a small JSON file (`failures`, `lastFailure`, `openedAt`).
//! A missing file means closed with zero failures. Reads that fail are treated
//! as "no prior state" so the query path stays available; writes that fail are
//! logged and counted. The read-modify-write cycle takes no lock of its own and
//! relies on the session guard for single-writer access.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::atomic_io::{remove_file_if_exists, write_text_atomic};
use crate::health::HealthCounters;
use crate::time_utils::{format_iso8601_ms, parse_iso8601_ms, system_clock, ClockFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 10 * 60 * 1_000,
        }
    }
}

/// Persisted breaker state. `opened_at` is set exactly when `failures`
/// reaches the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub failures: u32,
    pub last_failure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPosture {
    Closed,
    Open,
}

impl CircuitPosture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitPosture,
    pub failures: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub last_failure: Option<String>,
    pub opened_at: Option<String>,
    pub open_until: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitFailureOutcome {
    pub failures: u32,
    /// True only for the failure that first reached the threshold.
    pub opened: bool,
}

pub struct CircuitBreaker {
    state_path: PathBuf,
    config: CircuitBreakerConfig,
    clock: ClockFn,
    health: Option<Arc<HealthCounters>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state_path", &self.state_path)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(state_path: impl Into<PathBuf>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(state_path, config, system_clock())
    }

    pub fn with_clock(
        state_path: impl Into<PathBuf>,
        config: CircuitBreakerConfig,
        clock: ClockFn,
    ) -> Self {
        Self {
            state_path: state_path.into(),
            config,
            clock,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthCounters>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn threshold(&self) -> u32 {
        self.config.failure_threshold.max(1)
    }

    /// Loads persisted state; unreadable or malformed state reads as `None`.
    /// An `openedAt` stamp on state below the current threshold is dropped.
    pub fn load_state(&self) -> Option<CircuitState> {
        let raw = match std::fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(
                    path = %self.state_path.display(),
                    error = %error,
                    "circuit state unreadable; treating breaker as closed"
                );
                return None;
            }
        };
        match serde_json::from_str::<CircuitState>(&raw) {
            Ok(mut state) => {
                if state.failures < self.threshold() {
                    state.opened_at = None;
                }
                Some(state)
            }
            Err(error) => {
                warn!(
                    path = %self.state_path.display(),
                    error = %error,
                    "circuit state malformed; treating breaker as closed"
                );
                None
            }
        }
    }

    fn opened_at_ms(state: &CircuitState) -> Option<u64> {
        state
            .opened_at
            .as_deref()
            .and_then(parse_iso8601_ms)
            .or_else(|| parse_iso8601_ms(&state.last_failure))
    }

    /// Returns true while the breaker is open. The first check after the
    /// cooldown has elapsed resets the persisted state and reports closed.
    pub fn is_open(&self) -> bool {
        let Some(state) = self.load_state() else {
            return false;
        };
        if state.failures < self.threshold() {
            return false;
        }
        let now_unix_ms = (self.clock)();
        let Some(opened_at_ms) = Self::opened_at_ms(&state) else {
            self.reset();
            return false;
        };
        if now_unix_ms.saturating_sub(opened_at_ms) > self.config.cooldown_ms {
            info!(
                failures = state.failures,
                cooldown_ms = self.config.cooldown_ms,
                "circuit cooldown elapsed; closing"
            );
            self.reset();
            return false;
        }
        true
    }

    pub fn record_failure(&self) -> CircuitFailureOutcome {
        let now = format_iso8601_ms((self.clock)());
        let mut state = self.load_state().unwrap_or(CircuitState {
            failures: 0,
            last_failure: now.clone(),
            opened_at: None,
        });
        state.failures = state.failures.saturating_add(1);
        state.last_failure = now.clone();
        let mut opened = false;
        if state.failures >= self.threshold() && state.opened_at.is_none() {
            state.opened_at = Some(now);
            opened = true;
            warn!(
                failures = state.failures,
                cooldown_ms = self.config.cooldown_ms,
                "circuit opened"
            );
        }
        self.persist(&state);
        CircuitFailureOutcome {
            failures: state.failures,
            opened,
        }
    }

    pub fn record_success(&self) {
        self.reset();
    }

    /// Best-effort removal of the persisted state. Idempotent.
    pub fn reset(&self) {
        if let Err(error) = remove_file_if_exists(&self.state_path) {
            warn!(error = %error, "circuit reset failed");
            self.count_persist_failure();
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let threshold = self.threshold();
        let mut status = CircuitBreakerStatus {
            state: CircuitPosture::Closed,
            failures: 0,
            failure_threshold: threshold,
            cooldown_ms: self.config.cooldown_ms,
            last_failure: None,
            opened_at: None,
            open_until: None,
        };
        let Some(state) = self.load_state() else {
            return status;
        };
        status.failures = state.failures;
        status.last_failure = Some(state.last_failure.clone());
        status.opened_at = state.opened_at.clone();
        if state.failures >= threshold {
            if let Some(opened_at_ms) = Self::opened_at_ms(&state) {
                let open_until_ms = opened_at_ms.saturating_add(self.config.cooldown_ms);
                if (self.clock)() <= open_until_ms {
                    status.state = CircuitPosture::Open;
                    status.open_until = Some(format_iso8601_ms(open_until_ms));
                }
            }
        }
        status
    }

    fn persist(&self, state: &CircuitState) {
        let encoded = match serde_json::to_string_pretty(state) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(error = %error, "failed to encode circuit state");
                self.count_persist_failure();
                return;
            }
        };
        if let Err(error) = write_text_atomic(&self.state_path, &encoded) {
            warn!(error = %error, "failed to persist circuit state");
            self.count_persist_failure();
        }
    }

    fn count_persist_failure(&self) {
        if let Some(health) = &self.health {
            health.record_breaker_persist_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::{CircuitBreaker, CircuitBreakerConfig, CircuitPosture, CircuitState};
    use crate::health::HealthCounters;

    const START_MS: u64 = 1_710_072_000_000;

    fn breaker_with_clock(path: &std::path::Path, now: Arc<AtomicU64>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            path,
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 600_000,
            },
            Arc::new(move || now.load(Ordering::SeqCst)),
        )
    }

    #[test]
    fn unit_defaults_match_reference_behavior() {
        let defaults = CircuitBreakerConfig::default();
        assert_eq!(defaults.failure_threshold, 3);
        assert_eq!(defaults.cooldown_ms, 600_000);
    }

    #[test]
    fn unit_missing_state_is_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&temp.path().join("breaker.json"), now);
        assert!(!breaker.is_open());
        assert_eq!(breaker.status().state, CircuitPosture::Closed);
    }

    #[test]
    fn functional_breaker_opens_at_threshold_and_closes_after_cooldown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("breaker.json");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&path, now.clone());

        let first = breaker.record_failure();
        let second = breaker.record_failure();
        assert!(!first.opened && !second.opened);
        assert!(!breaker.is_open(), "below threshold stays closed");

        let third = breaker.record_failure();
        assert!(third.opened);
        assert_eq!(third.failures, 3);
        assert!(breaker.is_open());
        assert!(breaker.is_open(), "repeated checks stay open");

        now.store(START_MS + 600_000, Ordering::SeqCst);
        assert!(breaker.is_open(), "cooldown must be exceeded, not just reached");

        now.store(START_MS + 600_001, Ordering::SeqCst);
        assert!(!breaker.is_open());
        assert!(!path.exists(), "cooldown expiry clears persisted state");
    }

    #[test]
    fn regression_stale_opened_at_below_threshold_is_restamped_on_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("breaker.json");
        std::fs::write(
            &path,
            r#"{"failures":2,"lastFailure":"2024-03-01T00:00:00.000Z","openedAt":"2024-03-01T00:00:00.000Z"}"#,
        )
        .expect("seed state from a lower threshold");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&path, now);

        assert_eq!(breaker.load_state().expect("state").opened_at, None);
        let outcome = breaker.record_failure();
        assert!(outcome.opened);
        assert_eq!(
            breaker.load_state().expect("state").opened_at.as_deref(),
            Some("2024-03-10T12:00:00.000Z")
        );
        assert!(breaker.is_open(), "fresh stamp keeps the full cooldown");
    }

    #[test]
    fn functional_persisted_state_uses_camel_case_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("breaker.json");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&path, now);

        breaker.record_failure();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["failures"], 1);
        assert_eq!(raw["lastFailure"], "2024-03-10T12:00:00.000Z");
        assert!(raw.get("openedAt").is_none());

        breaker.record_failure();
        breaker.record_failure();
        let state: CircuitState =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("state");
        assert_eq!(state.opened_at.as_deref(), Some("2024-03-10T12:00:00.000Z"));
    }

    #[test]
    fn functional_success_resets_regardless_of_failure_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("breaker.json");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&path, now);

        for _ in 0..7 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(!path.exists());
        breaker.reset();
    }

    #[test]
    fn unit_opened_at_is_stamped_once_per_opening() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&temp.path().join("breaker.json"), now.clone());

        for _ in 0..3 {
            breaker.record_failure();
        }
        now.fetch_add(5_000, Ordering::SeqCst);
        let late = breaker.record_failure();
        assert!(!late.opened);
        assert_eq!(late.failures, 4);
        let status = breaker.status();
        assert_eq!(status.state, CircuitPosture::Open);
        assert_eq!(status.opened_at.as_deref(), Some("2024-03-10T12:00:00.000Z"));
        assert_eq!(status.open_until.as_deref(), Some("2024-03-10T12:10:00.000Z"));
    }

    #[test]
    fn regression_malformed_state_fails_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("breaker.json");
        std::fs::write(&path, "{ not json").expect("seed");
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(&path, now);

        assert!(!breaker.is_open());
        let outcome = breaker.record_failure();
        assert_eq!(outcome.failures, 1, "malformed state restarts the count");
    }

    #[test]
    fn regression_persist_failure_is_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let health = Arc::new(HealthCounters::default());
        let now = Arc::new(AtomicU64::new(START_MS));
        let breaker = breaker_with_clock(temp.path(), now).with_health(health.clone());

        breaker.record_failure();
        assert_eq!(health.snapshot().breaker_persist_failures, 1);
    }
}
