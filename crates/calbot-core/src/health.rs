//! Process-local counters for failures that soft components swallow.
//!
//! The audit log, breaker persistence, and notification dispatch never raise
//! into the request path. Each swallowed failure bumps a counter here so the
//! loss is observable through `/status` and the `health` subcommand.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct HealthCounters {
    audit_write_failures: AtomicU64,
    audit_prune_failures: AtomicU64,
    breaker_persist_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    watchdog_expirations: AtomicU64,
    late_completions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub audit_write_failures: u64,
    pub audit_prune_failures: u64,
    pub breaker_persist_failures: u64,
    pub dispatch_failures: u64,
    pub watchdog_expirations: u64,
    pub late_completions: u64,
}

impl HealthSnapshot {
    /// Total failures swallowed by soft components.
    pub fn swallowed_failures(&self) -> u64 {
        self.audit_write_failures
            .saturating_add(self.audit_prune_failures)
            .saturating_add(self.breaker_persist_failures)
            .saturating_add(self.dispatch_failures)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl HealthCounters {
    pub fn record_audit_write_failure(&self) {
        bump(&self.audit_write_failures);
    }

    pub fn record_audit_prune_failure(&self) {
        bump(&self.audit_prune_failures);
    }

    pub fn record_breaker_persist_failure(&self) {
        bump(&self.breaker_persist_failures);
    }

    pub fn record_dispatch_failure(&self) {
        bump(&self.dispatch_failures);
    }

    pub fn record_watchdog_expiration(&self) {
        bump(&self.watchdog_expirations);
    }

    pub fn record_late_completion(&self) {
        bump(&self.late_completions);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
            audit_prune_failures: self.audit_prune_failures.load(Ordering::Relaxed),
            breaker_persist_failures: self.breaker_persist_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            watchdog_expirations: self.watchdog_expirations.load(Ordering::Relaxed),
            late_completions: self.late_completions.load(Ordering::Relaxed),
        }
    }
}
