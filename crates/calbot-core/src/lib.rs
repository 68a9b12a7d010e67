//! Resilience primitives for the calbot scheduling-bot runtime.
//!
//! Provides the persisted circuit breaker guarding the free-text query path,
//! the single-instance session guard, the date-partitioned audit log, and the
//! shared health counters that make swallowed soft-component failures visible.

pub mod atomic_io;
pub mod audit_log;
pub mod circuit_breaker;
pub mod health;
pub mod session_guard;
pub mod time_utils;

pub use atomic_io::{remove_file_if_exists, write_text_atomic};
pub use audit_log::{AuditLog, AuditLogConfig, DEFAULT_AUDIT_RETENTION_DAYS};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitFailureOutcome,
    CircuitPosture, CircuitState,
};
pub use health::{HealthCounters, HealthSnapshot};
pub use session_guard::{
    read_holder_pid, LivenessProbe, SessionGuard, SessionGuardError, SessionLock,
    SignalLivenessProbe,
};
pub use time_utils::{
    current_unix_timestamp_ms, format_iso8601_ms, parse_iso8601_ms, system_clock, utc_date_for,
    ClockFn,
};
