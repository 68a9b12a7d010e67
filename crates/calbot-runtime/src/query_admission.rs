//! Single-slot admission for free-text queries.
//!
//! At most one query is in flight. A second query while the slot is taken is
//! answered `Busy` without running the backend or reading the breaker; an open
//! breaker answers `Disabled`. Admitted queries hold the slot until they finish
//! or until the watchdog frees it. The watchdog never cancels the backend call:
//! a late completion still updates breaker and audit state, but the slot is
//! tagged with a generation so a late completion cannot free a newer query's
//! slot.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use calbot_core::{AuditLog, CircuitBreaker, CircuitFailureOutcome, HealthCounters};
use calbot_notify::{
    to_rich_text, NotificationDispatcher, NotificationMessage, NotificationPriority, RichText,
};

use crate::query_backend::QueryBackend;

const FAILURE_DETAIL_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryAdmissionConfig {
    pub watchdog_timeout: Duration,
}

impl Default for QueryAdmissionConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Completed {
        reply: String,
        /// The watchdog had already freed the slot when the reply arrived.
        late: bool,
    },
    Failed {
        detail: String,
        breaker_opened: bool,
        late: bool,
    },
    /// Another query holds the slot.
    Busy,
    /// The circuit breaker is open.
    Disabled,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Busy => "busy",
            Self::Disabled => "disabled",
        }
    }

    /// Chat reply for this outcome, as rich markup.
    pub fn reply_markup(&self) -> String {
        match self {
            Self::Completed { reply, .. } => to_rich_text(reply),
            Self::Failed { detail, .. } => RichText::new()
                .bold("That query failed.")
                .line_break()
                .code(&truncate_detail(detail))
                .into_string(),
            Self::Busy => RichText::new()
                .text("Another query is still running. Please retry in a moment.")
                .into_string(),
            Self::Disabled => RichText::new()
                .bold("Queries are temporarily disabled")
                .text(" after repeated failures. Please try again later.")
                .into_string(),
        }
    }
}

fn truncate_detail(detail: &str) -> String {
    if detail.chars().count() <= FAILURE_DETAIL_MAX_CHARS {
        return detail.to_string();
    }
    detail.chars().take(FAILURE_DETAIL_MAX_CHARS).collect::<String>() + "..."
}

/// In-flight slot. `holder` is the generation currently owning it.
#[derive(Debug, Default)]
struct QuerySlot {
    holder: Option<u64>,
    last_generation: u64,
}

impl QuerySlot {
    fn claim(&mut self) -> Option<u64> {
        if self.holder.is_some() {
            return None;
        }
        self.last_generation = self.last_generation.wrapping_add(1);
        self.holder = Some(self.last_generation);
        self.holder
    }

    /// Frees the slot only if `generation` still holds it.
    fn release(&mut self, generation: u64) -> bool {
        if self.holder == Some(generation) {
            self.holder = None;
            return true;
        }
        false
    }
}

fn lock_slot(slot: &Mutex<QuerySlot>) -> MutexGuard<'_, QuerySlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct QueryAdmissionController {
    backend: Arc<dyn QueryBackend>,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<AuditLog>,
    health: Arc<HealthCounters>,
    alerts: Option<Arc<NotificationDispatcher>>,
    config: QueryAdmissionConfig,
    slot: Arc<Mutex<QuerySlot>>,
}

impl QueryAdmissionController {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<AuditLog>,
        health: Arc<HealthCounters>,
        config: QueryAdmissionConfig,
    ) -> Self {
        Self {
            backend,
            breaker,
            audit,
            health,
            alerts: None,
            config,
            slot: Arc::new(Mutex::new(QuerySlot::default())),
        }
    }

    /// Broadcasts an elevated notification whenever a failure opens the breaker.
    pub fn with_alerts(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.alerts = Some(dispatcher);
        self
    }

    pub fn is_in_flight(&self) -> bool {
        lock_slot(&self.slot).holder.is_some()
    }

    pub async fn admit(&self, query: &str) -> AdmissionOutcome {
        let generation = {
            let mut slot = lock_slot(&self.slot);
            if slot.holder.is_some() {
                drop(slot);
                debug!("query rejected: slot busy");
                self.audit.record(
                    "query_rejected_busy",
                    json!({"query_chars": query.chars().count()}),
                );
                return AdmissionOutcome::Busy;
            }
            if self.breaker.is_open() {
                drop(slot);
                info!("query rejected: circuit open");
                self.audit.record(
                    "query_rejected_circuit_open",
                    json!({"query_chars": query.chars().count()}),
                );
                return AdmissionOutcome::Disabled;
            }
            match slot.claim() {
                Some(generation) => generation,
                None => return AdmissionOutcome::Busy,
            }
        };

        self.audit.record(
            "query_started",
            json!({
                "generation": generation,
                "query_chars": query.chars().count(),
                "watchdog_ms": self.config.watchdog_timeout.as_millis() as u64,
            }),
        );
        let watchdog = self.spawn_watchdog(generation);
        let started = Instant::now();
        let result = self.backend.run_query(query).await;
        watchdog.abort();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let late = !lock_slot(&self.slot).release(generation);
        if late {
            warn!(generation, elapsed_ms, "query completed after watchdog expiry");
            self.health.record_late_completion();
        }

        match result {
            Ok(reply) => {
                self.breaker.record_success();
                self.audit.record(
                    "query_completed",
                    json!({
                        "generation": generation,
                        "elapsed_ms": elapsed_ms,
                        "late": late,
                        "reply_chars": reply.chars().count(),
                    }),
                );
                AdmissionOutcome::Completed { reply, late }
            }
            Err(error) => {
                let detail = error.to_string();
                let outcome = self.breaker.record_failure();
                warn!(generation, failures = outcome.failures, error = %detail, "query failed");
                self.audit.record(
                    "query_failed",
                    json!({
                        "generation": generation,
                        "elapsed_ms": elapsed_ms,
                        "late": late,
                        "failures": outcome.failures,
                        "error": detail,
                    }),
                );
                if outcome.opened {
                    self.on_breaker_opened(outcome, &detail).await;
                }
                AdmissionOutcome::Failed {
                    detail,
                    breaker_opened: outcome.opened,
                    late,
                }
            }
        }
    }

    fn spawn_watchdog(&self, generation: u64) -> tokio::task::JoinHandle<()> {
        let slot = Arc::clone(&self.slot);
        let audit = Arc::clone(&self.audit);
        let health = Arc::clone(&self.health);
        let timeout = self.config.watchdog_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if lock_slot(&slot).release(generation) {
                warn!(generation, "query watchdog expired; slot released");
                health.record_watchdog_expiration();
                audit.record(
                    "query_watchdog_expired",
                    json!({
                        "generation": generation,
                        "watchdog_ms": timeout.as_millis() as u64,
                    }),
                );
            }
        })
    }

    async fn on_breaker_opened(&self, outcome: CircuitFailureOutcome, detail: &str) {
        let status = self.breaker.status();
        self.audit.record(
            "circuit_opened",
            json!({
                "failures": outcome.failures,
                "open_until": status.open_until,
            }),
        );
        let Some(dispatcher) = &self.alerts else {
            return;
        };
        let body = RichText::new()
            .text(&format!(
                "{} consecutive query failures; free-text queries are paused",
                outcome.failures
            ))
            .text(
                &status
                    .open_until
                    .as_deref()
                    .map(|until| format!(" until {until}."))
                    .unwrap_or_else(|| ".".to_string()),
            )
            .line_break()
            .text("Last error: ")
            .code(&truncate_detail(detail));
        let message = NotificationMessage::new("Calendar queries paused", body.into_string())
            .with_priority(NotificationPriority::Elevated);
        let channels = dispatcher.configured_channels();
        let outcomes = dispatcher.broadcast(&channels, &message).await;
        let delivered = outcomes.iter().filter(|outcome| outcome.is_delivered()).count();
        self.audit.record(
            "circuit_alert_dispatched",
            json!({
                "channels": channels.len(),
                "delivered": delivered,
            }),
        );
    }
}
