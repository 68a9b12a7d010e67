use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use calbot_core::{
    utc_date_for, AuditLog, AuditLogConfig, CircuitBreaker, CircuitBreakerConfig, ClockFn,
    HealthCounters,
};
use calbot_notify::{
    NotificationChannel, NotificationDispatcher, NotificationMessage, NotificationOutboundConfig,
    NotificationOutboundMode, NotificationPriority,
};
use calbot_runtime::{
    AdmissionOutcome, QueryAdmissionConfig, QueryAdmissionController, QueryBackend,
    QueryBackendError,
};

const NOON_2024_03_10_MS: u64 = 1_710_072_000_000;
const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

fn simulated_clock(start_ms: u64) -> (Arc<AtomicU64>, ClockFn) {
    let now = Arc::new(AtomicU64::new(start_ms));
    let handle = Arc::clone(&now);
    (now, Arc::new(move || handle.load(Ordering::SeqCst)))
}

/// Fails the first `failures` calls, then answers.
struct FlakyBackend {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl QueryBackend for FlakyBackend {
    async fn run_query(&self, query: &str) -> Result<String, QueryBackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(QueryBackendError::ProcessFailed {
                status: "1".to_string(),
                summary: "calendar api unavailable".to_string(),
            });
        }
        Ok(format!("answer to {query}"))
    }
}

#[test]
fn integration_breaker_opens_at_threshold_and_closes_after_cooldown() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (now, clock) = simulated_clock(NOON_2024_03_10_MS);
    let breaker = CircuitBreaker::with_clock(
        temp.path().join("circuit-breaker.json"),
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 600_000,
        },
        clock,
    );

    for _ in 0..3 {
        breaker.record_failure();
    }
    assert!(breaker.is_open());
    assert!(breaker.is_open());

    now.fetch_add(600_001, Ordering::SeqCst);
    assert!(!breaker.is_open());
    assert!(!breaker.state_path().exists());
}

#[tokio::test]
async fn integration_failing_queries_disable_path_until_cooldown_then_recover() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (now, clock) = simulated_clock(NOON_2024_03_10_MS);
    let health = Arc::new(HealthCounters::default());
    let breaker = Arc::new(
        CircuitBreaker::with_clock(
            temp.path().join("circuit-breaker.json"),
            CircuitBreakerConfig::default(),
            clock.clone(),
        )
        .with_health(health.clone()),
    );
    let audit = Arc::new(
        AuditLog::with_clock(
            AuditLogConfig::new(temp.path().join("audit"), "calbot"),
            clock,
        )
        .with_health(health.clone()),
    );
    let dispatcher = NotificationDispatcher::new(NotificationOutboundConfig {
        mode: NotificationOutboundMode::DryRun,
        telegram_bot_token: Some("token".to_string()),
        telegram_chat_id: Some("4242".to_string()),
        pushover_app_token: Some("app".to_string()),
        pushover_user_key: Some("user".to_string()),
        ..NotificationOutboundConfig::default()
    })
    .expect("dispatcher")
    .with_health(health.clone());
    let backend = Arc::new(FlakyBackend {
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let controller = QueryAdmissionController::new(
        backend.clone(),
        breaker.clone(),
        audit.clone(),
        health.clone(),
        QueryAdmissionConfig {
            watchdog_timeout: Duration::from_secs(60),
        },
    )
    .with_alerts(Arc::new(dispatcher));

    let mut opened = Vec::new();
    for _ in 0..3 {
        match controller.admit("free slots?").await {
            AdmissionOutcome::Failed { breaker_opened, .. } => opened.push(breaker_opened),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(opened, vec![false, false, true]);
    assert_eq!(controller.admit("free slots?").await, AdmissionOutcome::Disabled);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    now.fetch_add(600_001, Ordering::SeqCst);
    assert_eq!(
        controller.admit("free slots?").await,
        AdmissionOutcome::Completed {
            reply: "answer to free slots?".to_string(),
            late: false
        }
    );

    let entries = audit
        .read_unit(utc_date_for(NOON_2024_03_10_MS))
        .expect("read audit unit");
    let events = entries
        .iter()
        .map(|entry| entry["event"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        events,
        vec![
            "query_started",
            "query_failed",
            "query_started",
            "query_failed",
            "query_started",
            "query_failed",
            "circuit_opened",
            "circuit_alert_dispatched",
            "query_rejected_circuit_open",
            "query_started",
            "query_completed",
        ]
    );
    assert!(entries.iter().all(|entry| entry["service"] == "calbot"));
    assert_eq!(entries[8]["query_chars"], 11);
    assert_eq!(entries[7]["delivered"], 2);
    assert_eq!(health.snapshot().swallowed_failures(), 0);
}

#[test]
fn integration_audit_units_roll_over_by_day_and_expire() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (now, clock) = simulated_clock(NOON_2024_03_10_MS);
    let audit = AuditLog::with_clock(
        AuditLogConfig::new(temp.path().join("audit"), "calbot"),
        clock,
    );

    audit.record("runtime_started", serde_json::json!({}));
    let first_day = utc_date_for(NOON_2024_03_10_MS);
    assert!(audit.unit_path_for(first_day).exists());

    now.fetch_add(DAY_MS, Ordering::SeqCst);
    audit.record("command_received", serde_json::json!({"command": "status"}));
    assert!(audit.unit_path_for(first_day).exists());

    now.fetch_add(20 * DAY_MS, Ordering::SeqCst);
    audit.record("runtime_stopped", serde_json::json!({}));
    assert!(!audit.unit_path_for(first_day).exists());
    let today = utc_date_for(now.load(Ordering::SeqCst));
    assert_eq!(audit.read_unit(today).expect("read").len(), 1);
}

#[tokio::test]
async fn integration_dual_channel_payloads_follow_priority_rules() {
    let dispatcher = NotificationDispatcher::new(NotificationOutboundConfig {
        mode: NotificationOutboundMode::DryRun,
        default_sound: Some("pushover".to_string()),
        ..NotificationOutboundConfig::default()
    })
    .expect("dispatcher");
    let channels = [NotificationChannel::Telegram, NotificationChannel::Pushover];

    let emergency = NotificationMessage::new("Sync stalled", "a <b>bold</b> &amp; line<br/>break")
        .with_priority(NotificationPriority::Emergency);
    let outcomes = dispatcher.broadcast(&channels, &emergency).await;
    let chat = outcomes[0].result.as_ref().expect("chat dry run");
    assert_eq!(
        chat.receipts[0].request_body["text"],
        "<b>Sync stalled</b>\na <b>bold</b> &amp; line\nbreak"
    );
    let push = outcomes[1].result.as_ref().expect("push dry run");
    let body = &push.receipts[0].request_body;
    assert_eq!(body["message"], "a bold & line\nbreak");
    assert_eq!(body["sound"], "pushover");
    assert!(!body["retry"].as_str().unwrap_or_default().is_empty());
    assert!(!body["expire"].as_str().unwrap_or_default().is_empty());

    let normal = NotificationMessage::new("Reminder", "standup");
    let outcomes = dispatcher.broadcast(&channels[1..], &normal).await;
    let body = outcomes[0].result.as_ref().expect("push dry run").receipts[0]
        .request_body
        .as_object()
        .expect("object")
        .clone();
    assert!(!body.contains_key("retry"));
    assert!(!body.contains_key("expire"));
}
