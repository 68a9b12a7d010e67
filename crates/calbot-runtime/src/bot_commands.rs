use serde_json::json;

use calbot_core::{AuditLog, CircuitBreaker, CircuitPosture, HealthCounters};
use calbot_notify::RichText;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    Reset,
    Unknown(String),
}

impl BotCommand {
    pub fn parse(name: &str) -> Self {
        match name.trim().trim_start_matches('/').to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "status" => Self::Status,
            "reset" => Self::Reset,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// State a command may read or change. Commands never wait on the query slot.
pub struct CommandContext<'a> {
    pub breaker: &'a CircuitBreaker,
    pub audit: &'a AuditLog,
    pub health: &'a HealthCounters,
    pub query_in_flight: bool,
}

pub fn execute_bot_command(command: &BotCommand, context: &CommandContext<'_>) -> String {
    match command {
        BotCommand::Start | BotCommand::Help => render_usage(),
        BotCommand::Status => render_status(context),
        BotCommand::Reset => {
            let previous = context.breaker.status();
            context.breaker.reset();
            context.audit.record(
                "circuit_reset",
                json!({
                    "source": "operator_command",
                    "previous_state": previous.state.as_str(),
                    "previous_failures": previous.failures,
                }),
            );
            RichText::new()
                .bold("Circuit breaker reset.")
                .text(" Queries are accepted again.")
                .into_string()
        }
        BotCommand::Unknown(name) => RichText::new()
            .text("Unknown command ")
            .code(&format!("/{name}"))
            .text(". Send /help for the command list.")
            .into_string(),
    }
}

fn render_usage() -> String {
    RichText::new()
        .bold("Calendar assistant")
        .line_break()
        .text("Send a question in plain words to query the calendar. One query runs at a time.")
        .line_break()
        .code("/status")
        .text(" breaker state, running query, health counters")
        .line_break()
        .code("/reset")
        .text(" close the circuit breaker")
        .line_break()
        .code("/help")
        .text(" this message")
        .into_string()
}

fn render_status(context: &CommandContext<'_>) -> String {
    let status = context.breaker.status();
    let health = context.health.snapshot();
    let mut text = RichText::new()
        .bold("Status")
        .line_break()
        .text("Breaker: ")
        .code(status.state.as_str())
        .text(&format!(
            " ({}/{} failures)",
            status.failures, status.failure_threshold
        ));
    if status.state == CircuitPosture::Open {
        if let Some(until) = &status.open_until {
            text = text.text(&format!(", open until {until}"));
        }
    }
    text.line_break()
        .text("Query in flight: ")
        .text(if context.query_in_flight { "yes" } else { "no" })
        .line_break()
        .text(&format!(
            "Audit failures: {} write, {} prune",
            health.audit_write_failures, health.audit_prune_failures
        ))
        .line_break()
        .text(&format!(
            "Breaker persist failures: {}; dispatch failures: {}",
            health.breaker_persist_failures, health.dispatch_failures
        ))
        .line_break()
        .text(&format!(
            "Watchdog expirations: {}; late completions: {}",
            health.watchdog_expirations, health.late_completions
        ))
        .into_string()
}

#[cfg(test)]
mod tests {
    use calbot_core::{
        utc_date_for, AuditLog, AuditLogConfig, CircuitBreaker, CircuitBreakerConfig,
        HealthCounters,
    };

    use super::{execute_bot_command, BotCommand, CommandContext};

    #[test]
    fn unit_parse_maps_known_and_unknown_names() {
        assert_eq!(BotCommand::parse("/Start"), BotCommand::Start);
        assert_eq!(BotCommand::parse("status"), BotCommand::Status);
        assert_eq!(
            BotCommand::parse("book"),
            BotCommand::Unknown("book".to_string())
        );
    }

    #[test]
    fn functional_status_reports_open_breaker_and_counters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let breaker = CircuitBreaker::new(
            temp.path().join("cb.json"),
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 600_000,
            },
        );
        breaker.record_failure();
        let audit = AuditLog::new(AuditLogConfig::new(temp.path().join("audit"), "calbot"));
        let health = HealthCounters::default();
        health.record_late_completion();

        let reply = execute_bot_command(
            &BotCommand::Status,
            &CommandContext {
                breaker: &breaker,
                audit: &audit,
                health: &health,
                query_in_flight: true,
            },
        );
        assert!(reply.contains("Breaker: <code>open</code> (1/1 failures), open until "));
        assert!(reply.contains("Query in flight: yes"));
        assert!(reply.contains("late completions: 1"));
    }

    #[test]
    fn functional_reset_closes_breaker_and_is_audited() {
        let temp = tempfile::tempdir().expect("tempdir");
        let breaker = CircuitBreaker::new(
            temp.path().join("cb.json"),
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 600_000,
            },
        );
        breaker.record_failure();
        assert!(breaker.is_open());
        let audit = AuditLog::new(AuditLogConfig::new(temp.path().join("audit"), "calbot"));
        let health = HealthCounters::default();

        let reply = execute_bot_command(
            &BotCommand::Reset,
            &CommandContext {
                breaker: &breaker,
                audit: &audit,
                health: &health,
                query_in_flight: false,
            },
        );
        assert!(reply.starts_with("<b>Circuit breaker reset.</b>"));
        assert!(!breaker.is_open());
        let entries = audit
            .read_unit(utc_date_for(calbot_core::current_unix_timestamp_ms()))
            .expect("read audit");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["event"], "circuit_reset");
        assert_eq!(entries[0]["previous_state"], "open");
    }

    #[test]
    fn unit_unknown_command_gets_usage_hint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let breaker = CircuitBreaker::new(temp.path().join("cb.json"), Default::default());
        let audit = AuditLog::new(AuditLogConfig::new(temp.path().join("audit"), "calbot"));
        let health = HealthCounters::default();
        let reply = execute_bot_command(
            &BotCommand::Unknown("book<now>".to_string()),
            &CommandContext {
                breaker: &breaker,
                audit: &audit,
                health: &health,
                query_in_flight: false,
            },
        );
        assert_eq!(
            reply,
            "Unknown command <code>/book&lt;now&gt;</code>. Send /help for the command list."
        );
    }
}
