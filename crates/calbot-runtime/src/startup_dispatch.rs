use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;

use calbot_core::{read_holder_pid, LivenessProbe, SessionGuard, SignalLivenessProbe};
use calbot_notify::{to_rich_text, NotificationDispatcher, NotificationMessage};

use crate::bootstrap_helpers::build_core_services;
use crate::bot_runtime::run_bot;
use crate::startup_config::{
    BreakerAction, Cli, CliCommand, ConfigError, NotifyArgs, RuntimeConfig,
};

/// Exit status for a failed startup: 2 for configuration errors, 1 otherwise.
pub fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    if error.downcast_ref::<ConfigError>().is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

pub async fn dispatch_cli(cli: Cli) -> Result<()> {
    cli.validate_numeric()?;
    match cli.command() {
        CliCommand::Run => {
            let config = RuntimeConfig::from_cli(&cli)?;
            let lock = SessionGuard::new().acquire_or_exit(&config.paths.lock_file);
            let services =
                build_core_services(&config.paths, config.audit_retention_days, config.breaker);
            run_bot(config, services, lock).await
        }
        CliCommand::Notify(args) => execute_notify(&cli, &args).await,
        CliCommand::Breaker { action } => execute_breaker(&cli, action),
        CliCommand::Health => execute_health(&cli),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render json output")?
    );
    Ok(())
}

fn build_notify_message(cli: &Cli, args: &NotifyArgs) -> NotificationMessage {
    let mut message = NotificationMessage::new(args.title.trim(), to_rich_text(&args.body))
        .with_priority(args.priority);
    if let Some(sound) = &args.sound {
        message = message.with_sound(sound.as_str());
    }
    let escalation_given = args.retry_seconds.is_some() || args.expire_seconds.is_some();
    if args.priority.is_emergency() && escalation_given {
        message = message.with_escalation(
            Duration::from_secs(args.retry_seconds.unwrap_or(cli.emergency_retry_seconds)),
            Duration::from_secs(args.expire_seconds.unwrap_or(cli.emergency_expire_seconds)),
        );
    }
    message
}

async fn execute_notify(cli: &Cli, args: &NotifyArgs) -> Result<()> {
    let dispatcher = NotificationDispatcher::new(cli.outbound_config())?;
    let channels = dispatcher.configured_channels();
    if channels.is_empty() {
        return Err(ConfigError::NoChannels.into());
    }
    let message = build_notify_message(cli, args);
    let outcomes = dispatcher.broadcast(&channels, &message).await;
    let rendered = outcomes
        .iter()
        .map(|outcome| match &outcome.result {
            Ok(result) => json!({
                "channel": outcome.channel,
                "status": "delivered",
                "receipts": result.receipts,
            }),
            Err(error) => json!({
                "channel": outcome.channel,
                "status": "failed",
                "reason_code": error.reason_code,
                "retryable": error.retryable,
                "http_status": error.http_status,
                "detail": error.detail,
            }),
        })
        .collect::<Vec<_>>();
    print_json(&json!({ "outcomes": rendered }))?;
    let failed = outcomes.iter().filter(|outcome| !outcome.is_delivered()).count();
    if failed > 0 {
        bail!("{failed} of {} channel deliveries failed", outcomes.len());
    }
    Ok(())
}

fn execute_breaker(cli: &Cli, action: BreakerAction) -> Result<()> {
    let services = build_core_services(
        &cli.state_paths(),
        cli.audit_retention_days,
        cli.breaker_config(),
    );
    if let BreakerAction::Reset = action {
        let previous = services.breaker.status();
        services.breaker.reset();
        services.audit.record(
            "circuit_reset",
            json!({
                "source": "cli",
                "previous_state": previous.state.as_str(),
                "previous_failures": previous.failures,
            }),
        );
    }
    print_json(&serde_json::to_value(services.breaker.status())?)
}

fn execute_health(cli: &Cli) -> Result<()> {
    let paths = cli.state_paths();
    let services = build_core_services(&paths, cli.audit_retention_days, cli.breaker_config());
    let holder = read_holder_pid(&paths.lock_file)
        .with_context(|| format!("failed to read {}", paths.lock_file.display()))?;
    print_json(&json!({
        "breaker": services.breaker.status(),
        "lock_file": paths.lock_file.display().to_string(),
        "lock_holder_pid": holder,
        "lock_holder_alive": holder.map(|pid| SignalLivenessProbe.is_alive(pid)),
    }))
}
