use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use calbot_core::CircuitBreakerConfig;
use calbot_notify::{NotificationOutboundConfig, NotificationOutboundMode, NotificationPriority};

#[derive(Debug, Parser)]
#[command(
    name = "calbot",
    about = "Scheduling bot runtime with a guarded query path and dual-channel alerts",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    #[arg(
        long = "telegram-bot-token",
        env = "CALBOT_TELEGRAM_BOT_TOKEN",
        global = true,
        hide_env_values = true,
        help = "Bot token used for chat ingress and rich-text delivery"
    )]
    pub telegram_bot_token: Option<String>,

    #[arg(
        long = "telegram-chat-id",
        env = "CALBOT_TELEGRAM_CHAT_ID",
        global = true,
        help = "Only chat the bot listens to and notifies"
    )]
    pub telegram_chat_id: Option<String>,

    #[arg(
        long,
        env = "CALBOT_MODEL",
        global = true,
        help = "Model identifier passed to the query backend"
    )]
    pub model: Option<String>,

    #[arg(
        long = "account-ref",
        env = "CALBOT_ACCOUNT_REF",
        global = true,
        help = "External calendar account the bot answers for"
    )]
    pub account_ref: Option<String>,

    #[arg(
        long = "state-dir",
        env = "CALBOT_STATE_DIR",
        global = true,
        default_value = ".calbot",
        help = "Directory holding the session lock, breaker state, and audit log"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "lock-file",
        env = "CALBOT_LOCK_FILE",
        global = true,
        help = "Session lock path (default: <state-dir>/calbot.lock)"
    )]
    pub lock_file: Option<PathBuf>,

    #[arg(
        long = "circuit-state-file",
        env = "CALBOT_CIRCUIT_STATE_FILE",
        global = true,
        help = "Circuit breaker state path (default: <state-dir>/circuit-breaker.json)"
    )]
    pub circuit_state_file: Option<PathBuf>,

    #[arg(
        long = "audit-dir",
        env = "CALBOT_AUDIT_DIR",
        global = true,
        help = "Audit log directory (default: <state-dir>/audit)"
    )]
    pub audit_dir: Option<PathBuf>,

    #[arg(
        long = "audit-retention-days",
        env = "CALBOT_AUDIT_RETENTION_DAYS",
        global = true,
        default_value_t = 14,
        help = "Days an audit unit is kept before pruning"
    )]
    pub audit_retention_days: u64,

    #[arg(
        long = "breaker-failure-threshold",
        env = "CALBOT_BREAKER_FAILURE_THRESHOLD",
        global = true,
        default_value_t = 3,
        help = "Consecutive query failures that open the circuit breaker"
    )]
    pub breaker_failure_threshold: u32,

    #[arg(
        long = "breaker-cooldown-ms",
        env = "CALBOT_BREAKER_COOLDOWN_MS",
        global = true,
        default_value_t = 600_000,
        help = "How long an open breaker refuses queries"
    )]
    pub breaker_cooldown_ms: u64,

    #[arg(
        long = "query-timeout-ms",
        env = "CALBOT_QUERY_TIMEOUT_MS",
        global = true,
        default_value_t = 120_000,
        help = "Watchdog that frees the query slot if a query runs too long"
    )]
    pub query_timeout_ms: u64,

    #[arg(
        long = "poll-interval-ms",
        env = "CALBOT_POLL_INTERVAL_MS",
        global = true,
        default_value_t = 1_000,
        help = "Delay between chat update polls"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "http-timeout-ms",
        env = "CALBOT_HTTP_TIMEOUT_MS",
        global = true,
        default_value_t = 10_000,
        help = "Timeout for chat and push HTTP requests"
    )]
    pub http_timeout_ms: u64,

    #[arg(
        long = "telegram-api-base",
        env = "CALBOT_TELEGRAM_API_BASE",
        global = true,
        default_value = "https://api.telegram.org",
        help = "Base URL for the chat bot API"
    )]
    pub telegram_api_base: String,

    #[arg(
        long = "pushover-api-base",
        env = "CALBOT_PUSHOVER_API_BASE",
        global = true,
        default_value = "https://api.pushover.net/1",
        help = "Base URL for the push notification API"
    )]
    pub pushover_api_base: String,

    #[arg(
        long = "pushover-app-token",
        env = "CALBOT_PUSHOVER_APP_TOKEN",
        global = true,
        hide_env_values = true,
        help = "Push application token; push delivery is enabled when this and the user key are set"
    )]
    pub pushover_app_token: Option<String>,

    #[arg(
        long = "pushover-user-key",
        env = "CALBOT_PUSHOVER_USER_KEY",
        global = true,
        hide_env_values = true,
        help = "Push recipient user key"
    )]
    pub pushover_user_key: Option<String>,

    #[arg(
        long = "pushover-sound",
        env = "CALBOT_PUSHOVER_SOUND",
        global = true,
        help = "Default push sound when a message names none"
    )]
    pub pushover_sound: Option<String>,

    #[arg(
        long = "emergency-retry-seconds",
        env = "CALBOT_EMERGENCY_RETRY_SECONDS",
        global = true,
        default_value_t = 60,
        help = "Default re-alert interval for emergency push notifications"
    )]
    pub emergency_retry_seconds: u64,

    #[arg(
        long = "emergency-expire-seconds",
        env = "CALBOT_EMERGENCY_EXPIRE_SECONDS",
        global = true,
        default_value_t = 3_600,
        help = "Default re-alert window for emergency push notifications"
    )]
    pub emergency_expire_seconds: u64,

    #[arg(
        long = "claude-executable",
        env = "CALBOT_CLAUDE_EXECUTABLE",
        global = true,
        default_value = "claude",
        help = "Query backend executable"
    )]
    pub claude_executable: String,

    #[arg(
        long = "dry-run",
        env = "CALBOT_DRY_RUN",
        global = true,
        default_value_t = false,
        help = "Shape outbound payloads without sending them"
    )]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Run the bot loop (default).
    Run,
    /// Broadcast one notification to every configured channel.
    Notify(NotifyArgs),
    /// Inspect or reset the persisted circuit breaker.
    Breaker {
        #[command(subcommand)]
        action: BreakerAction,
    },
    /// Print breaker status and the current session lock holder.
    Health,
}

#[derive(Debug, Clone, Subcommand)]
pub enum BreakerAction {
    Status,
    Reset,
}

#[derive(Debug, Clone, Args)]
pub struct NotifyArgs {
    #[arg(long, help = "Notification title (plain text)")]
    pub title: String,

    #[arg(long, help = "Notification body; emphasis and code tags are kept")]
    pub body: String,

    #[arg(long, default_value = "normal", help = "normal, elevated, or emergency")]
    pub priority: NotificationPriority,

    #[arg(long, help = "Push sound for this notification")]
    pub sound: Option<String>,

    #[arg(long = "retry-seconds", help = "Emergency re-alert interval")]
    pub retry_seconds: Option<u64>,

    #[arg(long = "expire-seconds", help = "Emergency re-alert window")]
    pub expire_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredSetting {
    pub flag: &'static str,
    pub env: &'static str,
}

impl std::fmt::Display for RequiredSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "--{} ({})", self.flag, self.env)
    }
}

fn render_settings(settings: &[RequiredSetting]) -> String {
    settings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", render_settings(.missing))]
    MissingRequired { missing: Vec<RequiredSetting> },
    #[error("--{flag} must be greater than 0")]
    MustBePositive { flag: &'static str },
    #[error("no notification channel configured; set the chat bot token and chat id or the push app token and user key")]
    NoChannels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub lock_file: PathBuf,
    pub circuit_state_file: PathBuf,
    pub audit_dir: PathBuf,
}

/// Validated configuration for the bot loop.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub model: String,
    pub account_ref: String,
    pub paths: StatePaths,
    pub audit_retention_days: u64,
    pub breaker: CircuitBreakerConfig,
    pub query_timeout: Duration,
    pub poll_interval: Duration,
    pub claude_executable: String,
    pub outbound: NotificationOutboundConfig,
}

fn present(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl Cli {
    pub fn command(&self) -> CliCommand {
        self.command.clone().unwrap_or(CliCommand::Run)
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths {
            lock_file: self
                .lock_file
                .clone()
                .unwrap_or_else(|| self.state_dir.join("calbot.lock")),
            circuit_state_file: self
                .circuit_state_file
                .clone()
                .unwrap_or_else(|| self.state_dir.join("circuit-breaker.json")),
            audit_dir: self
                .audit_dir
                .clone()
                .unwrap_or_else(|| self.state_dir.join("audit")),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown_ms: self.breaker_cooldown_ms,
        }
    }

    pub fn outbound_config(&self) -> NotificationOutboundConfig {
        NotificationOutboundConfig {
            mode: if self.dry_run {
                NotificationOutboundMode::DryRun
            } else {
                NotificationOutboundMode::Provider
            },
            http_timeout_ms: self.http_timeout_ms,
            telegram_api_base: self.telegram_api_base.clone(),
            telegram_bot_token: present(&self.telegram_bot_token),
            telegram_chat_id: present(&self.telegram_chat_id),
            pushover_api_base: self.pushover_api_base.clone(),
            pushover_app_token: present(&self.pushover_app_token),
            pushover_user_key: present(&self.pushover_user_key),
            default_sound: present(&self.pushover_sound),
            emergency_retry: Duration::from_secs(self.emergency_retry_seconds),
            emergency_expire: Duration::from_secs(self.emergency_expire_seconds),
            ..NotificationOutboundConfig::default()
        }
    }

    /// Rejects zero for knobs where zero has no meaning.
    pub fn validate_numeric(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 8] = [
            ("audit-retention-days", self.audit_retention_days),
            (
                "breaker-failure-threshold",
                u64::from(self.breaker_failure_threshold),
            ),
            ("breaker-cooldown-ms", self.breaker_cooldown_ms),
            ("query-timeout-ms", self.query_timeout_ms),
            ("poll-interval-ms", self.poll_interval_ms),
            ("http-timeout-ms", self.http_timeout_ms),
            ("emergency-retry-seconds", self.emergency_retry_seconds),
            ("emergency-expire-seconds", self.emergency_expire_seconds),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((flag, _)) => Err(ConfigError::MustBePositive { flag }),
            None => Ok(()),
        }
    }
}

impl RuntimeConfig {
    /// Validates every required value up front and reports all missing ones.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let required = [
            (
                present(&cli.telegram_bot_token),
                RequiredSetting {
                    flag: "telegram-bot-token",
                    env: "CALBOT_TELEGRAM_BOT_TOKEN",
                },
            ),
            (
                present(&cli.telegram_chat_id),
                RequiredSetting {
                    flag: "telegram-chat-id",
                    env: "CALBOT_TELEGRAM_CHAT_ID",
                },
            ),
            (
                present(&cli.model),
                RequiredSetting {
                    flag: "model",
                    env: "CALBOT_MODEL",
                },
            ),
            (
                present(&cli.account_ref),
                RequiredSetting {
                    flag: "account-ref",
                    env: "CALBOT_ACCOUNT_REF",
                },
            ),
        ];
        let missing = required
            .iter()
            .filter(|(value, _)| value.is_none())
            .map(|(_, setting)| *setting)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired { missing });
        }
        cli.validate_numeric()?;

        let [token, chat_id, model, account_ref] =
            required.map(|(value, _)| value.unwrap_or_default());
        Ok(Self {
            telegram_bot_token: token,
            telegram_chat_id: chat_id,
            model,
            account_ref,
            paths: cli.state_paths(),
            audit_retention_days: cli.audit_retention_days,
            breaker: cli.breaker_config(),
            query_timeout: Duration::from_millis(cli.query_timeout_ms),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            claude_executable: cli.claude_executable.clone(),
            outbound: cli.outbound_config(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use clap::Parser;

    use super::{BreakerAction, Cli, CliCommand, ConfigError, RuntimeConfig};
    use calbot_notify::{NotificationOutboundMode, NotificationPriority};

    const REQUIRED: [&str; 8] = [
        "--telegram-bot-token",
        "bot-token",
        "--telegram-chat-id",
        "4242",
        "--model",
        "claude-sonnet",
        "--account-ref",
        "team@example.com",
    ];

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec!["calbot"];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).expect("parse cli")
    }

    #[test]
    fn unit_defaults_derive_state_paths_from_state_dir() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--state-dir", "/var/lib/calbot"]);
        let config = RuntimeConfig::from_cli(&parse(&args)).expect("config");
        assert_eq!(
            config.paths.lock_file,
            PathBuf::from("/var/lib/calbot/calbot.lock")
        );
        assert_eq!(
            config.paths.circuit_state_file,
            PathBuf::from("/var/lib/calbot/circuit-breaker.json")
        );
        assert_eq!(config.paths.audit_dir, PathBuf::from("/var/lib/calbot/audit"));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 600_000);
        assert_eq!(config.query_timeout, Duration::from_secs(120));
        assert_eq!(config.audit_retention_days, 14);
        assert_eq!(config.outbound.mode, NotificationOutboundMode::Provider);
    }

    #[test]
    fn functional_missing_required_values_are_reported_together() {
        let cli = parse(&["--model", "claude-sonnet", "--telegram-chat-id", "  "]);
        let error = RuntimeConfig::from_cli(&cli).expect_err("missing values");
        let ConfigError::MissingRequired { missing } = &error else {
            panic!("unexpected error: {error}");
        };
        let flags = missing.iter().map(|setting| setting.flag).collect::<Vec<_>>();
        assert_eq!(
            flags,
            vec!["telegram-bot-token", "telegram-chat-id", "account-ref"]
        );
        assert!(error.to_string().contains("CALBOT_ACCOUNT_REF"));
    }

    #[test]
    fn regression_zero_valued_knobs_are_rejected() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--query-timeout-ms", "0"]);
        let error = RuntimeConfig::from_cli(&parse(&args)).expect_err("zero timeout");
        assert_eq!(
            error,
            ConfigError::MustBePositive {
                flag: "query-timeout-ms"
            }
        );
    }

    #[test]
    fn unit_subcommands_and_global_flags_parse() {
        let cli = parse(&["breaker", "reset", "--state-dir", "/tmp/cb"]);
        assert!(matches!(
            cli.command(),
            CliCommand::Breaker {
                action: BreakerAction::Reset
            }
        ));
        assert_eq!(
            cli.state_paths().circuit_state_file,
            PathBuf::from("/tmp/cb/circuit-breaker.json")
        );

        let cli = parse(&[
            "notify",
            "--title",
            "Outage",
            "--body",
            "<b>down</b>",
            "--priority",
            "emergency",
            "--dry-run",
        ]);
        let CliCommand::Notify(args) = cli.command() else {
            panic!("expected notify");
        };
        assert_eq!(args.priority, NotificationPriority::Emergency);
        assert_eq!(cli.outbound_config().mode, NotificationOutboundMode::DryRun);

        assert!(matches!(parse(&[]).command(), CliCommand::Run));
    }

    #[test]
    fn unit_push_channel_settings_flow_into_outbound_config() {
        let cli = parse(&[
            "--pushover-app-token",
            "app",
            "--pushover-user-key",
            "user",
            "--pushover-sound",
            " ",
            "--emergency-retry-seconds",
            "90",
        ]);
        let outbound = cli.outbound_config();
        assert_eq!(outbound.pushover_app_token.as_deref(), Some("app"));
        assert_eq!(outbound.default_sound, None);
        assert_eq!(outbound.emergency_retry, Duration::from_secs(90));
    }
}
