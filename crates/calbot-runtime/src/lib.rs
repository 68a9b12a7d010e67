//! Process runtime for calbot: configuration, query admission, chat ingress,
//! bot commands, and the polling loop behind the `calbot` binary.

pub mod bootstrap_helpers;
pub mod bot_commands;
pub mod bot_runtime;
pub mod query_admission;
pub mod query_backend;
pub mod startup_config;
pub mod startup_dispatch;
pub mod telegram_ingress;

pub use bootstrap_helpers::{build_core_services, init_tracing, CoreServices};
pub use bot_commands::{execute_bot_command, BotCommand, CommandContext};
pub use bot_runtime::{run_bot, BotRuntime};
pub use query_admission::{AdmissionOutcome, QueryAdmissionConfig, QueryAdmissionController};
pub use query_backend::{ClaudeCliBackend, ClaudeCliConfig, QueryBackend, QueryBackendError};
pub use startup_config::{
    BreakerAction, Cli, CliCommand, ConfigError, NotifyArgs, RequiredSetting, RuntimeConfig,
    StatePaths,
};
pub use startup_dispatch::{dispatch_cli, exit_code_for};
pub use telegram_ingress::{classify_text, InboundEvent, InboundMessage, TelegramIngress};
