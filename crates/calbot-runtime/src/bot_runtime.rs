//! Polling loop tying ingress, commands, admission, and replies together.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use calbot_core::SessionLock;
use calbot_notify::{NotificationDispatcher, NotificationOutboundMode};

use crate::bootstrap_helpers::CoreServices;
use crate::bot_commands::{execute_bot_command, BotCommand, CommandContext};
use crate::query_admission::{QueryAdmissionConfig, QueryAdmissionController};
use crate::query_backend::{ClaudeCliBackend, ClaudeCliConfig, QueryBackend};
use crate::startup_config::RuntimeConfig;
use crate::telegram_ingress::{classify_text, InboundEvent, InboundMessage, TelegramIngress};

pub struct BotRuntime {
    config: RuntimeConfig,
    services: CoreServices,
    dispatcher: Arc<NotificationDispatcher>,
    admission: Arc<QueryAdmissionController>,
    ingress: TelegramIngress,
}

impl BotRuntime {
    pub fn new(
        config: RuntimeConfig,
        services: CoreServices,
        backend: Arc<dyn QueryBackend>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(
            NotificationDispatcher::new(config.outbound.clone())
                .context("failed to build notification dispatcher")?
                .with_health(services.health.clone()),
        );
        let admission = Arc::new(
            QueryAdmissionController::new(
                backend,
                services.breaker.clone(),
                services.audit.clone(),
                services.health.clone(),
                QueryAdmissionConfig {
                    watchdog_timeout: config.query_timeout,
                },
            )
            .with_alerts(dispatcher.clone()),
        );
        let ingress = TelegramIngress::new(
            &config.outbound.telegram_api_base,
            &config.telegram_bot_token,
            &config.telegram_chat_id,
            config.outbound.http_timeout_ms,
        )?;
        Ok(Self {
            config,
            services,
            dispatcher,
            admission,
            ingress,
        })
    }

    pub fn admission(&self) -> &QueryAdmissionController {
        &self.admission
    }

    /// Polls once and handles every message. Commands are answered before
    /// this returns; queries run on spawned tasks whose handles are returned.
    pub async fn run_cycle(&mut self) -> Result<Vec<JoinHandle<()>>> {
        let messages = self.ingress.poll().await?;
        let mut pending = Vec::new();
        for message in messages {
            if let Some(handle) = self.handle_message(message).await {
                pending.push(handle);
            }
        }
        Ok(pending)
    }

    async fn handle_message(&self, message: InboundMessage) -> Option<JoinHandle<()>> {
        match classify_text(&message.text) {
            InboundEvent::Command { name, .. } => {
                let command = BotCommand::parse(&name);
                self.services.audit.record(
                    "command_received",
                    json!({"command": name, "update_id": message.update_id}),
                );
                let reply = execute_bot_command(
                    &command,
                    &CommandContext {
                        breaker: &self.services.breaker,
                        audit: &self.services.audit,
                        health: &self.services.health,
                        query_in_flight: self.admission.is_in_flight(),
                    },
                );
                // Delivery failures are logged and counted by the dispatcher.
                let _ = self
                    .dispatcher
                    .send_chat_markup(&message.chat_id, &reply)
                    .await;
                None
            }
            InboundEvent::Query(text) if text.is_empty() => None,
            InboundEvent::Query(text) => {
                let admission = Arc::clone(&self.admission);
                let dispatcher = Arc::clone(&self.dispatcher);
                let chat_id = message.chat_id;
                Some(tokio::spawn(async move {
                    let outcome = admission.admit(&text).await;
                    info!(outcome = outcome.as_str(), "query handled");
                    let _ = dispatcher
                        .send_chat_markup(&chat_id, &outcome.reply_markup())
                        .await;
                }))
            }
        }
    }

    /// Runs until Ctrl-C, then audits the stop and releases `lock`.
    pub async fn run(mut self, lock: SessionLock) -> Result<()> {
        self.services.audit.record(
            "runtime_started",
            json!({
                "lock_file": lock.path().display().to_string(),
                "model": self.config.model,
                "dry_run": self.dispatcher.mode() == NotificationOutboundMode::DryRun,
            }),
        );
        info!(pid = lock.pid(), "calbot runtime started");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                cycle = self.run_cycle() => {
                    if let Err(error) = cycle {
                        warn!(error = %error, "chat poll failed");
                    }
                }
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("shutdown requested");
        self.services.audit.record(
            "runtime_stopped",
            json!({"query_in_flight": self.admission.is_in_flight()}),
        );
        lock.release();
        Ok(())
    }
}

/// Builds the production backend and runs the bot loop.
pub async fn run_bot(
    config: RuntimeConfig,
    services: CoreServices,
    lock: SessionLock,
) -> Result<()> {
    let backend = ClaudeCliBackend::new(ClaudeCliConfig {
        executable: config.claude_executable.clone(),
        model: config.model.clone(),
        account_ref: config.account_ref.clone(),
        extra_args: Vec::new(),
        // The watchdog only frees the slot; this bound kills a runaway child.
        timeout_ms: (config.query_timeout.as_millis() as u64).saturating_mul(2),
    })
    .context("invalid query backend configuration")?;
    BotRuntime::new(config, services, Arc::new(backend))?
        .run(lock)
        .await
}
