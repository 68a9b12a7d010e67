//! Chat ingress through `getUpdates` polling.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: u64,
    pub chat_id: String,
    pub text: String,
    pub sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `/name args`; the name is lowercased and stripped of any `@bot` suffix.
    Command { name: String, args: String },
    Query(String),
}

pub fn classify_text(text: &str) -> InboundEvent {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return InboundEvent::Query(trimmed.to_string());
    };
    let (head, args) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    InboundEvent::Command {
        name,
        args: args.trim().to_string(),
    }
}

pub struct TelegramIngress {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    next_offset: Option<u64>,
}

impl TelegramIngress {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        chat_id: &str,
        http_timeout_ms: u64,
    ) -> Result<Self> {
        let api_base = api_base.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            bail!("telegram api base cannot be empty");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(http_timeout_ms.max(1)))
            .build()
            .context("failed to build telegram ingress http client")?;
        Ok(Self {
            client,
            api_base,
            bot_token: bot_token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            next_offset: None,
        })
    }

    pub fn next_offset(&self) -> Option<u64> {
        self.next_offset
    }

    /// Fetches pending updates and returns text messages from the configured
    /// chat. The offset advances past every update seen, including ignored ones.
    pub async fn poll(&mut self) -> Result<Vec<InboundMessage>> {
        let offset = self.next_offset.unwrap_or(0);
        let url = format!("{}/bot{}/getUpdates", self.api_base, self.bot_token);
        let response = self
            .client
            .get(url.as_str())
            .query(&[("timeout", "0"), ("offset", offset.to_string().as_str())])
            .send()
            .await
            .map_err(|error| {
                anyhow!(
                    "telegram getUpdates request failed: {}",
                    error.without_url()
                )
            })?;
        let status = response.status();
        let payload = response
            .json::<Value>()
            .await
            .context("telegram getUpdates returned invalid json")?;
        if !status.is_success() || payload.get("ok").and_then(Value::as_bool) == Some(false) {
            let description = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            bail!("telegram getUpdates failed with status {status}: {description}");
        }
        let updates = payload
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("telegram getUpdates response missing result[]"))?;

        let mut max_update_id = offset;
        let mut messages = Vec::new();
        for update in updates {
            let update_id = update.get("update_id").and_then(Value::as_u64).unwrap_or(0);
            if update_id > 0 {
                max_update_id = max_update_id.max(update_id.saturating_add(1));
            }
            match parse_update_message(update) {
                Some(message) if message.chat_id == self.chat_id => messages.push(message),
                Some(message) => {
                    debug!(
                        update_id,
                        chat_id = %message.chat_id,
                        "ignoring message from other chat"
                    )
                }
                None => debug!(update_id, "ignoring update without text message"),
            }
        }
        if max_update_id > 0 {
            self.next_offset = Some(max_update_id);
        }
        Ok(messages)
    }
}

fn parse_update_message(update: &Value) -> Option<InboundMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    let chat_id = match message.get("chat").and_then(|chat| chat.get("id"))? {
        Value::Number(number) => number.to_string(),
        Value::String(raw) => raw.clone(),
        _ => return None,
    };
    let sender = message
        .get("from")
        .and_then(|from| from.get("username"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(InboundMessage {
        update_id: update.get("update_id").and_then(Value::as_u64).unwrap_or(0),
        chat_id,
        text: text.to_string(),
        sender,
    })
}
