//! Outbound delivery for the chat (rich text) and push (plain text) channels.
//!
//! Every channel call is isolated: `broadcast` runs one independent send per
//! channel and reports one outcome each, so a failing channel never blocks or
//! alters delivery to another. Failures are classified as retryable or terminal
//! but never retried here; callers decide.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use calbot_core::HealthCounters;

use crate::notify_format::{
    escape_html, parse_vocabulary_tag, push_close_tag, push_open_tag, to_chat_markup,
    to_plain_text, VocabularyTag,
};
use crate::notify_message::NotificationMessage;

const TELEGRAM_SAFE_MAX_CHARS: usize = 4096;
const PUSH_TITLE_MAX_CHARS: usize = 250;
const PUSH_MESSAGE_MAX_CHARS: usize = 1024;
const PUSH_MIN_RETRY_SECONDS: u64 = 30;
const PUSH_MAX_EXPIRE_SECONDS: u64 = 10_800;
const REDACTED: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Telegram,
    Pushover,
}

impl NotificationChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Pushover => "pushover",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutboundMode {
    /// Shape payloads and return them without any network I/O.
    DryRun,
    Provider,
}

impl NotificationOutboundMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationOutboundConfig {
    pub mode: NotificationOutboundMode,
    pub http_timeout_ms: u64,
    pub telegram_api_base: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_max_chars: usize,
    pub pushover_api_base: String,
    pub pushover_app_token: Option<String>,
    pub pushover_user_key: Option<String>,
    pub default_sound: Option<String>,
    pub emergency_retry: Duration,
    pub emergency_expire: Duration,
}

impl Default for NotificationOutboundConfig {
    fn default() -> Self {
        Self {
            mode: NotificationOutboundMode::Provider,
            http_timeout_ms: 10_000,
            telegram_api_base: "https://api.telegram.org".to_string(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_max_chars: TELEGRAM_SAFE_MAX_CHARS,
            pushover_api_base: "https://api.pushover.net/1".to_string(),
            pushover_app_token: None,
            pushover_user_key: None,
            default_sound: None,
            emergency_retry: Duration::from_secs(60),
            emergency_expire: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: NotificationChannel,
    pub mode: String,
    pub status: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub endpoint: String,
    pub request_body: Value,
    pub http_status: Option<u16>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeliveryResult {
    pub channel: NotificationChannel,
    pub mode: String,
    pub receipts: Vec<DeliveryReceipt>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{channel} delivery failed: reason_code={reason_code} retryable={retryable} chunk={chunk_index}/{chunk_count} detail={detail}")]
pub struct DeliveryError {
    pub channel: NotificationChannel,
    pub reason_code: String,
    pub detail: String,
    pub retryable: bool,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub http_status: Option<u16>,
}

impl DeliveryError {
    fn terminal(
        channel: NotificationChannel,
        reason_code: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            reason_code: reason_code.to_string(),
            detail: detail.into(),
            retryable: false,
            chunk_index: 0,
            chunk_count: 0,
            http_status: None,
        }
    }
}

/// Result of one channel inside a `broadcast`.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel: NotificationChannel,
    pub result: Result<DeliveryResult, DeliveryError>,
}

impl ChannelOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
enum OutboundBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

impl OutboundBody {
    fn redacted(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Form(fields) => {
                let mut object = Map::new();
                for (key, value) in fields {
                    let value = if key == "token" || key == "user" {
                        REDACTED.to_string()
                    } else {
                        value.clone()
                    };
                    object.insert(key.clone(), Value::String(value));
                }
                Value::Object(object)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct OutboundRequest {
    channel: NotificationChannel,
    endpoint: String,
    display_endpoint: String,
    body: OutboundBody,
    chunk_index: usize,
    chunk_count: usize,
}

pub struct NotificationDispatcher {
    config: NotificationOutboundConfig,
    client: Option<reqwest::Client>,
    health: Option<Arc<HealthCounters>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("mode", &self.config.mode)
            .field("channels", &self.configured_channels())
            .finish()
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

impl NotificationDispatcher {
    pub fn new(config: NotificationOutboundConfig) -> Result<Self> {
        if config.telegram_max_chars == 0 {
            return Err(anyhow!("telegram max chars must be greater than 0"));
        }
        let client = if config.mode == NotificationOutboundMode::Provider {
            if config.http_timeout_ms == 0 {
                return Err(anyhow!("provider mode requires http timeout > 0"));
            }
            Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_millis(config.http_timeout_ms))
                    .build()
                    .context("failed to build notification http client")?,
            )
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            health: None,
        })
    }

    pub fn with_health(mut self, health: Arc<HealthCounters>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn mode(&self) -> NotificationOutboundMode {
        self.config.mode
    }

    /// Channels whose credentials are present.
    pub fn configured_channels(&self) -> Vec<NotificationChannel> {
        let mut channels = Vec::new();
        if non_empty(self.config.telegram_bot_token.as_deref()).is_some()
            && non_empty(self.config.telegram_chat_id.as_deref()).is_some()
        {
            channels.push(NotificationChannel::Telegram);
        }
        if non_empty(self.config.pushover_app_token.as_deref()).is_some()
            && non_empty(self.config.pushover_user_key.as_deref()).is_some()
        {
            channels.push(NotificationChannel::Pushover);
        }
        channels
    }

    pub async fn send(
        &self,
        channel: NotificationChannel,
        message: &NotificationMessage,
    ) -> Result<DeliveryResult, DeliveryError> {
        let requests = match channel {
            NotificationChannel::Telegram => {
                let text = render_chat_text(message);
                self.build_chat_requests(None, &text)
            }
            NotificationChannel::Pushover => self.build_push_request(message).map(|r| vec![r]),
        };
        let outcome = match requests {
            Ok(requests) => self.deliver_requests(channel, requests).await,
            Err(error) => Err(error),
        };
        if let Err(error) = &outcome {
            self.count_failure(error);
        }
        outcome
    }

    /// Sends rich markup to a specific chat (bot replies), bypassing the title.
    pub async fn send_chat_markup(
        &self,
        chat_id: &str,
        markup: &str,
    ) -> Result<DeliveryResult, DeliveryError> {
        let text = to_chat_markup(markup);
        let outcome = match self.build_chat_requests(Some(chat_id), &text) {
            Ok(requests) => {
                self.deliver_requests(NotificationChannel::Telegram, requests)
                    .await
            }
            Err(error) => Err(error),
        };
        if let Err(error) = &outcome {
            self.count_failure(error);
        }
        outcome
    }

    /// Sends `message` to each channel independently; outcomes keep input order.
    pub async fn broadcast(
        &self,
        channels: &[NotificationChannel],
        message: &NotificationMessage,
    ) -> Vec<ChannelOutcome> {
        join_all(channels.iter().map(|channel| async move {
            ChannelOutcome {
                channel: *channel,
                result: self.send(*channel, message).await,
            }
        }))
        .await
    }

    fn count_failure(&self, error: &DeliveryError) {
        warn!(
            channel = error.channel.as_str(),
            reason_code = error.reason_code.as_str(),
            retryable = error.retryable,
            "notification delivery failed"
        );
        if let Some(health) = &self.health {
            health.record_dispatch_failure();
        }
    }

    async fn deliver_requests(
        &self,
        channel: NotificationChannel,
        requests: Vec<OutboundRequest>,
    ) -> Result<DeliveryResult, DeliveryError> {
        let mut receipts = Vec::with_capacity(requests.len());
        for request in requests {
            let receipt = match self.config.mode {
                NotificationOutboundMode::DryRun => DeliveryReceipt {
                    channel: request.channel,
                    mode: self.config.mode.as_str().to_string(),
                    status: "dry_run".to_string(),
                    chunk_index: request.chunk_index,
                    chunk_count: request.chunk_count,
                    endpoint: request.display_endpoint.clone(),
                    request_body: request.body.redacted(),
                    http_status: None,
                    provider_message_id: None,
                },
                NotificationOutboundMode::Provider => self.send_request(&request).await?,
            };
            receipts.push(receipt);
        }
        Ok(DeliveryResult {
            channel,
            mode: self.config.mode.as_str().to_string(),
            receipts,
        })
    }

    fn credential(&self, raw: Option<&str>, placeholder: &str) -> Option<String> {
        non_empty(raw).map(str::to_string).or_else(|| {
            (self.config.mode == NotificationOutboundMode::DryRun).then(|| placeholder.to_string())
        })
    }

    fn build_chat_requests(
        &self,
        chat_id_override: Option<&str>,
        text: &str,
    ) -> Result<Vec<OutboundRequest>, DeliveryError> {
        let channel = NotificationChannel::Telegram;
        let token = self
            .credential(
                self.config.telegram_bot_token.as_deref(),
                "dry-run-telegram-token",
            )
            .ok_or_else(|| {
                DeliveryError::terminal(
                    channel,
                    "delivery_missing_telegram_bot_token",
                    "chat delivery requires CALBOT_TELEGRAM_BOT_TOKEN",
                )
            })?;
        let chat_id = match non_empty(chat_id_override) {
            Some(chat_id) => chat_id.to_string(),
            None => self
                .credential(self.config.telegram_chat_id.as_deref(), "dry-run-chat")
                .ok_or_else(|| {
                    DeliveryError::terminal(
                        channel,
                        "delivery_missing_telegram_chat_id",
                        "chat delivery requires CALBOT_TELEGRAM_CHAT_ID",
                    )
                })?,
        };
        let base = self.config.telegram_api_base.trim_end_matches('/');
        let endpoint = format!("{base}/bot{token}/sendMessage");
        let display_endpoint = format!("{base}/bot{REDACTED}/sendMessage");

        let chunks = chunk_markup(text, self.config.telegram_max_chars);
        if chunks.is_empty() {
            return Err(DeliveryError::terminal(
                channel,
                "delivery_empty_message",
                "chat message has no text to send",
            ));
        }
        let chunk_count = chunks.len();
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(chunk_index, chunk)| OutboundRequest {
                channel,
                endpoint: endpoint.clone(),
                display_endpoint: display_endpoint.clone(),
                body: OutboundBody::Json(json!({
                    "chat_id": chat_id,
                    "text": chunk,
                    "parse_mode": "HTML",
                })),
                chunk_index,
                chunk_count,
            })
            .collect())
    }

    fn build_push_request(
        &self,
        message: &NotificationMessage,
    ) -> Result<OutboundRequest, DeliveryError> {
        let channel = NotificationChannel::Pushover;
        let token = self
            .credential(
                self.config.pushover_app_token.as_deref(),
                "dry-run-push-token",
            )
            .ok_or_else(|| {
                DeliveryError::terminal(
                    channel,
                    "delivery_missing_pushover_app_token",
                    "push delivery requires CALBOT_PUSHOVER_APP_TOKEN",
                )
            })?;
        let user = self
            .credential(self.config.pushover_user_key.as_deref(), "dry-run-push-user")
            .ok_or_else(|| {
                DeliveryError::terminal(
                    channel,
                    "delivery_missing_pushover_user_key",
                    "push delivery requires CALBOT_PUSHOVER_USER_KEY",
                )
            })?;
        let base = self.config.pushover_api_base.trim_end_matches('/');
        let endpoint = format!("{base}/messages.json");
        Ok(OutboundRequest {
            channel,
            endpoint: endpoint.clone(),
            display_endpoint: endpoint,
            body: OutboundBody::Form(self.push_form_fields(token, user, message)),
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    fn push_form_fields(
        &self,
        token: String,
        user: String,
        message: &NotificationMessage,
    ) -> Vec<(String, String)> {
        let title = truncate_chars(&to_plain_text(message.title()), PUSH_TITLE_MAX_CHARS);
        let mut text = to_plain_text(message.body());
        if text.is_empty() {
            text = title.clone();
        }
        let priority = message.priority();
        let mut fields = vec![
            ("token".to_string(), token),
            ("user".to_string(), user),
            ("title".to_string(), title),
            (
                "message".to_string(),
                truncate_chars(&text, PUSH_MESSAGE_MAX_CHARS),
            ),
            ("priority".to_string(), priority.push_code().to_string()),
        ];
        let sound = message
            .sound()
            .or_else(|| non_empty(self.config.default_sound.as_deref()));
        if let Some(sound) = sound {
            fields.push(("sound".to_string(), sound.to_string()));
        }
        if priority.is_emergency() {
            let retry = message
                .retry()
                .unwrap_or(self.config.emergency_retry)
                .as_secs()
                .max(PUSH_MIN_RETRY_SECONDS);
            let expire = message
                .expire()
                .unwrap_or(self.config.emergency_expire)
                .as_secs()
                .clamp(retry, PUSH_MAX_EXPIRE_SECONDS.max(retry));
            fields.push(("retry".to_string(), retry.to_string()));
            fields.push(("expire".to_string(), expire.to_string()));
        }
        fields
    }

    async fn send_request(
        &self,
        request: &OutboundRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let failure = |reason_code: &str, detail: String, retryable: bool, status: Option<u16>| {
            DeliveryError {
                channel: request.channel,
                reason_code: reason_code.to_string(),
                detail,
                retryable,
                chunk_index: request.chunk_index,
                chunk_count: request.chunk_count,
                http_status: status,
            }
        };
        let client = self.client.as_ref().ok_or_else(|| {
            failure(
                "delivery_provider_client_unavailable",
                "provider mode requested without initialized HTTP client".to_string(),
                false,
                None,
            )
        })?;

        let builder = client.post(request.endpoint.as_str());
        let builder = match &request.body {
            OutboundBody::Json(value) => builder.json(value),
            OutboundBody::Form(fields) => builder.form(fields),
        };
        let response = builder.send().await.map_err(|error| {
            failure(
                "delivery_transport_error",
                redact(&error.to_string(), &request.endpoint, &request.display_endpoint),
                true,
                None,
            )
        })?;
        let status = response.status();
        let body_raw = response.text().await.unwrap_or_default();
        let body_json = serde_json::from_str::<Value>(&body_raw).unwrap_or(Value::Null);
        if !status.is_success() {
            let (reason_code, retryable) = classify_provider_status(status);
            return Err(failure(
                reason_code,
                truncate_chars(body_raw.trim(), 512),
                retryable,
                Some(status.as_u16()),
            ));
        }
        if !provider_accepted(request.channel, &body_json) {
            return Err(failure(
                "delivery_request_rejected",
                truncate_chars(body_raw.trim(), 512),
                false,
                Some(status.as_u16()),
            ));
        }
        debug!(
            channel = request.channel.as_str(),
            chunk = request.chunk_index,
            "notification delivered"
        );
        Ok(DeliveryReceipt {
            channel: request.channel,
            mode: self.config.mode.as_str().to_string(),
            status: "sent".to_string(),
            chunk_index: request.chunk_index,
            chunk_count: request.chunk_count,
            endpoint: request.display_endpoint.clone(),
            request_body: request.body.redacted(),
            http_status: Some(status.as_u16()),
            provider_message_id: extract_provider_message_id(request.channel, &body_json),
        })
    }
}

/// Chat rendering: bold escaped title, newline, then the markup body.
pub fn render_chat_text(message: &NotificationMessage) -> String {
    let body = to_chat_markup(message.body());
    let title = message.title().trim();
    if title.is_empty() {
        return body;
    }
    format!("<b>{}</b>\n{body}", escape_html(title))
}

fn classify_provider_status(status: StatusCode) -> (&'static str, bool) {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ("delivery_rate_limited", true);
    }
    if status.is_server_error() {
        return ("delivery_provider_unavailable", true);
    }
    if status.is_client_error() {
        return ("delivery_request_rejected", false);
    }
    ("delivery_unknown_http_failure", true)
}

/// Both APIs can answer 200 with an application-level refusal.
fn provider_accepted(channel: NotificationChannel, payload: &Value) -> bool {
    match channel {
        NotificationChannel::Telegram => payload.get("ok").and_then(Value::as_bool) != Some(false),
        NotificationChannel::Pushover => payload
            .get("status")
            .and_then(Value::as_i64)
            .map_or(true, |status| status == 1),
    }
}

fn extract_provider_message_id(channel: NotificationChannel, payload: &Value) -> Option<String> {
    match channel {
        NotificationChannel::Telegram => payload
            .get("result")
            .and_then(|value| value.get("message_id"))
            .and_then(Value::as_i64)
            .map(|value| value.to_string()),
        NotificationChannel::Pushover => payload
            .get("request")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn redact(raw: &str, secret_endpoint: &str, display_endpoint: &str) -> String {
    raw.replace(secret_endpoint, display_endpoint)
}

fn truncate_chars(raw: &str, limit: usize) -> String {
    if raw.chars().count() <= limit {
        return raw.to_string();
    }
    let mut output = raw.chars().take(limit.saturating_sub(3)).collect::<String>();
    output.push_str("...");
    output
}

/// Splits a line into markup tokens: a whole `<...>` tag, a whole `&...;` entity,
/// or a single character. Chunk cuts only ever fall between tokens.
fn markup_tokens(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = line;
    while let Some(first) = rest.chars().next() {
        let token_len = match first {
            '<' => tag_token_len(rest),
            '&' => entity_token_len(rest),
            _ => None,
        }
        .unwrap_or_else(|| first.len_utf8());
        let (token, tail) = rest.split_at(token_len);
        tokens.push(token);
        rest = tail;
    }
    tokens
}

fn tag_token_len(rest: &str) -> Option<usize> {
    let close = rest.find('>')?;
    (!rest[1..close].contains('<')).then_some(close + 1)
}

fn entity_token_len(rest: &str) -> Option<usize> {
    let end = rest.char_indices().skip(1).take(12).find_map(|(index, ch)| match ch {
        ';' => Some(Some(index)),
        ch if ch.is_ascii_alphanumeric() || ch == '#' => None,
        _ => Some(None),
    })??;
    (end > 1).then_some(end + 1)
}

/// Tracks which vocabulary tags are open at the current position.
fn apply_tag(open: &mut Vec<String>, token: &str) {
    if !token.starts_with('<') {
        return;
    }
    match parse_vocabulary_tag(token) {
        Some(VocabularyTag::Open(name)) => open.push(name),
        Some(VocabularyTag::Close(name)) => {
            if let Some(position) = open.iter().rposition(|inner| *inner == name) {
                open.truncate(position);
            }
        }
        Some(VocabularyTag::LineBreak) | None => {}
    }
}

fn closing_len(open: &[String]) -> usize {
    open.iter().map(|name| name.len() + 3).sum()
}

struct MarkupChunker {
    max_chars: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
    prefix_len: usize,
    open: Vec<String>,
}

impl MarkupChunker {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
            prefix_len: 0,
            open: Vec::new(),
        }
    }

    fn has_content(&self) -> bool {
        self.current_len > self.prefix_len
    }

    fn fits(&self, extra_len: usize, open_after: &[String]) -> bool {
        self.current_len + extra_len + closing_len(open_after) <= self.max_chars
    }

    /// Closes open tags, emits the chunk, and reopens them in a fresh one.
    fn flush(&mut self) {
        if self.has_content() {
            for name in self.open.iter().rev() {
                push_close_tag(&mut self.current, name);
            }
            self.chunks.push(std::mem::take(&mut self.current));
        }
        self.current.clear();
        for name in &self.open {
            push_open_tag(&mut self.current, name);
        }
        self.current_len = self.current.chars().count();
        self.prefix_len = self.current_len;
    }

    fn push_line(&mut self, line: &str) {
        let tokens = markup_tokens(line);
        let line_len = line.chars().count();
        let mut open_after = self.open.clone();
        for token in &tokens {
            apply_tag(&mut open_after, token);
        }
        let separator = usize::from(self.has_content());
        if self.fits(separator + line_len, &open_after) {
            self.append_line(separator, line, open_after);
            return;
        }
        self.flush();
        if self.fits(line_len, &open_after) {
            self.append_line(0, line, open_after);
            return;
        }
        for token in tokens {
            let token_len = token.chars().count();
            let mut open_next = self.open.clone();
            apply_tag(&mut open_next, token);
            if self.has_content() && !self.fits(token_len, &open_next) {
                self.flush();
            }
            self.current.push_str(token);
            self.current_len += token_len;
            self.open = open_next;
        }
    }

    fn append_line(&mut self, separator: usize, line: &str, open_after: Vec<String>) {
        if separator > 0 {
            self.current.push('\n');
        }
        self.current.push_str(line);
        self.current_len += separator + line.chars().count();
        self.open = open_after;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

/// Splits chat markup into chunks of at most `max_chars`, preferring line
/// boundaries. Cuts never fall inside a tag or entity, and vocabulary tags open
/// at a cut are closed at the end of the chunk and reopened in the next one.
fn chunk_markup(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() || max_chars == 0 {
        return Vec::new();
    }
    let mut chunker = MarkupChunker::new(max_chars);
    for line in text.split('\n') {
        chunker.push_line(line);
    }
    chunker.finish()
}
