//! Channel-neutral notification value.
//!
//! A `NotificationMessage` is built once per event and handed to every
//! channel. Escalation fields (`retry`, `expire`) can only be set together with
//! emergency priority; lowering the priority drops them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    #[default]
    Normal,
    Elevated,
    Emergency,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::Emergency => "emergency",
        }
    }

    /// Priority code used by the plain-text push channel.
    pub fn push_code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Elevated => 1,
            Self::Emergency => 2,
        }
    }

    pub fn is_emergency(self) -> bool {
        self == Self::Emergency
    }
}

impl FromStr for NotificationPriority {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" | "0" => Ok(Self::Normal),
            "elevated" | "high" | "1" => Ok(Self::Elevated),
            "emergency" | "2" => Ok(Self::Emergency),
            other => Err(format!(
                "unknown priority '{other}' (expected normal, elevated, or emergency)"
            )),
        }
    }
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    title: String,
    body: String,
    priority: NotificationPriority,
    sound: Option<String>,
    retry: Option<Duration>,
    expire: Option<Duration>,
}

impl NotificationMessage {
    /// `body` is rich-text markup; plain-text channels derive their copy from it.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: NotificationPriority::Normal,
            sound: None,
            retry: None,
            expire: None,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        if !priority.is_emergency() {
            self.retry = None;
            self.expire = None;
        }
        self
    }

    pub fn with_sound(mut self, sound: impl Into<String>) -> Self {
        let sound = sound.into();
        let sound = sound.trim();
        self.sound = (!sound.is_empty()).then(|| sound.to_string());
        self
    }

    /// Raises the message to emergency priority with explicit re-alert timing.
    pub fn with_escalation(mut self, retry: Duration, expire: Duration) -> Self {
        self.priority = NotificationPriority::Emergency;
        self.retry = Some(retry);
        self.expire = Some(expire);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn priority(&self) -> NotificationPriority {
        self.priority
    }

    pub fn sound(&self) -> Option<&str> {
        self.sound.as_deref()
    }

    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    pub fn expire(&self) -> Option<Duration> {
        self.expire
    }
}
