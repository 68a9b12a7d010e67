//! Notification formatting and outbound delivery for calbot.
//!
//! Messages carry rich-text markup. The chat channel receives it as HTML, the
//! push channel receives plain text derived from the same markup.

pub mod notify_format;
pub mod notify_message;
pub mod notify_outbound;

pub use notify_format::{
    escape_html, to_chat_markup, to_plain_text, to_rich_text, unescape_html, RichText,
    RICH_TEXT_TAGS,
};
pub use notify_message::{NotificationMessage, NotificationPriority};
pub use notify_outbound::{
    render_chat_text, ChannelOutcome, DeliveryError, DeliveryReceipt, DeliveryResult,
    NotificationChannel, NotificationDispatcher, NotificationOutboundConfig,
    NotificationOutboundMode,
};
