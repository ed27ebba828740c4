//! Events funnelled into the dispatcher's queue.

use super::platform::{ChannelHandle, InboundMessage};
use super::session::SessionNotice;
use chrono::{DateTime, Utc};

/// Everything the dispatcher reacts to, from every source.
#[derive(Debug)]
pub enum BridgeEvent {
    Platform(PlatformEvent),
    Mobile(InboundMessage),
    Session(SessionNotice),
}

#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Message(PlatformMessage),
    ChannelDeleted(ChannelHandle),
}

/// Who wrote a Discord message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformAuthor {
    /// Guild nickname, falling back to the user name.
    pub display_name: String,
    pub is_bot: bool,
    /// Posted through a webhook (including the bridge's own).
    pub is_webhook: bool,
}

/// The message a Discord message replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformReply {
    pub author: PlatformAuthor,
    pub content: String,
}

/// A message created in the guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMessage {
    pub channel: ChannelHandle,
    pub author: PlatformAuthor,
    pub content: String,
    pub attachment_urls: Vec<String>,
    pub reply_to: Option<PlatformReply>,
    pub timestamp: DateTime<Utc>,
}
