//! Collaborator Boundary
//!
//! Types and traits the relay engine consumes from the two networks it bridges.
//! Discord sits behind [`GuildPlatform`]; WhatsApp sits behind
//! [`MobileNetwork`] (messaging) and [`SessionTransport`] (connection lifecycle).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque reference to a guild channel (text channel or category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a webhook used for named-sender delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookHandle {
    pub id: u64,
}

/// A guild channel as reported by the platform's channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildChannelInfo {
    pub channel: ChannelHandle,
    pub name: String,
    pub parent: Option<ChannelHandle>,
    pub is_category: bool,
}

/// File attached to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// One platform call worth of content for a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub content: Option<String>,
    /// Display name override (webhook username).
    pub username: String,
    pub file: Option<Attachment>,
}

/// Errors from guild platform calls.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("platform client not connected")]
    NotConnected,

    #[error("platform API error: {0}")]
    Api(String),
}

impl PlatformError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// The guild chat platform (Discord) as seen by the relay engine.
#[async_trait]
pub trait GuildPlatform: Send + Sync {
    async fn create_category(&self, name: &str) -> Result<ChannelHandle, PlatformError>;

    async fn create_text_channel(
        &self,
        name: &str,
        parent: Option<ChannelHandle>,
    ) -> Result<ChannelHandle, PlatformError>;

    async fn create_webhook(
        &self,
        channel: ChannelHandle,
        name: &str,
    ) -> Result<WebhookHandle, PlatformError>;

    /// Post through a webhook, overriding the display name per call.
    async fn execute_webhook(
        &self,
        webhook: &WebhookHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError>;

    /// Post as the bot itself. Used for entries without a webhook.
    async fn send_delivery(
        &self,
        channel: ChannelHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError>;

    async fn send_text(&self, channel: ChannelHandle, text: &str) -> Result<(), PlatformError>;

    async fn send_file(
        &self,
        channel: ChannelHandle,
        attachment: Attachment,
    ) -> Result<(), PlatformError>;

    async fn edit_channel(
        &self,
        channel: ChannelHandle,
        position: Option<u16>,
        parent: Option<ChannelHandle>,
    ) -> Result<(), PlatformError>;

    async fn delete_channel(&self, channel: ChannelHandle) -> Result<(), PlatformError>;

    async fn list_channels(&self) -> Result<Vec<GuildChannelInfo>, PlatformError>;
}

/// Kind of media carried by an inbound mobile-network message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

/// Collaborator-owned reference used by [`MobileNetwork::download`] to fetch
/// the payload bytes. The engine never looks inside.
#[derive(Clone)]
pub struct MediaLocator(Arc<dyn Any + Send + Sync>);

impl MediaLocator {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for MediaLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediaLocator(..)")
    }
}

/// Media metadata announced by the mobile network before any download.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub mimetype: String,
    /// Document title or file name, when the sender supplied one.
    pub file_name: Option<String>,
    pub caption: Option<String>,
    declared_size: u64,
    pub locator: MediaLocator,
}

impl MediaPayload {
    pub fn new(
        kind: MediaKind,
        mimetype: impl Into<String>,
        declared_size: u64,
        locator: MediaLocator,
    ) -> Self {
        Self {
            kind,
            mimetype: mimetype.into(),
            file_name: None,
            caption: None,
            declared_size,
            locator,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Size in bytes as declared by the sender.
    pub fn size(&self) -> u64 {
        self.declared_size
    }

    /// File name used for the platform upload.
    pub fn upload_name(&self) -> String {
        let subtype = self
            .mimetype
            .split(';')
            .next()
            .and_then(|m| m.split('/').nth(1))
            .unwrap_or("bin")
            .trim();
        match self.kind {
            MediaKind::Document => self
                .file_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("document.{subtype}")),
            MediaKind::Audio if subtype.starts_with("ogg") => "audio.ogg".to_string(),
            kind => format!("{}.{}", kind.as_str(), subtype),
        }
    }
}

/// The quoted part of an inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundQuote {
    /// Remote ID of the quoted author.
    pub participant: String,
    pub content: String,
}

/// Body of an inbound mobile-network message.
#[derive(Debug, Clone)]
pub enum InboundBody {
    Text(String),
    Media(MediaPayload),
}

/// One message event from the mobile network.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    /// Conversation the message belongs to (1:1 peer, group or broadcast list).
    pub chat: String,
    /// Author of the message. Equals `chat` for 1:1 conversations.
    pub sender: String,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    pub is_group: bool,
    pub is_forwarded: bool,
    pub quote: Option<InboundQuote>,
    pub body: InboundBody,
}

/// Quote reference attached to an outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundQuote {
    pub participant: String,
    pub content: String,
}

/// Text sent to the mobile network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    pub text: String,
    pub quote: Option<OutboundQuote>,
}

/// A directory entry: a contact or a group the account belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub name: String,
}

/// Errors from mobile-network messaging calls.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("mobile network not connected")]
    NotConnected,

    #[error("invalid conversation id: {0}")]
    InvalidId(String),

    #[error("{0}")]
    Other(String),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Messaging half of the mobile network (WhatsApp).
#[async_trait]
pub trait MobileNetwork: Send + Sync {
    /// Send a text and return the message ID the network assigned.
    async fn send_text(&self, to: &str, message: OutboundText) -> Result<String, SendError>;

    async fn download(&self, media: &MediaPayload) -> Result<Vec<u8>, SendError>;

    /// Snapshot of known contacts and joined groups.
    async fn directory(&self) -> Vec<Contact>;
}

/// Errors from session transport calls.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store error: {0}")]
    Store(String),

    #[error("connect failed: {0}")]
    Connect(String),
}

/// Connection half of the mobile network, driven by the session manager.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Whether credentials from an earlier pairing are on disk.
    async fn has_stored_session(&self) -> bool;

    /// Start a connection. With `fresh` set, stored credentials are deleted
    /// first and the network is asked for a new pairing QR code.
    async fn connect(&self, fresh: bool) -> Result<(), SessionError>;

    async fn disconnect(&self);
}

/// Lifecycle events reported by the session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    QrCode(String),
    Connected { own_id: Option<String> },
    Disconnected { reason: String },
    /// Stored credentials were rejected by the network.
    LoggedOut,
}
