//! Conversation Registry
//!
//! Durable mapping between remote conversation IDs and the Discord channel
//! (plus optional webhook) that mirrors each of them, together with the
//! per-conversation relay cursor read by the echo guard.

use super::platform::{ChannelHandle, GuildPlatform, PlatformError, WebhookHandle};
use super::whitelist::Whitelist;
use crate::db::VersionedDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Discord rejects channel names longer than this.
const MAX_CHANNEL_NAME_LEN: usize = 100;

/// Returns true for group conversation IDs.
pub fn is_group_id(remote_id: &str) -> bool {
    remote_id.ends_with("@g.us")
}

/// Which conversations are relayed through a named-sender webhook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Webhooks for group chats only; 1:1 chats use plain channel messages.
    #[default]
    GroupsOnly,
    /// A webhook for every conversation.
    All,
}

impl RoutingMode {
    pub fn needs_webhook(&self, remote_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::GroupsOnly => is_group_id(remote_id),
        }
    }
}

/// One mirrored conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub remote_id: String,
    pub channel: ChannelHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookHandle>,
    #[serde(default)]
    pub last_relayed_message_id: Option<String>,
    #[serde(default)]
    pub last_relayed_at: Option<DateTime<Utc>>,
}

impl ConversationEntry {
    fn new(remote_id: String, channel: ChannelHandle, webhook: Option<WebhookHandle>) -> Self {
        Self {
            remote_id,
            channel,
            webhook,
            last_relayed_message_id: None,
            last_relayed_at: None,
        }
    }
}

/// Result of [`ConversationRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub channel: ChannelHandle,
    pub webhook: Option<WebhookHandle>,
    pub created: bool,
}

/// Persisted form of the registry (the `chats` document).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub entries: Vec<ConversationEntry>,
}

impl VersionedDocument for RegistryDocument {
    const NAME: &'static str = "chats";
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }

    /// Unversioned documents map remote IDs to webhook objects:
    /// `{"<jid>": {"id": "...", "channelId": "...", ...}}` (or `channel_id`).
    fn upgrade_legacy(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.contains_key("version") {
            return None;
        }
        let mut entries = Vec::with_capacity(map.len());
        for (remote_id, webhook) in map {
            let channel = snowflake(webhook.get("channelId").or_else(|| webhook.get("channel_id"))?)?;
            let webhook_id = snowflake(webhook.get("id")?)?;
            let mut entry = ConversationEntry::new(
                remote_id.clone(),
                ChannelHandle(channel),
                Some(WebhookHandle { id: webhook_id }),
            );
            entry.last_relayed_message_id = webhook
                .get("last_message_ID")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            entries.push(entry);
        }
        Some(Self {
            version: Self::VERSION,
            entries,
        })
    }
}

fn snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// In-memory registry. Owned by the dispatcher task; never shared.
#[derive(Debug, Clone)]
pub struct ConversationRegistry {
    entries: BTreeMap<String, ConversationEntry>,
    parent: Option<ChannelHandle>,
    routing: RoutingMode,
    webhook_name: String,
}

impl ConversationRegistry {
    pub fn new(routing: RoutingMode, webhook_name: impl Into<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            parent: None,
            routing,
            webhook_name: webhook_name.into(),
        }
    }

    pub fn from_document(
        doc: RegistryDocument,
        routing: RoutingMode,
        webhook_name: impl Into<String>,
    ) -> Self {
        let mut registry = Self::new(routing, webhook_name);
        for entry in doc.entries {
            registry.entries.insert(entry.remote_id.clone(), entry);
        }
        registry
    }

    pub fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            version: RegistryDocument::VERSION,
            entries: self.entries.values().cloned().collect(),
        }
    }

    /// Category new channels are created under.
    pub fn set_parent(&mut self, parent: Option<ChannelHandle>) {
        self.parent = parent;
    }

    pub fn get(&self, remote_id: &str) -> Option<&ConversationEntry> {
        self.entries.get(remote_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the channel for `remote_id`, creating channel (and webhook when
    /// the routing mode wants one) on first contact. Platform failures are
    /// returned to the caller, whose delivery policy decides about retries.
    pub async fn resolve(
        &mut self,
        platform: &dyn GuildPlatform,
        remote_id: &str,
        display_name: &str,
    ) -> Result<Resolution, PlatformError> {
        if let Some(entry) = self.entries.get(remote_id) {
            return Ok(Resolution {
                channel: entry.channel,
                webhook: entry.webhook.clone(),
                created: false,
            });
        }

        let name = channel_name(display_name);
        let channel = platform.create_text_channel(&name, self.parent).await?;

        let webhook = if self.routing.needs_webhook(remote_id) {
            match platform.create_webhook(channel, &self.webhook_name).await {
                Ok(hook) => Some(hook),
                Err(e) => {
                    // Leave no orphan behind; the next resolve starts over.
                    if let Err(del) = platform.delete_channel(channel).await {
                        tracing::warn!("Registry: failed to remove channel {} after webhook error: {}", channel, del);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!("Registry: created channel {} for {}", channel, remote_id);
        self.entries.insert(
            remote_id.to_string(),
            ConversationEntry::new(remote_id.to_string(), channel, webhook.clone()),
        );
        Ok(Resolution {
            channel,
            webhook,
            created: true,
        })
    }

    pub fn reverse_resolve(&self, channel: ChannelHandle) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| entry.channel == channel)
            .map(|entry| entry.remote_id.as_str())
    }

    /// Drop the entry mapped to a deleted channel, along with its whitelist
    /// reference.
    pub fn prune(
        &mut self,
        channel: ChannelHandle,
        whitelist: &mut Whitelist,
    ) -> Option<ConversationEntry> {
        let remote_id = self.reverse_resolve(channel)?.to_string();
        let entry = self.entries.remove(&remote_id)?;
        let _ = whitelist.remove(&remote_id);
        tracing::info!("Registry: pruned {} (channel {} deleted)", remote_id, channel);
        Some(entry)
    }

    /// Keep only entries whose channel still exists. Returns the dropped ones.
    pub fn retain_existing(&mut self, existing: &HashSet<ChannelHandle>) -> Vec<ConversationEntry> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !existing.contains(&entry.channel))
            .map(|entry| entry.remote_id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Record a relayed message. Confirmations older than the stored cursor
    /// are ignored. Returns whether the cursor moved.
    pub fn advance_cursor(
        &mut self,
        remote_id: &str,
        message_id: &str,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(remote_id) else {
            return false;
        };
        if let Some(last) = entry.last_relayed_at
            && timestamp < last
        {
            tracing::debug!(
                "Registry: ignoring stale cursor {} for {} ({} < {})",
                message_id,
                remote_id,
                timestamp,
                last
            );
            return false;
        }
        entry.last_relayed_message_id = Some(message_id.to_string());
        entry.last_relayed_at = Some(timestamp);
        true
    }

    /// Record a message the bridge itself sent. Always stores the ID; the
    /// stored time never moves backwards even when `sent_at` (local clock)
    /// is behind the network time of the previous cursor.
    pub fn record_sent(
        &mut self,
        remote_id: &str,
        message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(remote_id) else {
            return false;
        };
        let at = entry.last_relayed_at.map_or(sent_at, |last| last.max(sent_at));
        entry.last_relayed_message_id = Some(message_id.to_string());
        entry.last_relayed_at = Some(at);
        true
    }

    pub fn last_relayed_message_id(&self, remote_id: &str) -> Option<&str> {
        self.entries
            .get(remote_id)
            .and_then(|entry| entry.last_relayed_message_id.as_deref())
    }
}

fn channel_name(display_name: &str) -> String {
    let trimmed = display_name.trim();
    let name = if trimmed.is_empty() { "conversation" } else { trimmed };
    name.chars().take(MAX_CHANNEL_NAME_LEN).collect()
}
