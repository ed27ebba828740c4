//! Discord Event Conversion
//!
//! Turns serenity gateway events into [`BridgeEvent`]s for the dispatcher.

use crate::bridge::events::{
    BridgeEvent, PlatformAuthor, PlatformEvent, PlatformMessage, PlatformReply,
};
use crate::bridge::platform::ChannelHandle;
use chrono::{DateTime, Utc};
use serenity::model::channel::{GuildChannel, Message};
use serenity::model::id::GuildId;
use tokio::sync::mpsc;

/// Nickname, then global display name, then user name.
pub fn author_display_name(nick: Option<&str>, global_name: Option<&str>, name: &str) -> String {
    nick.or(global_name)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(name)
        .to_string()
}

fn author_of(msg: &Message) -> PlatformAuthor {
    let nick = msg.member.as_ref().and_then(|m| m.nick.as_deref());
    PlatformAuthor {
        display_name: author_display_name(
            nick,
            msg.author.global_name.as_deref(),
            &msg.author.name,
        ),
        is_bot: msg.author.bot,
        is_webhook: msg.webhook_id.is_some(),
    }
}

pub fn to_utc(unix_seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(unix_seconds, 0).unwrap_or_else(Utc::now)
}

pub(crate) fn convert_message(msg: &Message) -> PlatformMessage {
    PlatformMessage {
        channel: ChannelHandle(msg.channel_id.get()),
        author: author_of(msg),
        content: msg.content.clone(),
        attachment_urls: msg.attachments.iter().map(|a| a.url.clone()).collect(),
        reply_to: msg.referenced_message.as_deref().map(|quoted| PlatformReply {
            author: author_of(quoted),
            content: quoted.content.clone(),
        }),
        timestamp: to_utc(msg.timestamp.unix_timestamp()),
    }
}

pub(crate) async fn handle_message(msg: &Message, guild: GuildId, events: &mpsc::Sender<BridgeEvent>) {
    if msg.guild_id != Some(guild) {
        return;
    }
    let converted = convert_message(msg);
    if events
        .send(BridgeEvent::Platform(PlatformEvent::Message(converted)))
        .await
        .is_err()
    {
        tracing::debug!("Discord: dispatcher gone, dropping message {}", msg.id);
    }
}

pub(crate) async fn handle_channel_delete(
    channel: &GuildChannel,
    guild: GuildId,
    events: &mpsc::Sender<BridgeEvent>,
) {
    if channel.guild_id != guild {
        return;
    }
    tracing::info!("Discord: channel {} ({}) deleted", channel.name, channel.id);
    let event = PlatformEvent::ChannelDeleted(ChannelHandle(channel.id.get()));
    if events.send(BridgeEvent::Platform(event)).await.is_err() {
        tracing::debug!("Discord: dispatcher gone, dropping channel deletion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_display_name_order() {
        assert_eq!(author_display_name(Some("Nick"), Some("Global"), "user"), "Nick");
        assert_eq!(author_display_name(None, Some("Global"), "user"), "Global");
        assert_eq!(author_display_name(None, None, "user"), "user");
        assert_eq!(author_display_name(Some(" "), None, "user"), "user");
    }

    #[test]
    fn test_to_utc() {
        assert_eq!(to_utc(1_700_000_000).timestamp(), 1_700_000_000);
    }
}
