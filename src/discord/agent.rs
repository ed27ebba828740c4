//! Discord Agent
//!
//! Agent struct and startup logic: logs the bot in, waits for the gateway to
//! become ready and hands back a [`SerenityPlatform`] for the dispatcher.

use super::handler;
use super::platform::SerenityPlatform;
use crate::bridge::BridgeEvent;
use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use serenity::async_trait;
use serenity::gateway::ShardManager;
use serenity::model::channel::{GuildChannel, Message};
use serenity::model::gateway::Ready;
use serenity::model::id::GuildId;
use serenity::prelude::*;

/// Discord bot that forwards guild events to the dispatcher
pub struct DiscordAgent {
    token: String,
    guild_id: u64,
    events: mpsc::Sender<BridgeEvent>,
}

/// A logged-in client. Dropping it does not disconnect; call [`shutdown`].
///
/// [`shutdown`]: DiscordConnection::shutdown
pub struct DiscordConnection {
    pub platform: Arc<SerenityPlatform>,
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

impl DiscordConnection {
    pub async fn shutdown(self) {
        self.shard_manager.shutdown_all().await;
        if let Err(e) = self.task.await {
            tracing::error!("Discord: client task error: {:?}", e);
        }
        tracing::info!("Discord: disconnected");
    }
}

impl DiscordAgent {
    pub fn new(token: String, guild_id: u64, events: mpsc::Sender<BridgeEvent>) -> Self {
        Self {
            token,
            guild_id,
            events,
        }
    }

    /// Start the client and wait until the gateway reports ready.
    pub async fn connect(self) -> Result<DiscordConnection> {
        if self.guild_id == 0 {
            anyhow::bail!("discord.guild_id must not be 0");
        }
        let guild = GuildId::new(self.guild_id);
        let (ready_tx, ready_rx) = oneshot::channel();

        let event_handler = Handler {
            guild,
            events: self.events,
            ready: Mutex::new(Some(ready_tx)),
        };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&self.token, intents)
            .event_handler(event_handler)
            .await
            .context("Failed to create Discord client")?;

        let http = client.http.clone();
        let shard_manager = client.shard_manager.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::error!("Discord: client error: {}", e);
            }
        });

        let bot_name = ready_rx
            .await
            .context("Discord client stopped before it became ready; check discord.token")?;
        tracing::info!("Discord: connected as {}", bot_name);

        Ok(DiscordConnection {
            platform: Arc::new(SerenityPlatform::new(http, guild)),
            shard_manager,
            task,
        })
    }
}

/// Serenity event handler that forwards guild events to the dispatcher.
struct Handler {
    guild: GuildId,
    events: mpsc::Sender<BridgeEvent>,
    ready: Mutex<Option<oneshot::Sender<String>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        if !ready.guilds.iter().any(|g| g.id == self.guild) {
            tracing::warn!("Discord: bot is not a member of guild {}", self.guild);
        }
        if let Some(tx) = self.ready.lock().await.take() {
            let _ = tx.send(ready.user.name.clone());
        } else {
            tracing::info!("Discord: gateway resumed as {}", ready.user.name);
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        handler::handle_message(&msg, self.guild, &self.events).await;
    }

    async fn channel_delete(
        &self,
        _ctx: Context,
        channel: GuildChannel,
        _messages: Option<Vec<Message>>,
    ) {
        handler::handle_channel_delete(&channel, self.guild, &self.events).await;
    }
}
