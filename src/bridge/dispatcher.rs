//! Relay Dispatcher
//!
//! Single task that owns the registry, whitelist, settings and directory and
//! reacts to every [`BridgeEvent`]: WhatsApp messages relayed to Discord,
//! Discord messages relayed to WhatsApp, control-channel commands, channel
//! deletions and session notices.

use super::commands::{Command, HELP_TEXT, StartTarget};
use super::echo_guard::{EchoGuard, Verdict};
use super::events::{BridgeEvent, PlatformAuthor, PlatformEvent, PlatformMessage};
use super::platform::{
    Attachment, ChannelHandle, Delivery, GuildPlatform, InboundBody, InboundMessage,
    MobileNetwork, OutboundQuote, OutboundText, PlatformError, SendError,
};
use super::registry::{ConversationRegistry, RegistryDocument, Resolution};
use super::render::{
    self, DISCORD_MESSAGE_LIMIT, download_failed_notice, oversized_file_notice,
};
use super::session::{SessionNotice, SessionState};
use super::settings::{BridgeSettings, ContactDirectory, local_part};
use super::whitelist::WhitelistError;
use crate::config::BridgeConfig;
use crate::db::StateStore;
use crate::error::{BridgeError, SetupError};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Extra attempts for a platform or network call that timed out.
pub const MAX_DELIVERY_RETRIES: usize = 1;

/// Position mapped channels are moved to inside the category.
const MAPPED_CHANNEL_POSITION: u16 = 999;

/// Display name of the account the bridge runs as.
pub const SELF_NAME: &str = "You";

trait Retryable: Display {
    fn is_timeout(&self) -> bool;
}

impl Retryable for PlatformError {
    fn is_timeout(&self) -> bool {
        PlatformError::is_timeout(self)
    }
}

impl Retryable for SendError {
    fn is_timeout(&self) -> bool {
        SendError::is_timeout(self)
    }
}

/// Run `call`, repeating it up to [`MAX_DELIVERY_RETRIES`] times on timeout.
async fn with_retry<T, E, F, Fut>(what: &str, mut call: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0;
    loop {
        match call().await {
            Err(e) if e.is_timeout() && retries < MAX_DELIVERY_RETRIES => {
                retries += 1;
                tracing::warn!(
                    "Relay: {} timed out, retrying ({}/{}): {}",
                    what,
                    retries,
                    MAX_DELIVERY_RETRIES,
                    e
                );
            }
            other => return other,
        }
    }
}

/// Persisted state handed to the dispatcher at startup.
#[derive(Debug, Clone)]
pub struct BridgeState {
    pub settings: BridgeSettings,
    pub registry: ConversationRegistry,
    pub directory: ContactDirectory,
}

impl BridgeState {
    pub fn fresh(config: &BridgeConfig, guild_id: u64) -> Self {
        Self {
            settings: BridgeSettings {
                guild_id: Some(guild_id),
                ..BridgeSettings::default()
            },
            registry: ConversationRegistry::new(config.routing, config.webhook_name.clone()),
            directory: ContactDirectory::new(),
        }
    }

    /// Load all documents. Stored state for a different guild is refused.
    pub async fn load(
        store: &StateStore,
        config: &BridgeConfig,
        guild_id: u64,
    ) -> Result<Self, SetupError> {
        let mut settings = store
            .load_for_startup::<BridgeSettings>()
            .await?
            .unwrap_or_default();
        match settings.guild_id {
            Some(stored) if stored != guild_id => {
                return Err(SetupError::GuildMismatch {
                    stored,
                    configured: guild_id,
                });
            }
            _ => settings.guild_id = Some(guild_id),
        }

        let registry = match store.load_for_startup::<RegistryDocument>().await? {
            Some(doc) => {
                ConversationRegistry::from_document(doc, config.routing, config.webhook_name.clone())
            }
            None => ConversationRegistry::new(config.routing, config.webhook_name.clone()),
        };
        let directory = store
            .load_for_startup::<ContactDirectory>()
            .await?
            .unwrap_or_default();

        tracing::info!(
            "Relay: loaded {} conversations, {} whitelisted, {} contacts",
            registry.len(),
            settings.whitelist.len(),
            directory.len()
        );
        Ok(Self {
            settings,
            registry,
            directory,
        })
    }
}

pub struct Dispatcher {
    platform: Arc<dyn GuildPlatform>,
    mobile: Arc<dyn MobileNetwork>,
    store: StateStore,
    config: BridgeConfig,
    settings: BridgeSettings,
    registry: ConversationRegistry,
    directory: ContactDirectory,
    guard: EchoGuard,
    session: SessionState,
    own_id: Option<String>,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn GuildPlatform>,
        mobile: Arc<dyn MobileNetwork>,
        store: StateStore,
        config: BridgeConfig,
        state: BridgeState,
        guard: EchoGuard,
    ) -> Self {
        let mut registry = state.registry;
        registry.set_parent(state.settings.category);
        Self {
            platform,
            mobile,
            store,
            config,
            settings: state.settings,
            registry,
            directory: state.directory,
            guard,
            session: SessionState::Unpaired,
            own_id: None,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ContactDirectory {
        &self.directory
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Process events until shutdown, then drain what is queued and flush
    /// state to storage.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<BridgeEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), BridgeError> {
        tracing::info!("Relay: dispatcher running");
        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break self.drain(&mut events).await,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle(event).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };
        if let Err(ref e) = result {
            tracing::error!("Relay: dispatcher stopping: {}", e);
        }
        self.flush().await;
        tracing::info!("Relay: dispatcher stopped");
        result
    }

    async fn drain(&mut self, events: &mut mpsc::Receiver<BridgeEvent>) -> Result<(), BridgeError> {
        events.close();
        while let Some(event) = events.recv().await {
            self.handle(event).await?;
        }
        Ok(())
    }

    pub async fn handle(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        match event {
            BridgeEvent::Mobile(message) => self.relay_inbound(message).await,
            BridgeEvent::Platform(PlatformEvent::Message(message)) => {
                self.on_platform_message(message).await
            }
            BridgeEvent::Platform(PlatformEvent::ChannelDeleted(channel)) => {
                self.on_channel_deleted(channel).await
            }
            BridgeEvent::Session(notice) => {
                self.on_session(notice).await;
                Ok(())
            }
        }
    }

    // ── Channel repair ──────────────────────────────────────────────

    /// Make sure the category and control channel exist, move channels
    /// into place, prune entries whose channel is gone and delete unmapped
    /// channels inside the category.
    pub async fn repair_channels(&mut self) -> Result<(), SetupError> {
        let platform = self.platform.clone();
        let listing = with_retry("list channels", || platform.list_channels())
            .await
            .map_err(|e| SetupError::Repair(e.to_string()))?;
        let existing: HashMap<ChannelHandle, _> =
            listing.iter().map(|info| (info.channel, info)).collect();

        let category = match self
            .settings
            .category
            .filter(|c| existing.get(c).is_some_and(|info| info.is_category))
        {
            Some(category) => category,
            None => {
                let name = self.config.category_name.clone();
                let category = with_retry("create category", || platform.create_category(&name))
                    .await
                    .map_err(|e| SetupError::Repair(e.to_string()))?;
                tracing::info!("Relay: created category {} ({})", name, category);
                category
            }
        };
        self.settings.category = Some(category);
        self.registry.set_parent(Some(category));

        let control = match self
            .settings
            .control_channel
            .filter(|c| existing.get(c).is_some_and(|info| !info.is_category))
        {
            Some(control) => control,
            None => {
                let name = self.config.control_channel_name.clone();
                let control = with_retry("create control channel", || {
                    platform.create_text_channel(&name, Some(category))
                })
                .await
                .map_err(|e| SetupError::Repair(e.to_string()))?;
                tracing::info!("Relay: created control channel {} ({})", name, control);
                control
            }
        };
        self.settings.control_channel = Some(control);
        if let Err(e) = platform.edit_channel(control, Some(0), Some(category)).await {
            tracing::warn!("Relay: failed to move control channel: {}", e);
        }

        let ids: HashSet<ChannelHandle> = existing.keys().copied().collect();
        for entry in self.registry.retain_existing(&ids) {
            let _ = self.settings.whitelist.remove(&entry.remote_id);
            tracing::info!(
                "Relay: dropped {} (channel {} no longer exists)",
                entry.remote_id,
                entry.channel
            );
        }

        for entry in self.registry.entries() {
            let misplaced = existing
                .get(&entry.channel)
                .is_some_and(|info| info.parent != Some(category));
            if misplaced
                && let Err(e) = platform
                    .edit_channel(entry.channel, Some(MAPPED_CHANNEL_POSITION), Some(category))
                    .await
            {
                tracing::warn!("Relay: failed to move channel {}: {}", entry.channel, e);
            }
        }

        for info in &listing {
            let orphan = info.parent == Some(category)
                && !info.is_category
                && info.channel != control
                && self.registry.reverse_resolve(info.channel).is_none();
            if orphan {
                tracing::info!("Relay: deleting unmapped channel {} ({})", info.name, info.channel);
                if let Err(e) = platform.delete_channel(info.channel).await {
                    tracing::warn!("Relay: failed to delete channel {}: {}", info.channel, e);
                }
            }
        }

        self.save_settings().await;
        self.save_registry().await;
        Ok(())
    }

    // ── WhatsApp → Discord ──────────────────────────────────────────

    async fn relay_inbound(&mut self, message: InboundMessage) -> Result<(), BridgeError> {
        if message.from_me {
            if self.own_id.is_none() {
                self.own_id = Some(normalize_id(&message.sender));
            }
        } else if let Some(push_name) = message.push_name.as_deref()
            && self.directory.name_of(&message.sender).is_none()
            && self.directory.learn(&message.sender, push_name)
        {
            self.save_directory().await;
        }

        let verdict = self.guard.check(&message, &self.registry, &self.settings.whitelist);
        if verdict != Verdict::Relay {
            tracing::debug!("Relay: skipping {} from {}: {:?}", message.id, message.chat, verdict);
            return Ok(());
        }

        let chat_push_name = (!message.is_group && !message.from_me)
            .then_some(message.push_name.as_deref())
            .flatten();
        let chat_name = self.directory.display_name(&message.chat, chat_push_name);
        let sender_name = if message.from_me {
            SELF_NAME.to_string()
        } else {
            self.directory
                .display_name(&message.sender, message.push_name.as_deref())
        };

        let Some(target) = self.resolve(&message.chat, &chat_name).await? else {
            return Ok(());
        };

        let deliveries = self.build_deliveries(&message, &sender_name, &target).await;
        for (landed, delivery) in deliveries.iter().enumerate() {
            let platform = self.platform.clone();
            let sent = with_retry("deliver message", || match &target.webhook {
                Some(webhook) => platform.execute_webhook(webhook, delivery),
                None => platform.send_delivery(target.channel, delivery),
            })
            .await;
            let Err(e) = sent else { continue };
            if landed == 0 {
                tracing::error!(
                    "Relay: failed to deliver {} to channel {}: {}",
                    message.id,
                    target.channel,
                    e
                );
                return Ok(());
            }
            // Earlier parts are already visible, so the message counts as relayed.
            tracing::error!(
                "Relay: partially delivered {} to channel {}: {} of {} parts sent, rest dropped: {}",
                message.id,
                target.channel,
                landed,
                deliveries.len(),
                e
            );
            break;
        }

        if self
            .registry
            .advance_cursor(&message.chat, &message.id, message.timestamp)
        {
            self.save_registry().await;
        }
        tracing::debug!("Relay: relayed {} to channel {}", message.id, target.channel);
        Ok(())
    }

    /// Lookup-or-create with retry. `None` when the platform keeps failing.
    async fn resolve(
        &mut self,
        remote_id: &str,
        display_name: &str,
    ) -> Result<Option<Resolution>, BridgeError> {
        let mut retries = 0;
        let resolution = loop {
            match self
                .registry
                .resolve(self.platform.as_ref(), remote_id, display_name)
                .await
            {
                Ok(resolution) => break resolution,
                Err(e) if e.is_timeout() && retries < MAX_DELIVERY_RETRIES => {
                    retries += 1;
                    tracing::warn!("Relay: creating channel for {} timed out, retrying", remote_id);
                }
                Err(e) => {
                    tracing::error!("Relay: failed to create channel for {}: {}", remote_id, e);
                    return Ok(None);
                }
            }
        };
        if self.registry.get(remote_id).is_none() {
            return Err(BridgeError::Protocol(format!(
                "registry has no entry for {remote_id} right after resolving it"
            )));
        }
        if resolution.created {
            self.save_registry().await;
        }
        Ok(Some(resolution))
    }

    async fn build_deliveries(
        &self,
        message: &InboundMessage,
        sender_name: &str,
        target: &Resolution,
    ) -> Vec<Delivery> {
        let quote = message.quote.as_ref().map(|q| {
            let author = if self.is_own_id(&q.participant) {
                SELF_NAME.to_string()
            } else {
                self.directory.display_name(&q.participant, None)
            };
            (author, q.content.clone())
        });
        let quote = quote.as_ref().map(|(a, c)| (a.as_str(), c.as_str()));

        let (text, file) = match &message.body {
            InboundBody::Text(text) => (
                render::render_inbound(text, quote, message.is_forwarded),
                None,
            ),
            InboundBody::Media(media) => {
                let caption = media.caption.as_deref().unwrap_or_default();
                let caption = render::render_inbound(caption, quote, message.is_forwarded && !caption.is_empty());
                let ceiling = self.config.attachment_ceiling_bytes;
                if media.size() > ceiling {
                    tracing::info!(
                        "Relay: {} carries {} bytes of {}, over the ceiling",
                        message.id,
                        media.size(),
                        media.kind.as_str()
                    );
                    (join_lines(&caption, &oversized_file_notice(ceiling)), None)
                } else {
                    let mobile = self.mobile.clone();
                    match with_retry("download media", || mobile.download(media)).await {
                        Ok(bytes) if bytes.len() as u64 > ceiling => {
                            (join_lines(&caption, &oversized_file_notice(ceiling)), None)
                        }
                        Ok(bytes) => (
                            caption,
                            Some(Attachment {
                                file_name: media.upload_name(),
                                bytes,
                            }),
                        ),
                        Err(e) => {
                            tracing::warn!("Relay: failed to download {}: {}", message.id, e);
                            (join_lines(&caption, &download_failed_notice(&e.to_string())), None)
                        }
                    }
                }
            }
        };

        let mut text = text;
        if message.is_group && self.settings.wa_group_prefix {
            text = render::with_name_prefix(sender_name, &text);
        }
        if target.webhook.is_none() {
            text = render::with_bold_sender(sender_name, &text);
        }

        let chunks = render::split_message(&text, DISCORD_MESSAGE_LIMIT);
        let last = chunks.len().saturating_sub(1);
        let mut file = file;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Delivery {
                content: Some(chunk.to_string()).filter(|c| !c.is_empty()),
                username: sender_name.to_string(),
                file: if i == last { file.take() } else { None },
            })
            .collect()
    }

    fn is_own_id(&self, remote_id: &str) -> bool {
        self.own_id
            .as_deref()
            .is_some_and(|own| own == normalize_id(remote_id))
    }

    // ── Discord → WhatsApp ──────────────────────────────────────────

    async fn on_platform_message(&mut self, message: PlatformMessage) -> Result<(), BridgeError> {
        if message.author.is_bot || message.author.is_webhook {
            return Ok(());
        }
        if Some(message.channel) == self.settings.control_channel {
            return self.run_command(&message).await;
        }
        let Some(remote_id) = self.registry.reverse_resolve(message.channel).map(str::to_string)
        else {
            return Ok(());
        };

        let mut text = message.content.clone();
        for url in &message.attachment_urls {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(url);
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        if self.settings.discord_prefix {
            text = render::with_name_prefix(&message.author.display_name, &text);
        }

        let quote = message.reply_to.as_ref().and_then(|reply| {
            let (name, content) = strip_bold_sender(&reply.author, &reply.content);
            let participant = self.quote_participant(&reply.author, name)?;
            Some(OutboundQuote {
                participant,
                content: content.to_string(),
            })
        });

        let outbound = OutboundText { text, quote };
        let mobile = self.mobile.clone();
        match with_retry("send to WhatsApp", || mobile.send_text(&remote_id, outbound.clone())).await {
            Ok(sent_id) => {
                tracing::debug!("Relay: sent {} to {}", sent_id, remote_id);
                if self.registry.record_sent(&remote_id, &sent_id, Utc::now()) {
                    self.save_registry().await;
                }
            }
            Err(e) => {
                tracing::error!("Relay: failed to send to {}: {}", remote_id, e);
                let feedback = format!("Failed to send message! Error: {e}");
                let platform = self.platform.clone();
                if let Err(e) =
                    with_retry("send feedback", || platform.send_text(message.channel, &feedback)).await
                {
                    tracing::warn!("Relay: failed to post send failure: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Remote ID of the author of a replied-to Discord message.
    fn quote_participant(&self, author: &PlatformAuthor, name: Option<&str>) -> Option<String> {
        let name = match (author.is_webhook, name) {
            (true, _) => Some(author.display_name.as_str()),
            (false, Some(name)) => Some(name),
            (false, None) if author.is_bot => None,
            (false, None) => Some(author.display_name.as_str()),
        };
        match name {
            None | Some(SELF_NAME) => {
                if self.own_id.is_none() {
                    tracing::debug!("Relay: own WhatsApp ID unknown, dropping quote");
                }
                self.own_id.clone()
            }
            Some(name) => Some(
                self.directory
                    .id_for_name(name)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{name}@s.whatsapp.net")),
            ),
        }
    }

    // ── Control channel ─────────────────────────────────────────────

    async fn run_command(&mut self, message: &PlatformMessage) -> Result<(), BridgeError> {
        let command = Command::parse(&message.content);
        tracing::info!("Relay: command from {}: {:?}", message.author.display_name, command);
        match command {
            Command::Start(StartTarget::Number(remote_id)) => {
                let name = self.directory.display_name(&remote_id, None);
                self.start_conversation(&remote_id, &name).await?;
            }
            Command::Start(StartTarget::Name(name)) => {
                let matches: Vec<(String, String)> = self
                    .directory
                    .find_by_name(&name)
                    .into_iter()
                    .map(|id| (id.to_string(), self.directory.display_name(id, None)))
                    .collect();
                if matches.is_empty() {
                    self.notify_control(&format!("Couldn't find `{name}`.")).await;
                }
                for (remote_id, display) in matches {
                    self.start_conversation(&remote_id, &display).await?;
                }
            }
            Command::List(filter) => {
                let names = self.directory.search(filter.as_deref().unwrap_or_default());
                let reply = if names.is_empty() {
                    "No results were found.".to_string()
                } else {
                    format!("```\n{}\n```", names.join("\n"))
                };
                self.notify_control(&reply).await;
            }
            Command::WhitelistAdd(channels) => {
                for channel in channels {
                    let reply = match self.registry.reverse_resolve(channel).map(str::to_string) {
                        None => "Couldn't find a chat with the given channel.",
                        Some(remote_id) => {
                            if self.settings.whitelist.add(remote_id) {
                                self.save_settings().await;
                                "Added to the whitelist!"
                            } else {
                                "Already in the whitelist."
                            }
                        }
                    };
                    self.notify_control(reply).await;
                }
            }
            Command::WhitelistRemove(channels) => {
                for channel in channels {
                    let reply = match self.registry.reverse_resolve(channel).map(str::to_string) {
                        None => "Couldn't find a chat with the given channel.",
                        Some(remote_id) => match self.settings.whitelist.remove(&remote_id) {
                            Ok(()) => {
                                self.save_settings().await;
                                "Removed from the whitelist!"
                            }
                            Err(WhitelistError::NotWhitelisted) => {
                                "This conversation is not whitelisted. Use `listWhitelist` to see the whitelist."
                            }
                        },
                    };
                    self.notify_control(reply).await;
                }
            }
            Command::WhitelistList => {
                let reply = if self.settings.whitelist.is_empty() {
                    "Whitelist is empty/inactive.".to_string()
                } else {
                    let names: Vec<String> = self
                        .settings
                        .whitelist
                        .iter()
                        .map(|id| self.directory.display_name(id, None))
                        .collect();
                    format!("```\n{}\n```", names.join("\n"))
                };
                self.notify_control(&reply).await;
            }
            Command::SetDiscordPrefix(enabled) => {
                self.settings.discord_prefix = enabled;
                self.save_settings().await;
                self.notify_control(if enabled {
                    "Discord username prefix enabled!"
                } else {
                    "Discord username prefix disabled!"
                })
                .await;
            }
            Command::SetGroupPrefix(enabled) => {
                self.settings.wa_group_prefix = enabled;
                self.save_settings().await;
                self.notify_control(if enabled {
                    "WhatsApp name prefix enabled!"
                } else {
                    "WhatsApp name prefix disabled!"
                })
                .await;
            }
            Command::Resync => {
                self.refresh_directory().await;
                self.notify_control("Re-synced!").await;
            }
            Command::Status => {
                let whitelist = if self.settings.whitelist.is_empty() {
                    "inactive".to_string()
                } else {
                    self.settings.whitelist.len().to_string()
                };
                let reply = format!(
                    "WhatsApp: {}\nConversations: {}\nWhitelist: {}\nContacts: {}",
                    self.session.label(),
                    self.registry.len(),
                    whitelist,
                    self.directory.len()
                );
                self.notify_control(&reply).await;
            }
            Command::Ping => {
                let latency = (Utc::now() - message.timestamp).num_milliseconds().max(0);
                self.notify_control(&format!("Pong {latency}ms!")).await;
            }
            Command::Help => self.notify_control(HELP_TEXT).await,
            Command::Usage(usage) => {
                self.notify_control(&format!("Please enter a valid argument. Usage: `{usage}`."))
                    .await;
            }
            Command::Unknown(_) => {
                self.notify_control(&format!(
                    "Unknown command: `{}`\nType `help` to see available commands",
                    message.content.trim()
                ))
                .await;
            }
        }
        Ok(())
    }

    async fn start_conversation(&mut self, remote_id: &str, name: &str) -> Result<(), BridgeError> {
        let Some(resolution) = self.resolve(remote_id, name).await? else {
            self.notify_control(&format!("Couldn't create a channel for `{name}`."))
                .await;
            return Ok(());
        };
        if !self.settings.whitelist.is_empty() && self.settings.whitelist.add(remote_id) {
            self.save_settings().await;
        }
        self.notify_control(&format!(
            "Started a conversation with {name}: <#{}>",
            resolution.channel
        ))
        .await;
        Ok(())
    }

    async fn notify_control(&self, text: &str) {
        let Some(control) = self.settings.control_channel else {
            tracing::warn!("Relay: no control channel, dropping notice: {}", text);
            return;
        };
        for chunk in render::split_message(text, DISCORD_MESSAGE_LIMIT) {
            let platform = self.platform.clone();
            if let Err(e) = with_retry("post to control channel", || platform.send_text(control, chunk)).await {
                tracing::warn!("Relay: failed to post to control channel: {}", e);
                return;
            }
        }
    }

    // ── Channel deletion ────────────────────────────────────────────

    async fn on_channel_deleted(&mut self, channel: ChannelHandle) -> Result<(), BridgeError> {
        if Some(channel) == self.settings.control_channel || Some(channel) == self.settings.category {
            tracing::warn!("Relay: bridge channel {} was deleted, repairing", channel);
            if Some(channel) == self.settings.control_channel {
                self.settings.control_channel = None;
            } else {
                self.settings.category = None;
            }
            self.repair_channels().await?;
            return Ok(());
        }
        if self
            .registry
            .prune(channel, &mut self.settings.whitelist)
            .is_some()
        {
            self.save_registry().await;
            self.save_settings().await;
        }
        Ok(())
    }

    // ── Session notices ─────────────────────────────────────────────

    async fn on_session(&mut self, notice: SessionNotice) {
        self.session.apply(&notice);
        match notice {
            SessionNotice::QrCode { payload, png } => match (png, self.settings.control_channel) {
                (Some(png), Some(control)) => {
                    let platform = self.platform.clone();
                    let sent = with_retry("post QR code", || {
                        platform.send_file(
                            control,
                            Attachment {
                                file_name: "qrcode.png".to_string(),
                                bytes: png.clone(),
                            },
                        )
                    })
                    .await;
                    if let Err(e) = sent {
                        tracing::warn!("Relay: failed to post QR code: {}", e);
                    }
                }
                _ => {
                    self.notify_control(&format!("Scan this pairing code with WhatsApp:\n```\n{payload}\n```"))
                        .await;
                }
            },
            SessionNotice::Connected { own_id } => {
                if let Some(own_id) = own_id {
                    self.own_id = Some(normalize_id(&own_id));
                }
                tracing::info!("WhatsApp: connection opened");
                self.notify_control("WhatsApp connection successfully opened!").await;
                self.refresh_directory().await;
            }
            SessionNotice::Disconnected {
                reason,
                attempt,
                retry_in,
            } => match retry_in {
                Some(delay) => tracing::warn!(
                    "WhatsApp: disconnected ({}), attempt {} reconnects in {}s",
                    reason,
                    attempt,
                    delay.as_secs()
                ),
                None => {
                    tracing::error!("WhatsApp: {} reconnects failed ({}), pairing again", attempt, reason);
                    self.notify_control(
                        "WhatsApp connection failed repeatedly. Scan the new QR code to pair again.",
                    )
                    .await;
                }
            },
            SessionNotice::LoggedOut => {
                tracing::warn!("WhatsApp: logged out");
                self.notify_control("WhatsApp session was logged out. Scan the new QR code to pair again.")
                    .await;
            }
            SessionNotice::PairingExpired => {
                tracing::info!("WhatsApp: pairing window expired");
            }
        }
    }

    async fn refresh_directory(&mut self) {
        let snapshot = self.mobile.directory().await;
        let changed = self.directory.merge(&snapshot);
        tracing::info!(
            "Relay: directory refreshed ({} entries, {} changed)",
            self.directory.len(),
            changed
        );
        if changed > 0 {
            self.save_directory().await;
        }
    }

    // ── Persistence ─────────────────────────────────────────────────

    async fn save_settings(&self) {
        if let Err(e) = self.store.save(&self.settings).await {
            tracing::error!("Relay: failed to persist settings: {}", e);
        }
    }

    async fn save_registry(&self) {
        if let Err(e) = self.store.save(&self.registry.to_document()).await {
            tracing::error!("Relay: failed to persist conversations: {}", e);
        }
    }

    async fn save_directory(&self) {
        if let Err(e) = self.store.save(&self.directory).await {
            tracing::error!("Relay: failed to persist contacts: {}", e);
        }
    }

    pub async fn flush(&self) {
        self.save_settings().await;
        self.save_registry().await;
        self.save_directory().await;
    }
}

/// `user@server` without a device suffix.
fn normalize_id(remote_id: &str) -> String {
    match remote_id.split_once('@') {
        Some((_, server)) => format!("{}@{}", local_part(remote_id), server),
        None => remote_id.to_string(),
    }
}

fn join_lines(first: &str, second: &str) -> String {
    if first.is_empty() {
        second.to_string()
    } else {
        format!("{first}\n{second}")
    }
}

/// Split the `**name**: ` line the bridge adds to bot-authored messages.
fn strip_bold_sender<'a>(author: &PlatformAuthor, content: &'a str) -> (Option<&'a str>, &'a str) {
    if !author.is_bot {
        return (None, content);
    }
    content
        .strip_prefix("**")
        .and_then(|rest| rest.split_once("**"))
        .map(|(name, rest)| (Some(name), rest.strip_prefix(": ").unwrap_or(rest)))
        .unwrap_or((None, content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> PlatformAuthor {
        PlatformAuthor {
            display_name: "wabridge".into(),
            is_bot: true,
            is_webhook: false,
        }
    }

    #[test]
    fn test_normalize_id_strips_device() {
        assert_eq!(normalize_id("1555:12@s.whatsapp.net"), "1555@s.whatsapp.net");
        assert_eq!(normalize_id("1555@s.whatsapp.net"), "1555@s.whatsapp.net");
        assert_eq!(normalize_id("garbage"), "garbage");
    }

    #[test]
    fn test_strip_bold_sender() {
        assert_eq!(strip_bold_sender(&bot(), "**Alice**: hi"), (Some("Alice"), "hi"));
        assert_eq!(strip_bold_sender(&bot(), "plain"), (None, "plain"));
        let human = PlatformAuthor {
            is_bot: false,
            ..bot()
        };
        assert_eq!(strip_bold_sender(&human, "**Alice**: hi"), (None, "**Alice**: hi"));
    }

    #[tokio::test]
    async fn test_with_retry_retries_timeouts_once() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), PlatformError> = with_retry("test", || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(PlatformError::Timeout("slow".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1 + MAX_DELIVERY_RETRIES);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_other_errors() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), SendError> = with_retry("test", || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(SendError::InvalidId("x".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
