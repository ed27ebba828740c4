//! Relay engine tests against in-memory fakes of both networks.

pub mod fakes;

mod commands_test;

use crate::bridge::platform::{ChannelHandle, InboundBody, InboundMessage, MediaKind, MediaLocator, MediaPayload};
use crate::bridge::{BridgeState, Dispatcher, EchoGuard, PlatformAuthor, PlatformMessage, RoutingMode};
use crate::config::BridgeConfig;
use crate::db::{Database, StateStore};
use chrono::{DateTime, TimeZone, Utc};
use fakes::{FakeMobile, FakePlatform};
use std::sync::Arc;

pub const ALICE: &str = "15551234567@s.whatsapp.net";
pub const BOB: &str = "15557654321@s.whatsapp.net";
pub const FAMILY: &str = "15551234567-1600000000@g.us";
pub const OWN: &str = "15550000000@s.whatsapp.net";

/// Process start used by every harness.
pub fn started() -> DateTime<Utc> {
    ts(1_000)
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn text(id: &str, chat: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        chat: chat.to_string(),
        sender: chat.to_string(),
        push_name: None,
        timestamp: ts(2_000),
        from_me: false,
        is_group: chat.ends_with("@g.us"),
        is_forwarded: false,
        quote: None,
        body: InboundBody::Text(body.to_string()),
    }
}

pub fn media(id: &str, chat: &str, size: u64) -> InboundMessage {
    let payload = MediaPayload::new(MediaKind::Image, "image/png", size, MediaLocator::new(()));
    InboundMessage {
        body: InboundBody::Media(payload),
        ..text(id, chat, "")
    }
}

pub fn human(name: &str) -> PlatformAuthor {
    PlatformAuthor {
        display_name: name.to_string(),
        is_bot: false,
        is_webhook: false,
    }
}

pub fn discord(channel: ChannelHandle, content: &str) -> PlatformMessage {
    PlatformMessage {
        channel,
        author: human("Dana"),
        content: content.to_string(),
        attachment_urls: Vec::new(),
        reply_to: None,
        timestamp: Utc::now(),
    }
}

pub fn config(routing: RoutingMode) -> BridgeConfig {
    BridgeConfig {
        routing,
        ..BridgeConfig::default()
    }
}

pub async fn memory_store() -> StateStore {
    let db = Database::connect_in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    StateStore::new(db)
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub platform: Arc<FakePlatform>,
    pub mobile: Arc<FakeMobile>,
    pub store: StateStore,
}

impl Harness {
    /// Fresh state, every conversation routed through a webhook.
    pub async fn new() -> Self {
        Self::with(config(RoutingMode::All), FakePlatform::new(), FakeMobile::new(), |_| {}).await
    }

    /// Build a dispatcher over the given fakes and run the startup repair.
    pub async fn with(
        config: BridgeConfig,
        platform: FakePlatform,
        mobile: FakeMobile,
        prepare: impl FnOnce(&mut BridgeState),
    ) -> Self {
        let platform = Arc::new(platform);
        let mobile = Arc::new(mobile);
        let store = memory_store().await;
        let mut state = BridgeState::fresh(&config, 42);
        prepare(&mut state);
        let mut dispatcher = Dispatcher::new(
            platform.clone(),
            mobile.clone(),
            store.clone(),
            config,
            state,
            EchoGuard::starting_at(started()),
        );
        dispatcher.repair_channels().await.unwrap();
        Self {
            dispatcher,
            platform,
            mobile,
            store,
        }
    }

    pub fn control(&self) -> ChannelHandle {
        self.dispatcher.settings().control_channel.unwrap()
    }

    pub fn channel_of(&self, remote_id: &str) -> ChannelHandle {
        self.dispatcher.registry().get(remote_id).unwrap().channel
    }

    /// Replies posted to the control channel, oldest first.
    pub fn replies(&self) -> Vec<String> {
        self.platform.texts_in(self.control())
    }

    pub fn last_reply(&self) -> String {
        self.replies().pop().unwrap_or_default()
    }
}
