//! Control Channel Tests
//!
//! Commands typed into the control channel and the session notices posted
//! there.

use super::fakes::{FakeMobile, FakePlatform};
use super::*;
use crate::bridge::commands::HELP_TEXT;
use crate::bridge::platform::WebhookHandle;
use crate::bridge::registry::{ConversationRegistry, RegistryDocument};
use crate::bridge::session::SessionNotice;
use crate::bridge::settings::BridgeSettings;
use crate::bridge::{BridgeEvent, ConversationEntry, PlatformEvent};
use crate::db::LoadOutcome;
use rstest::rstest;

async fn command(h: &mut Harness, content: &str) {
    let message = discord(h.control(), content);
    h.dispatcher
        .handle(BridgeEvent::Platform(PlatformEvent::Message(message)))
        .await
        .unwrap();
}

async fn notice(h: &mut Harness, notice: SessionNotice) {
    h.dispatcher.handle(BridgeEvent::Session(notice)).await.unwrap();
}

/// Harness whose registry already maps channel 123 to Alice.
async fn with_mapped_alice() -> Harness {
    let platform = FakePlatform::new();
    platform.add_channel(123, "alice", None, false);
    Harness::with(config(RoutingMode::All), platform, FakeMobile::new(), |state| {
        let doc = RegistryDocument {
            version: 1,
            entries: vec![ConversationEntry {
                remote_id: ALICE.to_string(),
                channel: ChannelHandle(123),
                webhook: Some(WebhookHandle { id: 124 }),
                last_relayed_message_id: None,
                last_relayed_at: None,
            }],
        };
        state.registry = ConversationRegistry::from_document(doc, RoutingMode::All, "WA2DC");
    })
    .await
}

fn directory(names: &[(&str, &str)]) -> impl FnOnce(&mut crate::bridge::BridgeState) {
    let names: Vec<(String, String)> = names
        .iter()
        .map(|(id, name)| (id.to_string(), name.to_string()))
        .collect();
    move |state| {
        for (id, name) in names {
            state.directory.learn(&id, &name);
        }
    }
}

#[tokio::test]
async fn test_add_to_whitelist_then_other_conversations_are_filtered() {
    let mut h = with_mapped_alice().await;

    command(&mut h, "addtowhitelist <#123>").await;

    assert_eq!(h.last_reply(), "Added to the whitelist!");
    assert!(h.dispatcher.settings().whitelist.contains(ALICE));

    h.dispatcher
        .handle(BridgeEvent::Mobile(text("M1", BOB, "hey")))
        .await
        .unwrap();
    assert!(h.dispatcher.registry().get(BOB).is_none());
    assert!(h.platform.deliveries().is_empty());

    let LoadOutcome::Current(saved) = h.store.load::<BridgeSettings>().await.unwrap() else {
        panic!("settings not saved");
    };
    assert!(saved.whitelist.contains(ALICE));
}

#[tokio::test]
async fn test_whitelist_subcommands() {
    let mut h = with_mapped_alice().await;

    command(&mut h, "whitelist list").await;
    assert_eq!(h.last_reply(), "Whitelist is empty/inactive.");

    command(&mut h, "whitelist add <#123>").await;
    command(&mut h, "whitelist add <#123>").await;
    assert_eq!(h.last_reply(), "Already in the whitelist.");

    command(&mut h, "listWhitelist").await;
    assert_eq!(h.last_reply(), "```\n15551234567\n```");

    command(&mut h, "removeFromWhitelist <#123>").await;
    assert_eq!(h.last_reply(), "Removed from the whitelist!");
    command(&mut h, "whitelist remove <#123>").await;
    assert!(h.last_reply().starts_with("This conversation is not whitelisted."));

    command(&mut h, "addToWhitelist <#555>").await;
    assert_eq!(h.last_reply(), "Couldn't find a chat with the given channel.");
}

#[tokio::test]
async fn test_start_by_number_creates_channel() {
    let mut h = Harness::new().await;

    command(&mut h, "start +1 555-765-4321").await;

    let channel = h.channel_of(BOB);
    assert_eq!(
        h.last_reply(),
        format!("Started a conversation with 15557654321: <#{channel}>")
    );

    command(&mut h, "start 15557654321").await;
    assert_eq!(h.platform.created_channels().len(), 2);
}

#[tokio::test]
async fn test_start_adds_to_active_whitelist() {
    let mut h = Harness::with(
        config(RoutingMode::All),
        FakePlatform::new(),
        FakeMobile::new(),
        |state| {
            state.settings.whitelist.add(ALICE);
        },
    )
    .await;

    command(&mut h, "start 15557654321").await;

    assert!(h.dispatcher.settings().whitelist.contains(BOB));
}

#[tokio::test]
async fn test_start_leaves_inactive_whitelist_empty() {
    let mut h = Harness::new().await;

    command(&mut h, "start 15557654321").await;

    assert!(h.dispatcher.settings().whitelist.is_empty());
}

#[tokio::test]
async fn test_start_by_name_opens_every_match() {
    let sam_a = "15550000001@s.whatsapp.net";
    let sam_b = "15550000002@s.whatsapp.net";
    let mut h = Harness::with(
        config(RoutingMode::All),
        FakePlatform::new(),
        FakeMobile::new(),
        directory(&[(sam_a, "Sam"), (sam_b, "sam"), (ALICE, "Alice")]),
    )
    .await;

    command(&mut h, "start Sam").await;

    assert!(h.dispatcher.registry().get(sam_a).is_some());
    assert!(h.dispatcher.registry().get(sam_b).is_some());
    assert!(h.dispatcher.registry().get(ALICE).is_none());

    command(&mut h, "start Zed").await;
    assert_eq!(h.last_reply(), "Couldn't find `Zed`.");
}

#[tokio::test]
async fn test_list_filters_directory() {
    let mut h = Harness::with(
        config(RoutingMode::All),
        FakePlatform::new(),
        FakeMobile::new(),
        directory(&[(ALICE, "Alice"), (BOB, "Bob"), (FAMILY, "Family")]),
    )
    .await;

    command(&mut h, "list").await;
    assert_eq!(h.last_reply(), "```\nAlice\nBob\nFamily\n```");

    command(&mut h, "LIST fam").await;
    assert_eq!(h.last_reply(), "```\nFamily\n```");

    command(&mut h, "list nobody").await;
    assert_eq!(h.last_reply(), "No results were found.");
}

#[rstest]
#[case::discord_on("enableDCPrefix", "Discord username prefix enabled!")]
#[case::discord_off("disableDCPrefix", "Discord username prefix disabled!")]
#[case::whatsapp_on("enableWAPrefix", "WhatsApp name prefix enabled!")]
#[case::whatsapp_off("disableWAPrefix", "WhatsApp name prefix disabled!")]
#[tokio::test]
async fn test_prefix_toggles(#[case] input: &str, #[case] reply: &str) {
    let mut h = Harness::new().await;

    command(&mut h, input).await;

    assert_eq!(h.last_reply(), reply);
    let settings = h.dispatcher.settings();
    let enabled = input.starts_with("enable");
    if input.contains("DC") {
        assert_eq!(settings.discord_prefix, enabled);
    } else {
        assert_eq!(settings.wa_group_prefix, enabled);
    }
}

#[tokio::test]
async fn test_help_ping_and_unknown() {
    let mut h = Harness::new().await;

    command(&mut h, "help").await;
    assert_eq!(h.last_reply(), HELP_TEXT);

    command(&mut h, "ping").await;
    assert!(h.last_reply().starts_with("Pong "));

    command(&mut h, "frobnicate now").await;
    assert_eq!(
        h.last_reply(),
        "Unknown command: `frobnicate now`\nType `help` to see available commands"
    );

    command(&mut h, "start").await;
    assert!(h.last_reply().starts_with("Please enter a valid argument."));
}

#[tokio::test]
async fn test_resync_and_status() {
    let mobile = FakeMobile::with_contacts(&[(ALICE, "Alice"), (FAMILY, "Family")]);
    let mut h = Harness::with(config(RoutingMode::All), FakePlatform::new(), mobile, |_| {}).await;

    command(&mut h, "resync").await;
    assert_eq!(h.last_reply(), "Re-synced!");
    assert_eq!(h.dispatcher.directory().name_of(FAMILY), Some("Family"));

    command(&mut h, "status").await;
    let status = h.last_reply();
    assert!(status.contains("Conversations: 0"));
    assert!(status.contains("Whitelist: inactive"));
    assert!(status.contains("Contacts: 2"));
}

#[tokio::test]
async fn test_group_subject_reaches_list_start_and_channel_name() {
    let mobile = FakeMobile::with_contacts(&[(ALICE, "Alice"), (FAMILY, "Family")]);
    let mut h = Harness::with(config(RoutingMode::All), FakePlatform::new(), mobile, |_| {}).await;
    notice(&mut h, SessionNotice::Connected { own_id: Some(OWN.into()) }).await;

    command(&mut h, "list fam").await;
    assert_eq!(h.last_reply(), "```\nFamily\n```");

    command(&mut h, "start family").await;
    let channel = h.channel_of(FAMILY);
    let created = h.platform.created_channels();
    assert_eq!(created.last().unwrap().0, "Family");
    assert_eq!(
        h.last_reply(),
        format!("Started a conversation with Family: <#{channel}>")
    );
}

#[tokio::test]
async fn test_qr_code_is_posted_as_image() {
    let mut h = Harness::new().await;

    notice(
        &mut h,
        SessionNotice::QrCode {
            payload: "2@abc".into(),
            png: Some(vec![0x89, b'P', b'N', b'G']),
        },
    )
    .await;

    let files = h.platform.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, h.control());
    assert_eq!(files[0].1.file_name, "qrcode.png");
}

#[tokio::test]
async fn test_qr_code_falls_back_to_text() {
    let mut h = Harness::new().await;

    notice(
        &mut h,
        SessionNotice::QrCode {
            payload: "2@abc".into(),
            png: None,
        },
    )
    .await;

    assert!(h.platform.files().is_empty());
    assert!(h.last_reply().contains("2@abc"));
}

#[tokio::test]
async fn test_connected_notice_refreshes_directory() {
    let mobile = FakeMobile::with_contacts(&[(ALICE, "Alice")]);
    let mut h = Harness::with(config(RoutingMode::All), FakePlatform::new(), mobile, |_| {}).await;

    notice(&mut h, SessionNotice::Connected { own_id: Some(OWN.into()) }).await;

    assert_eq!(h.last_reply(), "WhatsApp connection successfully opened!");
    assert_eq!(h.dispatcher.directory().name_of(ALICE), Some("Alice"));
    assert_eq!(h.dispatcher.session().label(), "connected");
}

#[tokio::test]
async fn test_logged_out_notice_asks_for_new_pairing() {
    let mut h = Harness::new().await;

    notice(&mut h, SessionNotice::LoggedOut).await;

    assert!(h.last_reply().contains("logged out"));
}
