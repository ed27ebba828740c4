//! Relay Engine
//!
//! Network-agnostic core of the bridge. The Discord and WhatsApp adapters
//! implement the traits in [`platform`] and feed [`events::BridgeEvent`]s
//! into the [`dispatcher::Dispatcher`].

pub mod commands;
pub mod dispatcher;
pub mod echo_guard;
pub mod events;
pub mod platform;
pub mod registry;
pub mod render;
pub mod session;
pub mod settings;
pub mod whitelist;

pub use dispatcher::{BridgeState, Dispatcher, MAX_DELIVERY_RETRIES};
pub use echo_guard::{EchoGuard, Verdict};
pub use events::{BridgeEvent, PlatformAuthor, PlatformEvent, PlatformMessage, PlatformReply};
pub use registry::{ConversationEntry, ConversationRegistry, RoutingMode};
pub use session::{SessionManager, SessionNotice, SessionState};
pub use whitelist::Whitelist;
