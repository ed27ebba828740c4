//! Discord Integration
//!
//! The guild side of the bridge: gateway events in, REST calls out.

mod agent;
mod handler;
mod platform;

pub use agent::{DiscordAgent, DiscordConnection};
pub use platform::SerenityPlatform;
