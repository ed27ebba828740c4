//! Echo Guard
//!
//! Decides whether an inbound mobile-network event is relayed. Messages the
//! bridge itself sent come back from the network as self-originated events;
//! those are dropped when their ID matches the conversation's relay cursor.

use super::platform::InboundMessage;
use super::registry::ConversationRegistry;
use super::whitelist::Whitelist;
use chrono::{DateTime, SubsecRound, Utc};

/// Outcome of [`EchoGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Relay,
    /// Timestamp before the second the process started in (history replay
    /// on connect).
    Stale,
    /// Self-originated event carrying the last ID the bridge relayed.
    Echo,
    NotWhitelisted,
}

impl Verdict {
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EchoGuard {
    started_at: DateTime<Utc>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Network timestamps carry whole seconds, so the start is kept at the
    /// same resolution.
    pub fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: started_at.trunc_subsecs(0),
        }
    }

    /// Pure decision; reads the registry cursor and the whitelist only.
    pub fn check(
        &self,
        message: &InboundMessage,
        registry: &ConversationRegistry,
        whitelist: &Whitelist,
    ) -> Verdict {
        if message.timestamp < self.started_at {
            return Verdict::Stale;
        }
        if message.from_me
            && registry.last_relayed_message_id(&message.chat) == Some(message.id.as_str())
        {
            return Verdict::Echo;
        }
        if !whitelist.allows(&message.chat) {
            return Verdict::NotWhitelisted;
        }
        Verdict::Relay
    }
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new()
    }
}
