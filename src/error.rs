//! Top-level error types and their exit codes.

use crate::db::StoreError;
use thiserror::Error;

/// Problems the operator has to fix before the bridge can run.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing configuration value `{key}`; set it in the config file or via {env}")]
    MissingConfig { key: &'static str, env: &'static str },

    #[error(
        "stored `{document}` document is incompatible: {reason}. \
         Run `wabridge reset {document}` to start over, or fix the stored document manually"
    )]
    IncompatibleDocument { document: &'static str, reason: String },

    #[error(
        "stored state belongs to guild {stored}, but the configured guild is {configured}. \
         Run `wabridge reset settings` and `wabridge reset chats` to start over"
    )]
    GuildMismatch { stored: u64, configured: u64 },

    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error("could not prepare the Discord guild: {0}. Check the bot's Manage Channels and Manage Webhooks permissions")]
    Repair(String),
}

/// Errors that stop the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Broken internal assumption; state is persisted and the process exits.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Setup(_) => 2,
            Self::Protocol(_) => 1,
        }
    }
}
