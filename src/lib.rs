//! wabridge
//!
//! Relays messages between a linked WhatsApp account and a Discord guild,
//! one Discord channel per WhatsApp conversation.

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;

#[cfg(feature = "discord")]
pub mod discord;

#[cfg(feature = "whatsapp")]
pub mod whatsapp;

#[cfg(test)]
mod tests;

pub use error::{BridgeError, SetupError};
