//! WhatsApp Integration
//!
//! Runs a WhatsApp Web client (linked device) for the bridge: session
//! lifecycle for the session manager, messaging for the dispatcher.

mod agent;
mod convert;

pub use agent::WhatsAppAgent;
