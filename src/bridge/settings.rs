//! Bridge settings and contact directory documents.

use super::platform::{ChannelHandle, Contact};
use super::whitelist::Whitelist;
use crate::db::VersionedDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Operator-facing state persisted as the `settings` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub version: u32,
    /// Guild the stored channel handles belong to.
    #[serde(default)]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub category: Option<ChannelHandle>,
    #[serde(default)]
    pub control_channel: Option<ChannelHandle>,
    #[serde(default)]
    pub whitelist: Whitelist,
    /// Prepend `[nickname] ` to messages sent to WhatsApp.
    #[serde(default)]
    pub discord_prefix: bool,
    /// Prepend `[sender] ` to group messages relayed to Discord.
    #[serde(default)]
    pub wa_group_prefix: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            guild_id: None,
            category: None,
            control_channel: None,
            whitelist: Whitelist::new(),
            discord_prefix: false,
            wa_group_prefix: false,
        }
    }
}

impl VersionedDocument for BridgeSettings {
    const NAME: &'static str = "settings";
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }

    fn upgrade_legacy(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.contains_key("version") {
            return None;
        }
        let whitelist = match map.get("Whitelist") {
            Some(Value::Array(ids)) => Whitelist::from_ids(
                ids.iter().filter_map(Value::as_str).map(str::to_string),
            ),
            Some(Value::Null) | None => Whitelist::new(),
            Some(_) => return None,
        };
        let category = map
            .get("CategoryID")
            .or_else(|| map.get("Categories").and_then(|c| c.get(0)))
            .and_then(parse_id)
            .map(ChannelHandle);
        Some(Self {
            version: Self::VERSION,
            guild_id: map.get("GuildID").and_then(parse_id),
            category,
            control_channel: map
                .get("ControlChannelID")
                .and_then(parse_id)
                .map(ChannelHandle),
            whitelist,
            discord_prefix: map.get("DiscordPrefix").and_then(Value::as_bool).unwrap_or(false),
            wa_group_prefix: map.get("WAGroupPrefix").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Local part of a remote ID, without the device suffix.
pub fn local_part(remote_id: &str) -> &str {
    let user = remote_id.split('@').next().unwrap_or(remote_id);
    user.split(':').next().unwrap_or(user)
}

/// Remote ID → display name, persisted as the `contacts` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDirectory {
    pub version: u32,
    #[serde(default)]
    contacts: BTreeMap<String, String>,
}

impl VersionedDocument for ContactDirectory {
    const NAME: &'static str = "contacts";
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }

    /// Unversioned documents are a flat `{"<id>": "<name>"}` map.
    fn upgrade_legacy(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.contains_key("version") {
            return None;
        }
        let mut directory = Self::new();
        for (id, name) in map {
            directory.learn(id, name.as_str()?);
        }
        Some(directory)
    }
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            contacts: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn name_of(&self, remote_id: &str) -> Option<&str> {
        self.contacts.get(remote_id).map(String::as_str)
    }

    /// Record a name. Returns whether the directory changed.
    pub fn learn(&mut self, remote_id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || self.name_of(remote_id) == Some(name) {
            return false;
        }
        self.contacts.insert(remote_id.to_string(), name.to_string());
        true
    }

    /// Merge a collaborator snapshot. Returns the number of changed entries.
    pub fn merge(&mut self, snapshot: &[Contact]) -> usize {
        snapshot
            .iter()
            .filter(|contact| self.learn(&contact.id, &contact.name))
            .count()
    }

    /// IDs whose name equals `name`, ignoring case.
    pub fn find_by_name(&self, name: &str) -> Vec<&str> {
        let wanted = name.trim().to_lowercase();
        self.contacts
            .iter()
            .filter(|(_, n)| n.to_lowercase() == wanted)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// First ID whose name equals `name`, ignoring case.
    pub fn id_for_name(&self, name: &str) -> Option<&str> {
        self.find_by_name(name).into_iter().next()
    }

    /// Names containing `needle` (case-insensitive), sorted.
    pub fn search(&self, needle: &str) -> Vec<&str> {
        let needle = needle.trim().to_lowercase();
        let mut names: Vec<&str> = self
            .contacts
            .values()
            .filter(|n| n.to_lowercase().contains(&needle))
            .map(String::as_str)
            .collect();
        names.sort_by_key(|n| n.to_lowercase());
        names.dedup();
        names
    }

    /// Display name for a conversation or sender: directory name, then the
    /// push name, then the local part of the ID.
    pub fn display_name(&self, remote_id: &str, push_name: Option<&str>) -> String {
        self.name_of(remote_id)
            .or(push_name.filter(|n| !n.trim().is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| local_part(remote_id).to_string())
    }
}
