//! Configuration
//!
//! Layered with the `config` crate: built-in defaults, then
//! `~/.wabridge/config.toml`, then an explicit `--config` file, then
//! `WABRIDGE__SECTION__KEY` environment variables.

use crate::bridge::registry::RoutingMode;
use crate::error::SetupError;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "WABRIDGE";

/// Largest file Discord accepts from a bot without boosts.
pub const DEFAULT_ATTACHMENT_CEILING: u64 = 8_388_284;

/// `~/.wabridge`, or `./.wabridge` when no home directory is known.
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wabridge")
}

pub fn default_config_path() -> PathBuf {
    base_dir().join("config.toml")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    pub bridge: BridgeConfig,
    pub storage: StorageConfig,
    pub whatsapp: WhatsAppConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub guild_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub category_name: String,
    pub control_channel_name: String,
    pub webhook_name: String,
    pub attachment_ceiling_bytes: u64,
    pub routing: RoutingMode,
    pub pairing_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            category_name: "WhatsApp".to_string(),
            control_channel_name: "control-room".to_string(),
            webhook_name: "WA2DC".to_string(),
            attachment_ceiling_bytes: DEFAULT_ATTACHMENT_CEILING,
            routing: RoutingMode::default(),
            pairing_timeout_secs: 60,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: base_dir().join("bridge.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// SQLite file holding the WhatsApp session credentials.
    pub session_path: PathBuf,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            session_path: base_dir().join("whatsapp.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
    /// Also write daily files under `directory`.
    pub file: bool,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
            directory: base_dir().join("logs"),
        }
    }
}

impl AppConfig {
    /// Load every layer. `explicit` is the `--config` path, which must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_layers(Some(&default_config_path()), explicit, ENV_PREFIX)
    }

    pub fn load_layers(home: Option<&Path>, explicit: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(home) = home {
            builder = builder.add_source(File::from(home).format(FileFormat::Toml).required(false));
        }
        if let Some(explicit) = explicit {
            builder = builder.add_source(File::from(explicit).format(FileFormat::Toml).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Discord token and guild, both required to run.
    pub fn discord_credentials(&self) -> Result<(String, u64), SetupError> {
        let token = self
            .discord
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SetupError::MissingConfig {
                key: "discord.token",
                env: "WABRIDGE__DISCORD__TOKEN",
            })?;
        let guild_id = self.discord.guild_id.ok_or(SetupError::MissingConfig {
            key: "discord.guild_id",
            env: "WABRIDGE__DISCORD__GUILD_ID",
        })?;
        Ok((token, guild_id))
    }

    /// Write a commented starter file. Refuses to overwrite.
    pub fn write_starter(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut starter = Self::default();
        starter.discord.token = Some(String::new());
        starter.discord.guild_id = Some(0);
        let body = toml::to_string_pretty(&starter).context("Failed to render starter config")?;
        let text = format!(
            "# wabridge configuration\n\
             # Fill in the Discord bot token and the guild (server) ID, then run `wabridge`.\n\n{body}"
        );
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_sources() {
        let cfg = AppConfig::load_layers(None, None, "WABRIDGE_TEST_DEFAULTS").unwrap();
        assert_eq!(cfg.bridge.category_name, "WhatsApp");
        assert_eq!(cfg.bridge.control_channel_name, "control-room");
        assert_eq!(cfg.bridge.routing, RoutingMode::GroupsOnly);
        assert_eq!(cfg.bridge.attachment_ceiling_bytes, DEFAULT_ATTACHMENT_CEILING);
        assert!(cfg.discord_credentials().is_err());
    }

    #[test]
    fn test_explicit_file_overrides_home_file() {
        let dir = tempfile::tempdir().unwrap();
        let home = write(
            &dir,
            "home.toml",
            "[discord]\ntoken = \"home\"\nguild_id = 1\n[bridge]\nwebhook_name = \"Relay\"\n",
        );
        let explicit = write(
            &dir,
            "explicit.toml",
            "[discord]\ntoken = \"explicit\"\n[bridge]\nrouting = \"all\"\n",
        );

        let cfg = AppConfig::load_layers(Some(&home), Some(&explicit), "WABRIDGE_TEST_LAYERS").unwrap();

        assert_eq!(cfg.discord_credentials().unwrap(), ("explicit".to_string(), 1));
        assert_eq!(cfg.bridge.webhook_name, "Relay");
        assert_eq!(cfg.bridge.routing, RoutingMode::All);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load_layers(None, Some(&missing), "WABRIDGE_TEST_MISSING").is_err());
    }

    #[test]
    fn test_starter_config_round_trips_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        AppConfig::write_starter(&path).unwrap();
        let cfg = AppConfig::load_layers(None, Some(&path), "WABRIDGE_TEST_STARTER").unwrap();

        assert_eq!(cfg.bridge, BridgeConfig::default());
        assert!(cfg.discord_credentials().is_err());
        assert!(AppConfig::write_starter(&path).is_err());
    }
}
