//! wabridge CLI
//!
//! `wabridge` (or `wabridge run`) starts the bridge; `reset` and
//! `init-config` are maintenance commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wabridge::bridge::platform::SessionTransport;
use wabridge::bridge::registry::RegistryDocument;
use wabridge::bridge::settings::{BridgeSettings, ContactDirectory};
use wabridge::bridge::{BridgeState, Dispatcher, EchoGuard, SessionManager};
use wabridge::config::{self, AppConfig};
use wabridge::db::{Database, StateStore, VersionedDocument};
use wabridge::discord::DiscordAgent;
use wabridge::whatsapp::WhatsAppAgent;
use wabridge::{BridgeError, SetupError, logging};

#[derive(Parser)]
#[command(name = "wabridge")]
#[command(version, about = "WhatsApp <-> Discord relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ~/.wabridge/config.toml)
    #[arg(long, short, global = true, env = "WABRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,

    /// Delete one stored document so it starts over on the next run
    Reset {
        #[arg(value_enum)]
        document: ResetTarget,
    },

    /// Write a starter config file
    InitConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResetTarget {
    /// Guild, category, control channel, whitelist and prefix flags
    Settings,
    /// Conversation to channel mappings
    Chats,
    /// Learned contact names
    Contacts,
    /// WhatsApp login; the next run pairs again
    Session,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config).await,
        Commands::Reset { document } => reset(cli.config, document).await,
        Commands::InitConfig => init_config(cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(bridge) = err.downcast_ref::<BridgeError>() {
        return bridge.exit_code() as u8;
    }
    if err.downcast_ref::<SetupError>().is_some() {
        return 2;
    }
    1
}

fn init_config(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(config::default_config_path);
    AppConfig::write_starter(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<(Database, StateStore)> {
    let db = Database::connect(&config.storage.database_path).await?;
    db.run_migrations().await?;
    Ok((db.clone(), StateStore::new(db)))
}

async fn reset(path: Option<PathBuf>, target: ResetTarget) -> Result<()> {
    let config = AppConfig::load(path.as_deref())?;

    let (name, removed) = match target {
        ResetTarget::Session => {
            let removed = WhatsAppAgent::remove_session_files(&config.whatsapp.session_path)
                .with_context(|| {
                    format!("Failed to remove {}", config.whatsapp.session_path.display())
                })?;
            ("session", removed)
        }
        document => {
            let name = match document {
                ResetTarget::Settings => BridgeSettings::NAME,
                ResetTarget::Chats => RegistryDocument::NAME,
                _ => ContactDirectory::NAME,
            };
            let (db, store) = open_store(&config).await?;
            let removed = store.delete(name).await.map_err(SetupError::from)?;
            db.close().await?;
            (name, removed)
        }
    };

    if removed {
        println!("Reset `{name}`.");
    } else {
        println!("Nothing stored for `{name}`.");
    }
    Ok(())
}

async fn run(path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(path.as_deref())?;
    let _log_guard = logging::init(&config.logging)?;
    tracing::info!("Starting wabridge v{}", env!("CARGO_PKG_VERSION"));

    let (token, guild_id) = config.discord_credentials()?;

    let (db, store) = open_store(&config).await.map_err(|e| {
        tracing::error!("Storage: {:#}", e);
        e
    })?;
    let state = BridgeState::load(&store, &config.bridge, guild_id).await?;

    let buffer = config.bridge.event_buffer.max(1);
    let (events_tx, events_rx) = mpsc::channel(buffer);
    let (transport_tx, transport_rx) = mpsc::channel(buffer);

    let discord = DiscordAgent::new(token, guild_id, events_tx.clone())
        .connect()
        .await?;
    let whatsapp = Arc::new(WhatsAppAgent::new(
        config.whatsapp.session_path.clone(),
        transport_tx,
        events_tx.clone(),
    ));

    let mut dispatcher = Dispatcher::new(
        discord.platform.clone(),
        whatsapp.clone(),
        store,
        config.bridge.clone(),
        state,
        EchoGuard::new(),
    );
    if let Err(e) = dispatcher.repair_channels().await {
        discord.shutdown().await;
        db.close().await?;
        return Err(e.into());
    }

    let shutdown = CancellationToken::new();
    let session = SessionManager::new(
        whatsapp.clone(),
        transport_rx,
        events_tx,
        Duration::from_secs(config.bridge.pairing_timeout_secs),
        shutdown.clone(),
    )
    .start();
    let mut relay = tokio::spawn(dispatcher.run(events_rx, shutdown.clone()));

    let outcome = tokio::select! {
        joined = &mut relay => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
            relay.await
        }
    };
    shutdown.cancel();

    if let Err(e) = session.await {
        tracing::error!("WhatsApp: session task error: {:?}", e);
    }
    whatsapp.disconnect().await;
    discord.shutdown().await;
    db.close().await?;

    match outcome {
        Ok(Ok(())) => {
            tracing::info!("wabridge stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(BridgeError::Protocol(format!("dispatcher task failed: {e}")).into()),
    }
}
