//! WhatsApp Agent
//!
//! Agent struct and connection logic. Each `connect` builds a fresh bot over
//! the SQLite session store and forwards its events: lifecycle events to the
//! session manager, messages to the dispatcher.

use super::convert::{self, WaMedia};
use crate::bridge::BridgeEvent;
use crate::bridge::platform::{
    Contact, MediaPayload, MobileNetwork, OutboundText, SendError, SessionError,
    SessionTransport, TransportEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust::store::SqliteStore;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

/// WhatsApp side of the bridge
pub struct WhatsAppAgent {
    session_path: PathBuf,
    transport_events: mpsc::Sender<TransportEvent>,
    bridge_events: mpsc::Sender<BridgeEvent>,
    client: RwLock<Option<Arc<Client>>>,
    run: Mutex<Option<JoinHandle<()>>>,
    /// Push names seen on incoming messages plus group subjects, offered
    /// as the directory.
    names: Arc<Mutex<HashMap<String, String>>>,
}

impl WhatsAppAgent {
    pub fn new(
        session_path: PathBuf,
        transport_events: mpsc::Sender<TransportEvent>,
        bridge_events: mpsc::Sender<BridgeEvent>,
    ) -> Self {
        Self {
            session_path,
            transport_events,
            bridge_events,
            client: RwLock::new(None),
            run: Mutex::new(None),
            names: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Delete the session database and its WAL side files.
    pub fn remove_session_files(path: &std::path::Path) -> std::io::Result<bool> {
        let mut removed = false;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    async fn connected_client(&self) -> Result<Arc<Client>, SendError> {
        self.client.read().await.clone().ok_or(SendError::NotConnected)
    }
}

fn send_error(e: impl std::fmt::Display) -> SendError {
    let text = e.to_string();
    let lower = text.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        SendError::Timeout(text)
    } else if lower.contains("not connected") {
        SendError::NotConnected
    } else {
        SendError::Other(text)
    }
}

#[async_trait]
impl SessionTransport for WhatsAppAgent {
    async fn has_stored_session(&self) -> bool {
        tokio::fs::metadata(&self.session_path)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    async fn connect(&self, fresh: bool) -> Result<(), SessionError> {
        self.disconnect().await;

        if fresh {
            match Self::remove_session_files(&self.session_path) {
                Ok(true) => tracing::info!("WhatsApp: discarded stored session"),
                Ok(false) => {}
                Err(e) => return Err(SessionError::Store(e.to_string())),
            }
        }
        if let Some(parent) = self.session_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SessionError::Store(e.to_string()))?;
        }

        let backend = SqliteStore::new(self.session_path.to_string_lossy().as_ref())
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let transport_events = self.transport_events.clone();
        let bridge_events = self.bridge_events.clone();
        let names = self.names.clone();

        let mut bot = Bot::builder()
            .with_backend(Arc::new(backend))
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let transport_events = transport_events.clone();
                let bridge_events = bridge_events.clone();
                let names = names.clone();
                async move {
                    let lifecycle = match event {
                        Event::PairingQrCode { code, .. } => {
                            tracing::info!("WhatsApp: QR code available (scan with your phone)");
                            Some(TransportEvent::QrCode(code))
                        }
                        Event::PairSuccess(_) => {
                            tracing::info!("WhatsApp: pairing successful");
                            None
                        }
                        Event::Connected(_) => {
                            tracing::info!("WhatsApp: connected successfully");
                            let own_id = client.get_pn().await.map(|jid| jid.to_string());
                            Some(TransportEvent::Connected { own_id })
                        }
                        Event::LoggedOut(_) => {
                            tracing::warn!("WhatsApp: logged out");
                            Some(TransportEvent::LoggedOut)
                        }
                        Event::Disconnected(_) => {
                            tracing::warn!("WhatsApp: disconnected");
                            Some(TransportEvent::Disconnected {
                                reason: "connection closed".to_string(),
                            })
                        }
                        Event::Message(msg, info) => {
                            if let Some(inbound) = convert::inbound(&msg, &info) {
                                if !inbound.from_me
                                    && let Some(name) = inbound.push_name.clone()
                                {
                                    names.lock().await.insert(inbound.sender.clone(), name);
                                }
                                if bridge_events.send(BridgeEvent::Mobile(inbound)).await.is_err() {
                                    tracing::debug!("WhatsApp: dispatcher gone, dropping message");
                                }
                            } else {
                                tracing::debug!("WhatsApp: ignoring unsupported message {}", info.id);
                            }
                            None
                        }
                        _ => None,
                    };
                    if let Some(event) = lifecycle
                        && transport_events.send(event).await.is_err()
                    {
                        tracing::debug!("WhatsApp: session manager gone, dropping event");
                    }
                }
            })
            .build()
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let client = bot.client();
        let handle = bot
            .run()
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let transport_events = self.transport_events.clone();
        let run = tokio::spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!("WhatsApp: client task error: {:?}", e);
                let _ = transport_events
                    .send(TransportEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
            }
        });

        *self.client.write().await = Some(client);
        *self.run.lock().await = Some(run);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.disconnect().await;
        }
        if let Some(run) = self.run.lock().await.take() {
            run.abort();
        }
    }
}

#[async_trait]
impl MobileNetwork for WhatsAppAgent {
    async fn send_text(&self, to: &str, message: OutboundText) -> Result<String, SendError> {
        let jid: Jid = to
            .parse()
            .map_err(|_| SendError::InvalidId(to.to_string()))?;
        let client = self.connected_client().await?;
        client
            .send_message(jid, convert::outbound(&message))
            .await
            .map_err(send_error)
    }

    async fn download(&self, media: &MediaPayload) -> Result<Vec<u8>, SendError> {
        let Some(inner) = media.locator.downcast_ref::<WaMedia>() else {
            return Err(SendError::Other("media was not received over WhatsApp".to_string()));
        };
        let client = self.connected_client().await?;
        let result = match inner {
            WaMedia::Image(m) => client.download(m).await,
            WaMedia::Video(m) => client.download(m).await,
            WaMedia::Audio(m) => client.download(m).await,
            WaMedia::Document(m) => client.download(m).await,
            WaMedia::Sticker(m) => client.download(m).await,
        };
        result.map_err(send_error)
    }

    async fn directory(&self) -> Vec<Contact> {
        if let Some(client) = self.client.read().await.clone() {
            match client.groups().get_participating().await {
                Ok(groups) => {
                    let subjects = groups
                        .into_values()
                        .map(|group| (group.id.to_string(), group.subject));
                    learn_subjects(&mut *self.names.lock().await, subjects);
                }
                Err(e) => tracing::warn!("WhatsApp: failed to fetch groups: {}", e),
            }
        }
        self.names
            .lock()
            .await
            .iter()
            .map(|(id, name)| Contact {
                id: id.clone(),
                name: name.clone(),
            })
            .collect()
    }
}

/// Group subjects replace whatever name a group ID had; blank subjects are
/// skipped.
fn learn_subjects(
    names: &mut HashMap<String, String>,
    subjects: impl IntoIterator<Item = (String, String)>,
) {
    for (id, subject) in subjects {
        let subject = subject.trim();
        if !subject.is_empty() {
            names.insert(id, subject.to_string());
        }
    }
}
