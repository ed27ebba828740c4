//! Session Manager
//!
//! Owns the WhatsApp connection lifecycle: restore or pair, reconnect with
//! backoff, re-pair when the stored session is rejected or retries run out.
//! The decision logic lives in [`SessionMachine`]; [`SessionManager`] is the
//! task that feeds it events and timers and carries out its actions.

use super::events::BridgeEvent;
use super::platform::{SessionError, SessionTransport, TransportEvent};
use image::{ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Failed attempts tolerated before the stored session is discarded.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Wait before reconnect attempt `attempt` (1-based). `None` means give up
/// on the stored session and pair again.
pub fn reconnect_delay(attempt: u32) -> Option<Duration> {
    match attempt {
        1..=3 => Some(Duration::ZERO),
        4..=MAX_RECONNECT_ATTEMPTS => Some(Duration::from_secs(u64::from(attempt - 3) * 10)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unpaired,
    Pairing { qr: Option<String> },
    Connected { own_id: Option<String> },
    Disconnected { last_error: String },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unpaired => "unpaired",
            Self::Pairing { .. } => "waiting for QR scan",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    /// Track the manager's state from the notices it publishes.
    pub fn apply(&mut self, notice: &SessionNotice) {
        *self = match notice {
            SessionNotice::QrCode { payload, .. } => Self::Pairing {
                qr: Some(payload.clone()),
            },
            SessionNotice::Connected { own_id } => Self::Connected {
                own_id: own_id.clone(),
            },
            SessionNotice::Disconnected {
                retry_in: Some(_),
                reason,
                ..
            } => Self::Disconnected {
                last_error: reason.clone(),
            },
            SessionNotice::Disconnected { retry_in: None, .. }
            | SessionNotice::LoggedOut
            | SessionNotice::PairingExpired => Self::Pairing { qr: None },
        };
    }
}

/// Connectivity news for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// `png` is absent when the payload could not be rendered.
    QrCode { payload: String, png: Option<Vec<u8>> },
    Connected { own_id: Option<String> },
    Disconnected {
        reason: String,
        attempt: u32,
        retry_in: Option<Duration>,
    },
    LoggedOut,
    PairingExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Connect { fresh: bool, delay: Duration },
    Disconnect,
    Notify(SessionNotice),
}

/// Pure transition logic.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    attempts: u32,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unpaired,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pairing(&self) -> bool {
        matches!(self.state, SessionState::Pairing { .. })
    }

    pub fn start(&mut self, has_stored_session: bool) -> Vec<SessionAction> {
        if has_stored_session {
            self.state = SessionState::Unpaired;
            vec![SessionAction::Connect {
                fresh: false,
                delay: Duration::ZERO,
            }]
        } else {
            self.state = SessionState::Pairing { qr: None };
            vec![SessionAction::Connect {
                fresh: true,
                delay: Duration::ZERO,
            }]
        }
    }

    pub fn on_event(&mut self, event: TransportEvent) -> Vec<SessionAction> {
        match event {
            TransportEvent::QrCode(code) => {
                if matches!(self.state, SessionState::Connected { .. }) {
                    return Vec::new();
                }
                self.state = SessionState::Pairing {
                    qr: Some(code.clone()),
                };
                vec![SessionAction::Notify(SessionNotice::QrCode {
                    payload: code,
                    png: None,
                })]
            }
            TransportEvent::Connected { own_id } => {
                self.attempts = 0;
                self.state = SessionState::Connected {
                    own_id: own_id.clone(),
                };
                vec![SessionAction::Notify(SessionNotice::Connected { own_id })]
            }
            TransportEvent::Disconnected { reason } => self.fail(reason),
            TransportEvent::LoggedOut => {
                self.attempts = 0;
                self.state = SessionState::Pairing { qr: None };
                vec![
                    SessionAction::Notify(SessionNotice::LoggedOut),
                    SessionAction::Connect {
                        fresh: true,
                        delay: Duration::ZERO,
                    },
                ]
            }
        }
    }

    pub fn on_connect_failed(&mut self, error: &SessionError) -> Vec<SessionAction> {
        self.fail(error.to_string())
    }

    pub fn on_pairing_timeout(&mut self) -> Vec<SessionAction> {
        if !self.is_pairing() {
            return Vec::new();
        }
        self.state = SessionState::Pairing { qr: None };
        vec![
            SessionAction::Notify(SessionNotice::PairingExpired),
            SessionAction::Disconnect,
            SessionAction::Connect {
                fresh: true,
                delay: Duration::ZERO,
            },
        ]
    }

    fn fail(&mut self, reason: String) -> Vec<SessionAction> {
        let was_pairing = self.is_pairing();
        self.attempts += 1;
        let attempt = self.attempts;
        match reconnect_delay(attempt) {
            Some(delay) => {
                if !was_pairing {
                    self.state = SessionState::Disconnected {
                        last_error: reason.clone(),
                    };
                }
                vec![
                    SessionAction::Notify(SessionNotice::Disconnected {
                        reason,
                        attempt,
                        retry_in: Some(delay),
                    }),
                    SessionAction::Connect {
                        fresh: was_pairing,
                        delay,
                    },
                ]
            }
            None => {
                self.attempts = 0;
                self.state = SessionState::Pairing { qr: None };
                vec![
                    SessionAction::Notify(SessionNotice::Disconnected {
                        reason,
                        attempt,
                        retry_in: None,
                    }),
                    SessionAction::Connect {
                        fresh: true,
                        delay: Duration::ZERO,
                    },
                ]
            }
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a pairing payload as a PNG QR code.
pub fn render_qr_png(payload: &str) -> anyhow::Result<Vec<u8>> {
    let code = QrCode::new(payload.as_bytes())?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .build();
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

/// Task driving a [`SessionMachine`] against a [`SessionTransport`].
pub struct SessionManager {
    transport: Arc<dyn SessionTransport>,
    events: mpsc::Receiver<TransportEvent>,
    notices: mpsc::Sender<BridgeEvent>,
    pairing_timeout: Duration,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        events: mpsc::Receiver<TransportEvent>,
        notices: mpsc::Sender<BridgeEvent>,
        pairing_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            events,
            notices,
            pairing_timeout,
            shutdown,
        }
    }

    /// Start as a background task. Returns JoinHandle.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut machine = SessionMachine::new();
        let has_stored = self.transport.has_stored_session().await;
        tracing::info!(
            "WhatsApp: {}",
            if has_stored { "restoring stored session" } else { "no stored session, pairing" }
        );

        let mut pending: Option<(Instant, bool)> = None;
        let mut pairing_deadline: Option<Instant> = None;
        let mut actions = machine.start(has_stored);

        loop {
            for action in actions.drain(..) {
                match action {
                    SessionAction::Connect { fresh, delay } => {
                        if !delay.is_zero() {
                            tracing::info!("WhatsApp: reconnecting in {}s", delay.as_secs());
                        }
                        pending = Some((Instant::now() + delay, fresh));
                    }
                    SessionAction::Disconnect => self.transport.disconnect().await,
                    SessionAction::Notify(notice) => self.publish(notice).await,
                }
            }
            pairing_deadline = if machine.is_pairing() {
                pairing_deadline.or_else(|| Some(Instant::now() + self.pairing_timeout))
            } else {
                None
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        tracing::debug!("WhatsApp: transport event {:?}", event);
                        actions = machine.on_event(event);
                    }
                    None => {
                        tracing::warn!("WhatsApp: transport event stream closed");
                        break;
                    }
                },
                _ = sleep_until_opt(pending.map(|(at, _)| at)), if pending.is_some() => {
                    let fresh = pending.take().map(|(_, fresh)| fresh).unwrap_or(false);
                    if let Err(e) = self.transport.connect(fresh).await {
                        tracing::warn!("WhatsApp: connect failed: {}", e);
                        actions = machine.on_connect_failed(&e);
                    }
                }
                _ = sleep_until_opt(pairing_deadline), if pairing_deadline.is_some() => {
                    tracing::info!("WhatsApp: pairing timed out, requesting a new QR code");
                    pairing_deadline = None;
                    actions = machine.on_pairing_timeout();
                }
            }
        }

        self.transport.disconnect().await;
        tracing::info!("WhatsApp: session manager stopped");
    }

    async fn publish(&self, notice: SessionNotice) {
        let notice = match notice {
            SessionNotice::QrCode { payload, .. } => {
                let png = match render_qr_png(&payload) {
                    Ok(png) => Some(png),
                    Err(e) => {
                        tracing::warn!("WhatsApp: failed to render QR code: {}", e);
                        None
                    }
                };
                SessionNotice::QrCode { payload, png }
            }
            other => other,
        };
        if self.notices.send(BridgeEvent::Session(notice)).await.is_err() {
            tracing::debug!("WhatsApp: dispatcher gone, dropping session notice");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
