//! In-memory stand-ins for Discord and WhatsApp.
//!
//! Both record every call so tests can assert on what the relay engine did,
//! and both can be told to time out a given number of times per operation.

use crate::bridge::platform::{
    Attachment, ChannelHandle, Contact, Delivery, GuildChannelInfo, GuildPlatform, MediaPayload,
    MobileNetwork, OutboundText, PlatformError, SendError, WebhookHandle,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Where a delivery went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Webhook(WebhookHandle),
    Channel(ChannelHandle),
}

#[derive(Default)]
struct Timeouts(Mutex<HashMap<&'static str, (usize, usize)>>);

impl Timeouts {
    /// Let `skip` calls through, then fail the next `times`.
    fn set(&self, op: &'static str, skip: usize, times: usize) {
        self.0.lock().unwrap().insert(op, (skip, times));
    }

    fn take(&self, op: &'static str) -> bool {
        let mut map = self.0.lock().unwrap();
        match map.get_mut(op) {
            Some((skip, _)) if *skip > 0 => {
                *skip -= 1;
                false
            }
            Some((_, left)) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

pub struct FakePlatform {
    next_id: AtomicU64,
    channels: Mutex<Vec<GuildChannelInfo>>,
    created: Mutex<Vec<(String, Option<ChannelHandle>)>>,
    categories: Mutex<Vec<String>>,
    webhooks: Mutex<HashMap<u64, ChannelHandle>>,
    deliveries: Mutex<Vec<(Route, Delivery)>>,
    texts: Mutex<Vec<(ChannelHandle, String)>>,
    files: Mutex<Vec<(ChannelHandle, Attachment)>>,
    edits: Mutex<Vec<(ChannelHandle, Option<u16>, Option<ChannelHandle>)>>,
    deleted: Mutex<Vec<ChannelHandle>>,
    fail_webhooks: AtomicBool,
    timeouts: Timeouts,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            channels: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            categories: Mutex::new(Vec::new()),
            webhooks: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(Vec::new()),
            texts: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_webhooks: AtomicBool::new(false),
            timeouts: Timeouts::default(),
        }
    }

    fn next(&self) -> ChannelHandle {
        ChannelHandle(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Pretend a channel already exists in the guild.
    pub fn add_channel(&self, channel: u64, name: &str, parent: Option<ChannelHandle>, is_category: bool) {
        self.channels.lock().unwrap().push(GuildChannelInfo {
            channel: ChannelHandle(channel),
            name: name.to_string(),
            parent,
            is_category,
        });
    }

    /// Remove a channel without going through the platform API.
    pub fn drop_channel(&self, channel: ChannelHandle) {
        self.channels.lock().unwrap().retain(|c| c.channel != channel);
    }

    pub fn fail_webhooks(&self, fail: bool) {
        self.fail_webhooks.store(fail, Ordering::SeqCst);
    }

    /// Make the next `times` calls of `op` time out. `op` is the trait
    /// method name.
    pub fn time_out(&self, op: &'static str, times: usize) {
        self.timeouts.set(op, 0, times);
    }

    /// Like [`time_out`](Self::time_out) but only after `skip` calls succeed.
    pub fn time_out_after(&self, op: &'static str, skip: usize, times: usize) {
        self.timeouts.set(op, skip, times);
    }

    fn check(&self, op: &'static str) -> Result<(), PlatformError> {
        if self.timeouts.take(op) {
            return Err(PlatformError::Timeout(op.to_string()));
        }
        Ok(())
    }

    pub fn created_channels(&self) -> Vec<(String, Option<ChannelHandle>)> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_categories(&self) -> Vec<String> {
        self.categories.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<(Route, Delivery)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<(ChannelHandle, String)> {
        self.texts.lock().unwrap().clone()
    }

    /// Texts posted to one channel, oldest first.
    pub fn texts_in(&self, channel: ChannelHandle) -> Vec<String> {
        self.texts()
            .into_iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, t)| t)
            .collect()
    }

    pub fn files(&self) -> Vec<(ChannelHandle, Attachment)> {
        self.files.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(ChannelHandle, Option<u16>, Option<ChannelHandle>)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn deleted_channels(&self) -> Vec<ChannelHandle> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl GuildPlatform for FakePlatform {
    async fn create_category(&self, name: &str) -> Result<ChannelHandle, PlatformError> {
        self.check("create_category")?;
        let channel = self.next();
        self.categories.lock().unwrap().push(name.to_string());
        self.channels.lock().unwrap().push(GuildChannelInfo {
            channel,
            name: name.to_string(),
            parent: None,
            is_category: true,
        });
        Ok(channel)
    }

    async fn create_text_channel(
        &self,
        name: &str,
        parent: Option<ChannelHandle>,
    ) -> Result<ChannelHandle, PlatformError> {
        self.check("create_text_channel")?;
        let channel = self.next();
        self.created.lock().unwrap().push((name.to_string(), parent));
        self.channels.lock().unwrap().push(GuildChannelInfo {
            channel,
            name: name.to_string(),
            parent,
            is_category: false,
        });
        Ok(channel)
    }

    async fn create_webhook(
        &self,
        channel: ChannelHandle,
        _name: &str,
    ) -> Result<WebhookHandle, PlatformError> {
        self.check("create_webhook")?;
        if self.fail_webhooks.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("Maximum number of webhooks reached".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.webhooks.lock().unwrap().insert(id, channel);
        Ok(WebhookHandle { id })
    }

    async fn execute_webhook(
        &self,
        webhook: &WebhookHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError> {
        self.check("execute_webhook")?;
        if !self.webhooks.lock().unwrap().contains_key(&webhook.id) {
            return Err(PlatformError::Api("Unknown Webhook".into()));
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((Route::Webhook(webhook.clone()), delivery.clone()));
        Ok(())
    }

    async fn send_delivery(
        &self,
        channel: ChannelHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError> {
        self.check("send_delivery")?;
        self.deliveries
            .lock()
            .unwrap()
            .push((Route::Channel(channel), delivery.clone()));
        Ok(())
    }

    async fn send_text(&self, channel: ChannelHandle, text: &str) -> Result<(), PlatformError> {
        self.check("send_text")?;
        self.texts.lock().unwrap().push((channel, text.to_string()));
        Ok(())
    }

    async fn send_file(
        &self,
        channel: ChannelHandle,
        attachment: Attachment,
    ) -> Result<(), PlatformError> {
        self.check("send_file")?;
        self.files.lock().unwrap().push((channel, attachment));
        Ok(())
    }

    async fn edit_channel(
        &self,
        channel: ChannelHandle,
        position: Option<u16>,
        parent: Option<ChannelHandle>,
    ) -> Result<(), PlatformError> {
        self.check("edit_channel")?;
        self.edits.lock().unwrap().push((channel, position, parent));
        if let Some(info) = self
            .channels
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.channel == channel)
        {
            info.parent = parent.or(info.parent);
        }
        Ok(())
    }

    async fn delete_channel(&self, channel: ChannelHandle) -> Result<(), PlatformError> {
        self.check("delete_channel")?;
        self.deleted.lock().unwrap().push(channel);
        self.drop_channel(channel);
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<GuildChannelInfo>, PlatformError> {
        self.check("list_channels")?;
        Ok(self.channels.lock().unwrap().clone())
    }
}

pub struct FakeMobile {
    next_id: AtomicUsize,
    sent: Mutex<Vec<(String, OutboundText)>>,
    send_failure: Mutex<Option<String>>,
    downloads: Mutex<VecDeque<Result<Vec<u8>, SendError>>>,
    download_calls: AtomicUsize,
    contacts: Mutex<Vec<Contact>>,
    timeouts: Timeouts,
}

impl FakeMobile {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            sent: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            downloads: Mutex::new(VecDeque::new()),
            download_calls: AtomicUsize::new(0),
            contacts: Mutex::new(Vec::new()),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_contacts(contacts: &[(&str, &str)]) -> Self {
        let fake = Self::new();
        *fake.contacts.lock().unwrap() = contacts
            .iter()
            .map(|(id, name)| Contact {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect();
        fake
    }

    /// Make the next `times` calls of `op` (`send_text` or `download`) time out.
    pub fn time_out(&self, op: &'static str, times: usize) {
        self.timeouts.set(op, 0, times);
    }

    /// Reject every send with a non-retryable error.
    pub fn fail_sends(&self, reason: &str) {
        *self.send_failure.lock().unwrap() = Some(reason.to_string());
    }

    /// Queue the result of the next download. Unqueued downloads return
    /// four bytes.
    pub fn queue_download(&self, result: Result<Vec<u8>, SendError>) {
        self.downloads.lock().unwrap().push_back(result);
    }

    pub fn sent(&self) -> Vec<(String, OutboundText)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MobileNetwork for FakeMobile {
    async fn send_text(&self, to: &str, message: OutboundText) -> Result<String, SendError> {
        if self.timeouts.take("send_text") {
            return Err(SendError::Timeout("send_text".into()));
        }
        if let Some(reason) = self.send_failure.lock().unwrap().clone() {
            return Err(SendError::Other(reason));
        }
        let id = format!("OUT{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push((to.to_string(), message));
        Ok(id)
    }

    async fn download(&self, _media: &MediaPayload) -> Result<Vec<u8>, SendError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.timeouts.take("download") {
            return Err(SendError::Timeout("download".into()));
        }
        self.downloads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![1, 2, 3, 4]))
    }

    async fn directory(&self) -> Vec<Contact> {
        self.contacts.lock().unwrap().clone()
    }
}
