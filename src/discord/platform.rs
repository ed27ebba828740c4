//! Discord Platform
//!
//! [`GuildPlatform`] over serenity's REST client, scoped to one guild.

use crate::bridge::platform::{
    Attachment, ChannelHandle, Delivery, GuildChannelInfo, GuildPlatform, PlatformError,
    WebhookHandle,
};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, ChannelType, CreateAttachment, CreateChannel, CreateMessage, CreateWebhook,
    EditChannel, ExecuteWebhook, GuildId, Http, Webhook, WebhookId,
};
use serenity::http::HttpError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SerenityPlatform {
    http: Arc<Http>,
    guild: GuildId,
    /// Webhooks fetched or created this run, keyed by ID.
    webhooks: Mutex<HashMap<u64, Webhook>>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, guild: GuildId) -> Self {
        Self {
            http,
            guild,
            webhooks: Mutex::new(HashMap::new()),
        }
    }

    async fn webhook(&self, handle: &WebhookHandle) -> Result<Webhook, PlatformError> {
        if let Some(hook) = self.webhooks.lock().await.get(&handle.id) {
            return Ok(hook.clone());
        }
        let id = nonzero(handle.id, "webhook").map(WebhookId::new)?;
        let hook = self.http.get_webhook(id).await.map_err(platform_error)?;
        self.webhooks.lock().await.insert(handle.id, hook.clone());
        Ok(hook)
    }
}

fn nonzero(id: u64, what: &str) -> Result<u64, PlatformError> {
    if id == 0 {
        Err(PlatformError::Api(format!("invalid {what} id 0")))
    } else {
        Ok(id)
    }
}

fn channel_id(handle: ChannelHandle) -> Result<ChannelId, PlatformError> {
    nonzero(handle.0, "channel").map(ChannelId::new)
}

fn platform_error(e: serenity::Error) -> PlatformError {
    match &e {
        serenity::Error::Http(HttpError::Request(request)) if request.is_timeout() => {
            PlatformError::Timeout(e.to_string())
        }
        _ => PlatformError::Api(e.to_string()),
    }
}

fn upload(attachment: &Attachment) -> CreateAttachment {
    CreateAttachment::bytes(attachment.bytes.clone(), attachment.file_name.clone())
}

#[async_trait]
impl GuildPlatform for SerenityPlatform {
    async fn create_category(&self, name: &str) -> Result<ChannelHandle, PlatformError> {
        let channel = self
            .guild
            .create_channel(&self.http, CreateChannel::new(name).kind(ChannelType::Category))
            .await
            .map_err(platform_error)?;
        Ok(ChannelHandle(channel.id.get()))
    }

    async fn create_text_channel(
        &self,
        name: &str,
        parent: Option<ChannelHandle>,
    ) -> Result<ChannelHandle, PlatformError> {
        let mut builder = CreateChannel::new(name).kind(ChannelType::Text);
        if let Some(parent) = parent {
            builder = builder.category(channel_id(parent)?);
        }
        let channel = self
            .guild
            .create_channel(&self.http, builder)
            .await
            .map_err(platform_error)?;
        Ok(ChannelHandle(channel.id.get()))
    }

    async fn create_webhook(
        &self,
        channel: ChannelHandle,
        name: &str,
    ) -> Result<WebhookHandle, PlatformError> {
        let hook = channel_id(channel)?
            .create_webhook(&self.http, CreateWebhook::new(name))
            .await
            .map_err(platform_error)?;
        let id = hook.id.get();
        self.webhooks.lock().await.insert(id, hook);
        Ok(WebhookHandle { id })
    }

    async fn execute_webhook(
        &self,
        webhook: &WebhookHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError> {
        let hook = self.webhook(webhook).await?;
        let mut builder = ExecuteWebhook::new().username(&delivery.username);
        if let Some(content) = &delivery.content {
            builder = builder.content(content);
        }
        if let Some(file) = &delivery.file {
            builder = builder.add_file(upload(file));
        }
        hook.execute(&self.http, true, builder)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn send_delivery(
        &self,
        channel: ChannelHandle,
        delivery: &Delivery,
    ) -> Result<(), PlatformError> {
        let mut builder = CreateMessage::new();
        if let Some(content) = &delivery.content {
            builder = builder.content(content);
        }
        if let Some(file) = &delivery.file {
            builder = builder.add_file(upload(file));
        }
        channel_id(channel)?
            .send_message(&self.http, builder)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn send_text(&self, channel: ChannelHandle, text: &str) -> Result<(), PlatformError> {
        channel_id(channel)?
            .say(&self.http, text)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn send_file(
        &self,
        channel: ChannelHandle,
        attachment: Attachment,
    ) -> Result<(), PlatformError> {
        channel_id(channel)?
            .send_message(&self.http, CreateMessage::new().add_file(upload(&attachment)))
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn edit_channel(
        &self,
        channel: ChannelHandle,
        position: Option<u16>,
        parent: Option<ChannelHandle>,
    ) -> Result<(), PlatformError> {
        let mut builder = EditChannel::new();
        if let Some(position) = position {
            builder = builder.position(position);
        }
        if let Some(parent) = parent {
            builder = builder.category(Some(channel_id(parent)?));
        }
        channel_id(channel)?
            .edit(&self.http, builder)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn delete_channel(&self, channel: ChannelHandle) -> Result<(), PlatformError> {
        channel_id(channel)?
            .delete(&self.http)
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<GuildChannelInfo>, PlatformError> {
        let channels = self
            .guild
            .channels(&self.http)
            .await
            .map_err(platform_error)?;
        Ok(channels
            .into_values()
            .map(|channel| GuildChannelInfo {
                channel: ChannelHandle(channel.id.get()),
                name: channel.name,
                parent: channel.parent_id.map(|p| ChannelHandle(p.get())),
                is_category: channel.kind == ChannelType::Category,
            })
            .collect())
    }
}
