//! WhatsApp message conversion
//!
//! Maps protobuf messages to [`InboundMessage`] and builds outbound ones.

use crate::bridge::platform::{
    InboundBody, InboundMessage, InboundQuote, MediaKind, MediaLocator, MediaPayload, OutboundText,
};
use std::borrow::Borrow;
use wacore::types::message::MessageInfo;
use waproto::whatsapp as wa;

/// Media message kept for the download call.
#[derive(Debug, Clone)]
pub enum WaMedia {
    Image(wa::message::ImageMessage),
    Video(wa::message::VideoMessage),
    Audio(wa::message::AudioMessage),
    Document(wa::message::DocumentMessage),
    Sticker(wa::message::StickerMessage),
}

/// Context info whether or not the generated field is boxed.
fn context<C: Borrow<wa::ContextInfo>>(field: &Option<C>) -> Option<&wa::ContextInfo> {
    field.as_ref().map(<C as Borrow<wa::ContextInfo>>::borrow)
}

/// Strip ephemeral and view-once wrappers.
fn unwrap_message(msg: &wa::Message) -> &wa::Message {
    if let Some(inner) = msg.ephemeral_message.as_ref().and_then(|f| f.message.as_ref()) {
        return unwrap_message(inner);
    }
    if let Some(inner) = msg.view_once_message.as_ref().and_then(|f| f.message.as_ref()) {
        return unwrap_message(inner);
    }
    msg
}

/// Plain text of a message, or a short tag for media without a caption.
pub fn text_of(msg: &wa::Message) -> Option<String> {
    let msg = unwrap_message(msg);
    if let Some(text) = msg.conversation.as_ref() {
        return Some(text.clone());
    }
    if let Some(text) = msg.extended_text_message.as_ref().and_then(|m| m.text.clone()) {
        return Some(text);
    }
    let (kind, caption) = if let Some(m) = msg.image_message.as_ref() {
        ("image", m.caption.clone())
    } else if let Some(m) = msg.video_message.as_ref() {
        ("video", m.caption.clone())
    } else if let Some(m) = msg.document_message.as_ref() {
        ("document", m.caption.clone().or_else(|| m.file_name.clone()))
    } else if msg.audio_message.is_some() {
        ("audio", None)
    } else if msg.sticker_message.is_some() {
        ("sticker", None)
    } else {
        return None;
    };
    Some(caption.unwrap_or_else(|| format!("[{kind}]")))
}

fn media(kind: MediaKind, mimetype: Option<&String>, fallback: &str, size: Option<u64>, inner: WaMedia) -> MediaPayload {
    MediaPayload::new(
        kind,
        mimetype.cloned().unwrap_or_else(|| fallback.to_string()),
        size.unwrap_or(0),
        MediaLocator::new(inner),
    )
}

/// Body and context info of a supported message type.
fn body_of(msg: &wa::Message) -> Option<(InboundBody, Option<&wa::ContextInfo>)> {
    if let Some(text) = msg.conversation.as_ref() {
        return Some((InboundBody::Text(text.clone()), None));
    }
    if let Some(ext) = msg.extended_text_message.as_ref() {
        let text = ext.text.clone().unwrap_or_default();
        return Some((InboundBody::Text(text), context(&ext.context_info)));
    }
    if let Some(m) = msg.image_message.as_ref() {
        let mut payload = media(
            MediaKind::Image,
            m.mimetype.as_ref(),
            "image/jpeg",
            m.file_length,
            WaMedia::Image(wa::message::ImageMessage::clone(m)),
        );
        if let Some(caption) = &m.caption {
            payload = payload.with_caption(caption);
        }
        return Some((InboundBody::Media(payload), context(&m.context_info)));
    }
    if let Some(m) = msg.video_message.as_ref() {
        let mut payload = media(
            MediaKind::Video,
            m.mimetype.as_ref(),
            "video/mp4",
            m.file_length,
            WaMedia::Video(wa::message::VideoMessage::clone(m)),
        );
        if let Some(caption) = &m.caption {
            payload = payload.with_caption(caption);
        }
        return Some((InboundBody::Media(payload), context(&m.context_info)));
    }
    if let Some(m) = msg.audio_message.as_ref() {
        let payload = media(
            MediaKind::Audio,
            m.mimetype.as_ref(),
            "audio/ogg",
            m.file_length,
            WaMedia::Audio(wa::message::AudioMessage::clone(m)),
        );
        return Some((InboundBody::Media(payload), context(&m.context_info)));
    }
    if let Some(m) = msg.document_message.as_ref() {
        let mut payload = media(
            MediaKind::Document,
            m.mimetype.as_ref(),
            "application/octet-stream",
            m.file_length,
            WaMedia::Document(wa::message::DocumentMessage::clone(m)),
        );
        if let Some(name) = m.file_name.as_ref().or(m.title.as_ref()) {
            payload = payload.with_file_name(name);
        }
        if let Some(caption) = &m.caption {
            payload = payload.with_caption(caption);
        }
        return Some((InboundBody::Media(payload), context(&m.context_info)));
    }
    if let Some(m) = msg.sticker_message.as_ref() {
        let payload = media(
            MediaKind::Sticker,
            m.mimetype.as_ref(),
            "image/webp",
            m.file_length,
            WaMedia::Sticker(wa::message::StickerMessage::clone(m)),
        );
        return Some((InboundBody::Media(payload), context(&m.context_info)));
    }
    None
}

fn quote_of(context: &wa::ContextInfo) -> Option<InboundQuote> {
    let quoted = context.quoted_message.as_ref()?;
    Some(InboundQuote {
        participant: context.participant.clone().unwrap_or_default(),
        content: text_of(quoted).unwrap_or_default(),
    })
}

/// `None` for protocol messages, reactions and other unsupported types.
pub fn inbound(msg: &wa::Message, info: &MessageInfo) -> Option<InboundMessage> {
    let (body, context) = body_of(unwrap_message(msg))?;
    Some(InboundMessage {
        id: info.id.clone(),
        chat: info.source.chat.to_string(),
        sender: info.source.sender.to_string(),
        push_name: Some(info.push_name.clone()).filter(|n| !n.is_empty()),
        timestamp: info.timestamp,
        from_me: info.source.is_from_me,
        is_group: info.source.is_group,
        is_forwarded: context.and_then(|c| c.is_forwarded).unwrap_or(false),
        quote: context.and_then(quote_of),
        body,
    })
}

/// Protobuf message for an outbound text, quoting when asked.
pub fn outbound(message: &OutboundText) -> wa::Message {
    match &message.quote {
        None => wa::Message {
            conversation: Some(message.text.clone()),
            ..Default::default()
        },
        Some(quote) => {
            let quoted = wa::Message {
                conversation: Some(quote.content.clone()),
                ..Default::default()
            };
            let context = wa::ContextInfo {
                participant: Some(quote.participant.clone()),
                quoted_message: Some(quoted.into()),
                ..Default::default()
            };
            let extended = wa::message::ExtendedTextMessage {
                text: Some(message.text.clone()),
                context_info: Some(context.into()),
                ..Default::default()
            };
            wa::Message {
                extended_text_message: Some(extended.into()),
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::platform::OutboundQuote;

    #[test]
    fn test_text_of_conversation_and_media_tag() {
        let text = wa::Message {
            conversation: Some("hello".into()),
            ..Default::default()
        };
        assert_eq!(text_of(&text).as_deref(), Some("hello"));

        let image = wa::Message {
            image_message: Some(wa::message::ImageMessage::default().into()),
            ..Default::default()
        };
        assert_eq!(text_of(&image).as_deref(), Some("[image]"));
        assert_eq!(text_of(&wa::Message::default()), None);
    }

    #[test]
    fn test_document_body_keeps_name_and_size() {
        let doc = wa::message::DocumentMessage {
            file_name: Some("report.pdf".into()),
            mimetype: Some("application/pdf".into()),
            file_length: Some(2048),
            ..Default::default()
        };
        let msg = wa::Message {
            document_message: Some(doc.into()),
            ..Default::default()
        };
        let Some((InboundBody::Media(payload), _)) = body_of(&msg) else {
            panic!("expected media body");
        };
        assert_eq!(payload.size(), 2048);
        assert_eq!(payload.upload_name(), "report.pdf");
        assert!(matches!(payload.locator.downcast_ref::<WaMedia>(), Some(WaMedia::Document(_))));
    }

    #[test]
    fn test_outbound_quote_builds_context() {
        let msg = outbound(&OutboundText {
            text: "reply".into(),
            quote: Some(OutboundQuote {
                participant: "1@s.whatsapp.net".into(),
                content: "original".into(),
            }),
        });
        let ext = msg.extended_text_message.as_ref().unwrap();
        assert_eq!(ext.text.as_deref(), Some("reply"));
        let ctx = ext.context_info.as_ref().unwrap();
        assert_eq!(ctx.participant.as_deref(), Some("1@s.whatsapp.net"));
        assert_eq!(text_of(ctx.quoted_message.as_ref().unwrap()).as_deref(), Some("original"));
    }
}
