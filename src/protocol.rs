//! Wire types for messages exchanged with the messaging gateway
//!
//! Shapes follow the Bot API closely enough that platform updates can be
//! deserialized into them with little or no translation.

use crate::memory::ChatKind;
use serde::{Deserialize, Serialize};

/// Maximum characters of a forward origin name kept in the text
const FORWARD_NAME_MAX_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ChatInfo {
    /// Title for groups, first name for private chats
    pub fn display_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.first_name.as_deref())
    }
}

/// Where a forwarded message originally came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardOrigin {
    User { sender_user: User },
    HiddenUser { sender_user_name: String },
    Chat { sender_chat: ChatInfo },
    Channel { chat: ChatInfo },
}

impl ForwardOrigin {
    fn display_name(&self) -> String {
        match self {
            Self::User { sender_user } => sender_user.first_name.clone(),
            Self::HiddenUser { .. } => "hidden".to_string(),
            Self::Chat { sender_chat: chat } | Self::Channel { chat } => chat
                .first_name
                .clone()
                .or_else(|| chat.title.clone())
                .unwrap_or_default(),
        }
    }

    /// Id of the user the message was forwarded from, when known
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::User { sender_user } => Some(sender_user.id),
            _ => None,
        }
    }
}

/// Non-text payloads a message may carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Sticker {
        #[serde(default)]
        emoji: Option<String>,
    },
    Photo,
    Video,
    Animation,
    Audio,
    Voice,
    Document,
    VideoNote,
    Contact,
    Location,
    Venue,
    Poll,
    Dice,
    Game,
}

impl Attachment {
    /// Inline marker for the transcript
    pub fn marker(&self) -> String {
        match self {
            Self::Sticker { emoji: Some(emoji) } => format!("[Sticker {}]", emoji),
            Self::Sticker { emoji: None } => "[Sticker]".to_string(),
            Self::Photo => "[photo]".to_string(),
            Self::Video => "[video]".to_string(),
            Self::Animation => "[animation]".to_string(),
            Self::Audio => "[audio]".to_string(),
            Self::Voice => "[voice]".to_string(),
            Self::Document => "[document]".to_string(),
            Self::VideoNote => "[video_note]".to_string(),
            Self::Contact => "[contact]".to_string(),
            Self::Location => "[location]".to_string(),
            Self::Venue => "[venue]".to_string(),
            Self::Poll => "[poll]".to_string(),
            Self::Dice => "[dice]".to_string(),
            Self::Game => "[game]".to_string(),
        }
    }

    fn is_sticker(&self) -> bool {
        matches!(self, Self::Sticker { .. })
    }
}

/// Content fields shared by a message and the message it replies to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_origin: Option<ForwardOrigin>,
}

/// The message an inbound message replies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(flatten)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
}

/// One inbound message event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: ChatInfo,
    pub from: User,
    #[serde(flatten)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_bot: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<ReplyMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
}

/// One reply as emitted by the console gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    pub text: String,
    pub date: i64,
}

/// Flatten a message's content into a single line of text.
///
/// Text, sticker marker and caption come first, newlines become spaces,
/// forwards get a `(forwarded from NAME): ` prefix and every other
/// attachment appends its own ` [kind]` marker. Returns `None` when the
/// message carries nothing the transcript can show.
pub fn extract_text(content: &Content) -> Option<String> {
    let mut text = content.text.clone().unwrap_or_default();

    for sticker in content.attachments.iter().filter(|a| a.is_sticker()) {
        text.push_str(&sticker.marker());
    }

    if let Some(caption) = &content.caption {
        text.push_str(caption);
    }

    let text = text.replace(['\n', '\r'], " ");

    let markers: String = content
        .attachments
        .iter()
        .filter(|a| !a.is_sticker())
        .map(|a| format!(" {}", a.marker()))
        .collect();

    if text.trim().is_empty() && markers.is_empty() {
        return None;
    }

    let mut result = match &content.forward_origin {
        Some(origin) => {
            let name: String = origin
                .display_name()
                .chars()
                .take(FORWARD_NAME_MAX_CHARS)
                .collect();
            format!("(forwarded from {}): {}", name, text)
        }
        None => text,
    };
    result.push_str(&markers);

    Some(result.trim_start().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> Content {
        Content {
            text: Some(text.to_string()),
            ..Content::default()
        }
    }

    #[test]
    fn test_extract_plain_text_collapses_newlines() {
        assert_eq!(
            extract_text(&content("hello\nthere\r\n")).as_deref(),
            Some("hello there  ")
        );
    }

    #[test]
    fn test_extract_empty_is_none() {
        assert_eq!(extract_text(&content("   ")), None);
        assert_eq!(extract_text(&Content::default()), None);
    }

    #[test]
    fn test_extract_sticker_and_caption() {
        let c = Content {
            caption: Some(" look".to_string()),
            attachments: vec![Attachment::Sticker {
                emoji: Some("😀".to_string()),
            }],
            ..Content::default()
        };
        assert_eq!(extract_text(&c).as_deref(), Some("[Sticker 😀] look"));
    }

    #[test]
    fn test_extract_attachment_only() {
        let c = Content {
            attachments: vec![Attachment::Photo, Attachment::Poll],
            ..Content::default()
        };
        assert_eq!(extract_text(&c).as_deref(), Some("[photo] [poll]"));
    }

    #[test]
    fn test_extract_forward_prefix_truncates_name() {
        let c = Content {
            text: Some("news".to_string()),
            forward_origin: Some(ForwardOrigin::Channel {
                chat: ChatInfo {
                    id: -100,
                    kind: ChatKind::Channel,
                    title: Some("A very long channel title indeed".to_string()),
                    first_name: None,
                    username: None,
                },
            }),
            ..Content::default()
        };
        assert_eq!(
            extract_text(&c).as_deref(),
            Some("(forwarded from A very long channel ): news")
        );
    }

    #[test]
    fn test_incoming_message_deserializes_flat_content() {
        let json = r#"{
            "message_id": 5,
            "chat": {"id": 42, "type": "group", "title": "Friends"},
            "from": {"id": 9, "first_name": "Ann", "username": "ann"},
            "text": "hi",
            "attachments": [{"kind": "photo"}]
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.content.text.as_deref(), Some("hi"));
        assert_eq!(msg.content.attachments, vec![Attachment::Photo]);
        assert_eq!(msg.chat.kind, ChatKind::Group);
        assert_eq!(msg.chat.display_title(), Some("Friends"));
    }
}
