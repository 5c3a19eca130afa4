//! Chat state that survives restarts

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Milliseconds since the Unix epoch, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Root of all persisted state: chat id -> chat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub chats: BTreeMap<i64, Chat>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The only way a `Chat` record comes into existence.
    pub fn get_or_create(&mut self, chat_id: i64) -> &mut Chat {
        self.chats.entry(chat_id).or_insert_with(Chat::new)
    }

    pub fn get(&self, chat_id: i64) -> Option<&Chat> {
        self.chats.get(&chat_id)
    }
}

/// Kind of conversation, as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    #[default]
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private)
    }
}

/// One conversation's full state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chat {
    pub history: Vec<ChatMessage>,
    pub notes: Vec<String>,
    pub members: Vec<Member>,
    pub opt_out_users: Vec<OptOutUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<Character>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_to_pass: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_reply_probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub kind: ChatKind,
    pub last_use: i64,
    pub last_notes: i64,
    pub last_memory: i64,
}

impl Chat {
    pub fn new() -> Self {
        Self {
            last_use: now_millis(),
            ..Self::default()
        }
    }

    pub fn is_opted_out(&self, user_id: i64) -> bool {
        self.opt_out_users.iter().any(|u| u.id == user_id)
    }
}

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub myself: bool,
}

impl Sender {
    /// `Name (@username)` or just `Name`
    pub fn display(&self) -> String {
        match &self.username {
            Some(username) => format!("{} (@{})", self.name, username),
            None => self.name.clone(),
        }
    }
}

/// Copy of the message being replied to.
///
/// A value, not an index into history: it stays valid after the
/// original has been trimmed away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub id: i64,
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub is_myself: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub text: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub is_myself: bool,
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
}

impl ChatMessage {
    /// Snapshot of this message for use as another message's `reply_to`.
    pub fn as_reply(&self) -> ReplyTo {
        ReplyTo {
            id: self.id,
            text: self.text.clone(),
            sender: self.sender.clone(),
            is_myself: self.is_myself,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub last_use: i64,
}

/// A user who asked not to be addressed by the bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptOutUser {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub first_name: String,
}

/// Persona that replaces the default system prompt for one chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Aliases the bot answers to in this chat, first one is the display name
    pub names: Vec<String>,
    pub description: String,
}
