//! Context builder for language model calls

use super::compact::{HistoryCompactor, Transcript};
use super::model::{Chat, ChatMessage, Member, ReplyTo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One role-tagged message of a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub role: Role,
    pub content: String,
}

impl ContentBlock {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Everything one model call needs, plus what is needed afterwards to
/// thread the answer back into the chat.
#[derive(Debug, Clone)]
pub struct Context {
    pub blocks: Vec<ContentBlock>,
    pub transcript: Transcript,
    pub targets: ReplyTargets,
}

impl Context {
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.content.len()).sum()
    }
}

/// Snapshot of who can be replied to, taken before the model is called.
///
/// Holds copies rather than indexes so later trimming of the chat's
/// history cannot invalidate it. Own messages and opted-out users are
/// never candidates.
#[derive(Debug, Clone, Default)]
pub struct ReplyTargets {
    candidates: Vec<ReplyTo>,
}

impl ReplyTargets {
    pub fn from_chat(chat: &Chat) -> Self {
        Self::from_history(&chat.history, |user_id| chat.is_opted_out(user_id))
    }

    pub fn from_history(history: &[ChatMessage], is_opted_out: impl Fn(i64) -> bool) -> Self {
        let candidates = history
            .iter()
            .filter(|m| !m.is_myself && !m.sender.myself && !is_opted_out(m.sender.id))
            .map(ChatMessage::as_reply)
            .collect();
        Self { candidates }
    }

    /// Most recent message whose sender's username matches `hint`
    /// (case-insensitive, leading `@` ignored).
    pub fn resolve(&self, hint: &str) -> Option<&ReplyTo> {
        let wanted = hint.trim().trim_start_matches('@');
        if wanted.is_empty() {
            return None;
        }
        self.candidates.iter().rev().find(|candidate| {
            candidate
                .sender
                .username
                .as_deref()
                .is_some_and(|username| username.eq_ignore_ascii_case(wanted))
        })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Builds the prompt for one turn in a chat
pub struct ContextBuilder<'a> {
    chat: &'a Chat,
    compactor: HistoryCompactor,
    prompt: &'a str,
    final_prompt: Option<&'a str>,
    members: Vec<Member>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(chat: &'a Chat, compactor: HistoryCompactor) -> Self {
        let opted_out: Vec<i64> = chat.opt_out_users.iter().map(|u| u.id).collect();
        Self {
            chat,
            compactor: compactor.with_hidden_usernames(opted_out),
            prompt: "",
            final_prompt: None,
            members: Vec::new(),
        }
    }

    /// Default system prompt, used unless the chat has a persona
    pub fn with_prompt(mut self, prompt: &'a str) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_final_prompt(mut self, final_prompt: &'a str) -> Self {
        if !final_prompt.trim().is_empty() {
            self.final_prompt = Some(final_prompt);
        }
        self
    }

    /// Roster block; opted-out users are left out
    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members
            .into_iter()
            .filter(|m| !self.chat.is_opted_out(m.id))
            .collect();
        self
    }

    fn system_prompt(&self) -> String {
        match &self.chat.character {
            Some(character) => match character.names.first() {
                Some(name) => format!("You are {}. {}", name, character.description),
                None => character.description.clone(),
            },
            None => self.prompt.to_string(),
        }
    }

    fn notes_block(&self) -> Option<String> {
        if self.chat.notes.is_empty() {
            return None;
        }
        let mut block = String::from("=== Notes about this chat ===\n");
        for note in &self.chat.notes {
            block.push_str(&format!("- {}\n", note));
        }
        Some(block)
    }

    fn members_block(&self) -> Option<String> {
        if self.members.is_empty() {
            return None;
        }
        let mut block = String::from("=== Active members ===\n");
        for member in &self.members {
            let mut line = match &member.username {
                Some(username) => format!("- {} (@{})", member.first_name, username),
                None => format!("- {}", member.first_name),
            };
            if !member.description.is_empty() {
                line.push_str(&format!(": {}", member.description));
            }
            block.push_str(&line);
            block.push('\n');
        }
        Some(block)
    }

    pub fn build(self) -> Context {
        let transcript = self.compactor.compact(&self.chat.history);

        let mut blocks = vec![ContentBlock::system(self.system_prompt())];
        if let Some(notes) = self.notes_block() {
            blocks.push(ContentBlock::system(notes));
        }
        if let Some(members) = self.members_block() {
            blocks.push(ContentBlock::system(members));
        }
        blocks.push(ContentBlock::user(transcript.text.clone()));
        if let Some(final_prompt) = self.final_prompt {
            blocks.push(ContentBlock::user(final_prompt));
        }

        Context {
            blocks,
            transcript,
            targets: ReplyTargets::from_chat(self.chat),
        }
    }
}
