//! Per-chat view over the shared memory

use super::model::{now_millis, Chat, ChatKind, ChatMessage, Member, Memory, OptOutUser};
use crate::protocol::User;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Accessor bound to one chat of a `Memory`.
///
/// Cheap to build, holds no state of its own; create one per update while
/// holding the memory lock.
pub struct ChatMemory<'a> {
    memory: &'a mut Memory,
    chat_id: i64,
}

impl<'a> ChatMemory<'a> {
    pub fn new(memory: &'a mut Memory, chat_id: i64) -> Self {
        Self { memory, chat_id }
    }

    /// Chat record, created with empty defaults on first access
    pub fn get_chat(&mut self) -> &mut Chat {
        self.memory.get_or_create(self.chat_id)
    }

    pub fn history(&mut self) -> &[ChatMessage] {
        &self.get_chat().history
    }

    /// Record the platform's view of the chat
    pub fn set_info(&mut self, title: Option<&str>, kind: ChatKind) {
        let chat = self.get_chat();
        chat.title = title.map(str::to_string);
        chat.kind = kind;
    }

    pub fn add_message(&mut self, message: ChatMessage) {
        self.get_chat().history.push(message);
    }

    /// Once history grows past `max_length`, drop its first `max_length`
    /// entries (not just the overflow).
    pub fn remove_old_messages(&mut self, max_length: usize) {
        let history = &mut self.get_chat().history;
        if history.len() > max_length {
            history.drain(..max_length);
        }
    }

    pub fn add_note(&mut self, note: String) {
        self.get_chat().notes.push(note);
    }

    /// Same pruning policy as [`Self::remove_old_messages`], applied to notes.
    pub fn remove_old_notes(&mut self, max_length: usize) {
        let notes = &mut self.get_chat().notes;
        if notes.len() > max_length {
            notes.drain(..max_length);
        }
    }

    /// Insert or replace the roster entry for `user`
    pub fn update_user(&mut self, user: &User) {
        self.update_user_at(user, now_millis());
    }

    pub fn update_user_at(&mut self, user: &User, now: i64) {
        let members = &mut self.get_chat().members;
        match members.iter().position(|m| m.id == user.id) {
            Some(index) => {
                let member = &mut members[index];
                member.username = user.username.clone();
                member.first_name = user.first_name.clone();
                member.last_use = member.last_use.max(now);
            }
            None => members.push(Member {
                id: user.id,
                username: user.username.clone(),
                first_name: user.first_name.clone(),
                description: String::new(),
                last_use: now,
            }),
        }
    }

    /// Members seen within the last `days`, at most `limit`, in roster order
    pub fn active_members(&mut self, days: u32, limit: usize) -> Vec<Member> {
        self.active_members_at(now_millis(), days, limit)
    }

    pub fn active_members_at(&mut self, now: i64, days: u32, limit: usize) -> Vec<Member> {
        let since = now - DAY_MILLIS * i64::from(days);
        self.get_chat()
            .members
            .iter()
            .filter(|m| m.last_use > since)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Forget the conversation. Notes and members are left alone.
    pub fn clear(&mut self) {
        let chat = self.get_chat();
        chat.history.clear();
        chat.last_notes = 0;
    }

    /// Refresh `last_use`; never moves it backwards
    pub fn touch(&mut self) {
        let now = now_millis();
        let chat = self.get_chat();
        chat.last_use = chat.last_use.max(now);
    }

    pub fn mark_notes_updated(&mut self, now: i64) {
        let chat = self.get_chat();
        chat.last_notes = chat.last_notes.max(now);
    }

    /// Returns false when the user had already opted out
    pub fn opt_out(&mut self, user: &User) -> bool {
        let chat = self.get_chat();
        if chat.is_opted_out(user.id) {
            return false;
        }
        chat.opt_out_users.push(OptOutUser {
            id: user.id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
        });
        true
    }

    /// Returns false when the user was not opted out
    pub fn opt_in(&mut self, user_id: i64) -> bool {
        let users = &mut self.get_chat().opt_out_users;
        let before = users.len();
        users.retain(|u| u.id != user_id);
        users.len() != before
    }

    pub fn model(&mut self) -> Option<String> {
        self.get_chat().chat_model.clone()
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.get_chat().chat_model = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Sender;
    use pretty_assertions::assert_eq;

    fn message(id: i64) -> ChatMessage {
        ChatMessage {
            id,
            text: format!("message {}", id),
            sender: Sender {
                id: 1,
                name: "Ann".to_string(),
                username: None,
                myself: false,
            },
            reply_to: None,
            is_myself: false,
            date: 0,
            media_group_id: None,
        }
    }

    fn user(id: i64, name: &str) -> User {
        User {
            id,
            first_name: name.to_string(),
            username: Some(name.to_lowercase()),
            is_bot: false,
        }
    }

    #[test]
    fn test_remove_old_messages_drops_max_length_entries() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        for id in 0..25 {
            chat.add_message(message(id));
        }

        chat.remove_old_messages(20);

        let ids: Vec<i64> = chat.history().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![20, 21, 22, 23, 24]);
    }

    #[test]
    fn test_remove_old_messages_within_limit_is_noop() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        for id in 0..20 {
            chat.add_message(message(id));
        }
        chat.remove_old_messages(20);
        assert_eq!(chat.history().len(), 20);
    }

    #[test]
    fn test_remove_old_notes() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        for i in 0..4 {
            chat.add_note(format!("note {}", i));
        }
        chat.remove_old_notes(3);
        assert_eq!(chat.get_chat().notes, vec!["note 3".to_string()]);
    }

    #[test]
    fn test_update_user_upserts_by_id() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        chat.update_user_at(&user(1, "Ann"), 100);
        chat.update_user_at(&user(2, "Bob"), 100);
        chat.get_chat().members[0].description = "bakes bread".to_string();

        let mut renamed = user(1, "Anna");
        renamed.username = None;
        chat.update_user_at(&renamed, 200);

        let members = &chat.get_chat().members;
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].first_name, "Anna");
        assert_eq!(members[0].username, None);
        assert_eq!(members[0].last_use, 200);
        assert_eq!(members[0].description, "bakes bread");
    }

    #[test]
    fn test_active_members_window_and_limit() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        let now = 100 * DAY_MILLIS;
        chat.update_user_at(&user(1, "Old"), now - 8 * DAY_MILLIS);
        for id in 2..6 {
            chat.update_user_at(&user(id, "Fresh"), now - DAY_MILLIS);
        }

        let active = chat.active_members_at(now, 7, 3);
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|m| m.last_use >= now - 7 * DAY_MILLIS));
        let ids: Vec<i64> = active.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_clear_keeps_notes_and_members() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        chat.add_message(message(1));
        chat.add_note("note".to_string());
        chat.update_user(&user(1, "Ann"));
        chat.mark_notes_updated(500);

        chat.clear();

        let state = chat.get_chat();
        assert!(state.history.is_empty());
        assert_eq!(state.last_notes, 0);
        assert_eq!(state.notes.len(), 1);
        assert_eq!(state.members.len(), 1);
    }

    #[test]
    fn test_opt_out_and_in() {
        let mut memory = Memory::new();
        let mut chat = ChatMemory::new(&mut memory, 1);
        let ann = user(1, "Ann");
        assert!(chat.opt_out(&ann));
        assert!(!chat.opt_out(&ann));
        assert!(chat.get_chat().is_opted_out(1));
        assert!(chat.opt_in(1));
        assert!(!chat.opt_in(1));
    }
}
