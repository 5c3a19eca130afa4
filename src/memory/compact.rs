//! History compaction: stored messages -> bounded transcript.
//!
//! The transcript is limited three ways:
//!   1. only the last `messages` entries of history are considered
//!   2. every message is cut to `symbols` characters
//!   3. lines are taken newest-first until `bytes` would be exceeded
//!
//! Whatever is dropped is always the oldest part of the window, so the
//! result is a contiguous, most-recent slice of the conversation.

use super::model::ChatMessage;
use std::collections::HashSet;
use tracing::debug;

/// Limits applied when rendering history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactLimits {
    /// Most recent messages considered
    pub messages: usize,
    /// Byte budget for the whole transcript
    pub bytes: usize,
    /// Character cap per message text
    pub symbols: usize,
}

impl Default for CompactLimits {
    fn default() -> Self {
        Self {
            messages: 100,
            bytes: 24_000,
            symbols: 1_000,
        }
    }
}

/// Rendered history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    /// One line per rendered message, each terminated by `\n`
    pub text: String,
    /// Ids of the messages that made it in, oldest first
    pub message_ids: Vec<i64>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn lines(&self) -> usize {
        self.text.lines().count()
    }
}

/// Cut `text` to `max_chars` characters, marking the cut with `...`
pub fn slice_message(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// One transcript line before rendering; media groups collapse into one
struct Entry<'a> {
    message: &'a ChatMessage,
    text: String,
    ids: Vec<i64>,
}

pub struct HistoryCompactor {
    limits: CompactLimits,
    /// Users whose handle is never shown
    hidden_usernames: HashSet<i64>,
}

impl HistoryCompactor {
    pub fn new(limits: CompactLimits) -> Self {
        Self {
            limits,
            hidden_usernames: HashSet::new(),
        }
    }

    pub fn with_hidden_usernames(mut self, user_ids: impl IntoIterator<Item = i64>) -> Self {
        self.hidden_usernames = user_ids.into_iter().collect();
        self
    }

    /// Render the tail of `history` into a transcript that fits the limits.
    pub fn compact(&self, history: &[ChatMessage]) -> Transcript {
        let start = history.len().saturating_sub(self.limits.messages);
        let entries = Self::group_media(&history[start..]);

        let last = entries.len().saturating_sub(1);
        let mut lines: Vec<(String, &[i64])> = Vec::new();
        let mut used_bytes = 0usize;

        for (index, entry) in entries.iter().enumerate().rev() {
            let line = self.render(entry, index == last);
            let line_bytes = line.len() + 1;
            if used_bytes + line_bytes > self.limits.bytes {
                debug!(
                    "Transcript byte budget reached: kept {} of {} messages ({} bytes)",
                    lines.len(),
                    entries.len(),
                    used_bytes
                );
                break;
            }
            used_bytes += line_bytes;
            lines.push((line, entry.ids.as_slice()));
        }
        lines.reverse();

        let mut transcript = Transcript::default();
        for (line, ids) in lines {
            transcript.text.push_str(&line);
            transcript.text.push('\n');
            transcript.message_ids.extend_from_slice(ids);
        }
        transcript
    }

    /// Merge consecutive messages of one sender sharing a media group.
    fn group_media(window: &[ChatMessage]) -> Vec<Entry<'_>> {
        let mut entries: Vec<Entry<'_>> = Vec::new();

        for message in window {
            if let Some(previous) = entries.last_mut() {
                let same_group = message.media_group_id.is_some()
                    && previous.message.media_group_id == message.media_group_id
                    && previous.message.sender.id == message.sender.id;
                if same_group {
                    if !message.text.trim().is_empty() {
                        previous.text.push(' ');
                        previous.text.push_str(&message.text);
                    }
                    previous.ids.push(message.id);
                    continue;
                }
            }
            entries.push(Entry {
                message,
                text: message.text.clone(),
                ids: vec![message.id],
            });
        }

        entries
    }

    fn render(&self, entry: &Entry<'_>, is_last: bool) -> String {
        let message = entry.message;
        let sender = &message.sender;

        let mut line = match &sender.username {
            Some(username) if !self.hidden_usernames.contains(&sender.id) => {
                format!("{} (@{}): ", sender.name, username)
            }
            _ => format!("{}: ", sender.name),
        };

        if let Some(reply) = &message.reply_to {
            if !sender.myself {
                if is_last {
                    let reply_text = slice_message(&collapse(&reply.text), self.limits.symbols);
                    line.push_str(&format!(
                        "(in reply to: {} > \"{}\"): ",
                        reply.sender.name, reply_text
                    ));
                } else {
                    line.push_str(&format!("(in reply to: {}): ", reply.sender.name));
                }
            }
        }

        line.push_str(&slice_message(&collapse(&entry.text), self.limits.symbols));
        line
    }
}

fn collapse(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ReplyTo, Sender};
    use pretty_assertions::assert_eq;

    fn sender(id: i64, name: &str, myself: bool) -> Sender {
        Sender {
            id,
            name: name.to_string(),
            username: Some(name.to_lowercase()),
            myself,
        }
    }

    fn message(id: i64, from: Sender, text: &str) -> ChatMessage {
        ChatMessage {
            id,
            text: text.to_string(),
            is_myself: from.myself,
            sender: from,
            reply_to: None,
            date: 0,
            media_group_id: None,
        }
    }

    fn limits(messages: usize, bytes: usize, symbols: usize) -> CompactLimits {
        CompactLimits {
            messages,
            bytes,
            symbols,
        }
    }

    #[test]
    fn test_slice_message() {
        assert_eq!(slice_message("hello", 10), "hello");
        assert_eq!(slice_message("hello", 5), "hello");
        assert_eq!(slice_message("hello", 3), "hel...");
        assert_eq!(slice_message("привет", 2), "пр...");
    }

    #[test]
    fn test_render_lines_with_and_without_username() {
        let mut anon = sender(2, "Bob", false);
        anon.username = None;
        let history = vec![
            message(1, sender(1, "Ann", false), "hi\nall"),
            message(2, anon, "yo"),
        ];

        let transcript = HistoryCompactor::new(CompactLimits::default()).compact(&history);
        assert_eq!(transcript.text, "Ann (@ann): hi all\nBob: yo\n");
        assert_eq!(transcript.message_ids, vec![1, 2]);
    }

    #[test]
    fn test_message_count_limit_keeps_latest() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| message(i, sender(1, "Ann", false), &format!("m{}", i)))
            .collect();

        let transcript = HistoryCompactor::new(limits(3, 10_000, 100)).compact(&history);
        assert_eq!(transcript.message_ids, vec![7, 8, 9]);
    }

    #[test]
    fn test_reply_context_inlined_only_for_last_message() {
        let quoted = ReplyTo {
            id: 1,
            text: "the original question".to_string(),
            sender: sender(1, "Ann", false),
            is_myself: false,
        };
        let mut first = message(2, sender(2, "Bob", false), "early answer");
        first.reply_to = Some(quoted.clone());
        let mut last = message(3, sender(3, "Cat", false), "late answer");
        last.reply_to = Some(quoted);

        let transcript = HistoryCompactor::new(limits(10, 10_000, 8)).compact(&[first, last]);
        assert_eq!(
            transcript.text,
            "Bob (@bob): (in reply to: Ann): early an...\n\
             Cat (@cat): (in reply to: Ann > \"the orig...\"): late ans...\n"
        );
    }

    #[test]
    fn test_own_replies_are_not_annotated() {
        let mut mine = message(2, sender(99, "Kibitz", true), "sure");
        mine.reply_to = Some(ReplyTo {
            id: 1,
            text: "question".to_string(),
            sender: sender(1, "Ann", false),
            is_myself: false,
        });

        let transcript = HistoryCompactor::new(CompactLimits::default()).compact(&[mine]);
        assert_eq!(transcript.text, "Kibitz (@kibitz): sure\n");
    }

    #[test]
    fn test_byte_budget_keeps_strict_suffix() {
        let history: Vec<ChatMessage> = (0..100)
            .map(|i| message(i, sender(1, "Ann", false), &format!("message number {}", i)))
            .collect();
        let full = HistoryCompactor::new(limits(100, usize::MAX, 1_000)).compact(&history);
        let budget = full.text.len() / 3;

        let transcript = HistoryCompactor::new(limits(100, budget, 1_000)).compact(&history);

        assert!(transcript.text.len() <= budget);
        assert!(!transcript.message_ids.is_empty());
        assert!(transcript.message_ids.len() < 100);
        let first = transcript.message_ids[0];
        let expected: Vec<i64> = (first..100).collect();
        assert_eq!(transcript.message_ids, expected);
        assert!(full.text.ends_with(&transcript.text));
    }

    #[test]
    fn test_media_group_collapses_into_one_line() {
        let mut a = message(1, sender(1, "Ann", false), "[photo]");
        a.media_group_id = Some("g1".to_string());
        let mut b = message(2, sender(1, "Ann", false), "[photo] caption");
        b.media_group_id = Some("g1".to_string());
        let c = message(3, sender(2, "Bob", false), "nice");

        let transcript = HistoryCompactor::new(CompactLimits::default()).compact(&[a, b, c]);
        assert_eq!(
            transcript.text,
            "Ann (@ann): [photo] [photo] caption\nBob (@bob): nice\n"
        );
        assert_eq!(transcript.message_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_hidden_usernames() {
        let history = vec![message(1, sender(5, "Eve", false), "psst")];
        let transcript = HistoryCompactor::new(CompactLimits::default())
            .with_hidden_usernames([5])
            .compact(&history);
        assert_eq!(transcript.text, "Eve: psst\n");
    }
}
