//! Chat notes: a running summary the model writes about each chat

use super::provider::{GenerationRequest, LanguageModel};
use crate::config::Config;
use crate::memory::{now_millis, Chat, ChatMemory, ContentBlock, HistoryCompactor, SharedMemory};
use crate::{KibitzError, Result};
use tracing::{debug, info};

const HOUR_MILLIS: i64 = 60 * 60 * 1000;

/// Whether `chat` is due for a new note at `now`
pub fn notes_due(chat: &Chat, config: &Config, now: i64) -> bool {
    let hours = i64::try_from(config.notes.interval_hours).unwrap_or(i64::MAX);
    let interval = HOUR_MILLIS.saturating_mul(hours);
    config.notes.enabled
        && now.saturating_sub(chat.last_notes) >= interval
        && chat.history.len() >= config.notes.min_messages
}

/// Ask the model for a summary of recent history and store it as a note.
///
/// Returns `Ok(false)` when the chat was not due.
pub async fn refresh_notes(
    config: &Config,
    memory: &SharedMemory,
    model: &dyn LanguageModel,
    chat_id: i64,
) -> Result<bool> {
    let now = now_millis();
    let request = {
        let memory = memory.read().await;
        let Some(chat) = memory.get(chat_id) else {
            return Ok(false);
        };
        if !notes_due(chat, config, now) {
            return Ok(false);
        }

        let opted_out: Vec<i64> = chat.opt_out_users.iter().map(|u| u.id).collect();
        let transcript = HistoryCompactor::new(config.compact_limits(chat.messages_to_pass))
            .with_hidden_usernames(opted_out)
            .compact(&chat.history);
        let blocks = vec![
            ContentBlock::system(config.notes.prompt.clone()),
            ContentBlock::user(transcript.text),
        ];
        let model_name = chat
            .chat_model
            .clone()
            .unwrap_or_else(|| config.ai.model.clone());

        GenerationRequest {
            structured: false,
            ..GenerationRequest::from_config(config, model_name, blocks)
        }
    };

    debug!("Generating notes for chat {}", chat_id);
    let note = model.generate(&request).await?.into_text();
    let note = note.trim();
    if note.is_empty() {
        return Err(KibitzError::ModelOutput("empty note".to_string()));
    }

    let mut memory = memory.write().await;
    let mut chat = ChatMemory::new(&mut memory, chat_id);
    chat.add_note(note.to_string());
    chat.remove_old_notes(config.notes_max_length);
    chat.mark_notes_updated(now);
    info!("Updated notes for chat {}", chat_id);
    Ok(true)
}
