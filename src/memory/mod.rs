//! Memory module for Kibitz
//!
//! Per-chat state, its durable snapshot, and the transcript built from it
//! for every language model call.

mod chat;
mod compact;
mod context;
mod model;
mod store;

pub use chat::ChatMemory;
pub use compact::{slice_message, CompactLimits, HistoryCompactor, Transcript};
pub use context::{ContentBlock, Context, ContextBuilder, ReplyTargets, Role};
pub use model::{
    now_millis, Character, Chat, ChatKind, ChatMessage, Member, Memory, OptOutUser, ReplyTo,
    Sender,
};
pub use store::MemoryStore;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide memory handle threaded through the message pipeline.
///
/// Guards are only held across synchronous sections, never across a
/// network call, so a chat's state is never observed half-mutated.
pub type SharedMemory = Arc<RwLock<Memory>>;
