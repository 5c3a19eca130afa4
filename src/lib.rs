//! Kibitz - a chat companion for group conversations
//!
//! Watches every message in a chat and keeps a bounded memory of it:
//! - Decides whether a message deserves an answer at all
//! - Builds a size-limited transcript for the language model
//! - Delivers multi-part answers as paced, correctly threaded replies

pub mod agent;
pub mod commands;
pub mod config;
pub mod gateway;
pub mod jobs;
pub mod memory;
pub mod protocol;
pub mod rules;

pub use agent::{ChatAgent, StopReason, TurnOutcome};
pub use config::Config;
pub use gateway::{BotIdentity, ConsoleGateway, MessagingGateway};
pub use memory::{ChatMemory, Memory, MemoryStore, SharedMemory};
pub use rules::{Decision, DecisionEngine, Stage, Verdict};

/// Result type for Kibitz operations
pub type Result<T> = std::result::Result<T, KibitzError>;

/// Errors that can occur in Kibitz
#[derive(Debug, thiserror::Error)]
pub enum KibitzError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Language model error: {0}")]
    Provider(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Malformed model output: {0}")]
    ModelOutput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}
