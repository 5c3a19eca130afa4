//! Configuration loaded once at startup from a TOML file.
//!
//! Every field has a default, so a file only needs the values it changes.
//! Anything invalid is fatal: the process stops before touching a chat.

use crate::gateway::BotIdentity;
use crate::memory::CompactLimits;
use crate::{KibitzError, Result};
use rand::seq::SliceRandom;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity used by the console gateway
    pub bot: BotIdentity,

    /// Names the bot answers to in every chat
    pub names: Vec<String>,

    /// Patterns that make an ambient reply more likely
    pub tend_to_reply: Vec<String>,
    pub tend_to_reply_probability: f64,

    /// Patterns that make short messages more likely to be ignored
    pub tend_to_ignore: Vec<String>,
    pub tend_to_ignore_probability: f64,
    /// Messages shorter than this (in characters) count as short
    pub short_message_length: usize,

    /// Base rate for replying to any message at all
    pub random_reply_probability: f64,

    pub history_max_length: usize,
    pub notes_max_length: usize,

    /// Users allowed to run admin commands
    pub admin_ids: Vec<i64>,

    pub start_message: String,
    pub forget_message: String,

    /// Filler sent when a deliberate reply could not be produced
    pub fallback_replies: Vec<String>,

    /// Downloaded files live here and expire after `files_max_age_hours`
    pub files_dir: Option<PathBuf>,
    pub files_max_age_hours: u64,

    pub save_interval_secs: u64,

    pub typing: TypingConfig,
    pub notes: NotesConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub symbols_per_minute: u32,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotesConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub min_messages: usize,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub model: String,
    /// OpenAI-compatible endpoint, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub prompt: String,
    pub final_prompt: String,
    pub messages_to_pass: usize,
    pub message_max_length: usize,
    pub bytes_limit: usize,
    pub temperature: f32,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub active_members_days: u32,
    pub active_members_limit: usize,
    /// Ask the provider for `{"messages": [...]}` JSON output
    pub structured_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotIdentity::default(),
            names: vec!["kibitz".to_string()],
            tend_to_reply: Vec::new(),
            tend_to_reply_probability: 0.5,
            tend_to_ignore: Vec::new(),
            tend_to_ignore_probability: 0.5,
            short_message_length: 20,
            random_reply_probability: 0.02,
            history_max_length: 300,
            notes_max_length: 10,
            admin_ids: Vec::new(),
            start_message: "Hi! Add me to a group and just talk.".to_string(),
            forget_message: "History cleared".to_string(),
            fallback_replies: vec!["...".to_string()],
            files_dir: None,
            files_max_age_hours: 24,
            save_interval_secs: 60,
            typing: TypingConfig::default(),
            notes: NotesConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            symbols_per_minute: 1200,
            max_wait_ms: 5_000,
        }
    }
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            min_messages: 30,
            prompt: "Summarize the conversation above in a few short bullet points. \
                     Mention who said what when it matters."
                .to_string(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "KIBITZ_API_KEY".to_string(),
            prompt: "You are a friendly participant of a group chat.".to_string(),
            final_prompt: String::new(),
            messages_to_pass: 100,
            message_max_length: 1_000,
            bytes_limit: 24_000,
            temperature: 0.9,
            top_k: None,
            top_p: None,
            active_members_days: 7,
            active_members_limit: 10,
            structured_output: true,
        }
    }
}

impl Config {
    /// Read, parse and validate a config file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KibitzError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let probabilities = [
            ("tend_to_reply_probability", self.tend_to_reply_probability),
            ("tend_to_ignore_probability", self.tend_to_ignore_probability),
            ("random_reply_probability", self.random_reply_probability),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(KibitzError::Config(format!(
                    "{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        if self.names.iter().all(|n| n.trim().is_empty()) {
            return Err(KibitzError::Config("names must not be empty".to_string()));
        }

        let limits = [
            ("history_max_length", self.history_max_length),
            ("notes_max_length", self.notes_max_length),
            ("ai.messages_to_pass", self.ai.messages_to_pass),
            ("ai.message_max_length", self.ai.message_max_length),
            ("ai.bytes_limit", self.ai.bytes_limit),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(KibitzError::Config(format!("{} must be positive", name)));
            }
        }

        compile_patterns(&self.tend_to_reply)?;
        compile_patterns(&self.tend_to_ignore)?;
        Ok(())
    }

    /// Compaction limits, honouring a chat's own message count override
    pub fn compact_limits(&self, messages_to_pass: Option<usize>) -> CompactLimits {
        CompactLimits {
            messages: messages_to_pass.unwrap_or(self.ai.messages_to_pass),
            bytes: self.ai.bytes_limit,
            symbols: self.ai.message_max_length,
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn random_fallback(&self) -> Option<&str> {
        self.fallback_replies
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    pub fn files_max_age(&self) -> Duration {
        Duration::from_secs(self.files_max_age_hours.saturating_mul(60 * 60))
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.ai.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Compile a list of case-insensitive patterns
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){}", p))
                .map_err(|e| KibitzError::Config(format!("invalid pattern {:?}: {}", p, e)))
        })
        .collect()
}
