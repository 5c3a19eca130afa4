//! Reply decision: should this message get an answer?
//!
//! Stages are evaluated in `Stage::ORDER`; the first one that returns a
//! verdict wins. Deterministic triggers come before every probability draw,
//! so no configured probability can ever silence a direct address.

use crate::config::{compile_patterns, Config};
use crate::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A named step of the decision gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// No text and no known attachment
    Unsupported,
    /// Relayed through the bot itself
    SelfEcho,
    /// One-to-one chat
    DirectMessage,
    /// Reply to one of our own messages
    DirectReply,
    /// Contains our @handle
    UsernameMention,
    /// Contains one of our names or the persona's aliases
    NameMention,
    TendToIgnore,
    TendToReply,
    RandomReply,
    /// Nothing matched
    FallThrough,
}

impl Stage {
    pub const ORDER: [Stage; 10] = [
        Stage::Unsupported,
        Stage::SelfEcho,
        Stage::DirectMessage,
        Stage::DirectReply,
        Stage::UsernameMention,
        Stage::NameMention,
        Stage::TendToIgnore,
        Stage::TendToReply,
        Stage::RandomReply,
        Stage::FallThrough,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Unsupported => "unsupported",
            Stage::SelfEcho => "self_echo",
            Stage::DirectMessage => "direct_message",
            Stage::DirectReply => "direct_reply",
            Stage::UsernameMention => "username_mention",
            Stage::NameMention => "name_mention",
            Stage::TendToIgnore => "tend_to_ignore",
            Stage::TendToReply => "tend_to_reply",
            Stage::RandomReply => "random_reply",
            Stage::FallThrough => "fall_through",
        }
    }

    /// Stages whose outcome depends on a random draw
    pub fn is_probabilistic(&self) -> bool {
        matches!(
            self,
            Stage::TendToIgnore | Stage::TendToReply | Stage::RandomReply
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Someone addressed the bot; failures still get a filler reply
    Direct,
    /// Reply chosen by chance; failures stay silent
    Ambient,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub stage: Stage,
    pub verdict: Verdict,
}

impl Decision {
    pub fn should_reply(&self) -> bool {
        self.verdict != Verdict::Silent
    }

    pub fn is_ambient(&self) -> bool {
        self.verdict == Verdict::Ambient
    }

    /// Only a direct reply to the bot counts as the chat using it
    pub fn refreshes_last_use(&self) -> bool {
        self.stage == Stage::DirectReply
    }
}

/// Source of probability draws
pub trait Chance: Send {
    /// True with probability `probability`
    fn roll(&mut self, probability: f64) -> bool;
}

/// Draws from `rand::thread_rng()`
#[derive(Debug, Default)]
pub struct ThreadChance;

impl Chance for ThreadChance {
    fn roll(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        rand::Rng::gen_bool(&mut rand::thread_rng(), probability)
    }
}

/// What the gate needs to know about one inbound message
#[derive(Debug, Clone, Default)]
pub struct Signals<'a> {
    /// Normalised text; `None` when nothing could be extracted
    pub text: Option<&'a str>,
    pub private_chat: bool,
    pub reply_to_me: bool,
    pub via_me: bool,
    pub forwarded_from_me: bool,
    /// Names of the chat's persona, matched like configured names
    pub aliases: &'a [String],
    /// Chat's own base rate, preferred over the configured one
    pub random_reply_probability: Option<f64>,
}

pub struct DecisionEngine {
    /// `@handle` not followed by another word character
    username: Option<Regex>,
    names: Option<Regex>,
    /// Persona alias patterns, keyed by the alias list
    persona_names: Mutex<HashMap<Vec<String>, Option<Regex>>>,
    tend_to_reply: Vec<Regex>,
    tend_to_reply_probability: f64,
    tend_to_ignore: Vec<Regex>,
    tend_to_ignore_probability: f64,
    short_message_length: usize,
    random_reply_probability: f64,
}

impl DecisionEngine {
    pub fn new(config: &Config, bot_username: &str) -> Result<Self> {
        Ok(Self {
            username: username_pattern(bot_username)?,
            names: names_pattern(&config.names)?,
            persona_names: Mutex::new(HashMap::new()),
            tend_to_reply: compile_patterns(&config.tend_to_reply)?,
            tend_to_reply_probability: config.tend_to_reply_probability,
            tend_to_ignore: compile_patterns(&config.tend_to_ignore)?,
            tend_to_ignore_probability: config.tend_to_ignore_probability,
            short_message_length: config.short_message_length,
            random_reply_probability: config.random_reply_probability,
        })
    }

    pub fn decide(&self, signals: &Signals<'_>, chance: &mut dyn Chance) -> Decision {
        for stage in Stage::ORDER {
            if let Some(verdict) = self.evaluate(stage, signals, chance) {
                debug!("Decision stage {} -> {:?}", stage, verdict);
                return Decision { stage, verdict };
            }
        }
        Decision {
            stage: Stage::FallThrough,
            verdict: Verdict::Silent,
        }
    }

    /// Run one stage. `None` means "not my call", move on.
    pub fn evaluate(
        &self,
        stage: Stage,
        signals: &Signals<'_>,
        chance: &mut dyn Chance,
    ) -> Option<Verdict> {
        let text = signals.text.unwrap_or_default();

        match stage {
            Stage::Unsupported => signals.text.is_none().then_some(Verdict::Silent),
            Stage::SelfEcho => signals.via_me.then_some(Verdict::Silent),
            Stage::DirectMessage => signals.private_chat.then_some(Verdict::Direct),
            Stage::DirectReply => signals.reply_to_me.then_some(Verdict::Direct),
            Stage::UsernameMention => self.mentions_username(text).then_some(Verdict::Direct),
            Stage::NameMention => {
                let hit = !signals.forwarded_from_me && self.mentions_name(text, signals.aliases);
                hit.then_some(Verdict::Direct)
            }
            Stage::TendToIgnore => {
                let hit = matches_any(&self.tend_to_ignore, text)
                    && text.chars().count() < self.short_message_length
                    && chance.roll(self.tend_to_ignore_probability);
                hit.then_some(Verdict::Silent)
            }
            Stage::TendToReply => {
                let hit = matches_any(&self.tend_to_reply, text)
                    && chance.roll(self.tend_to_reply_probability);
                hit.then_some(Verdict::Ambient)
            }
            Stage::RandomReply => {
                let probability = signals
                    .random_reply_probability
                    .unwrap_or(self.random_reply_probability);
                chance.roll(probability).then_some(Verdict::Ambient)
            }
            Stage::FallThrough => Some(Verdict::Silent),
        }
    }

    fn mentions_username(&self, text: &str) -> bool {
        self.username.as_ref().is_some_and(|re| re.is_match(text))
    }

    fn mentions_name(&self, text: &str, aliases: &[String]) -> bool {
        if self.names.as_ref().is_some_and(|re| re.is_match(text)) {
            return true;
        }
        if aliases.is_empty() {
            return false;
        }

        let mut cache = self.persona_names.lock().unwrap_or_else(|e| e.into_inner());
        let pattern = cache.entry(aliases.to_vec()).or_insert_with(|| {
            names_pattern(aliases).unwrap_or_else(|e| {
                warn!("Ignoring persona names {:?}: {}", aliases, e);
                None
            })
        });
        pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}

/// `(?i)@handle` followed by a non-word character or the end of text
fn username_pattern(username: &str) -> Result<Option<Regex>> {
    let username = username.trim().trim_start_matches('@');
    if username.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)@{}(?:\W|$)", regex::escape(username));
    Ok(Some(Regex::new(&pattern)?))
}

/// `(?i)\b(?:name|alias|...)\b`, or `None` when there are no names
fn names_pattern(names: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Ok(Some(Regex::new(&pattern)?))
}

fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}
