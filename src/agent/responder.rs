//! Model output -> deliverable segments.
//!
//! Parsing strategy:
//! 1. Try `serde_json::from_str` on the whole output: either an array of
//!    segments or `{"messages": [...]}`.
//! 2. If that fails, extract the first `[…]` (then `{…}`) substring and retry.
//! 3. Otherwise the whole output is one plain-text segment.
//!
//! Parsing never fails; an unusable answer simply yields empty segments,
//! which the sequencer treats as a model failure.

use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One message of a multi-part answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    /// Username of the person this part answers, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Segment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
        }
    }

    pub fn replying_to(text: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: Some(username.into()),
        }
    }
}

/// What a language model hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    Segments(Vec<Segment>),
}

impl ModelReply {
    pub fn into_segments(self) -> Vec<Segment> {
        match self {
            ModelReply::Text(text) => parse_segments(&text),
            ModelReply::Segments(segments) => segments,
        }
    }

    /// Plain text view, e.g. for notes
    pub fn into_text(self) -> String {
        match self {
            ModelReply::Text(text) => text,
            ModelReply::Segments(segments) => segments
                .into_iter()
                .map(|s| s.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ── JSON shapes accepted from the model ─────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentJson {
    Plain(String),
    Full {
        text: String,
        #[serde(default)]
        reply_to: Option<String>,
    },
}

impl From<SegmentJson> for Segment {
    fn from(json: SegmentJson) -> Self {
        match json {
            SegmentJson::Plain(text) => Segment::new(text),
            SegmentJson::Full { text, reply_to } => Segment {
                text,
                reply_to: reply_to.filter(|r| !r.trim().is_empty()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentsJson {
    List(Vec<SegmentJson>),
    Wrapped { messages: Vec<SegmentJson> },
}

impl SegmentsJson {
    fn into_segments(self) -> Vec<Segment> {
        let list = match self {
            SegmentsJson::List(list) => list,
            SegmentsJson::Wrapped { messages } => messages,
        };
        list.into_iter().map(Segment::from).collect()
    }
}

/// Split raw model output into segments
pub fn parse_segments(raw: &str) -> Vec<Segment> {
    let text = raw.trim();

    if let Ok(parsed) = serde_json::from_str::<SegmentsJson>(text) {
        return parsed.into_segments();
    }

    for embedded in [extract_json(text, '[', ']'), extract_json(text, '{', '}')]
        .into_iter()
        .flatten()
    {
        if let Ok(parsed) = serde_json::from_str::<SegmentsJson>(embedded) {
            debug!("Parsed segments from embedded JSON");
            return parsed.into_segments();
        }
    }

    vec![Segment::new(text)]
}

/// First balanced `open … close` substring, ignoring brackets in strings
fn extract_json(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..start + i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Leading `* ` bullet -> `- `
pub fn normalize_bullet(text: &str) -> String {
    match text.strip_prefix("* ") {
        Some(rest) => format!("- {}", rest),
        None => text.to_string(),
    }
}

/// Post-processing applied to every segment's text before delivery
pub struct ReplyCleaner {
    /// `Name (@username):` and `Name:` echoes of the bot itself
    name_patterns: Vec<Regex>,
    emoji: Regex,
    speaker_line: Regex,
}

impl ReplyCleaner {
    pub fn new(first_name: &str, username: &str) -> Result<Self> {
        let mut name_patterns = Vec::new();
        let name = regex::escape(first_name.trim());
        if !name.is_empty() {
            let username = username.trim().trim_start_matches('@');
            if !username.is_empty() {
                name_patterns.push(Regex::new(&format!(
                    r"(?im)^{}\s*\(@{}\):\s*",
                    name,
                    regex::escape(username)
                ))?);
            }
            name_patterns.push(Regex::new(&format!(r"(?im)^{}\s*:\s*", name))?);
        }

        Ok(Self {
            name_patterns,
            emoji: Regex::new(r"[\p{Extended_Pictographic}\x{FE0F}\x{200D}]")?,
            speaker_line: Regex::new(r"^.*\)\s*:\s*$")?,
        })
    }

    pub fn clean(&self, text: &str) -> String {
        let mut text = text.to_string();

        for pattern in &self.name_patterns {
            text = pattern.replace_all(&text, "").into_owned();
        }

        // Emoji go only if something is left afterwards
        let without_emoji = self.emoji.replace_all(&text, "");
        if !without_emoji.trim().is_empty() {
            text = without_emoji.into_owned();
        }

        if let Some((first, rest)) = text.split_once('\n') {
            if self.speaker_line.is_match(first) {
                debug!("Dropped first line ending with \"):\"");
                text = rest.to_string();
            }
        } else if self.speaker_line.is_match(&text) {
            text.clear();
        }

        text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cleaner() -> ReplyCleaner {
        ReplyCleaner::new("Kibitz", "KibitzBot").unwrap()
    }

    #[test]
    fn test_parse_json_array() {
        let segments = parse_segments(r#"[{"text": "Hi", "reply_to": "ann"}, {"text": "bye"}]"#);
        assert_eq!(
            segments,
            vec![Segment::replying_to("Hi", "ann"), Segment::new("bye")]
        );
    }

    #[test]
    fn test_parse_wrapped_object() {
        let segments = parse_segments(r#"{"messages": [{"text": "one", "reply_to": ""}, "two"]}"#);
        assert_eq!(segments, vec![Segment::new("one"), Segment::new("two")]);
    }

    #[test]
    fn test_parse_embedded_array() {
        let raw = "Sure:\n```json\n[{\"text\": \"a [b] c\"}]\n```";
        assert_eq!(parse_segments(raw), vec![Segment::new("a [b] c")]);
    }

    #[test]
    fn test_plain_text_is_single_segment() {
        let raw = "look at this [photo], nice";
        assert_eq!(parse_segments(raw), vec![Segment::new(raw)]);
    }

    #[test]
    fn test_normalize_bullet() {
        assert_eq!(normalize_bullet("* ok"), "- ok");
        assert_eq!(normalize_bullet("*bold*"), "*bold*");
    }

    #[test]
    fn test_clean_removes_own_name() {
        assert_eq!(cleaner().clean("Kibitz (@KibitzBot): hello"), "hello");
        assert_eq!(cleaner().clean("kibitz: hello"), "hello");
        assert_eq!(cleaner().clean("Ann: hello"), "Ann: hello");
    }

    #[test]
    fn test_clean_strips_emoji_only_when_text_remains() {
        assert_eq!(cleaner().clean("great 😀👍"), "great");
        assert_eq!(cleaner().clean("👍"), "👍");
    }

    #[test]
    fn test_clean_drops_speaker_line() {
        assert_eq!(cleaner().clean("Bob (in reply to: Ann):\nsure thing"), "sure thing");
        assert_eq!(cleaner().clean("first line\nsecond):"), "first line\nsecond):");
    }

    #[test]
    fn test_reply_into_text() {
        let reply = ModelReply::Segments(vec![Segment::new("a"), Segment::new("b")]);
        assert_eq!(reply.into_text(), "a\nb");
    }
}
