//! Delivery of a multi-part answer.
//!
//! Segments go out one by one, in order. Each one is threaded as a reply:
//! to the person its `reply_to` hint names, otherwise to the previous
//! segment of the same answer. Between segments the bot "types" for a
//! while proportional to the next segment's length.

use super::responder::{normalize_bullet, Segment};
use crate::config::TypingConfig;
use crate::gateway::{BotIdentity, MessagingGateway};
use crate::memory::{ChatMemory, ChatMessage, ReplyTargets, ReplyTo, Sender, SharedMemory};
use crate::KibitzError;
use std::time::Duration;
use tracing::{debug, warn};

/// Simulated typing speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingPace {
    symbols_per_minute: u32,
    max_wait: Duration,
}

impl TypingPace {
    pub fn new(symbols_per_minute: u32, max_wait: Duration) -> Self {
        Self {
            symbols_per_minute,
            max_wait,
        }
    }

    pub fn from_config(config: &TypingConfig) -> Self {
        Self::new(
            config.symbols_per_minute,
            Duration::from_millis(config.max_wait_ms),
        )
    }

    /// No waiting at all
    pub fn instant() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn delay_for(&self, text: &str) -> Duration {
        if self.symbols_per_minute == 0 {
            return Duration::ZERO;
        }
        let symbols = text.chars().count() as u64;
        let millis = symbols * 60_000 / u64::from(self.symbols_per_minute);
        Duration::from_millis(millis).min(self.max_wait)
    }
}

/// Outcome of one delivery run
#[derive(Debug, Default)]
pub struct SequenceReport {
    /// Ids of the messages actually sent, in order
    pub delivered: Vec<i64>,
    /// Why the batch stopped early, if it did
    pub aborted: Option<KibitzError>,
}

impl SequenceReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

pub struct Sequencer<'a> {
    gateway: &'a dyn MessagingGateway,
    identity: &'a BotIdentity,
    pace: TypingPace,
}

impl<'a> Sequencer<'a> {
    pub fn new(gateway: &'a dyn MessagingGateway, identity: &'a BotIdentity, pace: TypingPace) -> Self {
        Self {
            gateway,
            identity,
            pace,
        }
    }

    fn own_sender(&self) -> Sender {
        Sender {
            id: self.identity.id,
            name: self.identity.first_name.clone(),
            username: Some(self.identity.username.clone()).filter(|u| !u.is_empty()),
            myself: true,
        }
    }

    /// Send `segments` to `chat_id`, recording each delivered one in memory.
    ///
    /// An empty segment or a failed send stops the batch; what was already
    /// delivered stays delivered.
    pub async fn deliver(
        &self,
        chat_id: i64,
        segments: &[Segment],
        targets: &ReplyTargets,
        memory: &SharedMemory,
    ) -> SequenceReport {
        let mut report = SequenceReport::default();
        let mut previous: Option<ReplyTo> = None;

        for (index, segment) in segments.iter().enumerate() {
            let text = normalize_bullet(segment.text.trim());
            if text.is_empty() {
                report.aborted = Some(KibitzError::ModelOutput(format!(
                    "segment {} of {} is empty",
                    index + 1,
                    segments.len()
                )));
                break;
            }

            let target = segment
                .reply_to
                .as_deref()
                .and_then(|hint| targets.resolve(hint))
                .cloned()
                .or_else(|| previous.clone());

            let sent = match self
                .gateway
                .send_text(chat_id, &text, target.as_ref().map(|t| t.id))
                .await
            {
                Ok(sent) => sent,
                Err(e) => {
                    report.aborted = Some(delivery_error(e));
                    break;
                }
            };

            let message = ChatMessage {
                id: sent.id,
                text,
                sender: self.own_sender(),
                reply_to: target,
                is_myself: true,
                date: sent.date,
                media_group_id: None,
            };
            previous = Some(message.as_reply());
            {
                let mut memory = memory.write().await;
                ChatMemory::new(&mut memory, chat_id).add_message(message);
            }
            report.delivered.push(sent.id);

            if let Some(next) = segments.get(index + 1) {
                let delay = self.pace.delay_for(next.text.trim());
                if !delay.is_zero() {
                    if let Err(e) = self.gateway.send_typing(chat_id).await {
                        warn!("Could not show typing in chat {}: {}", chat_id, e);
                    }
                    debug!("Typing for {:?} before segment {}", delay, index + 2);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report
    }
}

fn delivery_error(e: KibitzError) -> KibitzError {
    match e {
        KibitzError::Delivery(_) => e,
        other => KibitzError::Delivery(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SentMessage;
    use crate::memory::Memory;
    use crate::Result;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tokio::sync::RwLock;

    /// Records `(text, reply_to)` and fails on the configured call
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Option<i64>)>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl MessagingGateway for Recorder {
        async fn me(&self) -> Result<BotIdentity> {
            Ok(BotIdentity::default())
        }

        async fn send_text(&self, _chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<SentMessage> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_on == Some(sent.len()) {
                return Err(KibitzError::Delivery("network down".to_string()));
            }
            sent.push((text.to_string(), reply_to));
            Ok(SentMessage {
                id: 100 + sent.len() as i64,
                date: 0,
            })
        }
    }

    fn history() -> Vec<ChatMessage> {
        vec![ChatMessage {
            id: 7,
            text: "question".to_string(),
            sender: Sender {
                id: 2,
                name: "Ann".to_string(),
                username: Some("ann".to_string()),
                myself: false,
            },
            reply_to: None,
            is_myself: false,
            date: 0,
            media_group_id: None,
        }]
    }

    fn shared() -> SharedMemory {
        Arc::new(RwLock::new(Memory::new()))
    }

    #[test]
    fn test_typing_pace() {
        let pace = TypingPace::new(600, Duration::from_millis(1_000));
        assert_eq!(pace.delay_for("hello"), Duration::from_millis(500));
        assert_eq!(pace.delay_for(&"x".repeat(100)), Duration::from_millis(1_000));
        assert_eq!(TypingPace::instant().delay_for("hello"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_segments_chain_and_resolve_targets() {
        let gateway = Recorder::default();
        let identity = BotIdentity::default();
        let memory = shared();
        let targets = ReplyTargets::from_history(&history(), |_| false);
        let segments = vec![
            Segment::replying_to("Hi", "@Ann"),
            Segment::new("* ok"),
            Segment::replying_to("and you", "nobody"),
        ];

        let report = Sequencer::new(&gateway, &identity, TypingPace::instant())
            .deliver(42, &segments, &targets, &memory)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, vec![101, 102, 103]);
        assert_eq!(
            *gateway.sent.lock().unwrap(),
            vec![
                ("Hi".to_string(), Some(7)),
                ("- ok".to_string(), Some(101)),
                ("and you".to_string(), Some(102)),
            ]
        );

        let memory = memory.read().await;
        let stored = &memory.get(42).unwrap().history;
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|m| m.is_myself && m.sender.myself));
        assert_eq!(stored[1].reply_to.as_ref().map(|r| r.text.as_str()), Some("Hi"));
    }

    #[tokio::test]
    async fn test_first_segment_without_target_is_fresh() {
        let gateway = Recorder::default();
        let identity = BotIdentity::default();
        let memory = shared();

        Sequencer::new(&gateway, &identity, TypingPace::instant())
            .deliver(42, &[Segment::new("hello")], &ReplyTargets::default(), &memory)
            .await;

        assert_eq!(*gateway.sent.lock().unwrap(), vec![("hello".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_empty_segment_aborts_rest() {
        let gateway = Recorder::default();
        let identity = BotIdentity::default();
        let memory = shared();
        let segments = vec![Segment::new("Hi"), Segment::new("  "), Segment::new("never")];

        let report = Sequencer::new(&gateway, &identity, TypingPace::instant())
            .deliver(42, &segments, &ReplyTargets::default(), &memory)
            .await;

        assert_eq!(report.delivered, vec![101]);
        assert!(matches!(report.aborted, Some(KibitzError::ModelOutput(_))));
        assert_eq!(memory.read().await.get(42).unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_aborts_batch() {
        let gateway = Recorder {
            fail_on: Some(1),
            ..Recorder::default()
        };
        let identity = BotIdentity::default();
        let memory = shared();
        let segments = vec![Segment::new("one"), Segment::new("two"), Segment::new("three")];

        let report = Sequencer::new(&gateway, &identity, TypingPace::instant())
            .deliver(42, &segments, &ReplyTargets::default(), &memory)
            .await;

        assert_eq!(report.delivered, vec![101]);
        assert!(matches!(report.aborted, Some(KibitzError::Delivery(_))));
    }
}
