//! Messaging gateway: where messages come from and replies go to

use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::{KibitzError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// The bot's own account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotIdentity {
    pub id: i64,
    pub first_name: String,
    /// Handle without the leading `@`
    pub username: String,
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self {
            id: 1,
            first_name: "Kibitz".to_string(),
            username: "KibitzBot".to_string(),
        }
    }
}

/// Receipt for a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub id: i64,
    pub date: i64,
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn me(&self) -> Result<BotIdentity>;

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<SentMessage>;

    /// Show a "typing" indicator; it expires on its own
    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}

/// First id handed to our own messages. Inbound `message_id`s must stay
/// below it so history ids never collide within a chat.
pub const OUTGOING_ID_BASE: i64 = 1 << 40;

/// JSON-lines gateway: one `IncomingMessage` per input line, one
/// `OutgoingMessage` per output line.
pub struct ConsoleGateway {
    identity: BotIdentity,
    next_id: AtomicI64,
    output: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ConsoleGateway {
    /// Gateway writing replies to stdout
    pub fn new(identity: BotIdentity) -> Self {
        Self::with_writer(identity, tokio::io::stdout())
    }

    pub fn with_writer(identity: BotIdentity, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            identity,
            next_id: AtomicI64::new(OUTGOING_ID_BASE),
            output: Mutex::new(Box::new(writer)),
        }
    }

    /// Forward every parseable line of `reader` into `tx` until EOF or the
    /// receiver goes away. Malformed lines are logged and skipped.
    pub async fn read_messages<R>(reader: R, tx: mpsc::Sender<IncomingMessage>)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Error reading input: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IncomingMessage>(&line) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Skipping malformed input line: {}", e),
            }
        }
        info!("Input closed");
    }

    /// Spawn the stdin reader
    pub fn spawn_stdin_reader(tx: mpsc::Sender<IncomingMessage>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Self::read_messages(tokio::io::stdin(), tx))
    }
}

#[async_trait]
impl MessagingGateway for ConsoleGateway {
    async fn me(&self) -> Result<BotIdentity> {
        Ok(self.identity.clone())
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<SentMessage> {
        let sent = SentMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            date: Utc::now().timestamp(),
        };
        let outgoing = OutgoingMessage {
            chat_id,
            message_id: sent.id,
            reply_to_message_id: reply_to,
            text: text.to_string(),
            date: sent.date,
        };

        let mut line = serde_json::to_string(&outgoing)?;
        line.push('\n');

        let mut output = self.output.lock().await;
        output
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KibitzError::Delivery(e.to_string()))?;
        output
            .flush()
            .await
            .map_err(|e| KibitzError::Delivery(e.to_string()))?;

        debug!("Sent message {} to chat {}", sent.id, chat_id);
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_writes_json_lines_with_increasing_ids() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let gateway = ConsoleGateway::with_writer(BotIdentity::default(), writer);

        let first = gateway.send_text(42, "hi", None).await.unwrap();
        let second = gateway.send_text(42, "again", Some(first.id)).await.unwrap();
        assert_eq!(first.id, OUTGOING_ID_BASE);
        assert_eq!(second.id, first.id + 1);
        drop(gateway);

        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        let lines: Vec<OutgoingMessage> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "hi");
        assert_eq!(lines[0].reply_to_message_id, None);
        assert_eq!(lines[1].reply_to_message_id, Some(first.id));
    }

    #[tokio::test]
    async fn test_read_messages_skips_malformed_lines() {
        let input = concat!(
            r#"{"message_id": 1, "chat": {"id": 42, "type": "group"}, "from": {"id": 7, "first_name": "Ann"}, "text": "hello"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"message_id": 2, "chat": {"id": 42, "type": "group"}, "from": {"id": 7, "first_name": "Ann"}, "text": "again"}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        ConsoleGateway::read_messages(input.as_bytes(), tx).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.content.text.as_deref(), Some("hello"));
        assert_eq!(second.message_id, 2);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_me_returns_identity() {
        let identity = BotIdentity {
            id: 9,
            first_name: "Bot".to_string(),
            username: "BotName".to_string(),
        };
        let gateway = ConsoleGateway::with_writer(identity.clone(), tokio::io::sink());
        assert_eq!(gateway.me().await.unwrap(), identity);
    }
}
