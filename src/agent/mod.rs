//! Chat agent
//!
//! One inbound message is one turn: record it, run commands, decide
//! whether to answer, ask the model, and deliver what it says.

pub mod notes;
pub mod provider;
pub mod responder;
pub mod sequencer;

pub use provider::{ChatCompletionsClient, GenerationRequest, LanguageModel};
pub use responder::{ModelReply, ReplyCleaner, Segment};
pub use sequencer::{SequenceReport, Sequencer, TypingPace};

use crate::commands::{self, Command};
use crate::config::Config;
use crate::gateway::{BotIdentity, MessagingGateway};
use crate::memory::{
    ChatMemory, ChatMessage, Context, ContextBuilder, HistoryCompactor, ReplyTo, Sender,
    SharedMemory,
};
use crate::protocol::{extract_text, IncomingMessage, ReplyMessage, User};
use crate::rules::{Chance, Decision, DecisionEngine, Signals, ThreadChance};
use crate::{KibitzError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// Decided not to answer
    Silent(Decision),
    /// Handled as a command
    Command(Command),
    Replied {
        decision: Decision,
        delivered: Vec<i64>,
    },
    /// The model or the gateway let us down
    Failed {
        decision: Decision,
        delivered: Vec<i64>,
        fallback_sent: bool,
    },
}

/// Why `ChatAgent::serve` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Input ran out and every started turn finished
    InputClosed,
    /// `shutdown` fired; unfinished turns were dropped
    Interrupted,
}

pub struct ChatAgent {
    config: Arc<Config>,
    memory: SharedMemory,
    gateway: Arc<dyn MessagingGateway>,
    model: Arc<dyn LanguageModel>,
    identity: BotIdentity,
    engine: DecisionEngine,
    cleaner: ReplyCleaner,
    pace: TypingPace,
    chance: Mutex<Box<dyn Chance>>,
}

impl ChatAgent {
    pub async fn new(
        config: Arc<Config>,
        memory: SharedMemory,
        gateway: Arc<dyn MessagingGateway>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let identity = gateway.me().await?;
        let engine = DecisionEngine::new(&config, &identity.username)?;
        let cleaner = ReplyCleaner::new(&identity.first_name, &identity.username)?;
        let pace = TypingPace::from_config(&config.typing);

        info!(
            "Agent ready as {} (@{}), id {}",
            identity.first_name, identity.username, identity.id
        );

        Ok(Self {
            config,
            memory,
            gateway,
            model,
            identity,
            engine,
            cleaner,
            pace,
            chance: Mutex::new(Box::new(ThreadChance)),
        })
    }

    /// Replace the source of probability draws
    pub fn with_chance(mut self, chance: impl Chance + 'static) -> Self {
        self.chance = Mutex::new(Box::new(chance));
        self
    }

    pub fn with_pace(mut self, pace: TypingPace) -> Self {
        self.pace = pace;
        self
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Run one concurrent turn per message from `rx` until the input ends
    /// or `shutdown` completes.
    ///
    /// At end of input the turns still in flight are awaited, so their
    /// replies and fallbacks go out before the caller saves and exits.
    pub async fn serve(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<IncomingMessage>,
        shutdown: impl Future<Output = ()>,
    ) -> StopReason {
        tokio::pin!(shutdown);
        let mut turns = JoinSet::new();

        let reason = loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        break StopReason::InputClosed;
                    };
                    let agent = self.clone();
                    turns.spawn(async move { agent.handle(message).await });
                }
                Some(finished) = turns.join_next(), if !turns.is_empty() => {
                    log_turn(finished);
                }
                _ = &mut shutdown => break StopReason::Interrupted,
            }
        };

        if reason == StopReason::InputClosed && !turns.is_empty() {
            info!("No more input, finishing {} turns", turns.len());
            loop {
                tokio::select! {
                    finished = turns.join_next() => match finished {
                        Some(finished) => log_turn(finished),
                        None => break,
                    },
                    _ = &mut shutdown => {
                        info!("Interrupted while finishing turns");
                        break;
                    }
                }
            }
        }
        turns.shutdown().await;
        reason
    }

    /// Handle one inbound message from start to finish.
    ///
    /// Never fails: every error is contained in the turn and reflected in
    /// the outcome.
    pub async fn handle(&self, message: IncomingMessage) -> TurnOutcome {
        let chat_id = message.chat.id;
        let text = extract_text(&message.content);

        let (aliases, random_reply_probability) = self.record(&message, text.as_deref()).await;

        if let Some(command) = message
            .content
            .text
            .as_deref()
            .and_then(|t| Command::parse(t, &self.identity.username))
        {
            self.run_command(&message, command.clone()).await;
            return TurnOutcome::Command(command);
        }

        let signals = Signals {
            text: text.as_deref(),
            private_chat: message.chat.kind.is_private(),
            reply_to_me: message
                .reply_to_message
                .as_ref()
                .and_then(|r| r.from.as_ref())
                .is_some_and(|from| from.id == self.identity.id),
            via_me: message
                .via_bot
                .as_ref()
                .is_some_and(|bot| bot.id == self.identity.id),
            forwarded_from_me: message
                .content
                .forward_origin
                .as_ref()
                .and_then(|origin| origin.user_id())
                == Some(self.identity.id),
            aliases: &aliases,
            random_reply_probability,
        };
        let decision = {
            let mut chance = self.chance.lock().unwrap_or_else(|e| e.into_inner());
            self.engine.decide(&signals, &mut **chance)
        };

        if decision.refreshes_last_use() {
            let mut memory = self.memory.write().await;
            ChatMemory::new(&mut memory, chat_id).touch();
        }

        if !decision.should_reply() {
            debug!("Chat {}: staying silent ({})", chat_id, decision.stage);
            return TurnOutcome::Silent(decision);
        }
        info!(
            "Chat {}: replying because of {}{}",
            chat_id,
            decision.stage,
            if decision.is_ambient() { " (ambient)" } else { "" }
        );

        self.reply(&message, decision).await
    }

    /// Append the message to history and refresh the roster.
    /// Returns the persona aliases and the chat's own reply rate.
    async fn record(
        &self,
        message: &IncomingMessage,
        text: Option<&str>,
    ) -> (Vec<String>, Option<f64>) {
        let mut memory = self.memory.write().await;
        let mut chat = ChatMemory::new(&mut memory, message.chat.id);

        chat.set_info(message.chat.display_title(), message.chat.kind);
        if let Some(text) = text {
            chat.add_message(ChatMessage {
                id: message.message_id,
                text: text.to_string(),
                sender: self.sender_of(&message.from),
                reply_to: message
                    .reply_to_message
                    .as_ref()
                    .and_then(|r| self.reply_snapshot(r)),
                is_myself: false,
                date: message.date,
                media_group_id: message.media_group_id.clone(),
            });
            chat.remove_old_messages(self.config.history_max_length);
        }
        chat.update_user(&message.from);

        let state = chat.get_chat();
        let aliases = state
            .character
            .as_ref()
            .map(|c| c.names.clone())
            .unwrap_or_default();
        (aliases, state.random_reply_probability)
    }

    fn sender_of(&self, user: &User) -> Sender {
        Sender {
            id: user.id,
            name: user.first_name.clone(),
            username: user.username.clone(),
            myself: user.id == self.identity.id,
        }
    }

    fn reply_snapshot(&self, reply: &ReplyMessage) -> Option<ReplyTo> {
        let from = reply.from.as_ref()?;
        Some(ReplyTo {
            id: reply.message_id,
            text: extract_text(&reply.content).unwrap_or_default(),
            sender: self.sender_of(from),
            is_myself: from.id == self.identity.id,
        })
    }

    async fn run_command(&self, message: &IncomingMessage, command: Command) {
        let reply = {
            let mut memory = self.memory.write().await;
            let mut chat = ChatMemory::new(&mut memory, message.chat.id);
            commands::execute(&command, &mut chat, &message.from, &self.config)
        };
        info!("Chat {}: command {}", message.chat.id, command);

        if let Some(reply) = reply {
            let reply_to = self.thread_to(message).await;
            if let Err(e) = self
                .gateway
                .send_text(message.chat.id, &reply, reply_to)
                .await
            {
                error!("Could not answer {} in chat {}: {}", command, message.chat.id, e);
            }
        }
    }

    /// Prompt for the chat's next answer and the model to send it to
    pub async fn build_context(&self, chat_id: i64) -> (Context, String) {
        let mut memory = self.memory.write().await;
        let mut chat = ChatMemory::new(&mut memory, chat_id);
        let members =
            chat.active_members(self.config.ai.active_members_days, self.config.ai.active_members_limit);

        let state = chat.get_chat();
        let model = state
            .chat_model
            .clone()
            .unwrap_or_else(|| self.config.ai.model.clone());
        let compactor = HistoryCompactor::new(self.config.compact_limits(state.messages_to_pass));
        let context = ContextBuilder::new(state, compactor)
            .with_prompt(&self.config.ai.prompt)
            .with_final_prompt(&self.config.ai.final_prompt)
            .with_members(members)
            .build();
        (context, model)
    }

    async fn reply(&self, message: &IncomingMessage, decision: Decision) -> TurnOutcome {
        let chat_id = message.chat.id;
        let (context, model) = self.build_context(chat_id).await;
        debug!(
            "Chat {}: prompt of {} blocks, {} bytes, {} transcript lines",
            chat_id,
            context.blocks.len(),
            context.total_bytes(),
            context.transcript.lines()
        );

        let request = GenerationRequest::from_config(&self.config, model, context.blocks.clone());
        let started = Instant::now();
        let segments = match self.model.generate(&request).await {
            Ok(reply) => self.clean(reply.into_segments()),
            Err(e) => {
                warn!("Chat {}: could not get response: {}", chat_id, e);
                return self.fail(message, decision, Vec::new()).await;
            }
        };
        info!(
            "Chat {}: time to get response {:.2}s for {:?}",
            chat_id,
            started.elapsed().as_secs_f64(),
            message.chat.display_title().unwrap_or_default()
        );

        if segments.is_empty() {
            warn!("Chat {}: model answered with no messages", chat_id);
            return self.fail(message, decision, Vec::new()).await;
        }

        let report = Sequencer::new(self.gateway.as_ref(), &self.identity, self.pace)
            .deliver(chat_id, &segments, &context.targets, &self.memory)
            .await;

        match report.aborted {
            None => {
                self.refresh_notes(chat_id).await;
                TurnOutcome::Replied {
                    decision,
                    delivered: report.delivered,
                }
            }
            Some(KibitzError::ModelOutput(reason)) => {
                warn!("Chat {}: malformed model output: {}", chat_id, reason);
                if report.delivered.is_empty() {
                    return self.fail(message, decision, report.delivered).await;
                }
                self.refresh_notes(chat_id).await;
                TurnOutcome::Failed {
                    decision,
                    delivered: report.delivered,
                    fallback_sent: false,
                }
            }
            Some(e) => {
                error!("Chat {}: could not reply: {}", chat_id, e);
                self.fail(message, decision, report.delivered).await
            }
        }
    }

    fn clean(&self, segments: Vec<Segment>) -> Vec<Segment> {
        segments
            .into_iter()
            .map(|segment| Segment {
                text: self.cleaner.clean(&segment.text),
                reply_to: segment.reply_to,
            })
            .collect()
    }

    /// Send one filler reply, unless the turn was ambient
    async fn fail(
        &self,
        message: &IncomingMessage,
        decision: Decision,
        delivered: Vec<i64>,
    ) -> TurnOutcome {
        let fallback_sent = if decision.is_ambient() {
            debug!("Chat {}: ambient turn failed silently", message.chat.id);
            false
        } else {
            self.send_fallback(message).await
        };
        TurnOutcome::Failed {
            decision,
            delivered,
            fallback_sent,
        }
    }

    async fn send_fallback(&self, message: &IncomingMessage) -> bool {
        let Some(text) = self.config.random_fallback() else {
            return false;
        };
        let reply_to = self.thread_to(message).await;
        match self
            .gateway
            .send_text(message.chat.id, text, reply_to)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Chat {}: could not send fallback: {}", message.chat.id, e);
                false
            }
        }
    }

    /// Our answers thread to the triggering message, unless its sender
    /// opted out of being targeted
    async fn thread_to(&self, message: &IncomingMessage) -> Option<i64> {
        let memory = self.memory.read().await;
        let opted_out = memory
            .get(message.chat.id)
            .is_some_and(|chat| chat.is_opted_out(message.from.id));
        (!opted_out).then_some(message.message_id)
    }

    async fn refresh_notes(&self, chat_id: i64) {
        if let Err(e) =
            notes::refresh_notes(&self.config, &self.memory, self.model.as_ref(), chat_id).await
        {
            warn!("Chat {}: could not update notes: {}", chat_id, e);
        }
    }
}

fn log_turn(finished: std::result::Result<TurnOutcome, JoinError>) {
    match finished {
        Ok(outcome) => debug!("Turn finished: {:?}", outcome),
        Err(e) => error!("Turn task failed: {}", e),
    }
}
