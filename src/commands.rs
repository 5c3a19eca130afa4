//! Chat commands
//!
//! `/name args`, optionally addressed as `/name@BotUsername`. Commands
//! addressed to another bot, or unknown ones, are ordinary messages.

use crate::config::Config;
use crate::memory::ChatMemory;
use crate::protocol::User;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    /// Clear the chat's history
    Forget,
    /// Show (`None`) or set the chat's model; `default` resets it
    Model(Option<String>),
    /// Show the chat's notes
    Summary,
    OptOut,
    OptIn,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Forget => "forget",
            Command::Model(_) => "model",
            Command::Summary => "summary",
            Command::OptOut => "optout",
            Command::OptIn => "optin",
        }
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(self, Command::Model(_))
    }

    /// Parse a message text, `None` if it is not one of our commands.
    pub fn parse(text: &str, bot_username: &str) -> Option<Command> {
        let rest = text.trim().strip_prefix('/')?;
        let mut parts = rest.splitn(2, char::is_whitespace);
        let head = parts.next()?;
        let args = parts.next().unwrap_or("").trim();

        let name = match head.split_once('@') {
            Some((name, target)) => {
                if !target.eq_ignore_ascii_case(bot_username.trim_start_matches('@')) {
                    return None;
                }
                name
            }
            None => head,
        };

        match name.to_lowercase().as_str() {
            "start" => Some(Command::Start),
            "forget" => Some(Command::Forget),
            "model" => {
                let model = args.split_whitespace().next().map(str::to_string);
                Some(Command::Model(model))
            }
            "summary" => Some(Command::Summary),
            "optout" => Some(Command::OptOut),
            "optin" => Some(Command::OptIn),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())
    }
}

/// Run `command` for `from`. Returns the text to answer with, if any;
/// admin-only commands from anyone else get no answer at all.
pub fn execute(
    command: &Command,
    chat: &mut ChatMemory<'_>,
    from: &User,
    config: &Config,
) -> Option<String> {
    if command.is_admin_only() && !config.is_admin(from.id) {
        return None;
    }

    let reply = match command {
        Command::Start => config.start_message.clone(),
        Command::Forget => {
            chat.clear();
            config.forget_message.clone()
        }
        Command::Model(None) => chat.model().unwrap_or_else(|| config.ai.model.clone()),
        Command::Model(Some(model)) if model == "default" => {
            chat.set_model(None);
            "Model reset".to_string()
        }
        Command::Model(Some(model)) => {
            chat.set_model(Some(model.clone()));
            format!("Model set to {}", model)
        }
        Command::Summary => {
            let notes = &chat.get_chat().notes;
            if notes.is_empty() {
                "No notes yet".to_string()
            } else {
                notes.join("\n\n")
            }
        }
        Command::OptOut => {
            if chat.opt_out(from) {
                "Done, I will not mention you or reply to your messages anymore".to_string()
            } else {
                "You have already opted out".to_string()
            }
        }
        Command::OptIn => {
            if chat.opt_in(from.id) {
                "Welcome back".to_string()
            } else {
                "You have not opted out".to_string()
            }
        }
    };
    Some(reply)
}
