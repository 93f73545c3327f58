//! Chatbot engine - runs one turn per inbound message.
//!
//! A turn moves through `Received -> Filtered` or
//! `Received -> Recorded -> Gated -> (Responding -> Replied) | Skipped`.
//! The incoming message is recorded before generation, so it is part of the
//! history even when generation fails. A reply is recorded only after it was
//! delivered.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::chatbot::commands::Command;
use crate::chatbot::completion::{Completion, GenerationError, GenerationParams};
use crate::chatbot::context::{ContextWindow, build_context, build_history};
use crate::chatbot::database::{Database, Observation};
use crate::chatbot::gate::{self, BotIdentity, GateDecision, GatePolicy};
use crate::chatbot::message::{ChatAdmins, InboundEvent, Message, NewMessage, transcript_line};
use crate::chatbot::settings::{ConfigError, SettingKey, Settings};

/// Lines shown by `/summary`.
const SUMMARY_MESSAGES: usize = 10;

/// Outbound side of the chat platform.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver_text(&self, chat_id: i64, text: &str) -> Result<(), String>;

    async fn chat_admins(&self, chat_id: i64) -> Result<ChatAdmins, String>;
}

/// Chatbot configuration.
#[derive(Debug, Clone)]
pub struct ChatbotConfig {
    pub bot_user_id: i64,
    /// Handle without `@`, used for mentions and command suffixes.
    pub bot_username: String,
    /// Speaker name for the bot's own messages.
    pub bot_name: String,
    /// Messages shorter than this (trimmed, in chars) are ignored.
    pub min_message_chars: usize,
    pub context: ContextWindow,
    /// Tell the chat when the backend is slow or unreachable.
    pub notify_failures: bool,
    pub welcome_new_members: bool,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            bot_user_id: 0,
            bot_username: String::new(),
            bot_name: "SuperAI".to_string(),
            min_message_chars: 3,
            context: ContextWindow::default(),
            notify_failures: false,
            welcome_new_members: true,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// No text, an unknown command, or too short. Nothing was stored.
    Filtered,
    /// Recorded, but no reply was delivered.
    Skipped,
    /// A reply was delivered and recorded.
    Replied,
    /// A command was answered.
    Command,
    /// A new-member event was handled.
    Welcomed,
}

/// The chatbot engine.
pub struct ChatbotEngine {
    config: ChatbotConfig,
    identity: BotIdentity,
    database: Arc<Database>,
    transport: Arc<dyn Transport>,
    completion: Arc<dyn Completion>,
    /// Groups whose admins were already asked for in this process.
    admin_lookups: Mutex<HashSet<i64>>,
}

impl ChatbotEngine {
    pub fn new(
        config: ChatbotConfig,
        database: Arc<Database>,
        transport: Arc<dyn Transport>,
        completion: Arc<dyn Completion>,
    ) -> Self {
        let identity = BotIdentity::new(&config.bot_username);
        Self {
            config,
            identity,
            database,
            transport,
            completion,
            admin_lookups: Mutex::new(HashSet::new()),
        }
    }

    /// Handle one inbound event. Never fails: every error is logged here.
    pub async fn handle_event(&self, event: InboundEvent) -> TurnOutcome {
        if event.is_new_member_event {
            return self.welcome_members(&event).await;
        }

        let text = event.text.as_deref().map(str::trim).unwrap_or("");
        if let Some(command) = Command::parse(text, &self.config.bot_username) {
            self.run_command(&event, command).await;
            return TurnOutcome::Command;
        }

        if !self.passes_filter(event.text.as_deref()) {
            debug!(chat_id = event.chat_id, "Filtered message from {}", event.author_id);
            return TurnOutcome::Filtered;
        }

        info!(
            "📨 {} ({}) in {}: \"{}\"",
            event.author_name,
            event.author_id,
            event.chat_id,
            text.chars().take(50).collect::<String>()
        );

        // Recorded
        self.observe(&event, Observation::Message).await;
        let recorded_id = match self.database.append_message(NewMessage::from_user(
            event.chat_id,
            event.author_id,
            &event.author_name,
            text,
        )) {
            Ok(message) => Some(message.id),
            Err(e) => {
                error!(chat_id = event.chat_id, stage = "record", "Failed to record message: {e}");
                None
            }
        };

        // Gated
        let settings = self.settings(event.chat_id);
        let last_reply = self.last_bot_reply(event.chat_id);
        let decision = gate::decide(text, &self.identity, &GatePolicy::from(&settings), last_reply.as_ref());
        if !decision.responds() {
            debug!(chat_id = event.chat_id, "Gate: no reply");
            return TurnOutcome::Skipped;
        }
        info!(chat_id = event.chat_id, "Gate: replying ({:?})", decision);

        // Responding
        let user_turn = transcript_line(&event.author_name, text);
        // The new turn is sent on its own, so it is kept out of the history.
        let transcript = match build_history(&self.database, event.chat_id, &self.config.context, recorded_id) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(chat_id = event.chat_id, stage = "context", "Building context failed: {e}");
                Vec::new()
            }
        };

        let mut params = GenerationParams::from(&settings);
        if decision == GateDecision::SelfCorrection {
            params.correcting = last_reply.map(|reply| reply.text);
        }
        let reply = match self
            .completion
            .generate_reply(&transcript, &user_turn, event.chat_id, decision.is_mention(), &params)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(chat_id = event.chat_id, stage = "generate", "Completion failed: {e}");
                self.notify_failure(event.chat_id, &e).await;
                return TurnOutcome::Skipped;
            }
        };

        if let Err(e) = self.transport.deliver_text(event.chat_id, &reply).await {
            error!(chat_id = event.chat_id, stage = "deliver", "Failed to deliver reply: {e}");
            return TurnOutcome::Skipped;
        }

        // Replied
        if let Err(e) = self.database.append_message(NewMessage::from_bot(
            event.chat_id,
            self.config.bot_user_id,
            &self.config.bot_name,
            &reply,
        )) {
            error!(chat_id = event.chat_id, stage = "record_reply", "Failed to record reply: {e}");
        }
        info!(chat_id = event.chat_id, "🤖 Replied ({} chars)", reply.chars().count());
        TurnOutcome::Replied
    }

    fn passes_filter(&self, text: Option<&str>) -> bool {
        match text.map(str::trim) {
            None => false,
            Some(t) if t.starts_with('/') => false,
            Some(t) => t.chars().count() >= self.config.min_message_chars,
        }
    }

    /// Upsert the author and, outside private chats, the group.
    async fn observe(&self, event: &InboundEvent, observation: Observation) {
        if let Err(e) = self.database.upsert_user(event.author_id, &event.author_name, observation) {
            warn!(chat_id = event.chat_id, stage = "upsert_user", "Failed to upsert user: {e}");
        }

        if event.chat_type.is_private() {
            return;
        }

        let title = event.chat_title.as_deref().unwrap_or("");
        let group = match self.database.upsert_group(event.chat_id, title, None, None) {
            Ok(group) => group,
            Err(e) => {
                warn!(chat_id = event.chat_id, stage = "upsert_group", "Failed to upsert group: {e}");
                return;
            }
        };

        if group.creator_id.is_some() || !group.admin_ids.is_empty() {
            return;
        }
        // One attempt per group, even when it fails or finds nobody.
        let first_attempt = self
            .admin_lookups
            .lock()
            .map(|mut tried| tried.insert(event.chat_id))
            .unwrap_or(false);
        if !first_attempt {
            return;
        }

        // First sighting: learn who runs the group. No store lock is held here.
        match self.transport.chat_admins(event.chat_id).await {
            Ok(admins) => {
                let stored = self.database.upsert_group(
                    event.chat_id,
                    title,
                    admins.creator_id,
                    Some(admins.admin_ids.as_slice()),
                );
                if let Err(e) = stored {
                    warn!(chat_id = event.chat_id, stage = "upsert_group", "Failed to store admins: {e}");
                } else {
                    info!(
                        chat_id = event.chat_id,
                        "Learned group admins (creator {:?}, {} admin(s))",
                        admins.creator_id,
                        admins.admin_ids.len()
                    );
                }
            }
            Err(e) => warn!(chat_id = event.chat_id, stage = "admins", "Failed to fetch admins: {e}"),
        }
    }

    fn settings(&self, chat_id: i64) -> Settings {
        self.database.get_config().unwrap_or_else(|e| {
            warn!(chat_id, stage = "settings", "Using default settings: {e}");
            Settings::default()
        })
    }

    fn last_bot_reply(&self, chat_id: i64) -> Option<Message> {
        self.database.get_last_bot_reply(chat_id).unwrap_or_else(|e| {
            warn!(chat_id, stage = "gate", "Could not read last reply: {e}");
            None
        })
    }

    async fn notify_failure(&self, chat_id: i64, err: &GenerationError) {
        if !self.config.notify_failures {
            return;
        }
        let notice = match err {
            GenerationError::Timeout(_) => "⏳ I'm taking longer than usual to think. Please try again in a moment.",
            GenerationError::Transport(_) => "⚠️ I'm having trouble reaching my language service right now.",
            GenerationError::MalformedResponse(_) => return,
        };
        self.send(chat_id, notice).await;
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.deliver_text(chat_id, text).await {
            warn!(chat_id, stage = "deliver", "Failed to send message: {e}");
        }
    }

    // ==================== NEW MEMBERS ====================

    async fn welcome_members(&self, event: &InboundEvent) -> TurnOutcome {
        if !event.chat_type.is_private()
            && let Err(e) = self.database.upsert_group(
                event.chat_id,
                event.chat_title.as_deref().unwrap_or(""),
                None,
                None,
            )
        {
            warn!(chat_id = event.chat_id, stage = "upsert_group", "Failed to upsert group: {e}");
        }

        for member in &event.new_members {
            if member.user_id == self.config.bot_user_id {
                info!(chat_id = event.chat_id, "👋 Added to a chat");
                if self.config.welcome_new_members {
                    let intro = format!(
                        "Hello everyone! 🤖 I'm {}, the AI assistant of this group. \
                         I'm here to help with questions and conversation. Glad to be here!",
                        self.config.bot_name
                    );
                    self.send(event.chat_id, &intro).await;
                }
                continue;
            }

            if let Err(e) = self.database.upsert_user(member.user_id, &member.display_name, Observation::Passive) {
                warn!(chat_id = event.chat_id, stage = "upsert_user", "Failed to upsert member: {e}");
            }
            info!(chat_id = event.chat_id, "👋 Member joined: {} ({})", member.display_name, member.user_id);

            if self.config.welcome_new_members {
                let greeting = format!(
                    "Welcome, {}! 👋\nIf you need anything, just call me.",
                    member.display_name
                );
                self.send(event.chat_id, &greeting).await;
            }
        }

        TurnOutcome::Welcomed
    }

    // ==================== COMMANDS ====================

    /// Whether `user_id` administers `chat_id`: a deployment-wide admin, or
    /// the creator or a listed admin of that group.
    fn is_admin(&self, chat_id: i64, user_id: i64) -> bool {
        if self.settings(chat_id).is_admin(user_id) {
            return true;
        }
        match self.database.get_group(chat_id) {
            Ok(Some(group)) => group.is_admin(user_id),
            Ok(None) => false,
            Err(e) => {
                warn!(chat_id, stage = "admin_check", "Could not read group: {e}");
                false
            }
        }
    }

    async fn run_command(&self, event: &InboundEvent, command: Command) {
        let chat_id = event.chat_id;
        info!(chat_id, "Command from {} ({}): {:?}", event.author_name, event.author_id, command);

        let admin_chat = match &command {
            Command::Summary { chat_id: Some(target) } => *target,
            _ => chat_id,
        };
        if command.requires_admin(chat_id) && !self.is_admin(admin_chat, event.author_id) {
            warn!(chat_id, "Denied {:?} for non-admin {}", command, event.author_id);
            self.send(chat_id, "⛔ Only chat admins can do that.").await;
            return;
        }

        let reply = match command {
            Command::Info => format!(
                "🤖 I'm {}, an assistant that helps out in this group!\n\
                 I can answer questions, keep conversations going and help with information.\n\
                 Use /summary to see a summary of the recent conversation.",
                self.config.bot_name
            ),
            Command::Help => help_text(),
            Command::Usage(usage) => usage.to_string(),
            Command::Summary { chat_id: target } => self.summary(target.unwrap_or(chat_id)),
            Command::ConfigGet => format!("⚙️ Current settings:\n\n{}", self.settings(chat_id).render()),
            Command::ConfigSet { key, value } => self.config_set(chat_id, key, value),
            Command::FlagInaccurate => self.flag_last_reply(chat_id),
        };

        self.send(chat_id, &reply).await;
    }

    fn summary(&self, chat_id: i64) -> String {
        let window = ContextWindow {
            max_messages: SUMMARY_MESSAGES,
            ..self.config.context
        };
        match build_context(&self.database, chat_id, &window) {
            Ok(lines) if lines.is_empty() => "📝 No messages recorded yet.".to_string(),
            Ok(lines) => format!("📝 Conversation summary:\n\n{}", lines.join("\n")),
            Err(e) => {
                warn!(chat_id, stage = "summary", "Building summary failed: {e}");
                "⚠️ Couldn't read the conversation history right now.".to_string()
            }
        }
    }

    fn config_set(&self, chat_id: i64, key: String, value: String) -> String {
        match self.database.set_config(&[(key.clone(), value)]) {
            Ok(settings) => {
                let applied = SettingKey::parse(&key).map(|k| settings.value(k)).unwrap_or_default();
                format!("✅ {} = {}", key, applied)
            }
            Err(ConfigError::UnknownKey(keys)) => {
                let known: Vec<&str> = SettingKey::ALL.iter().map(|k| k.as_str()).collect();
                format!("❌ Unknown key: {}\nKnown keys: {}", keys.join(", "), known.join(", "))
            }
            Err(e) => {
                warn!(chat_id, stage = "config_set", "Config update failed: {e}");
                format!("❌ {e}")
            }
        }
    }

    fn flag_last_reply(&self, chat_id: i64) -> String {
        let Some(reply) = self.last_bot_reply(chat_id) else {
            return "There's no reply of mine to flag here.".to_string();
        };
        match self.database.set_reply_accuracy(reply.id, false) {
            Ok(true) => {
                info!(chat_id, "Reply {} flagged inaccurate", reply.id);
                "📌 Noted. I'll revisit my last reply.".to_string()
            }
            Ok(false) => "There's no reply of mine to flag here.".to_string(),
            Err(e) => {
                warn!(chat_id, stage = "flag", "Failed to flag reply: {e}");
                "⚠️ Couldn't update that right now.".to_string()
            }
        }
    }
}

fn help_text() -> String {
    [
        "/info - what this bot is",
        "/summary [chat_id] - recent conversation",
        "/config get - show settings",
        "/config set <key> <value> - change a setting (admins)",
        "/wrong - flag my last reply as inaccurate (admins)",
    ]
    .join("\n")
}
