//! Telegram transport using teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ChatMemberKind;
use tracing::{info, warn};

use crate::chatbot::engine::Transport;
use crate::chatbot::message::ChatAdmins;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn deliver_text(&self, chat_id: i64, text: &str) -> Result<(), String> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })
    }

    async fn chat_admins(&self, chat_id: i64) -> Result<ChatAdmins, String> {
        info!("Getting chat administrators: chat={}", chat_id);
        let members = self
            .bot
            .get_chat_administrators(ChatId(chat_id))
            .await
            .map_err(|e| format!("Failed to get chat administrators: {e}"))?;

        let mut admins = ChatAdmins::default();
        for member in members {
            let user_id = member.user.id.0 as i64;
            match member.kind {
                ChatMemberKind::Owner(_) => admins.creator_id = Some(user_id),
                ChatMemberKind::Administrator(_) => admins.admin_ids.push(user_id),
                _ => {}
            }
        }
        Ok(admins)
    }
}
