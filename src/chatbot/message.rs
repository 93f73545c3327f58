//! Conversation records and the inbound events they are built from.

use chrono::{DateTime, Utc};

/// A recorded chat message.
///
/// `id` is the store's sequence number: ids grow in creation order and are
/// never reused, so sorting by id is sorting chronologically.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub chat_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub text: String,
    pub is_bot: bool,
    /// Only bot replies are ever flagged inaccurate.
    pub accurate: bool,
}

impl Message {
    /// Format as a `speaker: text` transcript line.
    pub fn transcript_line(&self) -> String {
        transcript_line(&self.author_name, &self.text)
    }
}

/// `speaker: text` with the text folded onto a single line.
pub fn transcript_line(speaker: &str, text: &str) -> String {
    let folded = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{speaker}: {folded}")
}

/// A message about to be appended. The store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub text: String,
    pub is_bot: bool,
}

impl NewMessage {
    pub fn from_user(chat_id: i64, author_id: i64, author_name: &str, text: &str) -> Self {
        Self {
            chat_id,
            author_id,
            author_name: author_name.to_string(),
            text: text.to_string(),
            is_bot: false,
        }
    }

    pub fn from_bot(chat_id: i64, bot_id: i64, bot_name: &str, text: &str) -> Self {
        Self {
            chat_id,
            author_id: bot_id,
            author_name: bot_name.to_string(),
            text: text.to_string(),
            is_bot: true,
        }
    }
}

/// A user seen in any chat.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub user_id: i64,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
}

/// A non-private chat.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub chat_id: i64,
    pub title: String,
    pub creator_id: Option<i64>,
    /// Ordered, without duplicates.
    pub admin_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Group {
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.creator_id == Some(user_id) || self.admin_ids.contains(&user_id)
    }
}

/// Administrators of a chat as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatAdmins {
    pub creator_id: Option<i64>,
    pub admin_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    pub fn is_private(self) -> bool {
        matches!(self, ChatType::Private)
    }
}

/// A member who just joined a chat.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub user_id: i64,
    pub display_name: String,
}

/// Everything the transport tells us about one incoming update.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: i64,
    pub chat_type: ChatType,
    pub chat_title: Option<String>,
    pub author_id: i64,
    pub author_name: String,
    pub text: Option<String>,
    pub is_new_member_event: bool,
    pub new_members: Vec<NewMember>,
}

impl InboundEvent {
    /// A plain text message.
    #[cfg(test)]
    pub fn text(chat_id: i64, chat_type: ChatType, author_id: i64, author_name: &str, text: &str) -> Self {
        Self {
            chat_id,
            chat_type,
            chat_title: None,
            author_id,
            author_name: author_name.to_string(),
            text: Some(text.to_string()),
            is_new_member_event: false,
            new_members: Vec::new(),
        }
    }
}
