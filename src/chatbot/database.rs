//! Persistent store for messages, users, groups and settings.
//!
//! Each collection lives in its own SQLite file with its own lock, so the
//! four collections never serialize against each other. Every
//! read-modify-write runs inside one transaction: readers see either the old
//! collection or the new one, never a half-written one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chatbot::message::{Group, Message, NewMessage, User};
use crate::chatbot::settings::{self, ConfigError, SettingKey, Settings};

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The medium could not be reached. Retrying later may succeed.
    #[error("{collection} store unavailable: {reason}")]
    Unavailable { collection: &'static str, reason: String },

    /// The medium was reached but its content is unreadable.
    #[error("{collection} store corrupt: {reason}")]
    Corrupt { collection: &'static str, reason: String },

    /// Shutdown has begun; writes are refused.
    #[error("store is shutting down, {collection} write refused")]
    Closed { collection: &'static str },
}

/// Why a user is being upserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The user sent a message: counts toward `message_count`.
    Message,
    /// The user was seen some other way (joined, looked up).
    Passive,
}

const MESSAGES_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        chat_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        author_name TEXT NOT NULL,
        text TEXT NOT NULL,
        is_bot INTEGER NOT NULL DEFAULT 0,
        accurate INTEGER NOT NULL DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);
"#;

const USERS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY,
        display_name TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0
    );
"#;

const GROUPS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS groups (
        chat_id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        creator_id INTEGER,
        admin_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL
    );
"#;

const SETTINGS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const MESSAGE_COLUMNS: &str = "id, timestamp, chat_id, author_id, author_name, text, is_bot, accurate";

/// One independently locked record collection.
///
/// The connection is opened on first use. A failed open leaves it closed so
/// the next call tries again.
struct Collection {
    name: &'static str,
    path: Option<PathBuf>,
    schema: &'static str,
    conn: Mutex<Option<Connection>>,
}

impl Collection {
    fn new(name: &'static str, path: Option<PathBuf>, schema: &'static str) -> Self {
        Self {
            name,
            path,
            schema,
            conn: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = match &self.path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|e| self.classify(e))?;
        conn.execute_batch(self.schema).map_err(|e| self.classify(e))?;
        debug!("Opened {} collection ({:?})", self.name, self.path);
        Ok(conn)
    }

    /// Run `f` with the lock held for its whole duration.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Unavailable {
            collection: self.name,
            reason: "lock poisoned".to_string(),
        })?;
        let conn = match guard.take() {
            Some(conn) => conn,
            None => self.open()?,
        };
        let conn = guard.insert(conn);
        f(conn).map_err(|e| self.classify(e))
    }

    fn classify(&self, e: rusqlite::Error) -> StoreError {
        let corrupt = match &e {
            rusqlite::Error::SqliteFailure(err, _) => {
                matches!(err.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
            }
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => true,
            _ => false,
        };
        if corrupt {
            StoreError::Corrupt { collection: self.name, reason: e.to_string() }
        } else {
            StoreError::Unavailable { collection: self.name, reason: e.to_string() }
        }
    }
}

/// The persistent store.
pub struct Database {
    messages: Collection,
    users: Collection,
    groups: Collection,
    settings: Collection,
    /// Global cap on retained messages, across all chats.
    max_messages: usize,
    settings_defaults: Settings,
    closed: AtomicBool,
}

impl Database {
    /// A store backed by one SQLite file per collection under `data_dir`.
    ///
    /// Nothing is touched on disk until a collection is first used.
    pub fn open(data_dir: &Path, max_messages: usize) -> Self {
        Self::build(
            |name| Some(data_dir.join(format!("{name}.db"))),
            max_messages,
        )
    }

    /// A store that lives only as long as this value.
    #[cfg(test)]
    pub fn in_memory(max_messages: usize) -> Self {
        Self::build(|_| None, max_messages)
    }

    fn build(path_for: impl Fn(&str) -> Option<PathBuf>, max_messages: usize) -> Self {
        Self {
            messages: Collection::new("messages", path_for("messages"), MESSAGES_SCHEMA),
            users: Collection::new("users", path_for("users"), USERS_SCHEMA),
            groups: Collection::new("groups", path_for("groups"), GROUPS_SCHEMA),
            settings: Collection::new("settings", path_for("settings"), SETTINGS_SCHEMA),
            max_messages: max_messages.max(1),
            settings_defaults: Settings::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Settings written on first use when the settings collection is empty.
    pub fn with_settings_defaults(mut self, defaults: Settings) -> Self {
        self.settings_defaults = defaults;
        self
    }

    /// Begin shutdown. Reads keep working; every later write is refused.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Store closed for writes");
        }
    }

    fn ensure_writable(&self, collection: &'static str) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed { collection })
        } else {
            Ok(())
        }
    }

    // ==================== MESSAGE METHODS ====================

    /// Append a message, then evict the oldest messages beyond the global cap.
    pub fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        self.ensure_writable("messages")?;
        let timestamp = Utc::now();
        let keep = self.max_messages as i64;

        let (id, evicted) = self.messages.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (timestamp, chat_id, author_id, author_name, text, is_bot, accurate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    format_timestamp(&timestamp),
                    msg.chat_id,
                    msg.author_id,
                    msg.author_name,
                    msg.text,
                    msg.is_bot
                ],
            )?;
            let id = tx.last_insert_rowid();
            // Everything at or below the (keep + 1)-th newest id goes.
            let evicted = tx.execute(
                "DELETE FROM messages WHERE id <= (SELECT id FROM messages ORDER BY id DESC LIMIT 1 OFFSET ?1)",
                params![keep],
            )?;
            tx.commit()?;
            Ok((id, evicted))
        })?;

        if evicted > 0 {
            debug!("Evicted {} message(s) over the cap of {}", evicted, self.max_messages);
        }

        Ok(Message {
            id,
            timestamp,
            chat_id: msg.chat_id,
            author_id: msg.author_id,
            author_name: msg.author_name,
            text: msg.text,
            is_bot: msg.is_bot,
            accurate: true,
        })
    }

    /// Messages in chronological order, optionally for one chat and capped to
    /// the `limit` most recent.
    #[allow(dead_code)]
    pub fn get_messages(&self, chat_id: Option<i64>, limit: Option<usize>) -> Result<Vec<Message>, StoreError> {
        self.query_messages(chat_id, true, limit)
    }

    /// The `limit` most recent messages of one chat, oldest first.
    pub fn get_chat_history(
        &self,
        chat_id: i64,
        limit: usize,
        include_bot: bool,
    ) -> Result<Vec<Message>, StoreError> {
        self.query_messages(Some(chat_id), include_bot, Some(limit))
    }

    fn query_messages(
        &self,
        chat_id: Option<i64>,
        include_bot: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut messages = self.messages.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (?1 IS NULL OR chat_id = ?1) AND (?2 OR is_bot = 0)
                 ORDER BY id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![chat_id, include_bot, limit], message_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        messages.reverse();
        Ok(messages)
    }

    /// The most recent bot-authored message in a chat.
    pub fn get_last_bot_reply(&self, chat_id: i64) -> Result<Option<Message>, StoreError> {
        self.messages.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ?1 AND is_bot = 1 ORDER BY id DESC LIMIT 1"
                ),
                params![chat_id],
                message_from_row,
            )
            .optional()
        })
    }

    /// Flag a bot reply as accurate or not. Returns false when no bot reply
    /// with that id is retained.
    pub fn set_reply_accuracy(&self, message_id: i64, accurate: bool) -> Result<bool, StoreError> {
        self.ensure_writable("messages")?;
        let updated = self.messages.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET accurate = ?2 WHERE id = ?1 AND is_bot = 1",
                params![message_id, accurate],
            )
        })?;
        Ok(updated > 0)
    }

    pub fn count_messages_per_chat(&self) -> Result<BTreeMap<i64, usize>, StoreError> {
        self.messages.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT chat_id, COUNT(*) FROM messages GROUP BY chat_id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
            })?;
            rows.collect()
        })
    }

    pub fn message_count(&self) -> Result<usize, StoreError> {
        self.messages.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }

    // ==================== USER METHODS ====================

    /// Create or refresh a user record.
    ///
    /// Every call refreshes the display name and `last_seen`; only
    /// `Observation::Message` increments `message_count`.
    pub fn upsert_user(
        &self,
        user_id: i64,
        display_name: &str,
        observation: Observation,
    ) -> Result<User, StoreError> {
        self.ensure_writable("users")?;
        let now = format_timestamp(&Utc::now());
        let increment: i64 = match observation {
            Observation::Message => 1,
            Observation::Passive => 0,
        };

        self.users.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (user_id, display_name, first_seen, last_seen, message_count)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    last_seen = excluded.last_seen,
                    message_count = message_count + excluded.message_count",
                params![user_id, display_name, now, increment],
            )?;
            let user = select_user(&tx, user_id)?;
            tx.commit()?;
            Ok(user)
        })
    }

    #[allow(dead_code)]
    pub fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        self.users.with_conn(|conn| {
            let tx = conn.transaction()?;
            select_user(&tx, user_id).optional()
        })
    }

    // ==================== GROUP METHODS ====================

    /// Create or refresh a group record.
    ///
    /// Title and `last_activity` are always refreshed. A supplied creator is
    /// recorded; a supplied admin list replaces the stored one wholesale.
    pub fn upsert_group(
        &self,
        chat_id: i64,
        title: &str,
        creator_id: Option<i64>,
        admins: Option<&[i64]>,
    ) -> Result<Group, StoreError> {
        self.ensure_writable("groups")?;
        let now = format_timestamp(&Utc::now());

        self.groups.with_conn(|conn| {
            let admins_json = admins.map(encode_admins).transpose()?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (chat_id, title, creator_id, admin_ids, created_at, last_activity)
                 VALUES (?1, ?2, ?3, COALESCE(?4, '[]'), ?5, ?5)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    title = excluded.title,
                    creator_id = COALESCE(?3, creator_id),
                    admin_ids = COALESCE(?4, admin_ids),
                    last_activity = excluded.last_activity",
                params![chat_id, title, creator_id, admins_json, now],
            )?;
            let group = select_group(&tx, chat_id)?;
            tx.commit()?;
            Ok(group)
        })
    }

    pub fn get_group(&self, chat_id: i64) -> Result<Option<Group>, StoreError> {
        self.groups.with_conn(|conn| {
            let tx = conn.transaction()?;
            select_group(&tx, chat_id).optional()
        })
    }

    // ==================== SETTINGS METHODS ====================

    /// Current settings. An empty collection is initialized with the defaults.
    pub fn get_config(&self) -> Result<Settings, StoreError> {
        let writable = !self.closed.load(Ordering::SeqCst);
        let defaults = &self.settings_defaults;

        self.settings.with_conn(|conn| {
            let tx = conn.transaction()?;
            let rows = load_setting_rows(&tx)?;
            if rows.is_empty() {
                if writable {
                    write_settings(&tx, defaults)?;
                    tx.commit()?;
                    info!("Initialized settings with defaults");
                }
                return Ok(defaults.clone());
            }
            Settings::from_rows(defaults, &rows).map_err(corrupt_value)
        })
    }

    /// Apply a partial update, last writer wins.
    ///
    /// Keys and values are validated before the store is touched; an unknown
    /// key rejects the whole update.
    pub fn set_config(&self, changes: &[(String, String)]) -> Result<Settings, ConfigError> {
        let values = settings::parse_changes(changes)?;
        self.ensure_writable("settings")?;
        let defaults = &self.settings_defaults;

        let updated = self.settings.with_conn(|conn| {
            let tx = conn.transaction()?;
            let rows = load_setting_rows(&tx)?;
            let mut current = Settings::from_rows(defaults, &rows).map_err(corrupt_value)?;
            for value in values {
                current.set(value);
            }
            write_settings(&tx, &current)?;
            tx.commit()?;
            Ok(current)
        })?;

        let keys: Vec<&str> = changes.iter().map(|(k, _)| k.trim()).collect();
        info!("Settings updated: {}", keys.join(", "));
        Ok(updated)
    }
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_failure(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn corrupt_value(e: ConfigError) -> rusqlite::Error {
    conversion_failure(1, e)
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        timestamp: timestamp_at(row, 1)?,
        chat_id: row.get(2)?,
        author_id: row.get(3)?,
        author_name: row.get(4)?,
        text: row.get(5)?,
        is_bot: row.get(6)?,
        accurate: row.get(7)?,
    })
}

fn select_user(tx: &Transaction<'_>, user_id: i64) -> rusqlite::Result<User> {
    tx.query_row(
        "SELECT user_id, display_name, first_seen, last_seen, message_count FROM users WHERE user_id = ?1",
        params![user_id],
        |row| {
            Ok(User {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                first_seen: timestamp_at(row, 2)?,
                last_seen: timestamp_at(row, 3)?,
                message_count: row.get::<_, i64>(4)? as u64,
            })
        },
    )
}

fn select_group(tx: &Transaction<'_>, chat_id: i64) -> rusqlite::Result<Group> {
    tx.query_row(
        "SELECT chat_id, title, creator_id, admin_ids, created_at, last_activity FROM groups WHERE chat_id = ?1",
        params![chat_id],
        |row| {
            let admins: String = row.get(3)?;
            let admin_ids: Vec<i64> = serde_json::from_str(&admins).map_err(|e| conversion_failure(3, e))?;
            Ok(Group {
                chat_id: row.get(0)?,
                title: row.get(1)?,
                creator_id: row.get(2)?,
                admin_ids,
                created_at: timestamp_at(row, 4)?,
                last_activity: timestamp_at(row, 5)?,
            })
        },
    )
}

/// JSON array of ids, first occurrence order, duplicates dropped.
fn encode_admins(ids: &[i64]) -> rusqlite::Result<String> {
    let mut unique: Vec<i64> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(*id);
        }
    }
    serde_json::to_string(&unique).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn load_setting_rows(tx: &Transaction<'_>) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = tx.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn write_settings(tx: &Transaction<'_>, settings: &Settings) -> rusqlite::Result<()> {
    for (key, value) in settings.entries() {
        tx.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_str(), value],
        )?;
    }
    let known: Vec<&str> = SettingKey::ALL.iter().map(|k| k.as_str()).collect();
    let mut stmt = tx.prepare("SELECT key FROM settings")?;
    let stored = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for key in stored {
        if !known.contains(&key.as_str()) {
            warn!("Dropping retired setting '{}'", key);
            tx.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        }
    }
    Ok(())
}
