use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::chatbot::completion::{DEFAULT_API_URL, DEFAULT_MODEL, DEFAULT_TIMEOUT};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// OpenRouter (or any OpenAI-compatible) API key
    #[serde(default)]
    openrouter_api_key: String,
    api_url: Option<String>,
    model: Option<String>,
    #[serde(default = "default_bot_name")]
    bot_name: String,
    /// Replaces the default "You are <bot_name>" description.
    personality: Option<String>,
    /// Directory for the store files and logs. Defaults to current directory.
    data_dir: Option<String>,
    /// Seeds the runtime admin allowlist the first time settings are created.
    #[serde(default)]
    admin_ids: Vec<i64>,
    #[serde(default = "default_max_messages_stored")]
    max_messages_stored: usize,
    #[serde(default = "default_max_history_messages")]
    max_history_messages: usize,
    #[serde(default = "default_max_context_chars")]
    max_context_chars: usize,
    #[serde(default = "default_min_message_chars")]
    min_message_chars: usize,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_min_request_interval_ms")]
    min_request_interval_ms: u64,
    #[serde(default)]
    include_bot_replies_in_context: bool,
    #[serde(default)]
    notify_failures: bool,
    #[serde(default = "default_true")]
    welcome_new_members: bool,
}

fn default_bot_name() -> String {
    "SuperAI".to_string()
}

fn default_max_messages_stored() -> usize {
    1000
}

fn default_max_history_messages() -> usize {
    15
}

fn default_max_context_chars() -> usize {
    2000
}

fn default_min_message_chars() -> usize {
    3
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_min_request_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openrouter_api_key: String,
    pub api_url: String,
    pub model: String,
    /// Speaker name for the bot's own messages and the persona.
    pub bot_name: String,
    pub personality: Option<String>,
    /// Directory for the store files and logs.
    pub data_dir: PathBuf,
    pub admin_ids: Vec<i64>,
    /// Global cap on stored messages, across all chats.
    pub max_messages_stored: usize,
    pub max_history_messages: usize,
    pub max_context_chars: usize,
    pub min_message_chars: usize,
    pub request_timeout: Duration,
    /// Minimum spacing between two outbound completion requests.
    pub min_request_interval: Duration,
    pub include_bot_replies_in_context: bool,
    pub notify_failures: bool,
    pub welcome_new_members: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| LoadError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| LoadError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.telegram_bot_token.is_empty() {
            return Err(LoadError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(LoadError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if file.openrouter_api_key.trim().is_empty() {
            return Err(LoadError::Validation("openrouter_api_key is required".into()));
        }
        if file.bot_name.trim().is_empty() {
            return Err(LoadError::Validation("bot_name must not be empty".into()));
        }
        if file.max_messages_stored == 0 {
            return Err(LoadError::Validation("max_messages_stored must be at least 1".into()));
        }
        if file.request_timeout_secs == 0 {
            return Err(LoadError::Validation("request_timeout_secs must be at least 1".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openrouter_api_key: file.openrouter_api_key,
            api_url: file.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: file.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            bot_name: file.bot_name.trim().to_string(),
            personality: file.personality.filter(|p| !p.trim().is_empty()),
            data_dir,
            admin_ids: file.admin_ids,
            max_messages_stored: file.max_messages_stored,
            max_history_messages: file.max_history_messages,
            max_context_chars: file.max_context_chars,
            min_message_chars: file.min_message_chars,
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            min_request_interval: Duration::from_millis(file.min_request_interval_ms),
            include_bot_replies_in_context: file.include_bot_replies_in_context,
            notify_failures: file.notify_failures,
            welcome_new_members: file.welcome_new_members,
        })
    }
}
