//! Runtime settings: the single configuration record admins edit from chat.
//!
//! Every value has one canonical text form. That form is what `/config get`
//! prints, what `/config set` accepts and what the store persists.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::chatbot::database::StoreError;

/// How eagerly the bot joins conversations it was not addressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStrategy {
    /// Questions, trigger keywords and self-correction.
    Smart,
    /// Every message that passes the filter.
    Always,
    /// Only explicit mentions.
    MentionOnly,
}

impl ResponseStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStrategy::Smart => "smart",
            ResponseStrategy::Always => "always",
            ResponseStrategy::MentionOnly => "mention-only",
        }
    }
}

impl fmt::Display for ResponseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smart" => Ok(ResponseStrategy::Smart),
            "always" | "active" => Ok(ResponseStrategy::Always),
            "mention" | "mention-only" | "mention_only" => Ok(ResponseStrategy::MentionOnly),
            other => Err(format!("'{other}' is not one of smart, always, mention-only")),
        }
    }
}

/// The recognized setting keys. Anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    ResponseStrategy,
    Language,
    AdminIds,
    Temperature,
    MaxTokens,
    TriggerKeywords,
}

impl SettingKey {
    pub const ALL: [SettingKey; 6] = [
        SettingKey::ResponseStrategy,
        SettingKey::Language,
        SettingKey::AdminIds,
        SettingKey::Temperature,
        SettingKey::MaxTokens,
        SettingKey::TriggerKeywords,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::ResponseStrategy => "response_strategy",
            SettingKey::Language => "language",
            SettingKey::AdminIds => "admin_ids",
            SettingKey::Temperature => "temperature",
            SettingKey::MaxTokens => "max_tokens",
            SettingKey::TriggerKeywords => "trigger_keywords",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

/// Errors from reading or changing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config key(s): {}", .0.join(", "))]
    UnknownKey(Vec<String>),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A parsed, validated value for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    ResponseStrategy(ResponseStrategy),
    Language(String),
    AdminIds(Vec<i64>),
    Temperature(f32),
    MaxTokens(u32),
    TriggerKeywords(Vec<String>),
}

const MAX_TOKENS_LIMIT: u32 = 4096;

impl SettingValue {
    pub fn parse(key: SettingKey, raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue { key: key.as_str(), reason };
        let raw = raw.trim();

        match key {
            SettingKey::ResponseStrategy => raw
                .parse()
                .map(SettingValue::ResponseStrategy)
                .map_err(invalid),
            SettingKey::Language => {
                let valid = !raw.is_empty()
                    && raw.len() <= 16
                    && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
                if valid {
                    Ok(SettingValue::Language(raw.to_lowercase()))
                } else {
                    Err(invalid(format!("'{raw}' is not a language tag")))
                }
            }
            SettingKey::AdminIds => {
                let mut ids = Vec::new();
                for part in split_list(raw) {
                    let id = part
                        .parse::<i64>()
                        .map_err(|_| invalid(format!("'{part}' is not a user id")))?;
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Ok(SettingValue::AdminIds(ids))
            }
            SettingKey::Temperature => {
                let value = raw
                    .parse::<f32>()
                    .map_err(|_| invalid(format!("'{raw}' is not a number")))?;
                if value.is_finite() && (0.0..=2.0).contains(&value) {
                    Ok(SettingValue::Temperature(value))
                } else {
                    Err(invalid("must be between 0.0 and 2.0".to_string()))
                }
            }
            SettingKey::MaxTokens => {
                let value = raw
                    .parse::<u32>()
                    .map_err(|_| invalid(format!("'{raw}' is not a positive integer")))?;
                if (1..=MAX_TOKENS_LIMIT).contains(&value) {
                    Ok(SettingValue::MaxTokens(value))
                } else {
                    Err(invalid(format!("must be between 1 and {MAX_TOKENS_LIMIT}")))
                }
            }
            SettingKey::TriggerKeywords => {
                let mut keywords: Vec<String> = Vec::new();
                for part in split_list(raw) {
                    let keyword = part.to_lowercase();
                    if !keywords.contains(&keyword) {
                        keywords.push(keyword);
                    }
                }
                Ok(SettingValue::TriggerKeywords(keywords))
            }
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// The runtime settings record.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub response_strategy: ResponseStrategy,
    pub language: String,
    /// Deployment-wide admins, on top of each group's own admins.
    pub admin_ids: Vec<i64>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub trigger_keywords: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            response_strategy: ResponseStrategy::Smart,
            language: "pt-br".to_string(),
            admin_ids: Vec::new(),
            temperature: 0.7,
            max_tokens: 300,
            trigger_keywords: Vec::new(),
        }
    }
}

impl Settings {
    /// Defaults with a seeded admin allowlist.
    pub fn with_admins(admin_ids: Vec<i64>) -> Self {
        Self {
            admin_ids,
            ..Self::default()
        }
    }

    pub fn set(&mut self, value: SettingValue) {
        match value {
            SettingValue::ResponseStrategy(v) => self.response_strategy = v,
            SettingValue::Language(v) => self.language = v,
            SettingValue::AdminIds(v) => self.admin_ids = v,
            SettingValue::Temperature(v) => self.temperature = v,
            SettingValue::MaxTokens(v) => self.max_tokens = v,
            SettingValue::TriggerKeywords(v) => self.trigger_keywords = v,
        }
    }

    /// Canonical text form of one value.
    pub fn value(&self, key: SettingKey) -> String {
        match key {
            SettingKey::ResponseStrategy => self.response_strategy.to_string(),
            SettingKey::Language => self.language.clone(),
            SettingKey::AdminIds => self
                .admin_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
            SettingKey::Temperature => self.temperature.to_string(),
            SettingKey::MaxTokens => self.max_tokens.to_string(),
            SettingKey::TriggerKeywords => self.trigger_keywords.join(","),
        }
    }

    pub fn entries(&self) -> Vec<(SettingKey, String)> {
        SettingKey::ALL.into_iter().map(|k| (k, self.value(k))).collect()
    }

    /// One `key = value` line per setting.
    pub fn render(&self) -> String {
        self.entries()
            .into_iter()
            .map(|(k, v)| format!("{} = {}", k.as_str(), v))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    /// Rebuild settings from persisted rows on top of `defaults`.
    ///
    /// Rows with keys we no longer recognize are skipped; a recognized key
    /// with an unparseable value is an error.
    pub fn from_rows(defaults: &Settings, rows: &[(String, String)]) -> Result<Settings, ConfigError> {
        let mut settings = defaults.clone();
        for (key, raw) in rows {
            if let Some(key) = SettingKey::parse(key) {
                settings.set(SettingValue::parse(key, raw)?);
            }
        }
        Ok(settings)
    }
}

/// Validate a partial update.
///
/// All keys are checked before any value, so one error names every unknown
/// key at once.
pub fn parse_changes(changes: &[(String, String)]) -> Result<Vec<SettingValue>, ConfigError> {
    let unknown: Vec<String> = changes
        .iter()
        .filter(|(key, _)| SettingKey::parse(key).is_none())
        .map(|(key, _)| key.trim().to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(ConfigError::UnknownKey(unknown));
    }

    changes
        .iter()
        .filter_map(|(key, raw)| SettingKey::parse(key).map(|k| (k, raw)))
        .map(|(key, raw)| SettingValue::parse(key, raw))
        .collect()
}
