//! Completion pipeline: prompt assembly, one request to an OpenAI-compatible
//! chat completions endpoint (OpenRouter by default), and reply sanitation.
//!
//! No retries happen here. Each call makes at most one request; whether to
//! try again is the caller's decision.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chatbot::settings::Settings;

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick:free";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sanitized replies are cut to this many chars.
pub const MAX_REPLY_CHARS: usize = 500;

/// Why a completion produced no reply.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The backend did not answer in time. Worth trying later.
    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),

    /// Connectivity failure or a non-2xx status.
    #[error("completion transport error: {0}")]
    Transport(String),

    /// The backend answered, but not with a usable completion.
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
}

/// Per-request generation parameters, taken from the runtime settings.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub language: String,
    /// A reply of ours that was flagged inaccurate and should be corrected.
    pub correcting: Option<String>,
}

impl From<&Settings> for GenerationParams {
    fn from(settings: &Settings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            language: settings.language.clone(),
            correcting: None,
        }
    }
}

/// Anything that can turn a transcript and a new turn into a reply.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn generate_reply(
        &self,
        transcript: &[String],
        user_turn: &str,
        chat_id: i64,
        is_direct_mention: bool,
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;
}

/// Who the bot says it is.
#[derive(Debug, Clone)]
pub struct Persona {
    pub bot_name: String,
    /// Replaces the default identity line when set.
    pub personality: Option<String>,
}

/// Spacing between outbound requests, shared by the whole process.
///
/// Created once at startup with no recorded request, read and advanced only
/// by `CompletionClient` right before each call. The lock is never held
/// across the request itself.
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Reserve the next request slot and sleep until it arrives.
    pub async fn wait_turn(&self) {
        let delay = {
            let Ok(mut last) = self.last_request.lock() else {
                return;
            };
            let now = Instant::now();
            let slot = match *last {
                Some(prev) => (prev + self.min_interval).max(now),
                None => now,
            };
            *last = Some(slot);
            slot - now
        };

        if !delay.is_zero() {
            debug!("Pacing completion request by {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Endpoint and credentials.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct CompletionClient {
    http: reqwest::Client,
    config: CompletionConfig,
    persona: Persona,
    pacer: Arc<RequestPacer>,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig, persona: Persona, pacer: Arc<RequestPacer>) -> Self {
        info!("Completion backend: {} ({})", config.model, config.api_url);
        Self {
            http: reqwest::Client::new(),
            config,
            persona,
            pacer,
        }
    }

    fn request_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_timeout() {
            GenerationError::Timeout(self.config.timeout)
        } else {
            GenerationError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl Completion for CompletionClient {
    async fn generate_reply(
        &self,
        transcript: &[String],
        user_turn: &str,
        chat_id: i64,
        is_direct_mention: bool,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        self.pacer.wait_turn().await;

        let request = ApiRequest {
            model: &self.config.model,
            messages: build_messages(&self.persona, transcript, user_turn, is_direct_mention, params),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        debug!("Requesting completion for chat {} ({} context lines)", chat_id, transcript.len());

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .header("HTTP-Referer", format!("https://telegram-chat-{chat_id}"))
            .timeout(self.config.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(GenerationError::Transport(format!("HTTP {status}: {preview}")));
        }

        let body = response.text().await.map_err(|e| self.request_error(e))?;
        let content = extract_content(&body)?;
        let reply = sanitize_reply(&content);
        if reply.is_empty() {
            warn!("Completion for chat {} was empty after sanitizing", chat_id);
            return Err(GenerationError::MalformedResponse("empty completion".to_string()));
        }
        Ok(reply)
    }
}

/// System instruction plus one user turn carrying transcript and new message.
fn build_messages(
    persona: &Persona,
    transcript: &[String],
    user_turn: &str,
    is_direct_mention: bool,
    params: &GenerationParams,
) -> Vec<ApiMessage> {
    vec![
        ApiMessage {
            role: "system",
            content: system_instruction(persona, is_direct_mention, &params.language, params.correcting.as_deref()),
        },
        ApiMessage {
            role: "user",
            content: user_content(transcript, user_turn),
        },
    ]
}

fn system_instruction(
    persona: &Persona,
    is_direct_mention: bool,
    language: &str,
    correcting: Option<&str>,
) -> String {
    let identity = match &persona.personality {
        Some(personality) => personality.clone(),
        None => format!(
            "You are {}, an AI assistant taking part in a Telegram chat.",
            persona.bot_name
        ),
    };

    let mut prompt = format!(
        "{identity}\n\nFollow these rules:\n\
         1. Answer right away when someone mentions you with @\n\
         2. Keep replies nobody asked you for short (1-2 sentences)\n\
         3. Politely correct wrong information\n\
         4. Use a casual but informative tone\n\
         5. Stay consistent with the conversation so far\n\
         6. Use emojis when appropriate\n\
         7. If you don't know something, say you don't have that information\n\
         8. For complex questions, ask for details\n\n\
         Reply in the language with tag '{language}'."
    );

    if is_direct_mention {
        prompt.push_str("\n\nThe user mentioned you directly. Give a complete, direct answer to the request.");
    }
    if let Some(flagged) = correcting {
        prompt.push_str(&format!(
            "\n\nYour previous reply in this chat was flagged as inaccurate:\n\"{flagged}\"\n\
             Start with \"🔍 Correction:\", say briefly what was wrong, then give the correct information."
        ));
    }
    prompt
}

fn user_content(transcript: &[String], user_turn: &str) -> String {
    if transcript.is_empty() {
        format!("New message:\n{user_turn}")
    } else {
        format!(
            "Recent conversation:\n{}\n\nNew message:\n{user_turn}",
            transcript.join("\n")
        )
    }
}

fn extract_content(body: &str) -> Result<String, GenerationError> {
    let parsed: ApiResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let choice = parsed
        .choices
        .and_then(|choices| choices.into_iter().next())
        .ok_or_else(|| GenerationError::MalformedResponse("no choices in response".to_string()))?;

    choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| GenerationError::MalformedResponse("choice has no message content".to_string()))
}

static EDGE_QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^["'“]|["'”]$"#).expect("edge quote pattern is valid"));

/// Clean a raw completion for delivery.
///
/// Trims, drops one quote char at each end, folds all whitespace runs into
/// single spaces, ends the text with `.` unless it already ends in `.`, `!`
/// or `?`, and cuts it to `MAX_REPLY_CHARS`.
pub fn sanitize_reply(raw: &str) -> String {
    let unquoted = EDGE_QUOTES.replace_all(raw.trim(), "");
    let mut text = unquoted.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(last) = text.chars().last()
        && !matches!(last, '.' | '!' | '?')
    {
        text.push('.');
    }

    text.chars().take(MAX_REPLY_CHARS).collect()
}
