//! Chatbot module - conversation state and reply gating for Telegram chats.

pub mod commands;
pub mod completion;
pub mod context;
pub mod database;
pub mod engine;
pub mod gate;
pub mod message;
pub mod report;
pub mod settings;
pub mod telegram;


pub use completion::{CompletionClient, CompletionConfig, Persona, RequestPacer};
pub use context::ContextWindow;
pub use database::Database;
pub use engine::{ChatbotConfig, ChatbotEngine};
pub use message::{ChatType, InboundEvent, NewMember};
pub use settings::Settings;
pub use telegram::TelegramClient;
