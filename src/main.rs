mod chatbot;
mod config;

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chatbot::{
    ChatType, ChatbotConfig, ChatbotEngine, CompletionClient, CompletionConfig, ContextWindow, Database,
    InboundEvent, NewMember, Persona, RequestPacer, Settings, TelegramClient,
};
use config::Config;

/// Context lines per chat in the activity report.
const REPORT_LINES_PER_CHAT: usize = 5;

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "chatgate.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if args.next().as_deref() == Some("report") {
        let database = Database::open(&config.data_dir, config.max_messages_stored);
        println!(
            "{}",
            chatbot::report::render(&database, &config.bot_name, REPORT_LINES_PER_CHAT, config.max_context_chars)
        );
        return;
    }

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("chatgate.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting chatgate...");
    info!("Loaded config from {config_path}");

    let bot = Bot::new(&config.telegram_bot_token);

    // Get bot info
    let (bot_user_id, bot_username) = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            (me.id.0 as i64, me.username().to_string())
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            (0, String::new())
        }
    };

    let database = Arc::new(
        Database::open(&config.data_dir, config.max_messages_stored)
            .with_settings_defaults(Settings::with_admins(config.admin_ids.clone())),
    );

    let pacer = Arc::new(RequestPacer::new(config.min_request_interval));
    let completion = Arc::new(CompletionClient::new(
        CompletionConfig {
            api_url: config.api_url.clone(),
            api_key: config.openrouter_api_key.clone(),
            model: config.model.clone(),
            timeout: config.request_timeout,
        },
        Persona {
            bot_name: config.bot_name.clone(),
            personality: config.personality.clone(),
        },
        pacer,
    ));

    let chatbot_config = ChatbotConfig {
        bot_user_id,
        bot_username,
        bot_name: config.bot_name.clone(),
        min_message_chars: config.min_message_chars,
        context: ContextWindow {
            max_messages: config.max_history_messages,
            max_chars: config.max_context_chars,
            include_bot_replies: config.include_bot_replies_in_context,
        },
        notify_failures: config.notify_failures,
        welcome_new_members: config.welcome_new_members,
    };

    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    let engine = Arc::new(ChatbotEngine::new(chatbot_config, database.clone(), telegram, completion));

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_new_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    database.close();
    info!("👋 Stopped");
}

async fn handle_new_message(msg: Message, engine: Arc<ChatbotEngine>) -> ResponseResult<()> {
    let Some(event) = telegram_to_inbound_event(&msg) else {
        return Ok(());
    };
    engine.handle_event(event).await;
    Ok(())
}

/// Messages without a sender (channel posts) are dropped.
fn telegram_to_inbound_event(msg: &Message) -> Option<InboundEvent> {
    let user = msg.from.as_ref()?;

    let chat_type = if msg.chat.is_private() {
        ChatType::Private
    } else if msg.chat.is_supergroup() {
        ChatType::Supergroup
    } else if msg.chat.is_group() {
        ChatType::Group
    } else {
        ChatType::Channel
    };

    let new_members: Vec<NewMember> = msg
        .new_chat_members()
        .unwrap_or_default()
        .iter()
        .map(|member| NewMember {
            user_id: member.id.0 as i64,
            display_name: display_name(&member.full_name()),
        })
        .collect();

    Some(InboundEvent {
        chat_id: msg.chat.id.0,
        chat_type,
        chat_title: msg.chat.title().map(str::to_string),
        author_id: user.id.0 as i64,
        author_name: display_name(&user.full_name()),
        text: msg.text().map(str::to_string),
        is_new_member_event: !new_members.is_empty(),
        new_members,
    })
}

fn display_name(full_name: &str) -> String {
    match full_name.trim() {
        "" => "User".to_string(),
        name => name.to_string(),
    }
}
