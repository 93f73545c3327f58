//! Plain-text activity report over the store's aggregate queries.

use crate::chatbot::context::{ContextWindow, build_context};
use crate::chatbot::database::Database;

/// Markdown report: message count and latest lines for every chat.
pub fn render(db: &Database, bot_name: &str, lines_per_chat: usize, max_chars: usize) -> String {
    let counts = match db.count_messages_per_chat() {
        Ok(counts) => counts,
        Err(e) => return format!("⚠️ Failed to build report: {e}"),
    };
    if counts.is_empty() {
        return "No messages recorded yet.".to_string();
    }

    let window = ContextWindow {
        max_messages: lines_per_chat,
        max_chars,
        include_bot_replies: true,
    };

    let stored = db.message_count().unwrap_or_else(|_| counts.values().sum());
    let mut report = vec![format!("# 📊 {bot_name} activity report")];
    report.push(format!("\n**Stored messages:** {stored} across {} chat(s)", counts.len()));
    for (chat_id, count) in counts {
        let recent = match build_context(db, chat_id, &window) {
            Ok(lines) => lines.iter().map(|l| format!("  {l}")).collect::<Vec<_>>().join("\n"),
            Err(e) => format!("  (unavailable: {e})"),
        };
        report.push(format!(
            "\n## 💬 Chat {chat_id}\n- **Messages:** {count}\n- **Latest:**\n{recent}"
        ));
    }
    report.join("\n")
}
