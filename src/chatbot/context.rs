//! Context builder: the bounded transcript sent along with each request.
//!
//! The budget is spent newest-first, so when it is tight the oldest lines
//! are the ones dropped.

use crate::chatbot::database::{Database, StoreError};

/// Limits on the transcript for one chat.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    pub max_messages: usize,
    /// Budget for the summed length, in chars, of all returned lines.
    pub max_chars: usize,
    pub include_bot_replies: bool,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            max_messages: 15,
            max_chars: 2000,
            include_bot_replies: false,
        }
    }
}

/// `speaker: text` lines for a chat, oldest first, within `window`.
pub fn build_context(db: &Database, chat_id: i64, window: &ContextWindow) -> Result<Vec<String>, StoreError> {
    build_history(db, chat_id, window, None)
}

/// Like `build_context`, but the message `exclude_id` is left out before the
/// window is applied, so it costs neither a message slot nor budget.
pub fn build_history(
    db: &Database,
    chat_id: i64,
    window: &ContextWindow,
    exclude_id: Option<i64>,
) -> Result<Vec<String>, StoreError> {
    let fetch = window.max_messages + usize::from(exclude_id.is_some());
    let history = db.get_chat_history(chat_id, fetch, window.include_bot_replies)?;

    let mut lines: Vec<String> = history
        .iter()
        .filter(|m| Some(m.id) != exclude_id)
        .map(|m| m.transcript_line())
        .collect();
    let excess = lines.len().saturating_sub(window.max_messages);
    lines.drain(..excess);

    Ok(fit_to_budget(lines, window.max_chars))
}

/// Keep the longest suffix of `lines` whose total char count fits `max_chars`.
pub fn fit_to_budget(lines: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut used = 0;
    let mut kept = Vec::new();

    for line in lines.into_iter().rev() {
        let len = line.chars().count();
        if used + len > max_chars {
            break;
        }
        used += len;
        kept.push(line);
    }

    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::message::NewMessage;

    fn total_chars(lines: &[String]) -> usize {
        lines.iter().map(|l| l.chars().count()).sum()
    }

    #[test]
    fn test_fit_keeps_newest() {
        let lines: Vec<String> = ["aaaa", "bbbb", "cccc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(fit_to_budget(lines.clone(), 8), vec!["bbbb", "cccc"]);
        assert_eq!(fit_to_budget(lines.clone(), 12), lines);
        assert!(fit_to_budget(lines, 3).is_empty());
    }

    #[test]
    fn test_fit_stops_at_first_overflow() {
        // A short old line must not sneak in after a long one was dropped.
        let lines: Vec<String> = ["a", "long line here", "bb"].iter().map(|s| s.to_string()).collect();
        assert_eq!(fit_to_budget(lines, 5), vec!["bb"]);
    }

    #[test]
    fn test_fit_counts_chars_not_bytes() {
        let lines = vec!["ação".to_string(), "pão".to_string()];
        assert_eq!(fit_to_budget(lines, 7), vec!["ação", "pão"]);
    }

    #[test]
    fn test_budget_sized_for_last_three() {
        let db = Database::in_memory(1000);
        for i in 0..50 {
            db.append_message(NewMessage::from_user(-1, 10, "ana", &format!("message number {i:02}")))
                .unwrap();
        }
        // "ana: message number NN" is 22 chars.
        let window = ContextWindow {
            max_messages: 50,
            max_chars: 22 * 3 + 10,
            include_bot_replies: false,
        };
        let context = build_context(&db, -1, &window).unwrap();
        assert_eq!(
            context,
            vec![
                "ana: message number 47",
                "ana: message number 48",
                "ana: message number 49",
            ]
        );
        assert!(total_chars(&context) <= window.max_chars);
    }

    #[test]
    fn test_only_this_chat_and_message_cap() {
        let db = Database::in_memory(1000);
        for i in 0..10 {
            db.append_message(NewMessage::from_user(-1, 10, "ana", &format!("here {i}"))).unwrap();
            db.append_message(NewMessage::from_user(-2, 11, "bob", &format!("there {i}"))).unwrap();
        }
        let window = ContextWindow {
            max_messages: 4,
            max_chars: 10_000,
            include_bot_replies: false,
        };
        let context = build_context(&db, -2, &window).unwrap();
        assert_eq!(context, vec!["bob: there 6", "bob: there 7", "bob: there 8", "bob: there 9"]);
    }

    #[test]
    fn test_bot_replies_follow_window_policy() {
        let db = Database::in_memory(1000);
        db.append_message(NewMessage::from_user(-1, 10, "ana", "oi")).unwrap();
        db.append_message(NewMessage::from_bot(-1, 99, "SuperAI", "olá!")).unwrap();

        let mut window = ContextWindow::default();
        assert_eq!(build_context(&db, -1, &window).unwrap(), vec!["ana: oi"]);

        window.include_bot_replies = true;
        assert_eq!(build_context(&db, -1, &window).unwrap(), vec!["ana: oi", "SuperAI: olá!"]);
    }

    #[test]
    fn test_excluded_message_costs_no_budget() {
        let db = Database::in_memory(1000);
        db.append_message(NewMessage::from_user(-1, 11, "bob", "contexto importante aqui")).unwrap();
        let long = "x".repeat(1990);
        let newest = db.append_message(NewMessage::from_user(-1, 10, "ana", &long)).unwrap();

        let window = ContextWindow::default();
        assert_eq!(build_context(&db, -1, &window).unwrap(), vec![format!("ana: {long}")]);
        assert_eq!(
            build_history(&db, -1, &window, Some(newest.id)).unwrap(),
            vec!["bob: contexto importante aqui"]
        );
    }

    #[test]
    fn test_excluded_message_frees_a_slot() {
        let db = Database::in_memory(1000);
        for i in 0..5 {
            db.append_message(NewMessage::from_user(-1, 10, "ana", &format!("msg {i}"))).unwrap();
        }
        let newest = db.append_message(NewMessage::from_user(-1, 10, "ana", "msg 5")).unwrap();
        let window = ContextWindow {
            max_messages: 3,
            ..ContextWindow::default()
        };
        assert_eq!(
            build_history(&db, -1, &window, Some(newest.id)).unwrap(),
            vec!["ana: msg 2", "ana: msg 3", "ana: msg 4"]
        );
    }

    #[test]
    fn test_empty_chat() {
        let db = Database::in_memory(10);
        assert!(build_context(&db, 5, &ContextWindow::default()).unwrap().is_empty());
    }
}
