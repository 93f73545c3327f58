//! Chat commands.

/// A command addressed to this bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Info,
    Help,
    /// Recent transcript of this chat, or of another chat for admins.
    Summary { chat_id: Option<i64> },
    ConfigGet,
    ConfigSet { key: String, value: String },
    /// Flag the chat's last bot reply as inaccurate.
    FlagInaccurate,
    /// Right command, wrong arguments.
    Usage(&'static str),
}

pub const SUMMARY_USAGE: &str = "Usage: /summary [chat_id]";
pub const CONFIG_USAGE: &str = "Usage: /config get | /config set <key> <value>";

impl Command {
    /// Parse `text` as a command for the bot with handle `bot_handle`.
    ///
    /// Returns `None` for plain text, for commands we don't know, and for
    /// commands addressed to another bot (`/info@otherbot`).
    pub fn parse(text: &str, bot_handle: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };

        let name = match head.split_once('@') {
            Some((name, target)) => {
                if !target.eq_ignore_ascii_case(bot_handle.trim_start_matches('@')) {
                    return None;
                }
                name
            }
            None => head,
        };

        let command = match name.to_lowercase().as_str() {
            "info" => Command::Info,
            "help" | "start" => Command::Help,
            "summary" | "resumo" => match args {
                "" => Command::Summary { chat_id: None },
                id => match id.parse::<i64>() {
                    Ok(chat_id) => Command::Summary { chat_id: Some(chat_id) },
                    Err(_) => Command::Usage(SUMMARY_USAGE),
                },
            },
            "config" => parse_config(args),
            "wrong" => Command::FlagInaccurate,
            _ => return None,
        };
        Some(command)
    }

    /// Whether only admins may run this.
    pub fn requires_admin(&self, current_chat: i64) -> bool {
        match self {
            Command::ConfigSet { .. } | Command::FlagInaccurate => true,
            Command::Summary { chat_id: Some(id) } => *id != current_chat,
            _ => false,
        }
    }
}

fn parse_config(args: &str) -> Command {
    let (sub, rest) = match args.split_once(char::is_whitespace) {
        Some((sub, rest)) => (sub, rest.trim()),
        None => (args, ""),
    };

    match sub.to_lowercase().as_str() {
        "get" => Command::ConfigGet,
        "set" => {
            let (key, value) = match rest.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (rest, ""),
            };
            if key.is_empty() {
                Command::Usage(CONFIG_USAGE)
            } else {
                Command::ConfigSet {
                    key: key.to_string(),
                    value: value.to_string(),
                }
            }
        }
        _ => Command::Usage(CONFIG_USAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "SuperAi148_bot";

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(Command::parse("hello /info", BOT), None);
        assert_eq!(Command::parse("", BOT), None);
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(Command::parse("/info", BOT), Some(Command::Info));
        assert_eq!(Command::parse("/HELP", BOT), Some(Command::Help));
        assert_eq!(Command::parse("/wrong", BOT), Some(Command::FlagInaccurate));
        assert_eq!(Command::parse("/dance", BOT), None);
    }

    #[test]
    fn test_bot_suffix() {
        assert_eq!(Command::parse("/info@superai148_bot", BOT), Some(Command::Info));
        assert_eq!(Command::parse("/info@other_bot", BOT), None);
    }

    #[test]
    fn test_summary() {
        assert_eq!(Command::parse("/resumo", BOT), Some(Command::Summary { chat_id: None }));
        assert_eq!(
            Command::parse("/summary -1001234", BOT),
            Some(Command::Summary { chat_id: Some(-1001234) })
        );
        assert_eq!(Command::parse("/summary here", BOT), Some(Command::Usage(SUMMARY_USAGE)));
    }

    #[test]
    fn test_config() {
        assert_eq!(Command::parse("/config get", BOT), Some(Command::ConfigGet));
        assert_eq!(
            Command::parse("/config set trigger_keywords rust, tokio", BOT),
            Some(Command::ConfigSet {
                key: "trigger_keywords".to_string(),
                value: "rust, tokio".to_string(),
            })
        );
        assert_eq!(
            Command::parse("/config set admin_ids", BOT),
            Some(Command::ConfigSet {
                key: "admin_ids".to_string(),
                value: String::new(),
            })
        );
        assert_eq!(Command::parse("/config set", BOT), Some(Command::Usage(CONFIG_USAGE)));
        assert_eq!(Command::parse("/config", BOT), Some(Command::Usage(CONFIG_USAGE)));
    }

    #[test]
    fn test_admin_requirements() {
        assert!(Command::ConfigSet { key: "a".into(), value: "b".into() }.requires_admin(1));
        assert!(Command::FlagInaccurate.requires_admin(1));
        assert!(!Command::ConfigGet.requires_admin(1));
        assert!(!Command::Summary { chat_id: None }.requires_admin(1));
        assert!(!Command::Summary { chat_id: Some(1) }.requires_admin(1));
        assert!(Command::Summary { chat_id: Some(2) }.requires_admin(1));
    }
}
