//! Response gate: whether an incoming message gets a generated reply.
//!
//! Pure and total. Every input is passed in, nothing is read from the store or
//! the network, and every combination of inputs yields a decision.

use crate::chatbot::message::Message;
use crate::chatbot::settings::{ResponseStrategy, Settings};

/// Smart mode answers questions of at least this many words.
pub const MIN_QUESTION_WORDS: usize = 3;

/// Who the bot is, for mention detection.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    /// Handle without the leading `@`.
    pub handle: String,
}

impl BotIdentity {
    pub fn new(handle: &str) -> Self {
        Self {
            handle: handle.trim_start_matches('@').to_string(),
        }
    }

    /// Case-insensitive substring match. An empty handle never matches.
    pub fn is_mentioned_in(&self, text: &str) -> bool {
        !self.handle.is_empty() && text.to_lowercase().contains(&self.handle.to_lowercase())
    }
}

/// The slice of settings the gate consults.
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy<'a> {
    pub strategy: ResponseStrategy,
    pub trigger_keywords: &'a [String],
}

impl<'a> From<&'a Settings> for GatePolicy<'a> {
    fn from(settings: &'a Settings) -> Self {
        Self {
            strategy: settings.response_strategy,
            trigger_keywords: &settings.trigger_keywords,
        }
    }
}

/// Which rule decided, first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Mention,
    Always,
    Question,
    Keyword,
    SelfCorrection,
    Skip,
}

impl GateDecision {
    pub fn responds(self) -> bool {
        !matches!(self, GateDecision::Skip)
    }

    pub fn is_mention(self) -> bool {
        matches!(self, GateDecision::Mention)
    }
}

pub fn decide(
    text: &str,
    bot: &BotIdentity,
    policy: &GatePolicy<'_>,
    last_bot_reply: Option<&Message>,
) -> GateDecision {
    if bot.is_mentioned_in(text) {
        return GateDecision::Mention;
    }

    match policy.strategy {
        ResponseStrategy::MentionOnly => GateDecision::Skip,
        ResponseStrategy::Always => GateDecision::Always,
        ResponseStrategy::Smart => {
            if text.contains('?') && text.split_whitespace().count() >= MIN_QUESTION_WORDS {
                return GateDecision::Question;
            }

            let lowered = text.to_lowercase();
            let keyword_hit = policy
                .trigger_keywords
                .iter()
                .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()));
            if keyword_hit {
                return GateDecision::Keyword;
            }

            // Nothing in the normal flow flags a reply inaccurate; `/wrong` does.
            if last_bot_reply.is_some_and(|reply| !reply.accurate) {
                return GateDecision::SelfCorrection;
            }

            GateDecision::Skip
        }
    }
}

#[allow(dead_code)]
pub fn should_respond(
    text: &str,
    bot: &BotIdentity,
    policy: &GatePolicy<'_>,
    last_bot_reply: Option<&Message>,
) -> bool {
    decide(text, bot, policy, last_bot_reply).responds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bot() -> BotIdentity {
        BotIdentity::new("@SuperAi148_bot")
    }

    fn policy(strategy: ResponseStrategy, keywords: &[String]) -> GatePolicy<'_> {
        GatePolicy {
            strategy,
            trigger_keywords: keywords,
        }
    }

    fn bot_reply(accurate: bool) -> Message {
        Message {
            id: 1,
            timestamp: Utc::now(),
            chat_id: -1,
            author_id: 999,
            author_name: "SuperAI".to_string(),
            text: "Rust was released in 2015.".to_string(),
            is_bot: true,
            accurate,
        }
    }

    #[test]
    fn test_mention_wins_under_every_strategy() {
        for strategy in [ResponseStrategy::Smart, ResponseStrategy::Always, ResponseStrategy::MentionOnly] {
            let decision = decide("hey @superai148_BOT", &bot(), &policy(strategy, &[]), None);
            assert_eq!(decision, GateDecision::Mention, "strategy {strategy}");
        }
    }

    #[test]
    fn test_mention_only_ignores_questions() {
        let p = policy(ResponseStrategy::MentionOnly, &[]);
        assert!(!should_respond("what time is the meetup today?", &bot(), &p, None));
        assert!(!should_respond("hello", &bot(), &p, Some(&bot_reply(false))));
    }

    #[test]
    fn test_always_responds() {
        let p = policy(ResponseStrategy::Always, &[]);
        assert_eq!(decide("ok cool", &bot(), &p, None), GateDecision::Always);
    }

    #[test]
    fn test_smart_question_needs_enough_words() {
        let p = policy(ResponseStrategy::Smart, &[]);
        assert_eq!(decide("Como isso funciona?", &bot(), &p, None), GateDecision::Question);
        assert_eq!(decide("sério?", &bot(), &p, None), GateDecision::Skip);
        assert_eq!(decide("isso funciona mesmo", &bot(), &p, None), GateDecision::Skip);
    }

    #[test]
    fn test_smart_trigger_keywords() {
        let keywords = vec!["borrow checker".to_string(), "tokio".to_string()];
        let p = policy(ResponseStrategy::Smart, &keywords);
        assert_eq!(decide("I love the Borrow Checker", &bot(), &p, None), GateDecision::Keyword);
        assert_eq!(decide("Tokio rocks", &bot(), &p, None), GateDecision::Keyword);
        assert_eq!(decide("async-std rocks", &bot(), &p, None), GateDecision::Skip);
    }

    #[test]
    fn test_empty_keyword_never_matches() {
        let keywords = vec![String::new()];
        let p = policy(ResponseStrategy::Smart, &keywords);
        assert!(!should_respond("anything at all", &bot(), &p, None));
    }

    #[test]
    fn test_smart_self_correction() {
        let p = policy(ResponseStrategy::Smart, &[]);
        assert_eq!(
            decide("no it wasn't", &bot(), &p, Some(&bot_reply(false))),
            GateDecision::SelfCorrection
        );
        assert_eq!(decide("no it wasn't", &bot(), &p, Some(&bot_reply(true))), GateDecision::Skip);
    }

    #[test]
    fn test_empty_handle_is_never_mentioned() {
        let anonymous = BotIdentity::new("");
        assert!(!anonymous.is_mentioned_in("anything"));
    }

    #[test]
    fn test_deterministic() {
        let keywords = vec!["rust".to_string()];
        let p = policy(ResponseStrategy::Smart, &keywords);
        let reply = bot_reply(false);
        let inputs = ["rust?", "hello there friend?", "@SuperAi148_bot hi", "meh", ""];
        for text in inputs {
            let first = decide(text, &bot(), &p, Some(&reply));
            for _ in 0..3 {
                assert_eq!(decide(text, &bot(), &p, Some(&reply)), first);
            }
        }
    }

    #[test]
    fn test_policy_from_settings() {
        let mut settings = Settings::default();
        settings.trigger_keywords = vec!["ferris".to_string()];
        let p = GatePolicy::from(&settings);
        assert_eq!(p.strategy, ResponseStrategy::Smart);
        assert!(should_respond("where is ferris", &bot(), &p, None));
    }
}
