use crate::business::ServedSnapshot;
use crate::config::{ContextConfig, TenantConfig};
use crate::error::{ChatError, ChatResult};
use crate::model::{LanguageCode, Role, Session, TenantKey, Turn};
use serde::Serialize;
use serde_json::Value;

/// Business data as supplied to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BusinessContext {
    pub payload: Value,
    pub stale: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Per-turn flags decided by the orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TurnFlags {
    pub first_contact: bool,
    /// Live business data could not be obtained for this turn.
    pub data_unavailable: bool,
}

/// Everything the generation function receives for one turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub tenant: TenantKey,
    pub language: LanguageCode,
    pub system: String,
    pub history: Vec<ChatMessage>,
    pub business: Option<BusinessContext>,
    pub first_contact: bool,
    pub data_unavailable: bool,
    pub user_message: String,
}

impl GenerationRequest {
    /// Renders the request as an ordered chat transcript: system framing
    /// (with business data), trimmed history, then the new message.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut system = self.system.clone();
        if let Some(business) = &self.business {
            if business.stale {
                system.push_str(
                    "\n\n[STALE BUSINESS DATA] The data below could not be refreshed and may be outdated. \
                     Hedge prices and opening hours and suggest confirming with the salon.",
                );
            }
            system.push_str("\n\nBusiness data:\n");
            system.push_str(&business.payload.to_string());
        }
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", system));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::new(Role::User.as_str(), self.user_message.clone()));
        messages
    }
}

/// Collapses whitespace runs and trims.
pub fn normalize_message(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        tenant: &TenantConfig,
        session: &Session,
        language: &LanguageCode,
        business: Option<&ServedSnapshot>,
        new_message: &str,
        flags: TurnFlags,
    ) -> ChatResult<GenerationRequest> {
        let user_message = normalize_message(new_message);
        if user_message.is_empty() {
            return Err(ChatError::InvalidInput("message is empty".into()));
        }
        let message_chars = user_message.chars().count();
        if self.config.max_message_chars > 0 && message_chars > self.config.max_message_chars {
            return Err(ChatError::InvalidInput(format!(
                "message has {message_chars} characters, limit is {}",
                self.config.max_message_chars
            )));
        }

        let history = self.trim_history(session.turns.iter(), message_chars);
        let business = match (business, flags.data_unavailable) {
            (Some(served), false) => Some(BusinessContext {
                payload: served.snapshot.payload.clone(),
                stale: served.stale,
            }),
            _ => None,
        };

        Ok(GenerationRequest {
            tenant: tenant.key.clone(),
            language: language.clone(),
            system: self.system_framing(tenant, language, flags),
            history,
            business,
            first_contact: flags.first_contact,
            data_unavailable: flags.data_unavailable,
            user_message,
        })
    }

    /// Keeps the newest turns that fit both the turn count and the character
    /// budget left after the new message.
    fn trim_history<'a>(
        &self,
        turns: impl DoubleEndedIterator<Item = &'a Turn>,
        message_chars: usize,
    ) -> Vec<ChatMessage> {
        let mut budget = self.config.max_history_chars.saturating_sub(message_chars);
        let mut kept = Vec::new();
        for turn in turns.rev().take(self.config.max_history_turns) {
            let chars = turn.text.chars().count();
            if chars > budget {
                break;
            }
            budget -= chars;
            kept.push(ChatMessage::new(turn.role.as_str(), turn.text.clone()));
        }
        kept.reverse();
        kept
    }

    fn system_framing(&self, tenant: &TenantConfig, language: &LanguageCode, flags: TurnFlags) -> String {
        let mut framing = String::new();
        let role = tenant.localized(&tenant.role_description, language);
        if role.is_empty() {
            framing.push_str(&format!(
                "You are {}, the friendly assistant of {}. Answer questions about services, booking, pricing and location.",
                tenant.assistant_name, tenant.business_name
            ));
        } else {
            framing.push_str(role);
        }
        framing.push_str(&format!(
            "\nAlways respond in the language with code '{language}' unless the user explicitly asks otherwise."
        ));
        framing.push_str(
            "\nNever claim you can book an appointment yourself; list the booking options instead.",
        );
        if flags.first_contact {
            framing.push_str("\n\n[FIRST CONTACT] ");
            framing.push_str(tenant.localized(&tenant.greetings, language));
        } else {
            framing.push_str("\nThe conversation is ongoing; do not greet again.");
        }
        if flags.data_unavailable {
            framing.push_str(
                "\n\n[BUSINESS DATA UNAVAILABLE] Live business data could not be loaded. \
                 Do not state prices, availability or opening hours; refer the user to the salon directly.",
            );
        }
        framing
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

const GREETING_WORDS: &[&str] = &["hallo", "hello", "hi", "hey", "servus", "moin"];

/// Removes a leading greeting word ("Hallo!", "Hi,") from a reply in an
/// ongoing conversation. Leaves the reply untouched if nothing else remains.
pub fn strip_redundant_greeting(reply: &str) -> &str {
    let trimmed = reply.trim_start();
    let word_end = trimmed
        .find(|ch: char| !ch.is_alphabetic())
        .unwrap_or(trimmed.len());
    let word = &trimmed[..word_end];
    if !GREETING_WORDS.iter().any(|g| g.eq_ignore_ascii_case(word)) {
        return reply;
    }
    let rest = trimmed[word_end..]
        .trim_start_matches(|ch: char| ch.is_whitespace() || matches!(ch, '!' | ',' | ':' | '-' | '.'));
    if rest.is_empty() {
        reply
    } else {
        rest
    }
}
