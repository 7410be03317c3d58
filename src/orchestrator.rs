//! Drives one request/response cycle.
//!
//! ```text
//! Start -> SessionResolved -> LanguageResolved -> DataResolved
//!       -> ContextBuilt -> Generated -> Persisted -> Done
//! ```
//!
//! Any state may end in `Error`. Store and business-data failures are
//! absorbed into a degraded reply; invalid input and generation failures end
//! the turn without touching the stored session.
//!
//! Turns for one session key run one at a time in arrival order, from
//! session resolution through persistence.

use crate::business::{BusinessDataCache, ServedSnapshot};
use crate::config::{ChatConfig, DisconnectPolicy, TenantConfig, TenantRegistry};
use crate::context::{normalize_message, strip_redundant_greeting, ContextAssembler, TurnFlags};
use crate::error::ChatError;
use crate::generation::TimedGenerator;
use crate::language::{DecisionReason, LanguageDetector};
use crate::mapping::chat_user_to_session_key;
use crate::model::{Exchange, LanguageCode, Session, SessionKey, TenantKey};
use crate::sequencer::TurnSequencer;
use crate::store::SessionStore;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Start,
    SessionResolved,
    LanguageResolved,
    DataResolved,
    ContextBuilt,
    Generated,
    Persisted,
    Done,
    Error,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One user message as delivered by the web layer.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub session_key: SessionKey,
    pub tenant: TenantKey,
    pub text: String,
    /// When the caller stops waiting for the reply.
    pub deadline: Option<Instant>,
}

impl InboundMessage {
    pub fn new(session_key: SessionKey, tenant: TenantKey, text: impl Into<String>) -> Self {
        Self {
            session_key,
            tenant,
            text: text.into(),
            deadline: None,
        }
    }

    /// Builds a message for a web-chat user id, deriving the session key.
    pub fn from_chat(tenant: impl Into<String>, user_id: &str, text: impl Into<String>) -> Self {
        let tenant = TenantKey::new(tenant);
        let session_key = chat_user_to_session_key(&tenant, user_id);
        Self::new(session_key, tenant, text)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Degradation {
    /// Session state could not be read; the turn ran without history.
    StoreUnavailable,
    /// The finished turn could not be written back.
    PersistFailed,
    /// The caller's deadline passed before the reply was ready.
    CallerGone,
    /// No business data at all; the reply carries the unavailable template.
    DataUnavailable,
    /// Business data past its TTL was used after a failed refresh.
    StaleData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    Answered,
    Degraded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnReply {
    pub text: String,
    pub language: LanguageCode,
    pub status: TurnStatus,
    pub degradations: Vec<Degradation>,
    pub first_contact: bool,
    /// Session as written back, when persistence happened.
    pub session: Option<Session>,
}

/// A rejected turn. Nothing was written to the session.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnError {
    pub kind: ChatError,
    /// Last state reached before the turn moved to [`TurnState::Error`].
    pub failed_at: TurnState,
    pub language: LanguageCode,
    /// Localized text to show the user.
    pub message: String,
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn failed after {}: {}", self.failed_at, self.kind)
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Stateless per-request coordinator over the session store, language
/// detector, business cache, context assembler and generator.
pub struct TurnOrchestrator {
    tenants: TenantRegistry,
    sessions: Arc<dyn SessionStore>,
    cache: Arc<BusinessDataCache>,
    detector: LanguageDetector,
    assembler: ContextAssembler,
    generator: TimedGenerator,
    disconnect: DisconnectPolicy,
    turns: TurnSequencer,
}

struct Progress<'a> {
    key: &'a SessionKey,
    state: TurnState,
}

impl Progress<'_> {
    fn advance(&mut self, next: TurnState) {
        tracing::debug!(session = %self.key, from = %self.state, to = %next, "turn transition");
        self.state = next;
    }
}

impl TurnOrchestrator {
    pub fn new(
        tenants: TenantRegistry,
        sessions: Arc<dyn SessionStore>,
        cache: Arc<BusinessDataCache>,
        generator: TimedGenerator,
    ) -> Self {
        Self {
            tenants,
            sessions,
            cache,
            detector: LanguageDetector::default(),
            assembler: ContextAssembler::default(),
            generator,
            disconnect: DisconnectPolicy::default(),
            turns: TurnSequencer::new(),
        }
    }

    /// Wires every component from one configuration record.
    pub fn from_config(
        config: &ChatConfig,
        sessions: Arc<dyn SessionStore>,
        source: Arc<dyn crate::business::BusinessDataSource>,
        generator: Arc<dyn crate::generation::Generator>,
    ) -> Self {
        let tenants = TenantRegistry::new(config.tenants.iter().cloned());
        let cache = BusinessDataCache::new(source, config.cache.clone()).with_tenants(&tenants);
        Self {
            detector: LanguageDetector::new(config.language.clone()),
            assembler: ContextAssembler::new(config.context.clone()),
            generator: TimedGenerator::new(generator, config.generation.timeout())
                .with_max_in_flight(config.generation.max_in_flight),
            disconnect: config.disconnect,
            turns: TurnSequencer::new(),
            tenants,
            sessions,
            cache: Arc::new(cache),
        }
    }

    pub fn with_detector(mut self, detector: LanguageDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_disconnect_policy(mut self, policy: DisconnectPolicy) -> Self {
        self.disconnect = policy;
        self
    }

    pub fn cache(&self) -> &Arc<BusinessDataCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn handle(&self, inbound: InboundMessage) -> Result<TurnReply, TurnError> {
        let mut progress = Progress {
            key: &inbound.session_key,
            state: TurnState::Start,
        };

        let tenant = match self.tenants.get(&inbound.tenant) {
            Ok(tenant) => tenant,
            Err(err) => {
                tracing::warn!(tenant = %inbound.tenant, "message for unknown tenant");
                return Err(TurnError {
                    message: "Unknown chatbot.".into(),
                    kind: err,
                    failed_at: progress.state,
                    language: LanguageCode::new("en"),
                });
            }
        };

        if normalize_message(&inbound.text).is_empty() {
            return Err(self.reject(
                tenant,
                &progress,
                &tenant.default_language,
                ChatError::InvalidInput("message is empty".into()),
            ));
        }

        let _turn = self.turns.admit(&inbound.session_key);
        let mut degradations = Vec::new();
        let (session, persistent) =
            match self.sessions.get_or_create(&inbound.session_key, &tenant.key) {
                Ok(session) => (session, true),
                Err(err) => {
                    tracing::warn!(
                        session = %inbound.session_key,
                        error = %err,
                        "session store unavailable, answering statelessly"
                    );
                    degradations.push(Degradation::StoreUnavailable);
                    (
                        Session::new(inbound.session_key.clone(), tenant.key.clone()),
                        false,
                    )
                }
            };
        let first_contact = !session.greeted;
        progress.advance(TurnState::SessionResolved);

        let decision = self.detector.detect(
            &inbound.text,
            session.active_language.as_ref(),
            &tenant.default_language,
        );
        if matches!(
            decision.reason,
            DecisionReason::Detected | DecisionReason::ExplicitRequest
        ) && decision.switched_from(session.active_language.as_ref())
        {
            tracing::info!(
                session = %inbound.session_key,
                to = %decision.language,
                "switching response language"
            );
        }
        let language = decision.language;
        progress.advance(TurnState::LanguageResolved);

        let served = self.resolve_data(&tenant.key, &mut degradations);
        progress.advance(TurnState::DataResolved);

        let flags = TurnFlags {
            first_contact,
            data_unavailable: served.is_none(),
        };
        let request = self
            .assembler
            .build(tenant, &session, &language, served.as_ref(), &inbound.text, flags)
            .map_err(|err| self.reject(tenant, &progress, &language, err))?;
        progress.advance(TurnState::ContextBuilt);

        let generated = self
            .generator
            .generate(&request)
            .map_err(|err| self.reject(tenant, &progress, &language, err))?;
        progress.advance(TurnState::Generated);

        let mut text = if first_contact {
            generated
        } else {
            strip_redundant_greeting(&generated).to_string()
        };
        if flags.data_unavailable {
            text = format!(
                "{}\n\n{}",
                tenant.localized(&tenant.data_unavailable, &language),
                text
            );
        }

        let caller_gone = inbound
            .deadline
            .is_some_and(|deadline| Instant::now() > deadline);
        if caller_gone {
            degradations.push(Degradation::CallerGone);
        }

        let mut stored = None;
        let persist = persistent
            && (!caller_gone || self.disconnect == DisconnectPolicy::PersistAlways);
        if persist {
            let exchange = Exchange {
                tenant: tenant.key.clone(),
                user: request.user_message.clone(),
                assistant: text.clone(),
                language: Some(language.clone()),
                greet: first_contact,
            };
            match self.sessions.record_exchange(&inbound.session_key, &exchange) {
                Ok(session) => {
                    stored = Some(session);
                    progress.advance(TurnState::Persisted);
                }
                Err(err) => {
                    tracing::warn!(
                        session = %inbound.session_key,
                        error = %err,
                        "failed to persist turn"
                    );
                    degradations.push(Degradation::PersistFailed);
                }
            }
        } else if caller_gone {
            tracing::info!(
                session = %inbound.session_key,
                "caller deadline passed, turn not persisted"
            );
        }
        progress.advance(TurnState::Done);

        let status = if degradations.iter().any(|d| {
            matches!(
                d,
                Degradation::StoreUnavailable | Degradation::DataUnavailable | Degradation::StaleData
            )
        }) {
            TurnStatus::Degraded
        } else {
            TurnStatus::Answered
        };

        Ok(TurnReply {
            text,
            language,
            status,
            degradations,
            first_contact,
            session: stored,
        })
    }

    fn resolve_data(
        &self,
        tenant: &TenantKey,
        degradations: &mut Vec<Degradation>,
    ) -> Option<ServedSnapshot> {
        match self.cache.get(tenant) {
            Ok(served) => {
                if served.stale {
                    degradations.push(Degradation::StaleData);
                }
                Some(served)
            }
            Err(err) => {
                tracing::warn!(tenant = %tenant, error = %err, "answering without business data");
                degradations.push(Degradation::DataUnavailable);
                None
            }
        }
    }

    fn reject(
        &self,
        tenant: &TenantConfig,
        progress: &Progress<'_>,
        language: &LanguageCode,
        err: ChatError,
    ) -> TurnError {
        let message = match &err {
            ChatError::InvalidInput(_) => tenant.localized(&tenant.rephrase, language),
            _ => tenant.localized(&tenant.apology, language),
        };
        tracing::debug!(
            session = %progress.key,
            from = %progress.state,
            to = %TurnState::Error,
            "turn transition"
        );
        match &err {
            ChatError::GenerationFailed(_) => tracing::error!(
                session = %progress.key,
                tenant = %tenant.key,
                state = %progress.state,
                error = %err,
                "turn failed"
            ),
            _ => tracing::info!(
                session = %progress.key,
                state = %progress.state,
                error = %err,
                "turn rejected"
            ),
        }
        TurnError {
            message: message.to_string(),
            kind: err,
            failed_at: progress.state,
            language: language.clone(),
        }
    }
}

/// Convenience for callers that only need `(text, ok)`.
pub fn reply_text(outcome: &Result<TurnReply, TurnError>) -> (&str, bool) {
    match outcome {
        Ok(reply) => (reply.text.as_str(), true),
        Err(err) => (err.message.as_str(), false),
    }
}
