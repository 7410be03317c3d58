use crate::error::{not_found, ChatResult};
use crate::model::{Exchange, LanguageCode, Role, Session, SessionKey, TenantKey};

/// Persistent conversation storage used by the turn orchestrator.
///
/// Every mutation for one key is serialized by the implementation, so turns
/// appended concurrently for the same user keep their arrival order. Backend
/// failures surface as [`crate::ChatError::StoreUnavailable`].
pub trait SessionStore: Send + Sync + 'static {
    /// Returns the live session for `key`, creating an empty one when it is
    /// missing or expired.
    fn get_or_create(&self, key: &SessionKey, tenant: &TenantKey) -> ChatResult<Session>;

    /// Fetches the live session for `key` without creating it.
    fn get(&self, key: &SessionKey) -> ChatResult<Option<Session>>;

    /// Appends one turn, evicting the oldest turns beyond the history cap.
    /// Fails with [`crate::ChatError::SessionNotFound`] for a missing key.
    fn append_turn(&self, key: &SessionKey, role: Role, text: &str) -> ChatResult<Session>;

    /// Sets `greeted`; calling it again is a no-op.
    fn mark_greeted(&self, key: &SessionKey) -> ChatResult<()>;

    /// Persists the language chosen for the session.
    fn set_language(&self, key: &SessionKey, language: &LanguageCode) -> ChatResult<()>;

    /// Refreshes `last_seen` and resets the idle window. Returns `false` when
    /// the session does not exist.
    fn touch(&self, key: &SessionKey) -> ChatResult<bool>;

    /// Removes idle sessions and returns how many were dropped.
    fn expire_idle(&self) -> ChatResult<usize>;

    /// Removes the session entry. Not reachable from a conversation turn.
    fn remove(&self, key: &SessionKey) -> ChatResult<bool>;

    /// Writes a completed turn: user message, assistant reply, language and
    /// greeting state, then touches the session.
    ///
    /// The default issues the individual operations in order; backends that
    /// can do so apply them as a single serialized mutation.
    /// A session that expired while the reply was generated is recreated.
    fn record_exchange(&self, key: &SessionKey, exchange: &Exchange) -> ChatResult<Session> {
        self.get_or_create(key, &exchange.tenant)?;
        self.append_turn(key, Role::User, &exchange.user)?;
        self.append_turn(key, Role::Assistant, &exchange.assistant)?;
        if let Some(language) = &exchange.language {
            self.set_language(key, language)?;
        }
        if exchange.greet {
            self.mark_greeted(key)?;
        }
        self.touch(key)?;
        self.get(key)?.ok_or_else(|| not_found(key))
    }
}
