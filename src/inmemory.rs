use crate::config::SessionPolicy;
use crate::error::{not_found, ChatResult};
use crate::model::{Cas, Exchange, LanguageCode, Role, Session, SessionKey, TenantKey, Turn};
use crate::store::SessionStore;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

struct Entry {
    session: Session,
    cas: Cas,
}

impl Entry {
    fn new(session: Session) -> Self {
        Self {
            session,
            cas: Cas::initial(),
        }
    }

    fn bump(&mut self) {
        self.cas = self.cas.next();
    }
}

/// In-memory implementation backed by a concurrent hash map.
///
/// Mutations for one key run under that key's shard guard, which serializes
/// concurrent turns of the same user without blocking other keys' shards.
pub struct InMemorySessionStore {
    entries: DashMap<SessionKey, Entry>,
    policy: SessionPolicy,
    cleanup_hint: Mutex<OffsetDateTime>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_policy(SessionPolicy::default())
    }
}

impl InMemorySessionStore {
    /// Constructs a store with no background maintenance. Expiration is handled lazily on access.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SessionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            cleanup_hint: Mutex::new(OffsetDateTime::now_utc()),
        }
    }

    /// Current write version of a live session.
    pub fn cas(&self, key: &SessionKey) -> Option<Cas> {
        let now = Self::now();
        self.entries
            .get(key)
            .filter(|entry| !self.is_expired(&entry.session, now))
            .map(|entry| entry.cas)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn is_expired(&self, session: &Session, now: OffsetDateTime) -> bool {
        session.is_idle(self.policy.idle_ttl_secs, now)
    }

    fn maybe_cleanup(&self, now: OffsetDateTime) {
        {
            let mut guard = self.cleanup_hint.lock();
            if now - *guard < Duration::seconds(60) {
                return;
            }
            *guard = now;
        }
        let removed = self.sweep(now);
        if removed > 0 {
            tracing::debug!(removed, "swept idle sessions");
        }
    }

    fn sweep(&self, now: OffsetDateTime) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !self.is_expired(&entry.session, now));
        before.saturating_sub(self.entries.len())
    }

    /// Applies `apply` to the live session under its key guard.
    fn mutate<T>(
        &self,
        key: &SessionKey,
        apply: impl FnOnce(&mut Session) -> T,
    ) -> ChatResult<T> {
        let now = Self::now();
        self.maybe_cleanup(now);
        let Some(mut guard) = self.entries.get_mut(key) else {
            return Err(not_found(key));
        };
        if self.is_expired(&guard.session, now) {
            drop(guard);
            self.entries
                .remove_if(key, |_, entry| self.is_expired(&entry.session, now));
            return Err(not_found(key));
        }
        let out = apply(&mut guard.session);
        guard.bump();
        Ok(out)
    }
}

impl SessionStore for InMemorySessionStore {
    fn get_or_create(&self, key: &SessionKey, tenant: &TenantKey) -> ChatResult<Session> {
        let now = Self::now();
        self.maybe_cleanup(now);
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occ) => {
                if self.is_expired(&occ.get().session, now) {
                    tracing::debug!(session = %key, "replacing idle session");
                    occ.insert(Entry::new(Session::new(key.clone(), tenant.clone())));
                }
                Ok(occ.get().session.clone())
            }
            MapEntry::Vacant(vac) => {
                let session = Session::new(key.clone(), tenant.clone());
                vac.insert(Entry::new(session.clone()));
                Ok(session)
            }
        }
    }

    fn get(&self, key: &SessionKey) -> ChatResult<Option<Session>> {
        let now = Self::now();
        self.maybe_cleanup(now);
        if let Some(entry) = self.entries.get(key) {
            if self.is_expired(&entry.session, now) {
                drop(entry);
                self.entries
                    .remove_if(key, |_, entry| self.is_expired(&entry.session, now));
                return Ok(None);
            }
            return Ok(Some(entry.session.clone()));
        }
        Ok(None)
    }

    fn append_turn(&self, key: &SessionKey, role: Role, text: &str) -> ChatResult<Session> {
        let cap = self.policy.history_cap;
        self.mutate(key, |session| {
            session.push_turn(Turn::new(role, text), cap);
            session.clone()
        })
    }

    fn mark_greeted(&self, key: &SessionKey) -> ChatResult<()> {
        self.mutate(key, |session| {
            session.mark_greeted();
        })
    }

    fn set_language(&self, key: &SessionKey, language: &LanguageCode) -> ChatResult<()> {
        self.mutate(key, |session| {
            session.active_language = Some(language.clone());
        })
    }

    fn touch(&self, key: &SessionKey) -> ChatResult<bool> {
        match self.mutate(key, |session| session.last_seen = Self::now()) {
            Ok(()) => Ok(true),
            Err(crate::ChatError::SessionNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn expire_idle(&self) -> ChatResult<usize> {
        let now = Self::now();
        *self.cleanup_hint.lock() = now;
        Ok(self.sweep(now))
    }

    fn remove(&self, key: &SessionKey) -> ChatResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn record_exchange(&self, key: &SessionKey, exchange: &Exchange) -> ChatResult<Session> {
        let now = Self::now();
        self.maybe_cleanup(now);
        let cap = self.policy.history_cap;
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Session::new(key.clone(), exchange.tenant.clone())));
        if self.is_expired(&entry.session, now) {
            *entry = Entry::new(Session::new(key.clone(), exchange.tenant.clone()));
        }
        let session = &mut entry.session;
        session.push_turn(Turn::new(Role::User, exchange.user.as_str()), cap);
        session.push_turn(Turn::new(Role::Assistant, exchange.assistant.as_str()), cap);
        if let Some(language) = &exchange.language {
            session.active_language = Some(language.clone());
        }
        if exchange.greet {
            session.mark_greeted();
        }
        session.last_seen = now;
        let snapshot = session.clone();
        entry.bump();
        Ok(snapshot)
    }
}
