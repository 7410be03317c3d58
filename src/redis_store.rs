use crate::config::SessionPolicy;
use crate::error::{not_found, redis_error, ChatResult};
use crate::model::{Cas, Exchange, LanguageCode, Role, Session, SessionKey, TenantKey, Turn};
use crate::store::SessionStore;
use redis::{Client, Commands, Connection, ErrorKind, RedisError, RedisResult};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const DEFAULT_NAMESPACE: &str = "salon:session";

#[derive(Serialize, Deserialize)]
struct Record {
    /// Write version, bumped per mutation. Conflicts are detected by WATCH,
    /// not by comparing this value.
    cas: Cas,
    session: Session,
}

/// Redis-backed session store that mirrors the in-memory semantics.
///
/// Each session is one JSON value whose key expires after the idle window.
/// Mutations run as optimistic WATCH/MULTI/EXEC transactions and are retried
/// when another writer touched the same key, which keeps per-key arrival
/// order without a lock spanning keys.
pub struct RedisSessionStore {
    client: Client,
    namespace: String,
    policy: SessionPolicy,
}

impl RedisSessionStore {
    /// Creates a store using a Redis URL and the default namespace prefix.
    pub fn from_url(url: impl AsRef<str>, policy: SessionPolicy) -> ChatResult<Self> {
        Self::from_url_with_namespace(url, DEFAULT_NAMESPACE, policy)
    }

    /// Creates a store using a Redis URL and a custom namespace prefix.
    pub fn from_url_with_namespace(
        url: impl AsRef<str>,
        namespace: impl Into<String>,
        policy: SessionPolicy,
    ) -> ChatResult<Self> {
        let client = Client::open(url.as_ref()).map_err(redis_error)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            policy,
        })
    }

    fn conn(&self) -> ChatResult<Connection> {
        self.client.get_connection().map_err(redis_error)
    }

    fn session_entry_key(&self, key: &SessionKey) -> String {
        format!("{}:session:{}", self.namespace, key.as_str())
    }

    fn ttl_ms(&self) -> Option<i64> {
        match self.policy.idle_ttl_secs {
            0 => None,
            secs => Some(i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)),
        }
    }

    fn decode(payload: &str) -> RedisResult<Record> {
        serde_json::from_str(payload).map_err(|err| {
            RedisError::from((ErrorKind::TypeError, "invalid session payload", err.to_string()))
        })
    }

    fn encode(record: &Record) -> RedisResult<String> {
        serde_json::to_string(record).map_err(|err| {
            RedisError::from((ErrorKind::TypeError, "unserializable session", err.to_string()))
        })
    }

    /// Applies `apply` inside a transaction on the session key.
    ///
    /// With `create` set, a missing session is created for that tenant first;
    /// otherwise a missing session yields `Ok(None)`.
    fn mutate<T>(
        &self,
        key: &SessionKey,
        create: Option<&TenantKey>,
        mut apply: impl FnMut(&mut Session) -> T,
    ) -> ChatResult<Option<T>> {
        let entry_key = self.session_entry_key(key);
        let ttl_ms = self.ttl_ms();
        let cap = self.policy.history_cap;
        let mut conn = self.conn()?;
        let mut out = None;
        redis::transaction(&mut conn, &[entry_key.as_str()], |conn, pipe| {
            out = None;
            let raw: Option<String> = conn.get(&entry_key)?;
            let mut record = match (raw, create) {
                (Some(payload), _) => Self::decode(&payload)?,
                (None, Some(tenant)) => Record {
                    cas: Cas::initial(),
                    session: Session::new(key.clone(), tenant.clone()),
                },
                (None, None) => return Ok(Some(())),
            };
            out = Some(apply(&mut record.session));
            // Keep the stored history within bounds even if the policy shrank.
            while cap > 0 && record.session.turns.len() > cap {
                record.session.turns.pop_front();
            }
            record.cas = record.cas.next();
            pipe.set(&entry_key, Self::encode(&record)?).ignore();
            if let Some(ttl) = ttl_ms {
                pipe.pexpire(&entry_key, ttl).ignore();
            }
            pipe.query(conn)
        })
        .map_err(redis_error)?;
        Ok(out)
    }
}

impl SessionStore for RedisSessionStore {
    fn get_or_create(&self, key: &SessionKey, tenant: &TenantKey) -> ChatResult<Session> {
        self.mutate(key, Some(tenant), |session| session.clone())?
            .ok_or_else(|| not_found(key))
    }

    fn get(&self, key: &SessionKey) -> ChatResult<Option<Session>> {
        let mut conn = self.conn()?;
        let payload: Option<String> = conn.get(self.session_entry_key(key)).map_err(redis_error)?;
        payload
            .map(|payload| Self::decode(&payload).map(|record| record.session))
            .transpose()
            .map_err(redis_error)
    }

    fn append_turn(&self, key: &SessionKey, role: Role, text: &str) -> ChatResult<Session> {
        let cap = self.policy.history_cap;
        self.mutate(key, None, |session| {
            session.push_turn(Turn::new(role, text), cap);
            session.clone()
        })?
        .ok_or_else(|| not_found(key))
    }

    fn mark_greeted(&self, key: &SessionKey) -> ChatResult<()> {
        self.mutate(key, None, |session| {
            session.mark_greeted();
        })?
        .ok_or_else(|| not_found(key))
    }

    fn set_language(&self, key: &SessionKey, language: &LanguageCode) -> ChatResult<()> {
        self.mutate(key, None, |session| {
            session.active_language = Some(language.clone());
        })?
        .ok_or_else(|| not_found(key))
    }

    fn touch(&self, key: &SessionKey) -> ChatResult<bool> {
        let touched = self.mutate(key, None, |session| {
            session.last_seen = OffsetDateTime::now_utc();
        })?;
        Ok(touched.is_some())
    }

    fn expire_idle(&self) -> ChatResult<usize> {
        // Idle sessions expire through the key TTL set on every write.
        Ok(0)
    }

    fn remove(&self, key: &SessionKey) -> ChatResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.del(self.session_entry_key(key)).map_err(redis_error)?;
        Ok(removed > 0)
    }

    fn record_exchange(&self, key: &SessionKey, exchange: &Exchange) -> ChatResult<Session> {
        let cap = self.policy.history_cap;
        self.mutate(key, Some(&exchange.tenant), |session| {
            session.push_turn(Turn::new(Role::User, exchange.user.as_str()), cap);
            session.push_turn(Turn::new(Role::Assistant, exchange.assistant.as_str()), cap);
            if let Some(language) = &exchange.language {
                session.active_language = Some(language.clone());
            }
            if exchange.greet {
                session.mark_greeted();
            }
            session.last_seen = OffsetDateTime::now_utc();
            session.clone()
        })?
        .ok_or_else(|| not_found(key))
    }
}
