use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable key used for routing (device or chat identifier).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrows the underlying key as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one chatbot configuration (one salon).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct TenantKey(pub String);

impl TenantKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case ISO 639-1 style code such as `de` or `en`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct LanguageCode(pub String);

impl LanguageCode {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Per-user conversation state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub tenant: TenantKey,
    pub turns: VecDeque<Turn>,
    pub greeted: bool,
    pub active_language: Option<LanguageCode>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Session {
    /// Creates an empty, not yet greeted session.
    pub fn new(key: SessionKey, tenant: TenantKey) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: SessionId::new(),
            key,
            tenant,
            turns: VecDeque::new(),
            greeted: false,
            active_language: None,
            created_at: now,
            last_seen: now,
        }
    }

    /// Appends a turn and evicts the oldest turns beyond `cap`.
    ///
    /// A `cap` of zero disables the bound.
    pub fn push_turn(&mut self, turn: Turn, cap: usize) {
        self.turns.push_back(turn);
        if cap == 0 {
            return;
        }
        while self.turns.len() > cap {
            self.turns.pop_front();
        }
    }

    /// Sets `greeted`; returns `true` only on the false→true transition.
    pub fn mark_greeted(&mut self) -> bool {
        let flipped = !self.greeted;
        self.greeted = true;
        flipped
    }

    /// Returns the idle expiry deadline; a zero idle window never expires.
    pub fn expires_at(&self, idle_ttl_secs: u64) -> Option<OffsetDateTime> {
        if idle_ttl_secs == 0 {
            return None;
        }
        let ttl = Duration::seconds(i64::try_from(idle_ttl_secs).unwrap_or(i64::MAX));
        Some(self.last_seen.saturating_add(ttl))
    }

    pub fn is_idle(&self, idle_ttl_secs: u64, now: OffsetDateTime) -> bool {
        self.expires_at(idle_ttl_secs)
            .map(|deadline| now >= deadline)
            .unwrap_or(false)
    }
}

/// Everything one successful turn writes back to its session.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
    pub tenant: TenantKey,
    pub user: String,
    pub assistant: String,
    pub language: Option<LanguageCode>,
    pub greet: bool,
}

/// Compare-And-Set token; increments on each write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl Cas {
    /// Initial CAS value assigned to newly created records.
    pub const fn initial() -> Self {
        Self(1)
    }

    /// Produces the next CAS value.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}
