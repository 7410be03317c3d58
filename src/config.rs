//! Configuration records for the orchestration layer.
//!
//! Every record deserializes from JSON with defaults for omitted fields, so a
//! deployment only spells out what differs between its tenants.

use crate::error::{serde_error, ChatError, ChatResult};
use crate::language::LanguageConfig;
use crate::model::{LanguageCode, TenantKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Storage backend selection for [`crate::create_session_store`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum SessionBackendConfig {
    InMemory,
    RedisUrl(String),
}

/// History bound and idle expiry applied by every session store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SessionPolicy {
    /// Maximum stored turns per session; zero disables the bound.
    pub history_cap: usize,
    /// Idle window after which a session is dropped; zero never expires.
    pub idle_ttl_secs: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            history_cap: 10,
            idle_ttl_secs: 86_400,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    /// Upper bound a caller waits on another caller's refresh.
    pub coalesce_wait_ms: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn coalesce_wait(&self) -> Duration {
        Duration::from_millis(self.coalesce_wait_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            coalesce_wait_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct GenerationConfig {
    pub timeout_ms: u64,
    /// Worker threads allowed at once, including calls that already timed
    /// out and still run detached. Further calls fail fast.
    pub max_in_flight: usize,
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_in_flight: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ContextConfig {
    pub max_history_turns: usize,
    /// Character budget shared by the kept history and the new message.
    pub max_history_chars: usize,
    pub max_message_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 10,
            max_history_chars: 6_000,
            max_message_chars: 2_000,
        }
    }
}

/// What happens to a reply generated after the caller's deadline passed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    #[default]
    SkipPersist,
    PersistAlways,
}

/// Texts keyed by language code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(transparent)]
pub struct Localized(pub BTreeMap<String, String>);

impl Localized {
    pub fn with(mut self, language: &str, text: impl Into<String>) -> Self {
        self.0.insert(language.to_ascii_lowercase(), text.into());
        self
    }

    /// Looks up `language`, then `fallback`, then any entry.
    pub fn resolve(&self, language: &LanguageCode, fallback: &LanguageCode) -> Option<&str> {
        self.0
            .get(language.as_str())
            .or_else(|| self.0.get(fallback.as_str()))
            .or_else(|| self.0.values().next())
            .map(String::as_str)
    }
}

/// One chatbot: language default, business-data source key and branding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct TenantConfig {
    pub key: TenantKey,
    pub business_name: String,
    pub assistant_name: String,
    pub default_language: LanguageCode,
    /// Overrides [`CacheConfig::default_ttl_ms`] for this tenant.
    #[serde(default)]
    pub data_ttl_ms: Option<u64>,
    #[serde(default)]
    pub role_description: Localized,
    #[serde(default = "default_greetings")]
    pub greetings: Localized,
    #[serde(default = "default_data_unavailable")]
    pub data_unavailable: Localized,
    #[serde(default = "default_apology")]
    pub apology: Localized,
    #[serde(default = "default_rephrase")]
    pub rephrase: Localized,
}

impl TenantConfig {
    pub fn new(
        key: impl Into<String>,
        business_name: impl Into<String>,
        assistant_name: impl Into<String>,
        default_language: impl AsRef<str>,
    ) -> Self {
        Self {
            key: TenantKey::new(key),
            business_name: business_name.into(),
            assistant_name: assistant_name.into(),
            default_language: LanguageCode::new(default_language),
            data_ttl_ms: None,
            role_description: Localized::default(),
            greetings: default_greetings(),
            data_unavailable: default_data_unavailable(),
            apology: default_apology(),
            rephrase: default_rephrase(),
        }
    }

    pub fn with_data_ttl(mut self, ttl: Duration) -> Self {
        self.data_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn data_ttl(&self, cache: &CacheConfig) -> Duration {
        self.data_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| cache.default_ttl())
    }

    pub fn localized<'a>(&'a self, texts: &'a Localized, language: &LanguageCode) -> &'a str {
        texts
            .resolve(language, &self.default_language)
            .unwrap_or_default()
    }
}

fn default_greetings() -> Localized {
    Localized::default()
        .with(
            "de",
            "Begrüße die Person kurz und herzlich, stell dich mit deinem Namen vor und beantworte dann ihre Frage.",
        )
        .with(
            "en",
            "Greet the person briefly and warmly, introduce yourself by name, then answer their question.",
        )
}

fn default_data_unavailable() -> Localized {
    Localized::default()
        .with(
            "de",
            "Ich kann gerade leider nicht auf unsere aktuellen Preise und Termine zugreifen.",
        )
        .with(
            "en",
            "I can't access our live pricing and availability right now.",
        )
}

fn default_apology() -> Localized {
    Localized::default()
        .with(
            "de",
            "Entschuldige, ich habe gerade Verbindungsprobleme. Bitte versuch es gleich nochmal.",
        )
        .with(
            "en",
            "I'm sorry, I'm having trouble connecting right now. Please try again in a moment.",
        )
}

fn default_rephrase() -> Localized {
    Localized::default()
        .with(
            "de",
            "Das habe ich leider nicht verstanden. Kannst du deine Frage anders formulieren?",
        )
        .with(
            "en",
            "Sorry, I didn't catch that. Could you rephrase your question?",
        )
}

/// Root configuration record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ChatConfig {
    pub session: SessionPolicy,
    pub cache: CacheConfig,
    pub generation: GenerationConfig,
    pub context: ContextConfig,
    pub language: LanguageConfig,
    pub disconnect: DisconnectPolicy,
    pub tenants: Vec<TenantConfig>,
}

impl ChatConfig {
    pub fn from_json_str(raw: &str) -> ChatResult<Self> {
        serde_json::from_str(raw).map_err(serde_error)
    }
}

/// Tenant lookup by key.
#[derive(Clone, Debug, Default)]
pub struct TenantRegistry {
    tenants: HashMap<TenantKey, TenantConfig>,
}

impl TenantRegistry {
    pub fn new(tenants: impl IntoIterator<Item = TenantConfig>) -> Self {
        Self {
            tenants: tenants
                .into_iter()
                .map(|tenant| (tenant.key.clone(), tenant))
                .collect(),
        }
    }

    pub fn get(&self, key: &TenantKey) -> ChatResult<&TenantConfig> {
        self.tenants
            .get(key)
            .ok_or_else(|| ChatError::UnknownTenant(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &TenantKey> {
        self.tenants.keys()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
