#![forbid(unsafe_code)]

pub mod business;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod inmemory;
pub mod language;
pub mod mapping;
pub mod model;
pub mod orchestrator;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod sequencer;
pub mod store;

pub use business::{BusinessDataCache, BusinessDataSource, BusinessSnapshot, ServedSnapshot};
pub use config::{ChatConfig, SessionBackendConfig, SessionPolicy, TenantConfig, TenantRegistry};
pub use error::{ChatError, ChatResult};
pub use generation::{Generator, TimedGenerator};
pub use model::{LanguageCode, Role, Session, SessionKey, TenantKey, Turn};
pub use orchestrator::{InboundMessage, TurnError, TurnOrchestrator, TurnReply, TurnStatus};
pub use store::SessionStore;

use std::sync::Arc;

/// Builds the session store selected by `config`.
pub fn create_session_store(
    config: SessionBackendConfig,
    policy: SessionPolicy,
) -> ChatResult<Arc<dyn SessionStore>> {
    match config {
        SessionBackendConfig::InMemory => {
            Ok(Arc::new(inmemory::InMemorySessionStore::with_policy(policy)))
        }
        #[cfg(feature = "redis")]
        SessionBackendConfig::RedisUrl(url) => Ok(Arc::new(
            redis_store::RedisSessionStore::from_url(url, policy)?,
        )),
        #[cfg(not(feature = "redis"))]
        SessionBackendConfig::RedisUrl(_) => Err(ChatError::StoreUnavailable(
            "redis support is disabled; enable the `redis` feature".into(),
        )),
    }
}
