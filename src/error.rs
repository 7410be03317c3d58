use thiserror::Error;

/// Failure taxonomy shared by every component.
///
/// The type is `Clone` so a single refresh failure can be handed to every
/// caller that coalesced onto it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("business data unavailable for tenant {tenant}: {reason}")]
    DataUnavailable { tenant: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("timed out waiting for in-flight refresh of tenant {tenant}")]
    RefreshCoalesceTimeout { tenant: String },
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ChatError {
    /// Whether the failure means live business data could not be obtained.
    pub fn is_data_unavailable(&self) -> bool {
        matches!(
            self,
            ChatError::DataUnavailable { .. } | ChatError::RefreshCoalesceTimeout { .. }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

pub(crate) fn serde_error(err: serde_json::Error) -> ChatError {
    ChatError::Serialization(err.to_string())
}

#[cfg(feature = "redis")]
pub(crate) fn redis_error(err: redis::RedisError) -> ChatError {
    ChatError::StoreUnavailable(err.to_string())
}

pub(crate) fn not_found(key: &crate::model::SessionKey) -> ChatError {
    ChatError::SessionNotFound(key.to_string())
}

pub(crate) fn data_unavailable(tenant: impl Into<String>, reason: impl Into<String>) -> ChatError {
    ChatError::DataUnavailable {
        tenant: tenant.into(),
        reason: reason.into(),
    }
}
