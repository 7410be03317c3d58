use crate::model::{SessionKey, TenantKey};
use sha2::{Digest, Sha256};

/// Deterministic SessionKey for a web-chat user id within one tenant.
///
/// Callers that send no user id are mapped to the shared `guest` id.
pub fn chat_user_to_session_key(tenant: &TenantKey, user_id: &str) -> SessionKey {
    let user_id = match user_id.trim() {
        "" => "guest",
        trimmed => trimmed,
    };
    let s = format!("chat:{}:{user_id}", tenant.as_str());
    SessionKey(hex_sha(&s))
}

/// Deterministic SessionKey from a device identifier (kiosk, widget install).
pub fn device_to_session_key(tenant: &TenantKey, device_id: &str) -> SessionKey {
    let s = format!("dev:{}:{device_id}", tenant.as_str());
    SessionKey(hex_sha(&s))
}

fn hex_sha(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash() {
        let tenant = TenantKey::new("eunoia");
        let key1 = chat_user_to_session_key(&tenant, "user");
        let key2 = chat_user_to_session_key(&tenant, "user");
        assert_eq!(key1, key2);
        assert_ne!(key1, chat_user_to_session_key(&tenant, "user2"));
        assert_ne!(key1, device_to_session_key(&tenant, "user"));
    }

    #[test]
    fn blank_user_is_guest() {
        let tenant = TenantKey::new("waxbaby");
        assert_eq!(
            chat_user_to_session_key(&tenant, "  "),
            chat_user_to_session_key(&tenant, "guest")
        );
    }
}
