use proptest::prelude::*;
use salon_chat::mapping::{chat_user_to_session_key, device_to_session_key};
use salon_chat::TenantKey;

#[test]
fn deterministic_chat_mapping() {
    let tenant = TenantKey::new("eunoia");
    let key1 = chat_user_to_session_key(&tenant, "user5");
    let key2 = chat_user_to_session_key(&tenant, "user5");
    assert_eq!(key1, key2);
}

#[test]
fn tenants_do_not_share_sessions() {
    let a = chat_user_to_session_key(&TenantKey::new("eunoia"), "1234");
    let b = chat_user_to_session_key(&TenantKey::new("waxbaby"), "1234");
    assert_ne!(a, b);
}

proptest! {
    #[test]
    fn chat_keys_are_stable(tenant in "\\PC*", user in "\\PC*") {
        let tenant = TenantKey::new(tenant);
        let key1 = chat_user_to_session_key(&tenant, &user);
        let key2 = chat_user_to_session_key(&tenant, &user);
        prop_assert_eq!(key1, key2);
    }

    #[test]
    fn device_keys_change_with_inputs(tenant in "[a-z]{1,8}", device in "[a-z0-9]{1,16}") {
        let base = device_to_session_key(&TenantKey::new(tenant.clone()), &device);
        let alt_device = device_to_session_key(&TenantKey::new(tenant.clone()), &format!("{device}:alt"));
        let alt_tenant = device_to_session_key(&TenantKey::new(format!("alt-{tenant}")), &device);
        prop_assert_ne!(&base, &alt_device);
        prop_assert_ne!(&base, &alt_tenant);
    }
}
