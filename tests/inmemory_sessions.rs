use salon_chat::inmemory::InMemorySessionStore;
use salon_chat::model::{Exchange, LanguageCode, Role, SessionKey, TenantKey};
use salon_chat::store::SessionStore;
use salon_chat::{ChatError, SessionPolicy};
use std::sync::{Arc, Barrier};
use std::thread;

fn tenant() -> TenantKey {
    TenantKey::new("eunoia")
}

fn store_with_cap(history_cap: usize) -> InMemorySessionStore {
    InMemorySessionStore::with_policy(SessionPolicy {
        history_cap,
        idle_ttl_secs: 3600,
    })
}

#[test]
fn get_or_create_returns_fresh_ungreeted_session() {
    let store = store_with_cap(10);
    let key = SessionKey::new("user-42");

    let session = store.get_or_create(&key, &tenant()).expect("created");
    assert!(!session.greeted);
    assert!(session.turns.is_empty());
    assert!(session.active_language.is_none());

    store
        .append_turn(&key, Role::User, "Hallo")
        .expect("append succeeds");
    let again = store.get_or_create(&key, &tenant()).expect("existing");
    assert_eq!(again.id, session.id);
    assert_eq!(again.turns.len(), 1);
}

#[test]
fn append_on_missing_session_is_not_found() {
    let store = store_with_cap(10);
    let err = store
        .append_turn(&SessionKey::new("nobody"), Role::User, "hi")
        .expect_err("missing session");
    assert_eq!(err, ChatError::SessionNotFound("nobody".into()));
    assert!(!store.touch(&SessionKey::new("nobody")).expect("touch"));
}

#[test]
fn history_evicts_oldest_turns_first() {
    let store = store_with_cap(4);
    let key = SessionKey::new("evict");
    store.get_or_create(&key, &tenant()).expect("created");

    for idx in 0..7 {
        let role = if idx % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .append_turn(&key, role, &format!("turn-{idx}"))
            .expect("append");
    }

    let session = store.get(&key).expect("get").expect("present");
    let texts: Vec<_> = session.turns.iter().map(|t| t.text.clone()).collect();
    assert_eq!(texts, vec!["turn-3", "turn-4", "turn-5", "turn-6"]);
}

#[test]
fn mark_greeted_is_idempotent() {
    let store = store_with_cap(10);
    let key = SessionKey::new("greet");
    store.get_or_create(&key, &tenant()).expect("created");

    store.mark_greeted(&key).expect("first");
    store.mark_greeted(&key).expect("second");
    let session = store.get(&key).expect("get").expect("present");
    assert!(session.greeted);
}

#[test]
fn record_exchange_writes_user_before_assistant() {
    let store = store_with_cap(10);
    let key = SessionKey::new("exchange");
    let cas_before = {
        store.get_or_create(&key, &tenant()).expect("created");
        store.cas(&key).expect("cas")
    };

    let session = store
        .record_exchange(
            &key,
            &Exchange {
                tenant: tenant(),
                user: "Was kostet Brazilian Waxing?".into(),
                assistant: "Brazilian Waxing kostet 45 Euro.".into(),
                language: Some(LanguageCode::new("de")),
                greet: true,
            },
        )
        .expect("recorded");

    assert_eq!(session.turns.len(), 2);
    assert_eq!(session.turns[0].role, Role::User);
    assert_eq!(session.turns[1].role, Role::Assistant);
    assert!(session.greeted);
    assert_eq!(session.active_language, Some(LanguageCode::new("de")));
    assert_eq!(store.cas(&key), Some(cas_before.next()));
}

#[test]
fn concurrent_exchanges_for_one_key_never_interleave() {
    let store = Arc::new(store_with_cap(0));
    let key = SessionKey::new("concurrent");
    store.get_or_create(&key, &tenant()).expect("created");

    let writers = 8;
    let per_writer = 25;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|writer| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                for seq in 0..per_writer {
                    store
                        .record_exchange(
                            &key,
                            &Exchange {
                                tenant: tenant(),
                                user: format!("q:{writer}:{seq}"),
                                assistant: format!("a:{writer}:{seq}"),
                                language: None,
                                greet: false,
                            },
                        )
                        .expect("record");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let session = store.get(&key).expect("get").expect("present");
    assert_eq!(session.turns.len(), writers * per_writer * 2);

    let mut last_seq = vec![None; writers];
    for pair in session.turns.iter().collect::<Vec<_>>().chunks(2) {
        let (question, answer) = (pair[0], pair[1]);
        assert_eq!(question.role, Role::User);
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(question.text.replacen("q:", "a:", 1), answer.text);

        let mut parts = question.text.split(':').skip(1);
        let writer: usize = parts.next().expect("writer").parse().expect("number");
        let seq: usize = parts.next().expect("seq").parse().expect("number");
        if let Some(previous) = last_seq[writer] {
            assert!(seq > previous, "writer {writer} turns reordered");
        }
        last_seq[writer] = Some(seq);
    }
}

#[test]
fn concurrent_appends_keep_each_writers_order() {
    let store = Arc::new(store_with_cap(0));
    let key = SessionKey::new("appends");
    store.get_or_create(&key, &tenant()).expect("created");

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let store = Arc::clone(&store);
            let key = key.clone();
            thread::spawn(move || {
                for seq in 0..50 {
                    store
                        .append_turn(&key, Role::User, &format!("{writer}:{seq}"))
                        .expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let session = store.get(&key).expect("get").expect("present");
    assert_eq!(session.turns.len(), 200);
    for writer in 0..4 {
        let seqs: Vec<usize> = session
            .turns
            .iter()
            .filter_map(|turn| {
                let (w, s) = turn.text.split_once(':')?;
                (w == writer.to_string()).then(|| s.parse().expect("seq"))
            })
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    }
}
