//! End-to-end engine scenarios: two engines sharing one key directory, with
//! envelopes carried by hand in place of a transport.

use std::sync::Arc;
use std::thread;

use murmur_crypto::IdentityKeyPair;
use murmur_engine::{
    EngineConfig, EngineError, KeyDirectory, MemoryKeyDirectory, MemorySessionPersistence,
    SessionEngine, SessionPersistence, SessionRecord, SessionStatus,
};

fn make_engine(
    user_id: &str,
    directory: &Arc<MemoryKeyDirectory>,
    config: EngineConfig,
) -> SessionEngine {
    let directory: Arc<dyn KeyDirectory> = directory.clone();
    let engine =
        SessionEngine::new(user_id, IdentityKeyPair::generate(), directory, config).unwrap();
    engine.register().unwrap();
    engine
}

#[test]
fn alice_and_bob_end_to_end() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    assert_eq!(dir.remaining_prekeys("bob").unwrap(), 100);

    let hello = alice.encrypt_for_peer("bob", b"hello").unwrap();
    assert_eq!(dir.remaining_prekeys("bob").unwrap(), 99);
    assert_eq!(hello.counter, 0);

    let world = alice.encrypt_for_peer("bob", b"world").unwrap();
    assert_eq!(world.counter, 1);
    assert_ne!(hello.ciphertext, world.ciphertext);

    assert_eq!(bob.decrypt_from_peer(&hello).unwrap(), b"hello");
    assert_eq!(bob.decrypt_from_peer(&world).unwrap(), b"world");

    // And the reverse direction over the same session.
    let reply = bob.encrypt_for_peer("alice", b"hey alice").unwrap();
    assert_eq!(alice.decrypt_from_peer(&reply).unwrap(), b"hey alice");

    assert_eq!(
        alice.session_status("bob"),
        SessionStatus::Established { degraded: false }
    );
    assert_eq!(
        bob.session_status("alice"),
        SessionStatus::Established { degraded: false }
    );
}

#[test]
fn envelopes_survive_the_wire_format() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let env = alice.encrypt_for_peer("bob", b"over the wire").unwrap();
    let bytes = env.to_bytes().unwrap();
    let received = murmur_engine::Envelope::from_bytes(&bytes).unwrap();
    assert_eq!(bob.decrypt_from_peer(&received).unwrap(), b"over the wire");
}

#[test]
fn single_tamper_keeps_the_session_usable() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let good = alice.encrypt_for_peer("bob", b"genuine").unwrap();
    let mut bad = good.clone();
    bad.ciphertext[0] ^= 0x01;

    assert!(matches!(
        bob.decrypt_from_peer(&bad),
        Err(EngineError::Crypto(_))
    ));
    assert_eq!(
        bob.session_status("alice"),
        SessionStatus::Established { degraded: false }
    );

    // The untampered envelope still decrypts.
    assert_eq!(bob.decrypt_from_peer(&good).unwrap(), b"genuine");
}

#[test]
fn repeated_tampering_invalidates_until_reestablished() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let good = alice.encrypt_for_peer("bob", b"genuine").unwrap();
    let mut bad = good.clone();
    bad.auth_tag[0] ^= 0xff;

    for _ in 0..3 {
        assert!(bob.decrypt_from_peer(&bad).is_err());
    }
    assert_eq!(bob.session_status("alice"), SessionStatus::Invalidated);

    // Invalidated sessions refuse traffic in both directions.
    assert!(matches!(
        bob.decrypt_from_peer(&good),
        Err(EngineError::SessionInvalidated(_))
    ));
    assert!(matches!(
        bob.encrypt_for_peer("alice", b"no"),
        Err(EngineError::SessionInvalidated(_))
    ));

    // Delete on both sides and run a fresh handshake.
    assert!(bob.delete_session("alice"));
    assert!(alice.delete_session("bob"));
    let fresh = alice.encrypt_for_peer("bob", b"fresh start").unwrap();
    assert_eq!(bob.decrypt_from_peer(&fresh).unwrap(), b"fresh start");
}

#[test]
fn replay_invalidates_the_session() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let env = alice.encrypt_for_peer("bob", b"once only").unwrap();
    bob.decrypt_from_peer(&env).unwrap();

    assert!(matches!(
        bob.decrypt_from_peer(&env),
        Err(EngineError::Crypto(
            murmur_crypto::CryptoError::CounterRegression
        ))
    ));
    assert_eq!(bob.session_status("alice"), SessionStatus::Invalidated);
}

#[test]
fn out_of_order_delivery_within_the_window() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let envelopes: Vec<_> = (0..5)
        .map(|i| alice.encrypt_for_peer("bob", format!("msg {i}").as_bytes()).unwrap())
        .collect();

    for i in [3, 0, 4, 1, 2] {
        assert_eq!(
            bob.decrypt_from_peer(&envelopes[i]).unwrap(),
            format!("msg {i}").as_bytes()
        );
    }
}

#[test]
fn delivery_outside_the_window_fails_cleanly() {
    let config = EngineConfig {
        max_skip: 3,
        ..EngineConfig::default()
    };
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, config.clone());
    let bob = make_engine("bob", &dir, config);

    let envelopes: Vec<_> = (0..6)
        .map(|i| alice.encrypt_for_peer("bob", format!("msg {i}").as_bytes()).unwrap())
        .collect();

    // Counter 5 would skip 5 keys, past the window of 3.
    assert!(bob.decrypt_from_peer(&envelopes[5]).is_err());
    assert_eq!(
        bob.session_status("alice"),
        SessionStatus::Established { degraded: false }
    );

    // In-window messages are unaffected by the failed attempt.
    assert_eq!(bob.decrypt_from_peer(&envelopes[1]).unwrap(), b"msg 1");
}

#[test]
fn decrypt_without_session_or_handshake_fails() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let mut env = alice.encrypt_for_peer("bob", b"hi").unwrap();
    env.handshake = None;

    assert!(matches!(
        bob.decrypt_from_peer(&env),
        Err(EngineError::NoSession(_))
    ));
}

#[test]
fn exhausted_pool_degrades_the_handshake() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine(
        "bob",
        &dir,
        EngineConfig {
            prekey_pool_size: 0,
            ..EngineConfig::default()
        },
    );

    let env = alice.encrypt_for_peer("bob", b"no prekey left").unwrap();
    assert_eq!(
        alice.session_status("bob"),
        SessionStatus::Established { degraded: true }
    );
    assert_eq!(bob.decrypt_from_peer(&env).unwrap(), b"no prekey left");
    assert_eq!(
        bob.session_status("alice"),
        SessionStatus::Established { degraded: true }
    );
}

#[test]
fn maintain_never_reoffers_handed_out_prekeys() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let bob = make_engine(
        "bob",
        &dir,
        EngineConfig {
            prekey_pool_size: 3,
            ..EngineConfig::default()
        },
    );

    let first = dir.fetch_bundle("bob").unwrap().one_time_prekey.unwrap().id;
    bob.maintain().unwrap();

    let mut seen = vec![first];
    while let Some(pk) = dir.fetch_bundle("bob").unwrap().one_time_prekey {
        seen.push(pk.id);
    }
    let handed_out = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), handed_out);
}

#[test]
fn concurrent_first_envelopes_share_one_responder_session() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());
    let bob = make_engine("bob", &dir, EngineConfig::default());

    let first = alice.encrypt_for_peer("bob", b"first").unwrap();
    let second = alice.encrypt_for_peer("bob", b"second").unwrap();

    // Both envelopes carry the handshake; whichever thread runs X3DH first
    // wins, and the other must decrypt against that session instead of
    // consuming the one-time prekey again.
    thread::scope(|scope| {
        let h1 = scope.spawn(|| bob.decrypt_from_peer(&first).unwrap());
        let h2 = scope.spawn(|| bob.decrypt_from_peer(&second).unwrap());
        assert_eq!(h1.join().unwrap(), b"first");
        assert_eq!(h2.join().unwrap(), b"second");
    });

    assert_eq!(
        bob.session_status("alice"),
        SessionStatus::Established { degraded: false }
    );
}

#[test]
fn concurrent_fetches_never_share_a_prekey() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let _bob = make_engine(
        "bob",
        &dir,
        EngineConfig {
            prekey_pool_size: 16,
            ..EngineConfig::default()
        },
    );

    let mut ids = thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let dir = Arc::clone(&dir);
                scope.spawn(move || {
                    dir.fetch_bundle("bob").unwrap().one_time_prekey.unwrap().id
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(dir.remaining_prekeys("bob").unwrap(), 0);
}

#[test]
fn sessions_roundtrip_through_persistence() {
    let dir = Arc::new(MemoryKeyDirectory::new());
    let alice = make_engine("alice", &dir, EngineConfig::default());

    let bob_identity = IdentityKeyPair::generate();
    let bob_secret = *bob_identity.secret_bytes();
    let bob = SessionEngine::new(
        "bob",
        bob_identity,
        dir.clone(),
        EngineConfig::default(),
    )
    .unwrap();
    bob.register().unwrap();

    let env = alice.encrypt_for_peer("bob", b"before restart").unwrap();
    assert_eq!(bob.decrypt_from_peer(&env).unwrap(), b"before restart");

    let store = MemorySessionPersistence::new();
    let record = bob.export_session("alice").unwrap();
    store.save("alice", &record.to_bytes().unwrap()).unwrap();

    // A new engine with the same identity picks the session back up.
    let restarted = SessionEngine::new(
        "bob",
        IdentityKeyPair::from_secret_bytes(&bob_secret),
        dir.clone(),
        EngineConfig::default(),
    )
    .unwrap();
    let loaded = SessionRecord::from_bytes(&store.load("alice").unwrap().unwrap()).unwrap();
    restarted.import_session(loaded).unwrap();

    let env = alice.encrypt_for_peer("bob", b"after restart").unwrap();
    assert_eq!(restarted.decrypt_from_peer(&env).unwrap(), b"after restart");

    let reply = restarted.encrypt_for_peer("alice", b"still here").unwrap();
    assert_eq!(alice.decrypt_from_peer(&reply).unwrap(), b"still here");
}
