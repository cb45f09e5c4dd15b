// Identity Tests
// DIDs, signatures and signed-call authentication

use freight_escrow::identity::{
    AuthError, Authenticator, Caller, Did, DidError, Keypair, SignedCall, Signer,
};

// ============================================================================
// DIDS
// ============================================================================

#[test]
fn test_did_format() {
    let keypair = Keypair::generate();
    let did = keypair.did().to_string();

    let parts: Vec<&str> = did.split(':').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "did");
    assert_eq!(parts[1], "freight");
    assert!(!parts[2].is_empty());
}

#[test]
fn test_did_parse_round_trip() {
    let did = Keypair::generate().did();
    let parsed = Did::parse(&did.to_string()).unwrap();

    assert_eq!(did, parsed);
    assert!(parsed.public_key().is_ok());
}

#[test]
fn test_did_rejects_foreign_method() {
    let did = Keypair::generate().did();
    let foreign = format!("did:mesh:{}", did.key_part());

    assert!(matches!(Did::parse(&foreign), Err(DidError::InvalidMethod(_))));
}

#[test]
fn test_did_rejects_malformed_input() {
    assert!(matches!(Did::parse(""), Err(DidError::InvalidFormat(_))));
    assert!(matches!(Did::parse("did:freight"), Err(DidError::InvalidFormat(_))));
    assert!(matches!(Did::parse("key:freight:abc"), Err(DidError::InvalidFormat(_))));
    assert!(Did::parse("did:freight:0OIl").is_err());
}

#[test]
fn test_same_key_same_did() {
    let keypair = Keypair::generate();
    let restored = Keypair::from_bytes(&keypair.to_bytes()).unwrap();

    assert_eq!(keypair.did(), restored.did());
}

#[test]
fn test_short_form_is_a_prefix() {
    let did = Keypair::generate().did();
    assert!(did.key_part().starts_with(did.short()));
    assert!(did.short().len() <= 8);
}

// ============================================================================
// SIGNATURES
// ============================================================================

#[test]
fn test_sign_and_verify() {
    let keypair = Keypair::generate();
    let signature = Signer::sign(&keypair, b"release escrow");

    assert!(Signer::verify(&keypair.public_key(), b"release escrow", &signature));
    assert!(!Signer::verify(&keypair.public_key(), b"refund escrow", &signature));
}

#[test]
fn test_signature_from_other_key_fails() {
    let alice = Keypair::generate();
    let mallory = Keypair::generate();
    let signature = Signer::sign(&mallory, b"payload");

    assert!(!Signer::verify(&alice.public_key(), b"payload", &signature));
}

// ============================================================================
// SIGNED CALLS
// ============================================================================

#[test]
fn test_authenticate_valid_call() {
    let keypair = Keypair::generate();
    let call = SignedCall::new(&keypair, "escrow.fund", b"ESC-1", 1, 1_000);
    let auth = Authenticator::default();

    let caller = auth.authenticate(&call, "escrow.fund", b"ESC-1", 1_010).unwrap();
    assert_eq!(caller, Caller::local(&keypair));
}

#[test]
fn test_call_survives_base64_transport() {
    let keypair = Keypair::generate();
    let call = SignedCall::new(&keypair, "market.bid", b"LOAD-000001", 7, 2_000);

    let decoded = SignedCall::from_base64(&call.to_base64()).unwrap();
    assert_eq!(decoded.caller(), &keypair.did());
    assert_eq!(decoded.nonce(), 7);

    let auth = Authenticator::default();
    assert!(auth.authenticate(&decoded, "market.bid", b"LOAD-000001", 2_000).is_ok());
}

#[test]
fn test_replayed_nonce_rejected() {
    let keypair = Keypair::generate();
    let call = SignedCall::new(&keypair, "escrow.fund", b"x", 42, 1_000);
    let auth = Authenticator::default();

    auth.authenticate(&call, "escrow.fund", b"x", 1_000).unwrap();
    assert!(matches!(
        auth.authenticate(&call, "escrow.fund", b"x", 1_001),
        Err(AuthError::Replay(42))
    ));
}

#[test]
fn test_same_nonce_from_different_callers_is_fine() {
    let auth = Authenticator::default();
    let a = SignedCall::new(&Keypair::generate(), "op", b"", 1, 1_000);
    let b = SignedCall::new(&Keypair::generate(), "op", b"", 1, 1_000);

    assert!(auth.authenticate(&a, "op", b"", 1_000).is_ok());
    assert!(auth.authenticate(&b, "op", b"", 1_000).is_ok());
}

#[test]
fn test_wrong_operation_or_payload_rejected() {
    let keypair = Keypair::generate();
    let call = SignedCall::new(&keypair, "escrow.release", b"ESC-1", 1, 1_000);
    let auth = Authenticator::default();

    assert!(matches!(
        auth.authenticate(&call, "escrow.refund", b"ESC-1", 1_000),
        Err(AuthError::OperationMismatch { .. })
    ));
    assert!(matches!(
        auth.authenticate(&call, "escrow.release", b"ESC-2", 1_000),
        Err(AuthError::PayloadMismatch)
    ));
}

#[test]
fn test_stale_and_future_calls_rejected() {
    let keypair = Keypair::generate();
    let auth = Authenticator::new(60, 300);

    let stale = SignedCall::new(&keypair, "op", b"", 1, 1_000);
    assert!(matches!(
        auth.authenticate(&stale, "op", b"", 1_301),
        Err(AuthError::Expired)
    ));

    let future = SignedCall::new(&keypair, "op", b"", 2, 2_000);
    assert!(matches!(
        auth.authenticate(&future, "op", b"", 1_000),
        Err(AuthError::FutureTimestamp)
    ));
}

#[test]
fn test_garbage_envelope_is_malformed() {
    assert!(matches!(
        SignedCall::from_base64("not base64 at all!"),
        Err(AuthError::Malformed(_))
    ));
}
