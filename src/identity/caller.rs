// Caller authentication
//
// Every mutating service call takes a `Caller`. A caller is either built
// in-process from a keypair the process holds, or produced by verifying a
// `SignedCall` envelope received from a client.

use crate::identity::{Did, DidError, Keypair, Signature, SignatureError, Signer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

const CALL_DOMAIN: &[u8] = b"freight-call:v1";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid caller DID: {0}")]
    InvalidDid(#[from] DidError),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureBytes(#[from] SignatureError),

    #[error("Signature does not match the call contents")]
    InvalidSignature,

    #[error("Operation mismatch: signed for '{signed}', presented for '{expected}'")]
    OperationMismatch { signed: String, expected: String },

    #[error("Payload digest does not match the signed digest")]
    PayloadMismatch,

    #[error("Call timestamp is too far in the future")]
    FutureTimestamp,

    #[error("Call has expired")]
    Expired,

    #[error("Replayed call: nonce {0} already used")]
    Replay(u64),

    #[error("Malformed call envelope: {0}")]
    Malformed(String),
}

/// An authenticated party
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    did: Did,
}

impl Caller {
    /// A caller whose key is held by this process
    pub fn local(keypair: &Keypair) -> Self {
        Self { did: keypair.did() }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }
}

/// A client request signed with the caller's key
#[derive(Clone, Debug)]
pub struct SignedCall {
    caller: Did,
    operation: String,
    payload_digest: [u8; 32],
    nonce: u64,
    timestamp: u64,
    signature: Signature,
}

#[derive(Serialize, Deserialize)]
struct WireCall {
    caller: String,
    operation: String,
    payload_digest: [u8; 32],
    nonce: u64,
    timestamp: u64,
    signature: Vec<u8>,
}

impl SignedCall {
    pub fn new(
        keypair: &Keypair,
        operation: &str,
        payload: &[u8],
        nonce: u64,
        timestamp: u64,
    ) -> Self {
        let caller = keypair.did();
        let payload_digest = digest(payload);
        let bytes = signing_bytes(&caller, operation, &payload_digest, nonce, timestamp);
        let signature = Signer::sign(keypair, &bytes);

        Self {
            caller,
            operation: operation.to_string(),
            payload_digest,
            nonce,
            timestamp,
            signature,
        }
    }

    pub fn caller(&self) -> &Did {
        &self.caller
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Encode to base64 (URL-safe, no padding)
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let wire = WireCall {
            caller: self.caller.to_string(),
            operation: self.operation.clone(),
            payload_digest: self.payload_digest,
            nonce: self.nonce,
            timestamp: self.timestamp,
            signature: self.signature.to_bytes().to_vec(),
        };
        URL_SAFE_NO_PAD.encode(postcard::to_allocvec(&wire).unwrap_or_default())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let wire: WireCall =
            postcard::from_bytes(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))?;

        Ok(Self {
            caller: Did::parse(&wire.caller)?,
            operation: wire.operation,
            payload_digest: wire.payload_digest,
            nonce: wire.nonce,
            timestamp: wire.timestamp,
            signature: Signature::from_bytes(&wire.signature)?,
        })
    }
}

fn digest(payload: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(payload));
    out
}

fn signing_bytes(
    caller: &Did,
    operation: &str,
    payload_digest: &[u8; 32],
    nonce: u64,
    timestamp: u64,
) -> Vec<u8> {
    let caller = caller.to_string();
    let mut bytes = Vec::with_capacity(CALL_DOMAIN.len() + caller.len() + operation.len() + 56);
    bytes.extend_from_slice(CALL_DOMAIN);
    bytes.extend_from_slice(&(caller.len() as u32).to_le_bytes());
    bytes.extend_from_slice(caller.as_bytes());
    bytes.extend_from_slice(&(operation.len() as u32).to_le_bytes());
    bytes.extend_from_slice(operation.as_bytes());
    bytes.extend_from_slice(payload_digest);
    bytes.extend_from_slice(&nonce.to_le_bytes());
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    bytes
}

/// Verifies signed calls: signature, freshness window and nonce replay
pub struct Authenticator {
    future_tolerance_secs: u64,
    max_age_secs: u64,
    /// caller -> (nonce -> call timestamp)
    seen: Mutex<HashMap<Did, HashMap<u64, u64>>>,
}

impl Authenticator {
    pub fn new(future_tolerance_secs: u64, max_age_secs: u64) -> Self {
        Self {
            future_tolerance_secs,
            max_age_secs,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verify a call for `operation` carrying `payload`, as of `now` (unix seconds)
    pub fn authenticate(
        &self,
        call: &SignedCall,
        operation: &str,
        payload: &[u8],
        now: u64,
    ) -> Result<Caller, AuthError> {
        // Check the call is for this operation
        if call.operation != operation {
            return Err(AuthError::OperationMismatch {
                signed: call.operation.clone(),
                expected: operation.to_string(),
            });
        }

        // Check the payload is the one that was signed
        if digest(payload) != call.payload_digest {
            return Err(AuthError::PayloadMismatch);
        }

        // Verify the signature against the caller's own key
        let public_key = call.caller.public_key()?;
        let bytes = signing_bytes(
            &call.caller,
            &call.operation,
            &call.payload_digest,
            call.nonce,
            call.timestamp,
        );
        if !Signer::verify(&public_key, &bytes, &call.signature) {
            return Err(AuthError::InvalidSignature);
        }

        // Check freshness
        if call.timestamp > now.saturating_add(self.future_tolerance_secs) {
            return Err(AuthError::FutureTimestamp);
        }
        if call.timestamp.saturating_add(self.max_age_secs) < now {
            return Err(AuthError::Expired);
        }

        // Reject replays; nonces older than the window are forgotten
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now.saturating_sub(self.max_age_secs);
        let nonces = seen.entry(call.caller.clone()).or_default();
        nonces.retain(|_, ts| *ts >= cutoff);
        if nonces.contains_key(&call.nonce) {
            return Err(AuthError::Replay(call.nonce));
        }
        nonces.insert(call.nonce, call.timestamp);

        Ok(Caller {
            did: call.caller.clone(),
        })
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new(60, 300)
    }
}
