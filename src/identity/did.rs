use crate::identity::{KeypairError, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DID_SCHEME: &str = "did";
const DID_METHOD: &str = "freight";

#[derive(Error, Debug)]
pub enum DidError {
    #[error("Invalid DID format: {0}")]
    InvalidFormat(String),

    #[error("Invalid DID method: expected 'freight', got '{0}'")]
    InvalidMethod(String),

    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] KeypairError),
}

/// Account reference for a shipper, carrier, warehouse, resolver or signer.
///
/// Format: `did:freight:<base58 ed25519 public key>`. Two DIDs are equal when
/// their key parts are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Did {
    key_part: String,
}

impl Did {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self {
            key_part: bs58::encode(public_key.as_bytes()).into_string(),
        }
    }

    /// Parse a DID, checking that the key part decodes to a valid public key
    pub fn parse(s: &str) -> Result<Self, DidError> {
        // Check empty
        if s.is_empty() {
            return Err(DidError::InvalidFormat("DID cannot be empty".into()));
        }

        // Split by ':'
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(DidError::InvalidFormat(format!(
                "Expected 3 parts separated by ':', got {}",
                parts.len()
            )));
        }

        // Check scheme
        if parts[0] != DID_SCHEME {
            return Err(DidError::InvalidFormat(format!(
                "Expected 'did' scheme, got '{}'",
                parts[0]
            )));
        }

        // Check method
        if parts[1] != DID_METHOD {
            return Err(DidError::InvalidMethod(parts[1].to_string()));
        }

        // Check key part is not empty
        if parts[2].is_empty() {
            return Err(DidError::InvalidFormat("Key part cannot be empty".into()));
        }

        let did = Self {
            key_part: parts[2].to_string(),
        };
        // Key part must decode to an ed25519 public key
        did.public_key()?;
        Ok(did)
    }

    pub fn public_key(&self) -> Result<PublicKey, DidError> {
        let bytes = bs58::decode(&self.key_part)
            .into_vec()
            .map_err(|e| DidError::InvalidBase58(e.to_string()))?;

        Ok(PublicKey::from_bytes(&bytes)?)
    }

    pub fn key_part(&self) -> &str {
        &self.key_part
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.key_part[..self.key_part.len().min(8)]
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", DID_SCHEME, DID_METHOD, self.key_part)
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
