// Identity verification capability
//
// KYC lives outside this crate; the marketplace only asks a yes/no question
// before accepting a bid from a carrier.

use crate::identity::Did;
use std::collections::HashSet;
use std::sync::RwLock;

pub trait IdentityVerifier: Send + Sync {
    fn is_verified(&self, did: &Did) -> bool;
}

/// Treats every identity as verified
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl IdentityVerifier for AllowAll {
    fn is_verified(&self, _did: &Did) -> bool {
        true
    }
}

/// An in-memory allow list
#[derive(Debug, Default)]
pub struct VerifiedSet {
    verified: RwLock<HashSet<Did>>,
}

impl VerifiedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, did: Did) -> Self {
        self.verify(did);
        self
    }

    pub fn verify(&self, did: Did) {
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(did);
    }

    pub fn revoke(&self, did: &Did) {
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(did);
    }
}

impl IdentityVerifier for VerifiedSet {
    fn is_verified(&self, did: &Did) -> bool {
        self.verified
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(did)
    }
}
