// Capabilities - centralised role checks
//
// Roles are fixed for the life of a process: admins, dispute resolvers,
// treasury signers and operators (trusted service identities). Party roles
// (shipper, carrier, warehouse) come from the entity being acted on.

use crate::identity::{Caller, Did};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{caller} lacks the {required} role")]
pub struct AccessDenied {
    pub caller: Did,
    pub required: &'static str,
}

impl AccessDenied {
    fn new(caller: &Caller, required: &'static str) -> Self {
        Self {
            caller: caller.did().clone(),
            required,
        }
    }
}

/// Role assignments consulted by every mutating call
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    admins: BTreeSet<Did>,
    resolvers: BTreeSet<Did>,
    signers: BTreeSet<Did>,
    operators: BTreeSet<Did>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, did: Did) -> Self {
        self.admins.insert(did);
        self
    }

    pub fn with_resolver(mut self, did: Did) -> Self {
        self.resolvers.insert(did);
        self
    }

    pub fn with_signer(mut self, did: Did) -> Self {
        self.signers.insert(did);
        self
    }

    pub fn with_operator(mut self, did: Did) -> Self {
        self.operators.insert(did);
        self
    }

    pub fn is_admin(&self, did: &Did) -> bool {
        self.admins.contains(did)
    }

    pub fn is_operator(&self, did: &Did) -> bool {
        self.operators.contains(did)
    }

    pub fn is_signer(&self, did: &Did) -> bool {
        self.signers.contains(did)
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    // ========================================================================
    // CHECKS
    // ========================================================================

    pub fn admin(&self, caller: &Caller) -> Result<(), AccessDenied> {
        if self.is_admin(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "admin"))
        }
    }

    /// The shipper named on the entity, or an admin
    pub fn shipper_of(&self, caller: &Caller, shipper: &Did) -> Result<(), AccessDenied> {
        if caller.did() == shipper || self.is_admin(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "shipper"))
        }
    }

    /// The carrier named on the entity, or an admin
    pub fn carrier_of(&self, caller: &Caller, carrier: &Did) -> Result<(), AccessDenied> {
        if caller.did() == carrier || self.is_admin(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "carrier"))
        }
    }

    /// Strictly one of the two parties; admins are not parties
    pub fn party_to(
        &self,
        caller: &Caller,
        shipper: &Did,
        carrier: &Did,
    ) -> Result<(), AccessDenied> {
        if caller.did() == shipper || caller.did() == carrier {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "party"))
        }
    }

    pub fn resolver(&self, caller: &Caller) -> Result<(), AccessDenied> {
        if self.resolvers.contains(caller.did()) || self.is_admin(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "resolver"))
        }
    }

    /// Treasury signers only; admins do not approve withdrawals
    pub fn signer(&self, caller: &Caller) -> Result<(), AccessDenied> {
        if self.is_signer(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "signer"))
        }
    }

    pub fn operator(&self, caller: &Caller) -> Result<(), AccessDenied> {
        if self.is_operator(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "operator"))
        }
    }

    /// The party itself, or an operator acting on its behalf
    pub fn operator_for(&self, caller: &Caller, party: &Did) -> Result<(), AccessDenied> {
        if caller.did() == party || self.is_operator(caller.did()) {
            Ok(())
        } else {
            Err(AccessDenied::new(caller, "operator"))
        }
    }
}
