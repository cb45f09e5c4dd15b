// Access module - AUTHORIZATION
// Role checks and the external identity verification capability

mod capability;
mod verification;

pub use capability::{AccessDenied, Capabilities};
pub use verification::{AllowAll, IdentityVerifier, VerifiedSet};
