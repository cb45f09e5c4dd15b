// Identity module - Ed25519 keys, DIDs and authenticated callers

mod caller;
mod did;
mod keypair;
mod signer;

pub use caller::{AuthError, Authenticator, Caller, SignedCall};
pub use did::{Did, DidError};
pub use keypair::{Keypair, KeypairError, PublicKey};
pub use signer::{Signature, SignatureError, Signer};
