// Error taxonomy shared by the marketplace, escrow and ledger services
//
// Each service keeps its own error enum; `kind()` on every one of them maps
// the variant onto this closed set so clients can branch on the tag.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed arguments
    InvalidInput,
    /// Unknown id
    NotFound,
    /// Caller lacks the required role or signature
    Unauthorized,
    /// Operation not legal in the entity's current status
    InvalidState,
    InsufficientBalance,
    ThresholdNotMet,
    /// Persistence fault; the call may be retried
    Storage,
}

impl ErrorKind {
    /// Whether a relay may retry the call that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Storage)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::InsufficientBalance => "InsufficientBalance",
            ErrorKind::ThresholdNotMet => "ThresholdNotMet",
            ErrorKind::Storage => "Storage",
        };
        f.write_str(tag)
    }
}

/// Implemented by every service error enum
pub trait ServiceError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}
