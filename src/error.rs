//! error types
//!

use thiserror::Error;

use crate::checker::Op;
use crate::checkers::Caveat;

/// the global error type for bakery operations
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    /// A macaroon or one of its discharges failed signature or structural
    /// verification. The presented bundle is rejected and retrying with the
    /// same bundle cannot succeed.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Authorization needs further macaroons; the caller should mint a
    /// macaroon with the given caveats and present it on retry.
    #[error("{}", .0.message)]
    DischargeRequired(DischargeRequiredError),

    /// Authoritative refusal; no further discharging will help.
    #[error("permission denied")]
    PermissionDenied,

    /// A key, id or location was unknown. When encountered mid-verification
    /// this is treated like a verification failure; at mint time it is a
    /// configuration error.
    #[error("not found")]
    NotFound,

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("invalid namespace registration: {0}")]
    InvalidNamespace(String),

    #[error("cannot add third party caveat: {0}")]
    CannotAddCaveat(String),

    #[error(transparent)]
    Caveat(#[from] CaveatError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error("could not determine identity: {0}")]
    Identity(String),

    #[error(transparent)]
    Macaroon(#[from] crate::macaroon::MacaroonError),

    #[error("third party refused discharge: {0}")]
    DischargeRefused(String),
}

impl Error {
    /// Reports whether the error asks the client to acquire more discharge
    /// macaroons before retrying.
    pub fn is_discharge_required(&self) -> bool {
        matches!(self, Error::DischargeRequired(_))
    }
}

/// Returned when a set of requested operations could not be authorized with
/// the presented macaroons. Adding a macaroon minted for `ops` carrying
/// `caveats` allows authorization to proceed.
#[derive(Clone, Debug, PartialEq)]
pub struct DischargeRequiredError {
    pub message: String,
    /// The operations that remain to be authorized.
    pub ops: Vec<Op>,
    /// The caveats that the new macaroon must carry.
    pub caveats: Vec<Caveat>,
}

impl From<DischargeRequiredError> for Error {
    fn from(e: DischargeRequiredError) -> Self {
        Error::DischargeRequired(e)
    }
}

/// errors raised while checking individual first party caveats
#[derive(Error, Clone, Debug, PartialEq)]
pub enum CaveatError {
    /// The condition name is not registered in any known namespace. This is
    /// distinguished so that a verifier holding several checkers can try
    /// another one.
    #[error("caveat not recognized")]
    NotRecognized,

    #[error("cannot parse caveat {0:?}")]
    BadCaveat(String),

    #[error("caveat {caveat:?} not satisfied: {reason}")]
    NotSatisfied { caveat: String, reason: String },
}

impl CaveatError {
    pub(crate) fn not_satisfied(caveat: impl Into<String>, reason: impl Into<String>) -> Self {
        CaveatError::NotSatisfied {
            caveat: caveat.into(),
            reason: reason.into(),
        }
    }
}

/// errors from a root key or multi-op store
#[derive(Error, Clone, Debug, PartialEq)]
pub enum StoreError {
    #[error("item not found in store")]
    NotFound,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// errors from a third party locator
#[derive(Error, Clone, Debug, PartialEq)]
pub enum LocatorError {
    #[error("cannot find public key for location {0:?}")]
    NotFound(String),

    #[error("untrusted third party location {0:?}")]
    InsecureLocation(String),

    #[error("cannot fetch third party info from {location:?}: {reason}")]
    Transport { location: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format_strings() {
        assert_eq!(
            format!(
                "{}",
                Error::DischargeRequired(DischargeRequiredError {
                    message: "authentication required".to_string(),
                    ops: vec![],
                    caveats: vec![],
                })
            ),
            "authentication required"
        );

        assert_eq!(
            format!("{}", CaveatError::not_satisfied("time-before x", "bad time")),
            "caveat \"time-before x\" not satisfied: bad time"
        );

        assert_eq!(
            format!("{}", Error::DischargeRefused("caveat refused".to_string())),
            "third party refused discharge: caveat refused"
        );
    }
}
