//! authenticated identities
//!
//! Identity is established out of band by an identity service: a login
//! macaroon discharged by that service carries `declared` caveats naming
//! the user, and the [IdentityClient] turns those declared attributes back
//! into an [Identity] value. Services that do not authenticate users plug
//! in [NoIdentities].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::checkers::{Caveat, CheckContext};
use crate::error::Error;

/// Some user or agent authenticated by a third party.
pub trait Identity: Send + Sync + std::fmt::Debug {
    /// The id of the user, unique within its domain. May be an opaque
    /// blob with no human meaning.
    fn id(&self) -> &str;

    /// The domain of the user; empty when the user was authenticated
    /// directly with the identity provider.
    fn domain(&self) -> &str {
        ""
    }

    /// Access to ACL membership checking, when the implementation
    /// supports it. See [crate::authorizer::ACLAuthorizer].
    fn as_acl_identity(&self) -> Option<&dyn ACLIdentity> {
        None
    }
}

/// An [Identity] that can report membership of access control lists.
pub trait ACLIdentity: Identity {
    /// Reports whether the user matches any entry of the given ACL.
    fn allow(&self, acl: &[String]) -> Result<bool, Error>;
}

/// An [Identity] holding just a user name. Its ACL membership check
/// matches the user name itself and the `everyone` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleIdentity {
    user: String,
}

impl SimpleIdentity {
    pub fn new(user: impl Into<String>) -> SimpleIdentity {
        SimpleIdentity { user: user.into() }
    }
}

impl Identity for SimpleIdentity {
    fn id(&self) -> &str {
        &self.user
    }

    fn as_acl_identity(&self) -> Option<&dyn ACLIdentity> {
        Some(self)
    }
}

impl ACLIdentity for SimpleIdentity {
    fn allow(&self, acl: &[String]) -> Result<bool, Error> {
        Ok(acl
            .iter()
            .any(|entry| entry == crate::authorizer::EVERYONE || entry == &self.user))
    }
}

/// Interactions with the external identity service used for
/// authentication.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Infers an identity from ambient request data without a login
    /// macaroon, along with any caveats that should be attached to a
    /// subsequent discharge-required error asking the user to
    /// authenticate.
    async fn identity_from_context(
        &self,
        ctx: &CheckContext,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), Error>;

    /// Parses the identity declaration from the declared attributes of a
    /// verified login macaroon.
    fn declared_identity(
        &self,
        declared: &HashMap<String, String>,
    ) -> Result<Arc<dyn Identity>, Error>;
}

/// An [IdentityClient] for services with no authentication at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentities;

#[async_trait]
impl IdentityClient for NoIdentities {
    async fn identity_from_context(
        &self,
        _ctx: &CheckContext,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), Error> {
        Ok((None, Vec::new()))
    }

    fn declared_identity(
        &self,
        _declared: &HashMap<String, String>,
    ) -> Result<Arc<dyn Identity>, Error> {
        Err(Error::Identity(
            "no identity declared or possible".to_string(),
        ))
    }
}
