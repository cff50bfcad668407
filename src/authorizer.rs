//! operation authorization
//!
//! Once the presented macaroons have been reconciled, any operations they
//! did not cover are put to an [Authorizer], which may consult application
//! state (typically ACLs) and may return further third party caveats that
//! would authorize the operations once discharged.

use async_trait::async_trait;

use crate::checker::Op;
use crate::checkers::Caveat;
use crate::error::Error;
use crate::identity::Identity;

/// The ACL entry that matches any user, authenticated or not.
pub const EVERYONE: &str = "everyone";

/// Decides whether an identity may perform a set of operations.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Checks whether the given identity (absent when no user has
    /// authenticated) is allowed to perform the given operations.
    ///
    /// On success, each element of the returned vector reports whether the
    /// respective operation is allowed, and the caveats hold any
    /// additional third party caveats that apply. Errors are reserved for
    /// failures of the underlying store, not for denied access.
    async fn authorize(
        &self,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error>;
}

/// Authorizes every operation without question.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAuthorizer;

#[async_trait]
impl Authorizer for OpenAuthorizer {
    async fn authorize(
        &self,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        Ok((vec![true; ops.len()], Vec::new()))
    }
}

/// Denies every operation. The default authorizer: with it, only the
/// presented macaroons can authorize anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosedAuthorizer;

#[async_trait]
impl Authorizer for ClosedAuthorizer {
    async fn authorize(
        &self,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        Ok((vec![false; ops.len()], Vec::new()))
    }
}

/// Authorizes operations by ACL membership.
///
/// The `get_acls` function returns the ACL applying to each requested
/// operation; an operation is allowed when the authenticated identity
/// reports membership (see [crate::identity::ACLIdentity]), or, with
/// `allow_public` set, when the ACL contains [EVERYONE] even without an
/// authenticated user.
pub struct ACLAuthorizer<F> {
    pub allow_public: bool,
    pub get_acls: F,
}

#[async_trait]
impl<F> Authorizer for ACLAuthorizer<F>
where
    F: Fn(&[Op]) -> Result<Vec<Vec<String>>, Error> + Send + Sync,
{
    async fn authorize(
        &self,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        if ops.is_empty() {
            // Anyone is allowed to do nothing.
            return Ok((Vec::new(), Vec::new()));
        }
        let acls = (self.get_acls)(ops)?;
        if acls.len() != ops.len() {
            return Err(Error::Identity(format!(
                "mismatched ACLs {:?} for requested operations {:?}",
                acls, ops
            )));
        }
        let acl_identity = identity.and_then(|id| id.as_acl_identity());
        let mut allowed = Vec::with_capacity(acls.len());
        for acl in &acls {
            let ok = match acl_identity {
                Some(id) => id.allow(acl)?,
                None => self.allow_public && acl.iter().any(|entry| entry == EVERYONE),
            };
            allowed.push(ok);
        }
        Ok((allowed, Vec::new()))
    }
}
