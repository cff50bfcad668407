//! third party caveat discharging
//!
//! A third party receiving an encrypted caveat id decodes it with its
//! private key, asks a [ThirdPartyCaveatChecker] whether the condition
//! holds, and on success mints a discharge macaroon keyed on the caveat's
//! root key. The discharge may itself carry further caveats, including
//! third party ones, demanded by the checker.

use async_trait::async_trait;

use crate::bakery;
use crate::checkers::{Caveat, CheckContext, Namespace};
use crate::codec;
use crate::crypto::KeyPair;
use crate::error::Error;
use crate::locator::ThirdPartyLocator;

pub use crate::codec::ThirdPartyCaveatInfo;

/// Decides whether a third party caveat addressed to this service holds.
///
/// On success it returns any further caveats to attach to the discharge
/// macaroon; to refuse, it returns an error (conventionally
/// [Error::DischargeRefused]).
#[async_trait]
pub trait ThirdPartyCaveatChecker: Send + Sync {
    async fn check_third_party_caveat(
        &self,
        ctx: &CheckContext,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Error>;
}

/// A [ThirdPartyCaveatChecker] from a plain function.
pub struct ThirdPartyCaveatCheckerFunc<F>(pub F);

#[async_trait]
impl<F> ThirdPartyCaveatChecker for ThirdPartyCaveatCheckerFunc<F>
where
    F: Fn(&ThirdPartyCaveatInfo) -> Result<Vec<Caveat>, Error> + Send + Sync,
{
    async fn check_third_party_caveat(
        &self,
        _ctx: &CheckContext,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Error> {
        (self.0)(info)
    }
}

/// Parameters for [discharge].
pub struct DischargeParams<'a> {
    /// The encrypted caveat id, as received from the client.
    pub id: &'a [u8],

    /// The discharging service's key pair; the caveat id must have been
    /// encrypted to its public key.
    pub key: &'a KeyPair,

    /// Decides whether the caveat's condition holds.
    pub checker: &'a dyn ThirdPartyCaveatChecker,

    /// Used to resolve the locations of any third party caveats the
    /// checker attaches to the discharge.
    pub locator: Option<&'a dyn ThirdPartyLocator>,

    /// The location minted into the discharge macaroon.
    pub location: &'a str,
}

/// Checks a third party caveat and mints the discharge macaroon attesting
/// that its condition held.
///
/// The discharge is keyed on the root key recovered from the caveat id,
/// which is what lets the primary's holder bind it and the first party
/// verify it; its id is the caveat id itself, matching the caveat on the
/// primary.
pub async fn discharge(
    ctx: &CheckContext,
    p: DischargeParams<'_>,
) -> Result<bakery::Macaroon, Error> {
    let info = codec::decode_caveat(p.key, p.id)?;
    let caveats = p.checker.check_third_party_caveat(ctx, &info).await?;
    discharge_macaroon(&info, &caveats, p.key, p.locator, p.location, None).await
}

/// Mints a discharge macaroon for an already-checked caveat, attaching
/// `caveats`. Split out from [discharge] so that interactive dischargers
/// can mint once an out-of-band interaction has resolved the caveats.
pub async fn discharge_macaroon(
    info: &ThirdPartyCaveatInfo,
    caveats: &[Caveat],
    key: &KeyPair,
    locator: Option<&dyn ThirdPartyLocator>,
    location: &str,
    namespace: Option<&Namespace>,
) -> Result<bakery::Macaroon, Error> {
    let ns = namespace.unwrap_or(&info.namespace);
    let mut m = bakery::Macaroon::new(
        &info.root_key,
        info.caveat_id.clone(),
        location,
        info.version,
        ns.clone(),
    );
    m.add_caveats(caveats, Some(key), locator).await?;
    Ok(m)
}
