//! Macaroon bakery: an authorization framework built on macaroons
//!
//! A macaroon is a chained, cryptographically signed bearer token: anyone
//! holding one can restrict it further by appending caveats, but nobody
//! can widen it. The bakery turns that primitive into an end-to-end
//! authorization system:
//!
//! * the [Oven] mints macaroons whose ids record exactly the operations
//!   (entity/action pairs) they authorize, and attaches first and third
//!   party caveats;
//! * the [Checker] evaluates a bundle of presented macaroons against the
//!   operations a request needs, checks every first party caveat,
//!   authenticates the requester from a login macaroon, and reports what
//!   remains to be discharged;
//! * the [httpbakery] module carries the protocol by which clients obtain
//!   discharge macaroons from third party dischargers over HTTP,
//!   including interactive flows (web browser visit/wait, agent login).
//!
//! Non goals:
//!
//! * This is not a new token format: the primitive in [macaroon] is the
//!   ordinary chained-HMAC construction.
//! * Revocation: expiry comes from `time-before` caveats and from root
//!   key eviction in the [RootKeyStore]; there is no revocation service.
//!
//! # Usage
//!
//! A stand-alone service mints macaroons from its oven and later checks
//! requests that present them:
//!
//! ```rust
//! use macaroon_bakery::checkers::{Caveat, CheckContext};
//! use macaroon_bakery::{Bakery, BakeryParams, Op, LATEST_VERSION};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), macaroon_bakery::Error> {
//! let bakery = Bakery::new(BakeryParams {
//!     location: "https://service.example.com".to_string(),
//!     ..BakeryParams::default()
//! });
//!
//! // Mint a macaroon authorizing one operation, expiring in an hour.
//! let m = bakery
//!     .oven()
//!     .new_macaroon(
//!         LATEST_VERSION,
//!         Some(chrono::Utc::now() + chrono::Duration::hours(1)),
//!         &[Caveat::first_party("declared user alice")],
//!         &[Op::new("file1", "read")],
//!     )
//!     .await?;
//!
//! // A request presenting it is authorized for that operation...
//! let auth = bakery
//!     .checker()
//!     .auth(vec![vec![m.macaroon().clone()]])
//!     .allow(&CheckContext::new(), &[Op::new("file1", "read")])
//!     .await?;
//! assert_eq!(auth.macaroons.len(), 1);
//!
//! // ...and for nothing else.
//! assert!(bakery
//!     .checker()
//!     .auth(vec![vec![m.macaroon().clone()]])
//!     .allow(&CheckContext::new(), &[Op::new("file1", "write")])
//!     .await
//!     .is_err());
//! # Ok(())
//! # }
//! ```
//!
//! # Third party caveats
//!
//! A service adds a third party caveat to delegate part of the decision
//! to another authority: the caveat's id is encrypted to the authority's
//! public key and names a condition only it can check. The client must
//! present a discharge macaroon minted by that authority alongside the
//! primary, bound to it cryptographically. The [httpbakery::Client]
//! automates the whole exchange, including dischargers that require user
//! interaction first.

mod authorizer;
mod bakery;
pub mod bakerytest;
mod checker;
pub mod checkers;
pub mod codec;
mod crypto;
mod discharge;
pub mod error;
pub mod httpbakery;
mod identity;
mod locator;
pub mod macaroon;
mod oven;
mod store;
mod version;

pub use authorizer::{ACLAuthorizer, Authorizer, ClosedAuthorizer, OpenAuthorizer, EVERYONE};
pub use bakery::{
    is_local_location, local_third_party_caveat, Bakery, BakeryParams, Macaroon,
};
pub use checker::{AuthChecker, AuthInfo, Checker, CheckerParams, MacaroonOpStore, Op};
pub use crypto::{KeyPair, PrivateKey, PublicKey};
pub use discharge::{
    discharge, discharge_macaroon, DischargeParams, ThirdPartyCaveatChecker,
    ThirdPartyCaveatCheckerFunc, ThirdPartyCaveatInfo,
};
pub use error::{CaveatError, DischargeRequiredError, Error, LocatorError, StoreError};
pub use identity::{ACLIdentity, Identity, IdentityClient, NoIdentities, SimpleIdentity};
pub use locator::{ThirdPartyInfo, ThirdPartyLocator, ThirdPartyStore};
pub use oven::{canonical_ops, ops_entity, MemMultiOpStore, MultiOpStore, Oven, OvenParams};
pub use store::{MemRootKeyStore, RootKey, RootKeyStore};
pub use version::{Version, LATEST_VERSION};
