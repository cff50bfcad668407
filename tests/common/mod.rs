//! helpers shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use macaroon_bakery::checkers::{Caveat, CheckContext, Checker, Clock};
use macaroon_bakery::{
    Authorizer, Bakery, BakeryParams, Error, Identity, IdentityClient, Op, SimpleIdentity,
    ThirdPartyLocator,
};

/// An identity client that trusts `declared username <name>` caveats and
/// asks the discharger at `location` to authenticate anyone else.
pub struct TestIdentityClient {
    pub location: Option<String>,
}

#[async_trait]
impl IdentityClient for TestIdentityClient {
    async fn identity_from_context(
        &self,
        _ctx: &CheckContext,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), Error> {
        let caveats = match &self.location {
            Some(location) => vec![Caveat::third_party(
                location.clone(),
                "is-authenticated-user",
            )],
            None => Vec::new(),
        };
        Ok((None, caveats))
    }

    fn declared_identity(
        &self,
        declared: &HashMap<String, String>,
    ) -> Result<Arc<dyn Identity>, Error> {
        match declared.get("username") {
            Some(username) => Ok(Arc::new(SimpleIdentity::new(username.clone()))),
            None => Err(Error::Identity("no username declared".to_string())),
        }
    }
}

/// An authorizer that denies everything but asks for the given caveats,
/// producing discharge-required errors for unauthorized operations.
pub struct CaveatAuthorizer {
    pub caveats: Vec<Caveat>,
}

#[async_trait]
impl Authorizer for CaveatAuthorizer {
    async fn authorize(
        &self,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), Error> {
        Ok((vec![false; ops.len()], self.caveats.clone()))
    }
}

/// A clock pinned to a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A bakery with the given first party checker and locator, suitable for
/// most tests.
pub fn new_bakery(
    location: &str,
    checker: Option<Checker>,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
) -> Bakery {
    Bakery::new(BakeryParams {
        location: location.to_string(),
        key: Some(macaroon_bakery::KeyPair::new()),
        checker,
        locator,
        identity_client: Some(Arc::new(TestIdentityClient { location: None })),
        ..BakeryParams::default()
    })
}

/// Returns a checker that accepts exactly the given conditions, the
/// common test pattern for first party caveats.
pub fn checker_accepting(conditions: &[&'static str]) -> Checker {
    let mut checker = Checker::new();
    for cond in conditions {
        let (name, want_arg) = cond.split_once(' ').unwrap_or((cond, ""));
        checker
            .register(
                name,
                macaroon_bakery::checkers::STD_NAMESPACE,
                Arc::new(move |_ctx, _name, arg| {
                    if arg == want_arg {
                        Ok(())
                    } else {
                        Err(format!("unexpected argument {:?}", arg))
                    }
                }),
            )
            .unwrap();
    }
    checker
}
