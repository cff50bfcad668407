//! agent (non-interactive) login

mod common;

use std::sync::Arc;

use macaroon_bakery::checkers::CheckContext;
use macaroon_bakery::httpbakery::agent::{self, AgentInteractionHandler};
use macaroon_bakery::httpbakery::{Client, DischargerParams};
use macaroon_bakery::{
    bakerytest, Bakery, BakeryParams, Error, KeyPair, Op, ThirdPartyInfo, ThirdPartyStore,
    LATEST_VERSION,
};

use common::TestIdentityClient;

async fn start_agent_discharger(handler: Arc<AgentInteractionHandler>) -> bakerytest::Discharger {
    bakerytest::Discharger::start(DischargerParams {
        interactors: vec![handler],
        ..DischargerParams::default()
    })
    .await
}

#[tokio::test]
async fn agent_login_yields_identity() {
    let agent_key = KeyPair::new();
    let handler = Arc::new(AgentInteractionHandler::new());
    handler.register_agent("bob", agent_key.public());
    let discharger = start_agent_discharger(handler).await;

    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );
    let bakery = Bakery::new(BakeryParams {
        location: "http://service.example.com".to_string(),
        key: Some(KeyPair::new()),
        locator: Some(locator),
        identity_client: Some(Arc::new(TestIdentityClient {
            location: Some(discharger.location().to_string()),
        })),
        ..BakeryParams::default()
    });

    // With no macaroons at all, authentication is required: the service
    // answers with the identity caveats to discharge.
    let err = bakery
        .checker()
        .auth(vec![])
        .allow(&CheckContext::new(), &[Op::login()])
        .await
        .unwrap_err();
    let Error::DischargeRequired(required) = err else {
        panic!("expected discharge-required, got {:?}", err);
    };
    assert_eq!(required.ops, vec![Op::login()]);
    assert_eq!(required.caveats.len(), 1);

    // The service would now mint the login macaroon carrying those
    // caveats and hand it to the client.
    let m = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &required.caveats, &required.ops)
        .await
        .unwrap();

    let mut client = Client::new().unwrap();
    client.set_key(agent_key);
    agent::set_up_auth(
        &mut client,
        &discharger.location().parse().unwrap(),
        "bob",
    )
    .unwrap();

    let ms = client.discharge_all(&m).await.unwrap();
    // Primary, the agent discharge, and the local discharge of the
    // key-possession caveat.
    assert_eq!(ms.len(), 3);

    let auth = bakery
        .checker()
        .auth(vec![ms])
        .allow(&CheckContext::new(), &[Op::login()])
        .await
        .unwrap();
    assert_eq!(auth.identity.unwrap().id(), "bob");
}

#[tokio::test]
async fn unknown_agent_is_refused() {
    let agent_key = KeyPair::new();
    let handler = Arc::new(AgentInteractionHandler::new());
    // "bob" is not registered.
    let discharger = start_agent_discharger(handler).await;

    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );
    let bakery = Bakery::new(BakeryParams {
        location: "http://service.example.com".to_string(),
        key: Some(KeyPair::new()),
        locator: Some(locator),
        identity_client: Some(Arc::new(TestIdentityClient {
            location: Some(discharger.location().to_string()),
        })),
        ..BakeryParams::default()
    });

    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[macaroon_bakery::checkers::Caveat::third_party(
                discharger.location(),
                "is-authenticated-user",
            )],
            &[Op::login()],
        )
        .await
        .unwrap();

    let mut client = Client::new().unwrap();
    client.set_key(agent_key);
    agent::set_up_auth(
        &mut client,
        &discharger.location().parse().unwrap(),
        "bob",
    )
    .unwrap();

    assert!(client.discharge_all(&m).await.is_err());
}

#[tokio::test]
async fn agent_needs_matching_private_key() {
    let agent_key = KeyPair::new();
    let handler = Arc::new(AgentInteractionHandler::new());
    handler.register_agent("bob", agent_key.public());
    let discharger = start_agent_discharger(handler).await;

    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );
    let bakery = Bakery::new(BakeryParams {
        location: "http://service.example.com".to_string(),
        key: Some(KeyPair::new()),
        locator: Some(locator),
        ..BakeryParams::default()
    });
    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[macaroon_bakery::checkers::Caveat::third_party(
                discharger.location(),
                "is-authenticated-user",
            )],
            &[Op::login()],
        )
        .await
        .unwrap();

    // The impostor presents bob's username and public key but holds a
    // different private key, so it cannot discharge the local caveat.
    let mut client = Client::new().unwrap();
    client.set_key(KeyPair::new());
    let value = agent::login_cookie_value(&agent::AgentLogin {
        username: "bob".to_string(),
        public_key: agent_key.public(),
    })
    .unwrap();
    client.jar().add_cookie_str(
        &format!("agent-login={}; Path=/", value),
        &discharger.location().parse().unwrap(),
    );
    client.add_interactor(Arc::new(agent::AgentInteractor));

    assert!(client.discharge_all(&m).await.is_err());
}
