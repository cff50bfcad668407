//! the HTTP client against a macaroon-protected service

mod common;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;

use macaroon_bakery::checkers::CheckContext;
use macaroon_bakery::httpbakery::{
    self, macaroons_for_request, request_version, Client, DischargerParams,
    BAKERY_PROTOCOL_HEADER,
};
use macaroon_bakery::{
    bakerytest, Bakery, BakeryParams, Error, KeyPair, Op, ThirdPartyInfo, ThirdPartyStore,
    LATEST_VERSION,
};

use common::CaveatAuthorizer;

struct TestService {
    bakery: Bakery,
}

impl TestService {
    async fn handle(self: Arc<Self>, headers: HeaderMap) -> Result<String, httpbakery::Error> {
        let version = request_version(&headers);
        let bundles = macaroons_for_request(&headers);
        match self
            .bakery
            .checker()
            .auth(bundles)
            .allow(&CheckContext::new(), &[Op::new("test", "access")])
            .await
        {
            Ok(_) => Ok("hello".to_string()),
            Err(Error::DischargeRequired(required)) => {
                let m = self
                    .bakery
                    .oven()
                    .new_macaroon(
                        LATEST_VERSION,
                        Some(chrono::Utc::now() + chrono::Duration::minutes(5)),
                        &required.caveats,
                        &required.ops,
                    )
                    .await
                    .map_err(|e| httpbakery::Error::bad_request(e.to_string()))?;
                Err(httpbakery::Error::new_discharge_required(
                    m,
                    "/",
                    &required.message,
                    version,
                ))
            }
            Err(e) => Err(httpbakery::Error::bad_request(e.to_string())),
        }
    }
}

/// Serves a service whose single operation requires a third party
/// discharge from the given discharger. Returns its base URL.
async fn serve_test_service(discharger: &bakerytest::Discharger) -> String {
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
        authorizer: Some(Arc::new(CaveatAuthorizer {
            caveats: vec![macaroon_bakery::checkers::Caveat::third_party(
                discharger.location(),
                "allowed",
            )],
        })),
        ..BakeryParams::default()
    });
    let service = Arc::new(TestService { bakery });

    let app = Router::new().route(
        "/",
        get(move |headers: HeaderMap| service.clone().handle(headers)),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url
}

#[tokio::test]
async fn client_discharges_and_retries() {
    let discharger = bakerytest::Discharger::start(DischargerParams::default()).await;
    let url = serve_test_service(&discharger).await;

    let client = Client::new().unwrap();
    let response = client.execute(client.get(&url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello");

    // The bundle is now stored as a cookie, so a plain request with the
    // same jar is authorized without any further discharging.
    let response = client.execute(client.get(&url)).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn version0_clients_get_proxy_auth_status() {
    let discharger = bakerytest::Discharger::start(DischargerParams::default()).await;
    let url = serve_test_service(&discharger).await;

    // No protocol version header at all: version 0.
    let plain = reqwest::Client::new();
    let response = plain.get(&url).send().await.unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED
    );
}

#[tokio::test]
async fn version1_clients_get_unauthorized_with_challenge() {
    let discharger = bakerytest::Discharger::start(DischargerParams::default()).await;
    let url = serve_test_service(&discharger).await;

    let plain = reqwest::Client::new();
    let response = plain
        .get(&url)
        .header(BAKERY_PROTOCOL_HEADER, "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok()),
        Some("Macaroon")
    );

    let err: httpbakery::Error = response.json().await.unwrap();
    assert_eq!(err.code, Some(httpbakery::ErrorCode::DischargeRequired));
    assert!(err.info.unwrap().macaroon.is_some());
}

#[tokio::test]
async fn http_locator_fetches_discharger_info() {
    let discharger = bakerytest::Discharger::start(DischargerParams::default()).await;

    let locator = httpbakery::ThirdPartyLocator::new(reqwest::Client::new()).allow_insecure();
    let info = macaroon_bakery::ThirdPartyLocator::third_party_info(
        &locator,
        discharger.location(),
    )
    .await
    .unwrap();
    assert_eq!(info.public_key, discharger.public_key());
    assert_eq!(info.version, LATEST_VERSION);

    // https is required unless explicitly allowed.
    let strict = httpbakery::ThirdPartyLocator::new(reqwest::Client::new());
    assert!(macaroon_bakery::ThirdPartyLocator::third_party_info(
        &strict,
        discharger.location()
    )
    .await
    .is_err());
}
