//! end-to-end third party discharging over HTTP

mod common;

use std::sync::Arc;

use macaroon_bakery::checkers::{Caveat, CheckContext};
use macaroon_bakery::httpbakery::{
    CheckError, Client, ClientError, DischargerParams, ThirdPartyCaveatCheckerFunc,
};
use macaroon_bakery::{
    bakerytest, Bakery, BakeryParams, Op, ThirdPartyInfo, ThirdPartyStore, LATEST_VERSION,
};

use common::checker_accepting;

fn service(locator: Arc<ThirdPartyStore>) -> Bakery {
    Bakery::new(BakeryParams {
        location: "http://service.example.com".to_string(),
        key: Some(macaroon_bakery::KeyPair::new()),
        checker: Some(checker_accepting(&[])),
        locator: Some(locator),
        ..BakeryParams::default()
    })
}

async fn start_unconditional_discharger() -> bakerytest::Discharger {
    bakerytest::Discharger::start(DischargerParams::default()).await
}

#[tokio::test]
async fn single_third_party_discharge() {
    let discharger = start_unconditional_discharger().await;
    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );
    let bakery = service(locator);

    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[Caveat::third_party(discharger.location(), "anything")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let client = Client::new().unwrap();
    let ms = client.discharge_all(&m).await.unwrap();
    assert_eq!(ms.len(), 2);

    bakery
        .checker()
        .auth(vec![ms])
        .allow(&CheckContext::new(), &[Op::new("file1", "read")])
        .await
        .unwrap();
}

#[tokio::test]
async fn two_level_third_party_chain() {
    // D1 accepts only the condition "xtrue" and emits no further
    // caveats.
    let d1 = bakerytest::Discharger::start(DischargerParams {
        checker: Some(Arc::new(ThirdPartyCaveatCheckerFunc(|info: &macaroon_bakery::ThirdPartyCaveatInfo| {
            if info.condition == "xtrue" {
                Ok(vec![])
            } else {
                Err(CheckError::Refused("caveat refused".to_string()))
            }
        }))),
        ..DischargerParams::default()
    })
    .await;

    // D2 accepts any condition and forwards it to D1 with an "x" prefix.
    let d1_location = d1.location().to_string();
    let d2_locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    d2_locator.add_info(
        d1.location(),
        ThirdPartyInfo {
            public_key: d1.public_key(),
            version: LATEST_VERSION,
        },
    );
    let d2 = bakerytest::Discharger::start(DischargerParams {
        checker: Some(Arc::new(ThirdPartyCaveatCheckerFunc(move |info: &macaroon_bakery::ThirdPartyCaveatInfo| {
            Ok(vec![Caveat::third_party(
                d1_location.clone(),
                format!("x{}", info.condition),
            )])
        }))),
        locator: Some(d2_locator),
        ..DischargerParams::default()
    })
    .await;

    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    for d in [&d1, &d2] {
        locator.add_info(
            d.location(),
            ThirdPartyInfo {
                public_key: d.public_key(),
                version: LATEST_VERSION,
            },
        );
    }
    let bakery = service(locator);

    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[Caveat::third_party(d2.location(), "true")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let client = Client::new().unwrap();
    let ms = client.discharge_all(&m).await.unwrap();
    assert_eq!(ms.len(), 3);

    bakery
        .checker()
        .auth(vec![ms])
        .allow(&CheckContext::new(), &[Op::new("file1", "read")])
        .await
        .unwrap();
}

#[tokio::test]
async fn refused_discharge_surfaces_the_reason() {
    let d1 = bakerytest::Discharger::start(DischargerParams {
        checker: Some(Arc::new(ThirdPartyCaveatCheckerFunc(|info: &macaroon_bakery::ThirdPartyCaveatInfo| {
            if info.condition == "xtrue" {
                Ok(vec![])
            } else {
                Err(CheckError::Refused("caveat refused".to_string()))
            }
        }))),
        ..DischargerParams::default()
    })
    .await;

    let d1_location = d1.location().to_string();
    let d2_locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    d2_locator.add_info(
        d1.location(),
        ThirdPartyInfo {
            public_key: d1.public_key(),
            version: LATEST_VERSION,
        },
    );
    let d2 = bakerytest::Discharger::start(DischargerParams {
        checker: Some(Arc::new(ThirdPartyCaveatCheckerFunc(move |info: &macaroon_bakery::ThirdPartyCaveatInfo| {
            Ok(vec![Caveat::third_party(
                d1_location.clone(),
                format!("x{}", info.condition),
            )])
        }))),
        locator: Some(d2_locator),
        ..DischargerParams::default()
    })
    .await;

    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    for d in [&d1, &d2] {
        locator.add_info(
            d.location(),
            ThirdPartyInfo {
                public_key: d.public_key(),
                version: LATEST_VERSION,
            },
        );
    }
    let bakery = service(locator);

    // "nope" becomes "xnope" at D1, which refuses.
    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[Caveat::third_party(d2.location(), "nope")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let client = Client::new().unwrap();
    let err = client.discharge_all(&m).await.unwrap_err();
    assert!(
        err.to_string()
            .contains("third party refused discharge: caveat refused"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn discharge_all_is_idempotent_for_authorization() {
    let discharger = start_unconditional_discharger().await;
    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );
    let bakery = service(locator);

    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[Caveat::third_party(discharger.location(), "anything")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let client = Client::new().unwrap();
    for _ in 0..2 {
        let ms = client.discharge_all(&m).await.unwrap();
        bakery
            .checker()
            .auth(vec![ms])
            .allow(&CheckContext::new(), &[Op::new("file1", "read")])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn discharge_depth_is_bounded() {
    // A discharger that addresses every discharge back to itself would
    // loop forever without the depth bound.
    let locator = Arc::new(ThirdPartyStore::new().allow_insecure());
    let locator_for_discharger = locator.clone();
    let location_cell = Arc::new(std::sync::OnceLock::<String>::new());
    let location_for_checker = location_cell.clone();

    let discharger = bakerytest::Discharger::start(DischargerParams {
        checker: Some(Arc::new(ThirdPartyCaveatCheckerFunc(move |_info: &macaroon_bakery::ThirdPartyCaveatInfo| {
            let location = location_for_checker.get().expect("location set").clone();
            Ok(vec![Caveat::third_party(location, "again")])
        }))),
        locator: Some(locator_for_discharger),
        ..DischargerParams::default()
    })
    .await;
    location_cell.set(discharger.location().to_string()).unwrap();
    locator.add_info(
        discharger.location(),
        ThirdPartyInfo {
            public_key: discharger.public_key(),
            version: LATEST_VERSION,
        },
    );

    let bakery = service(locator);
    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[Caveat::third_party(discharger.location(), "start")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let client = Client::new().unwrap();
    let err = client.discharge_all(&m).await.unwrap_err();
    assert!(matches!(err, ClientError::TooManyDischarges(_)));
}
