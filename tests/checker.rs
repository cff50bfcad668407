//! authorization checker behavior over minted macaroons

mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use macaroon_bakery::checkers::{self, CheckContext};
use macaroon_bakery::{
    Bakery, BakeryParams, Error, MacaroonOpStore, MemMultiOpStore, Op, LATEST_VERSION,
};

use common::{checker_accepting, new_bakery, FixedClock, TestIdentityClient};

#[tokio::test]
async fn simple_first_party_caveat_authorizes_login() {
    let bakery = Bakery::new(BakeryParams {
        location: "loc".to_string(),
        checker: Some(checker_accepting(&["is something"])),
        identity_client: Some(Arc::new(TestIdentityClient { location: None })),
        ..BakeryParams::default()
    });

    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[
                checkers::Caveat::first_party("is something"),
                checkers::Caveat::first_party("declared username alice"),
            ],
            &[Op::login()],
        )
        .await
        .unwrap();
    let primitive = m.macaroon().clone();

    let auth = bakery
        .checker()
        .auth(vec![vec![primitive.clone()]])
        .allow(&CheckContext::new(), &[Op::login()])
        .await
        .unwrap();

    assert_eq!(auth.macaroons, vec![vec![primitive]]);
    assert_eq!(auth.identity.unwrap().id(), "alice");
}

#[tokio::test]
async fn failing_condition_denies() {
    let bakery = new_bakery("loc", Some(checker_accepting(&["is something"])), None);
    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            None,
            &[checkers::Caveat::first_party("is otherthing")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();

    let err = bakery
        .checker()
        .auth(vec![vec![m.into_macaroon()]])
        .allow(&CheckContext::new(), &[Op::new("file1", "read")])
        .await
        .unwrap_err();
    assert_eq!(err, Error::PermissionDenied);
}

#[tokio::test]
async fn time_before_respects_injected_clock() {
    let expiry = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
    let bakery = new_bakery("loc", None, None);
    let m = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, Some(expiry), &[], &[Op::new("file1", "read")])
        .await
        .unwrap();
    let primitive = m.into_macaroon();

    let before = CheckContext::new()
        .with_clock(Arc::new(FixedClock(expiry - Duration::seconds(1))));
    bakery
        .checker()
        .auth(vec![vec![primitive.clone()]])
        .allow(&before, &[Op::new("file1", "read")])
        .await
        .unwrap();

    let at = CheckContext::new().with_clock(Arc::new(FixedClock(expiry)));
    let err = bakery
        .checker()
        .auth(vec![vec![primitive.clone()]])
        .allow(&at, &[Op::new("file1", "read")])
        .await
        .unwrap_err();
    assert_eq!(err, Error::PermissionDenied);

    let after = CheckContext::new()
        .with_clock(Arc::new(FixedClock(expiry + Duration::seconds(1))));
    assert!(bakery
        .checker()
        .auth(vec![vec![primitive]])
        .allow(&after, &[Op::new("file1", "read")])
        .await
        .is_err());
}

#[tokio::test]
async fn macaroon_cannot_authorize_other_ops() {
    let bakery = new_bakery("loc", None, None);
    let m = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &[Op::new("file1", "read")])
        .await
        .unwrap();

    let err = bakery
        .checker()
        .auth(vec![vec![m.into_macaroon()]])
        .allow(&CheckContext::new(), &[Op::new("file2", "read")])
        .await
        .unwrap_err();
    assert_eq!(err, Error::PermissionDenied);
}

#[tokio::test]
async fn invalid_macaroons_are_skipped_not_fatal() {
    let bakery = new_bakery("loc", None, None);
    let other = new_bakery("loc", None, None);

    // Minted by a different service: wrong root key store.
    let bad = other
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &[Op::new("file1", "read")])
        .await
        .unwrap();
    let good = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &[Op::new("file1", "read")])
        .await
        .unwrap();

    let auth = bakery
        .checker()
        .auth(vec![vec![bad.into_macaroon()], vec![good.macaroon().clone()]])
        .allow(&CheckContext::new(), &[Op::new("file1", "read")])
        .await
        .unwrap();
    assert_eq!(auth.macaroons, vec![vec![good.into_macaroon()]]);
}

#[tokio::test]
async fn first_matching_macaroon_wins() {
    let bakery = new_bakery("loc", None, None);
    let m1 = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &[Op::new("file1", "read")])
        .await
        .unwrap();
    let m2 = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &[Op::new("file1", "read")])
        .await
        .unwrap();

    let auth = bakery
        .checker()
        .auth(vec![
            vec![m1.macaroon().clone()],
            vec![m2.into_macaroon()],
        ])
        .allow(&CheckContext::new(), &[Op::new("file1", "read")])
        .await
        .unwrap();
    assert_eq!(auth.macaroons, vec![vec![m1.into_macaroon()]]);
}

#[tokio::test]
async fn multi_op_macaroon_authorizes_all_its_ops() {
    let bakery = Bakery::new(BakeryParams {
        location: "loc".to_string(),
        ops_store: Some(Arc::new(MemMultiOpStore::new())),
        ..BakeryParams::default()
    });
    let ops = vec![
        Op::new("file1", "read"),
        Op::new("file2", "read"),
        Op::new("file2", "write"),
    ];
    let m = bakery
        .oven()
        .new_macaroon(LATEST_VERSION, None, &[], &ops)
        .await
        .unwrap();
    let primitive = m.into_macaroon();

    bakery
        .checker()
        .auth(vec![vec![primitive.clone()]])
        .allow(&CheckContext::new(), &ops)
        .await
        .unwrap();

    // The recovered op set is exactly the canonical one.
    let (got_ops, _) = bakery
        .oven()
        .macaroon_ops(&[primitive])
        .await
        .unwrap();
    assert_eq!(got_ops, macaroon_bakery::canonical_ops(&ops));
}

#[tokio::test]
async fn allow_capability_squashes_conditions() {
    let early = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
    let bakery = new_bakery("loc", Some(checker_accepting(&["is something"])), None);

    let m1 = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            Some(late),
            &[checkers::Caveat::first_party("is something")],
            &[Op::new("file1", "read")],
        )
        .await
        .unwrap();
    let m2 = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            Some(early),
            &[checkers::Caveat::first_party("is something")],
            &[Op::new("file2", "write")],
        )
        .await
        .unwrap();

    let ctx = CheckContext::new()
        .with_clock(Arc::new(FixedClock(early - Duration::days(1))));
    let conds = bakery
        .checker()
        .auth(vec![vec![m1.into_macaroon()], vec![m2.into_macaroon()]])
        .allow_capability(
            &ctx,
            &[Op::new("file1", "read"), Op::new("file2", "write")],
        )
        .await
        .unwrap();

    // One deduplicated condition plus the earliest expiry.
    assert_eq!(
        conds,
        vec![
            "is something".to_string(),
            format!(
                "time-before {}",
                early.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
            ),
        ]
    );
}

#[tokio::test]
async fn capability_requires_a_non_login_op() {
    let bakery = new_bakery("loc", None, None);
    let err = bakery
        .checker()
        .auth(vec![])
        .allow_capability(&CheckContext::new(), &[Op::login()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOp(_)));
}

#[tokio::test]
async fn macaroon_ops_round_trip_reports_conditions() {
    // Universal property: ops and conditions come back exactly.
    let bakery = new_bakery("loc", Some(checker_accepting(&["is something"])), None);
    let expiry = Utc::now() + Duration::hours(1);
    let ops = vec![Op::new("file1", "read"), Op::new("file1", "write")];
    let m = bakery
        .oven()
        .new_macaroon(
            LATEST_VERSION,
            Some(expiry),
            &[checkers::Caveat::first_party("is something")],
            &ops,
        )
        .await
        .unwrap();

    let (got_ops, conds) = bakery
        .oven()
        .macaroon_ops(&[m.into_macaroon()])
        .await
        .unwrap();
    assert_eq!(got_ops, ops);
    assert_eq!(conds.len(), 2);
    assert!(conds[0].starts_with("time-before "));
    assert_eq!(conds[1], "is something");
}
