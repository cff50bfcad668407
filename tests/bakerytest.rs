//! test discharger lifecycle and the skip-verify toggle

use macaroon_bakery::bakerytest::{insecure_skip_verify, Discharger};
use macaroon_bakery::httpbakery::DischargerParams;

// A single test function: the toggle state is process-wide, and tests
// within one binary run in parallel.
#[tokio::test]
async fn discharger_lifecycle_and_skip_verify_refcount() {
    let original = insecure_skip_verify::active();

    let mut dischargers = Vec::new();
    for _ in 0..3 {
        dischargers.push(Discharger::start(DischargerParams::default()).await);
        assert!(insecure_skip_verify::active());
    }

    // Nested dischargers keep the flag set until the last one goes.
    let client = reqwest::Client::new();
    while let Some(mut d) = dischargers.pop() {
        let url = format!("{}/publickey", d.location());
        assert!(client.get(&url).send().await.unwrap().status().is_success());
        assert!(insecure_skip_verify::active());

        d.stop();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(client.get(&url).send().await.is_err());
    }

    assert_eq!(insecure_skip_verify::active(), original);
}
