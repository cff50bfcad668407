//! in-process dischargers for tests
//!
//! [Discharger] runs a real [httpbakery::Discharger] on an ephemeral
//! local port so that client, discharge protocol and interactors can be
//! exercised end to end. It also owns the process-wide
//! [insecure_skip_verify] toggle that lets test clients talk to
//! self-signed test servers; production code must never touch that
//! module.

use async_trait::async_trait;

use crate::crypto::PublicKey;
use crate::error::LocatorError;
use crate::httpbakery;
use crate::locator::{ThirdPartyInfo, ThirdPartyLocator};

/// A third party discharger listening on an ephemeral local port.
///
/// The server shuts down when the value is dropped. It acquires the
/// [insecure_skip_verify] toggle for its lifetime so that nested test
/// dischargers compose.
pub struct Discharger {
    discharger: httpbakery::Discharger,
    location: String,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Discharger {
    /// Starts a discharger with the given parameters; the location is
    /// assigned from the bound port. Panics if the listener cannot be
    /// bound, as test helpers do.
    pub async fn start(mut p: httpbakery::DischargerParams) -> Discharger {
        insecure_skip_verify::acquire();

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind test discharger listener");
        let addr = listener.local_addr().expect("test discharger address");
        let location = format!("http://{}", addr);

        p.location = location.clone();
        let discharger = httpbakery::Discharger::new(p);
        let router = discharger.router();

        let (shutdown, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .expect("serve test discharger");
        });

        Discharger {
            discharger,
            location,
            shutdown: Some(shutdown),
        }
    }

    /// The discharger's location, e.g. `http://127.0.0.1:39041`.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn public_key(&self) -> PublicKey {
        self.discharger.key().public()
    }

    /// The served discharger, e.g. to finish interactions from a test's
    /// own routes.
    pub fn discharger(&self) -> &httpbakery::Discharger {
        &self.discharger
    }

    /// Shuts the server down. Also happens on drop.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for Discharger {
    fn drop(&mut self) {
        self.stop();
        insecure_skip_verify::release();
    }
}

#[async_trait]
impl ThirdPartyLocator for Discharger {
    /// Resolves the discharger's own location, so a test service can use
    /// the discharger directly as its locator.
    async fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, LocatorError> {
        if location.trim_end_matches('/') == self.location {
            Ok(self.discharger.third_party_info())
        } else {
            Err(LocatorError::NotFound(location.to_string()))
        }
    }
}

/// Returns an HTTP client suitable for talking to test servers: it
/// accepts invalid certificates exactly while [insecure_skip_verify] is
/// active.
pub fn http_client(jar: std::sync::Arc<reqwest::cookie::Jar>) -> reqwest::Client {
    reqwest::Client::builder()
        .cookie_provider(jar)
        .danger_accept_invalid_certs(insecure_skip_verify::active())
        .build()
        .expect("build test http client")
}

/// The process-wide certificate-check override used when test servers
/// present self-signed certificates.
///
/// The flag is reference counted so that nested test dischargers
/// compose: it turns on with the first [acquire](insecure_skip_verify::acquire)
/// and reverts to its original value when the last holder
/// [release](insecure_skip_verify::release)s.
pub mod insecure_skip_verify {
    use std::sync::{Mutex, OnceLock};

    struct State {
        count: usize,
        flag: bool,
        original: bool,
    }

    fn state() -> &'static Mutex<State> {
        static STATE: OnceLock<Mutex<State>> = OnceLock::new();
        STATE.get_or_init(|| {
            Mutex::new(State {
                count: 0,
                flag: false,
                original: false,
            })
        })
    }

    pub fn acquire() {
        let mut state = state().lock().expect("skip-verify state lock");
        if state.count == 0 {
            state.original = state.flag;
            state.flag = true;
        }
        state.count += 1;
    }

    pub fn release() {
        let mut state = state().lock().expect("skip-verify state lock");
        if state.count == 0 {
            return;
        }
        state.count -= 1;
        if state.count == 0 {
            state.flag = state.original;
        }
    }

    pub fn active() -> bool {
        state().lock().expect("skip-verify state lock").flag
    }
}
