//! the web browser visit/wait interaction method
//!
//! The discharger offers a `VisitURL` for the user to open in a browser
//! and a `WaitURL` the client long-polls; whatever the visit flow decides
//! is fed back through the discharger's interaction table and the wait
//! request returns the discharge macaroon.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::HeaderMap;
use axum::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::bakery;

use super::client::{Client, ClientError, Interactor};
use super::discharger::{DischargeRequestMeta, Discharger, ServerInteractor};
use super::error::{Error, VisitWaitParams, BAKERY_PROTOCOL_HEADER};
use super::{latest_version_header, WaitResponse};

/// the interaction kind implemented by this module
pub const INTERACTION_KIND: &str = "browser-window";

/// Client-side interactor that opens the discharger's visit URL in a
/// browser (or hands it to a caller-provided opener) and long-polls the
/// wait URL for the discharge macaroon.
pub struct WebBrowserInteractor {
    open: Arc<dyn Fn(&Url) + Send + Sync>,
}

impl WebBrowserInteractor {
    /// An interactor whose opener just tells the user which URL to
    /// visit.
    pub fn new() -> WebBrowserInteractor {
        WebBrowserInteractor {
            open: Arc::new(|url| info!(%url, "open this URL to authorize the request")),
        }
    }

    /// An interactor with a custom opener, e.g. one spawning the system
    /// browser.
    pub fn with_opener(open: Arc<dyn Fn(&Url) + Send + Sync>) -> WebBrowserInteractor {
        WebBrowserInteractor { open }
    }
}

impl Default for WebBrowserInteractor {
    fn default() -> Self {
        WebBrowserInteractor::new()
    }
}

#[async_trait]
impl Interactor for WebBrowserInteractor {
    fn kind(&self) -> &str {
        INTERACTION_KIND
    }

    async fn interact(
        &self,
        client: &Client,
        location: &str,
        err: &Error,
    ) -> Result<bakery::Macaroon, ClientError> {
        let params: VisitWaitParams = err
            .interaction_method(INTERACTION_KIND)
            .map_err(ClientError::Response)?;
        let discharge_err = |reason: String| ClientError::Discharge {
            location: location.to_string(),
            reason,
        };
        if params.visit_url.is_empty() || params.wait_url.is_empty() {
            return Err(discharge_err("no visit or wait URL found".to_string()));
        }

        // The URLs may be relative to the discharger.
        let base: Url = location
            .parse()
            .map_err(|e| discharge_err(format!("bad discharger location: {}", e)))?;
        let visit_url = base
            .join(&params.visit_url)
            .map_err(|e| discharge_err(format!("bad visit URL: {}", e)))?;
        let wait_url = base
            .join(&params.wait_url)
            .map_err(|e| discharge_err(format!("bad wait URL: {}", e)))?;

        (self.open)(&visit_url);

        let response = client
            .http()
            .get(wait_url)
            .header(BAKERY_PROTOCOL_HEADER, latest_version_header())
            .send()
            .await
            .map_err(|e| discharge_err(e.to_string()))?;
        if response.status().is_success() {
            let body: WaitResponse = response
                .json()
                .await
                .map_err(|e| discharge_err(format!("cannot parse wait response: {}", e)))?;
            return Ok(body.macaroon);
        }
        let err: Error = response
            .json()
            .await
            .map_err(|e| discharge_err(format!("cannot parse wait error: {}", e)))?;
        Err(discharge_err(err.message))
    }
}

#[derive(Debug, Deserialize)]
struct DischargeIdQuery {
    dischargeid: String,
}

/// how a visit endpoint resolves an interaction
pub type VisitHandler = Arc<dyn Fn(&Discharger, &str) -> Result<(), Error> + Send + Sync>;

/// Server-side visit/wait interaction: contributes `GET /visit` and
/// `GET /wait` under the discharger and advertises them (plus the legacy
/// visit/wait fields) on interaction-required errors.
pub struct VisitWaitHandler {
    visit: Option<VisitHandler>,
}

impl VisitWaitHandler {
    /// With no visit handler, visiting resolves the interaction
    /// immediately with no further caveats.
    pub fn new() -> VisitWaitHandler {
        VisitWaitHandler { visit: None }
    }

    /// Uses `visit` to decide the interaction when the user arrives at
    /// the visit URL.
    pub fn with_visit_handler(visit: VisitHandler) -> VisitWaitHandler {
        VisitWaitHandler { visit: Some(visit) }
    }
}

impl Default for VisitWaitHandler {
    fn default() -> Self {
        VisitWaitHandler::new()
    }
}

#[async_trait]
impl ServerInteractor for VisitWaitHandler {
    fn kind(&self) -> &str {
        INTERACTION_KIND
    }

    fn handlers(&self, discharger: &Discharger) -> Router {
        let visit = {
            let discharger = discharger.clone();
            let handler = self.visit.clone();
            move |Query(query): Query<DischargeIdQuery>| async move {
                match &handler {
                    Some(handler) => handler(&discharger, &query.dischargeid),
                    None => discharger.finish_interaction(&query.dischargeid, Ok(Vec::new())),
                }
                .map(|_| Json(serde_json::json!({})))
            }
        };
        let wait = {
            let discharger = discharger.clone();
            move |headers: HeaderMap, Query(query): Query<DischargeIdQuery>| async move {
                let meta = DischargeRequestMeta { headers };
                discharger.wait(&meta, &query.dischargeid).await.map(Json)
            }
        };
        Router::new()
            .route("/visit", get(visit))
            .route("/wait", get(wait))
    }

    async fn set_interaction(
        &self,
        discharger: &Discharger,
        _req: &DischargeRequestMeta,
        _info: &crate::codec::ThirdPartyCaveatInfo,
        discharge_id: &str,
        err: &mut Error,
    ) -> Result<(), Error> {
        let base = discharger.location().trim_end_matches('/');
        let visit_url = format!("{}/visit?dischargeid={}", base, discharge_id);
        let wait_url = format!("{}/wait?dischargeid={}", base, discharge_id);

        err.set_interaction(
            INTERACTION_KIND,
            serde_json::to_value(VisitWaitParams {
                visit_url: visit_url.clone(),
                wait_url: wait_url.clone(),
            })
            .unwrap_or_default(),
        );
        // Old clients read the top-level fields instead.
        let info = err.info.get_or_insert_with(Default::default);
        info.visit_url = visit_url;
        info.wait_url = wait_url;
        Ok(())
    }
}
