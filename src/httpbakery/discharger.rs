//! the discharger service
//!
//! A discharger receives encrypted third party caveat ids on
//! `POST /discharge`, decides them with a pluggable checker and mints
//! discharge macaroons. When the checker cannot decide without user
//! interaction, the caveat is parked in an interaction table under a
//! fresh discharge id and the client receives an interaction-required
//! error; whichever interactor endpoint resolves the interaction feeds
//! the outcome through a one-shot channel to the long-polling `wait`
//! endpoint, which completes the discharge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Form;
use axum::http::HeaderMap;
use axum::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;

use crate::checkers::Caveat;
use crate::codec::{self, ThirdPartyCaveatInfo};
use crate::crypto::KeyPair;
use crate::discharge::discharge_macaroon;
use crate::locator::ThirdPartyLocator;
use crate::version::{Version, LATEST_VERSION};

use super::error::{request_version, Error};
use super::{DischargeResponse, PublicKeyResponse, WaitResponse};

/// the default time a `wait` request blocks before giving up
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request metadata handed to checkers and server interactors: enough to
/// read protocol versions and cookies without tying them to the HTTP
/// framework's request type.
#[derive(Debug, Clone)]
pub struct DischargeRequestMeta {
    pub headers: HeaderMap,
}

impl DischargeRequestMeta {
    pub fn version(&self) -> Version {
        request_version(&self.headers)
    }

    /// Returns the value of the named cookie, if the request carried it.
    pub fn cookie(&self, name: &str) -> Option<String> {
        for value in self.headers.get_all(axum::http::header::COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for pair in value.split(';') {
                let Some((cookie_name, cookie_value)) = pair.trim().split_once('=') else {
                    continue;
                };
                if cookie_name == name {
                    return Some(cookie_value.to_string());
                }
            }
        }
        None
    }
}

/// how a third party caveat check can fail
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// The caveat cannot be decided without out-of-band interaction.
    #[error("interaction required")]
    NeedInteraction,

    /// The third party refuses to discharge.
    #[error("{0}")]
    Refused(String),

    #[error(transparent)]
    Bakery(#[from] crate::error::Error),
}

/// Decides whether a third party caveat addressed to this discharger
/// holds, in the context of the HTTP request presenting it.
#[async_trait]
pub trait ThirdPartyCaveatChecker: Send + Sync {
    async fn check_third_party_caveat(
        &self,
        req: &DischargeRequestMeta,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, CheckError>;
}

/// A [ThirdPartyCaveatChecker] from a plain function.
pub struct ThirdPartyCaveatCheckerFunc<F>(pub F);

#[async_trait]
impl<F> ThirdPartyCaveatChecker for ThirdPartyCaveatCheckerFunc<F>
where
    F: Fn(&ThirdPartyCaveatInfo) -> Result<Vec<Caveat>, CheckError> + Send + Sync,
{
    async fn check_third_party_caveat(
        &self,
        _req: &DischargeRequestMeta,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, CheckError> {
        (self.0)(info)
    }
}

/// A server-side interaction method. Adding a new kind needs only a new
/// implementation here and a matching [super::Interactor] on the client;
/// the checker and oven are untouched.
#[async_trait]
pub trait ServerInteractor: Send + Sync {
    /// The interaction kind, matched against client interactors.
    fn kind(&self) -> &str;

    /// Routes to install under the discharger's router, typically the
    /// endpoints that complete the interaction.
    fn handlers(&self, _discharger: &Discharger) -> Router {
        Router::new()
    }

    /// Populates an interaction-required error with this kind's
    /// parameters for the parked caveat `discharge_id`.
    async fn set_interaction(
        &self,
        discharger: &Discharger,
        req: &DischargeRequestMeta,
        info: &ThirdPartyCaveatInfo,
        discharge_id: &str,
        err: &mut Error,
    ) -> Result<(), Error>;
}

/// the outcome fed from an interaction endpoint to the waiter
type InteractionOutcome = Result<Vec<Caveat>, String>;

struct PendingInteraction {
    info: ThirdPartyCaveatInfo,
    sender: Option<mpsc::Sender<InteractionOutcome>>,
    receiver: Option<mpsc::Receiver<InteractionOutcome>>,
}

/// Configuration for [Discharger].
#[derive(Default)]
pub struct DischargerParams {
    /// The discharger's key pair; generated when absent.
    pub key: Option<KeyPair>,

    /// The location minted into discharge macaroons and used to build
    /// absolute interaction URLs.
    pub location: String,

    /// Decides third party caveats. The default discharges
    /// unconditionally when no interactors are configured, and demands
    /// interaction when some are.
    pub checker: Option<Arc<dyn ThirdPartyCaveatChecker>>,

    /// Resolves further third party caveats attached to discharges.
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,

    /// The interaction methods this discharger supports.
    pub interactors: Vec<Arc<dyn ServerInteractor>>,

    /// How long `wait` blocks before failing; [DEFAULT_WAIT_TIMEOUT]
    /// when absent.
    pub wait_timeout: Option<Duration>,
}

struct DischargerState {
    key: KeyPair,
    location: String,
    checker: Option<Arc<dyn ThirdPartyCaveatChecker>>,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    interactors: Vec<Arc<dyn ServerInteractor>>,
    wait_timeout: Duration,
    interactions: Mutex<HashMap<String, PendingInteraction>>,
    next_discharge_id: AtomicU64,
}

/// An HTTP third party caveat discharger.
#[derive(Clone)]
pub struct Discharger {
    state: Arc<DischargerState>,
}

impl Discharger {
    pub fn new(p: DischargerParams) -> Discharger {
        Discharger {
            state: Arc::new(DischargerState {
                key: p.key.unwrap_or_default(),
                location: p.location,
                checker: p.checker,
                locator: p.locator,
                interactors: p.interactors,
                wait_timeout: p.wait_timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT),
                interactions: Mutex::new(HashMap::new()),
                next_discharge_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn key(&self) -> &KeyPair {
        &self.state.key
    }

    pub fn location(&self) -> &str {
        &self.state.location
    }

    pub fn locator(&self) -> Option<&dyn ThirdPartyLocator> {
        self.state.locator.as_deref()
    }

    /// What a minter needs to address caveats to this discharger.
    pub fn third_party_info(&self) -> crate::locator::ThirdPartyInfo {
        crate::locator::ThirdPartyInfo {
            public_key: self.state.key.public(),
            version: LATEST_VERSION,
        }
    }

    /// Returns the discharger's routes: `POST /discharge`,
    /// `GET /publickey`, `GET /discharge/info` and whatever each
    /// configured interactor contributes.
    pub fn router(&self) -> Router {
        let discharge = {
            let d = self.clone();
            move |headers: HeaderMap, Form(form): Form<DischargeForm>| async move {
                d.handle_discharge(headers, form).await.map(Json)
            }
        };
        let publickey = {
            let d = self.clone();
            move || async move {
                Json(PublicKeyResponse {
                    public_key: d.state.key.public(),
                    version: LATEST_VERSION,
                })
            }
        };
        let info = publickey.clone();

        let mut router = Router::new()
            .route("/discharge", post(discharge))
            .route("/publickey", get(publickey))
            .route("/discharge/info", get(info));
        for interactor in &self.state.interactors {
            router = router.merge(interactor.handlers(self));
        }
        router
    }

    async fn handle_discharge(
        &self,
        headers: HeaderMap,
        form: DischargeForm,
    ) -> Result<DischargeResponse, Error> {
        let meta = DischargeRequestMeta { headers };
        let version = meta.version();

        let id = decode_discharge_id(&form)?;
        let info = codec::decode_caveat(&self.state.key, &id)
            .map_err(|e| Error::bad_request(format!("cannot decode caveat id: {}", e)))?;

        match self.check(&meta, &info).await {
            Ok(caveats) => {
                let m = self.mint(&info, &caveats).await?;
                Ok(DischargeResponse { macaroon: m })
            }
            Err(CheckError::NeedInteraction) => {
                Err(self.interaction_required(&meta, &info, version).await)
            }
            Err(e) => Err(Error {
                code: None,
                message: e.to_string(),
                info: None,
                version,
            }),
        }
    }

    async fn check(
        &self,
        meta: &DischargeRequestMeta,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, CheckError> {
        match &self.state.checker {
            Some(checker) => checker.check_third_party_caveat(meta, info).await,
            // No checker configured: interactive dischargers demand
            // interaction, others discharge unconditionally.
            None if self.state.interactors.is_empty() => Ok(Vec::new()),
            None => Err(CheckError::NeedInteraction),
        }
    }

    async fn interaction_required(
        &self,
        meta: &DischargeRequestMeta,
        info: &ThirdPartyCaveatInfo,
        version: Version,
    ) -> Error {
        if self.state.interactors.is_empty() {
            return Error {
                code: None,
                message: "cannot discharge: interaction required but not supported".to_string(),
                info: None,
                version,
            };
        }
        let discharge_id = self.new_interaction(info.clone());
        let mut err = Error::new_interaction_required("interaction required", version);
        for interactor in &self.state.interactors {
            if let Err(e) = interactor
                .set_interaction(self, meta, info, &discharge_id, &mut err)
                .await
            {
                debug!(kind = interactor.kind(), error = %e, "cannot set interaction");
            }
        }
        err
    }

    async fn mint(
        &self,
        info: &ThirdPartyCaveatInfo,
        caveats: &[Caveat],
    ) -> Result<crate::bakery::Macaroon, Error> {
        discharge_macaroon(
            info,
            caveats,
            &self.state.key,
            self.state.locator.as_deref(),
            &self.state.location,
            None,
        )
        .await
        .map_err(|e| Error {
            code: None,
            message: format!("cannot create macaroon: {}", e),
            info: None,
            version: info.version,
        })
    }

    /// Parks a caveat awaiting interaction, returning its discharge id.
    pub fn new_interaction(&self, info: ThirdPartyCaveatInfo) -> String {
        let discharge_id = self
            .state
            .next_discharge_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (sender, receiver) = mpsc::channel(1);
        self.state
            .interactions
            .lock()
            .expect("interaction table lock")
            .insert(
                discharge_id.clone(),
                PendingInteraction {
                    info,
                    sender: Some(sender),
                    receiver: Some(receiver),
                },
            );
        discharge_id
    }

    /// Resolves a parked interaction with its outcome: either the caveats
    /// to attach to the discharge, or the reason it was refused. A second
    /// call for the same discharge id fails with an
    /// "interaction already finished" error.
    pub fn finish_interaction(
        &self,
        discharge_id: &str,
        outcome: Result<Vec<Caveat>, String>,
    ) -> Result<(), Error> {
        let sender = {
            let mut interactions = self
                .state
                .interactions
                .lock()
                .expect("interaction table lock");
            let pending = interactions.get_mut(discharge_id).ok_or_else(|| {
                Error::bad_request(format!("no such interaction {:?}", discharge_id))
            })?;
            pending.sender.take().ok_or_else(|| {
                Error::bad_request(format!(
                    "interaction already finished for discharge id {:?}",
                    discharge_id
                ))
            })?
        };
        // The channel has capacity 1 and the single sender was just taken,
        // so this send cannot block or fill.
        let _ = sender.try_send(outcome);
        Ok(())
    }

    /// Removes a parked interaction, for interaction methods that resolve
    /// the discharge through other means.
    pub fn remove_interaction(&self, discharge_id: &str) -> Option<ThirdPartyCaveatInfo> {
        self.state
            .interactions
            .lock()
            .expect("interaction table lock")
            .remove(discharge_id)
            .map(|pending| pending.info)
    }

    /// Blocks until the interaction for `discharge_id` is finished, then
    /// completes the discharge: the configured checker is re-run and the
    /// resolved caveats are appended to whatever it returns. Fails after
    /// the configured wait timeout.
    pub async fn wait(
        &self,
        meta: &DischargeRequestMeta,
        discharge_id: &str,
    ) -> Result<WaitResponse, Error> {
        let (info, mut receiver) = {
            let mut interactions = self
                .state
                .interactions
                .lock()
                .expect("interaction table lock");
            let pending = interactions.get_mut(discharge_id).ok_or_else(|| {
                Error::bad_request(format!("no such interaction {:?}", discharge_id))
            })?;
            let receiver = pending.receiver.take().ok_or_else(|| {
                Error::bad_request(format!(
                    "interaction {:?} already has a waiter",
                    discharge_id
                ))
            })?;
            (pending.info.clone(), receiver)
        };

        let outcome = tokio::time::timeout(self.state.wait_timeout, receiver.recv()).await;
        self.remove_interaction(discharge_id);
        let outcome = match outcome {
            Err(_) => {
                return Err(Error {
                    code: None,
                    message: "timeout waiting for interaction to complete".to_string(),
                    info: None,
                    version: meta.version(),
                })
            }
            Ok(None) => {
                return Err(Error::bad_request(format!(
                    "interaction {:?} was abandoned",
                    discharge_id
                )))
            }
            Ok(Some(outcome)) => outcome,
        };

        let mut caveats = match self.check(meta, &info).await {
            Ok(caveats) => caveats,
            // The interaction has already been decided; its outcome
            // stands on its own.
            Err(CheckError::NeedInteraction) => Vec::new(),
            Err(e) => {
                return Err(Error {
                    code: None,
                    message: e.to_string(),
                    info: None,
                    version: meta.version(),
                })
            }
        };
        match outcome {
            Ok(resolved) => caveats.extend(resolved),
            Err(reason) => {
                return Err(Error {
                    code: None,
                    message: reason,
                    info: None,
                    version: meta.version(),
                })
            }
        }

        let macaroon = self.mint(&info, &caveats).await?;
        Ok(WaitResponse { macaroon })
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DischargeForm {
    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    id64: Option<String>,

    /// legacy form used by version 1 clients
    #[serde(default)]
    caveat64: Option<String>,
}

fn decode_discharge_id(form: &DischargeForm) -> Result<Vec<u8>, Error> {
    if let Some(caveat64) = form.caveat64.as_deref().filter(|s| !s.is_empty()) {
        return BASE64
            .decode(caveat64)
            .or_else(|_| BASE64_URL.decode(caveat64))
            .map_err(|e| Error::bad_request(format!("bad caveat64 field: {}", e)));
    }
    if let Some(id64) = form.id64.as_deref().filter(|s| !s.is_empty()) {
        return BASE64_URL
            .decode(id64)
            .or_else(|_| BASE64.decode(id64))
            .map_err(|e| Error::bad_request(format!("bad id64 field: {}", e)));
    }
    if let Some(id) = form.id.as_deref().filter(|s| !s.is_empty()) {
        return hex::decode(id).map_err(|e| Error::bad_request(format!("bad id field: {}", e)));
    }
    Err(Error::bad_request("discharge request with no caveat id"))
}
