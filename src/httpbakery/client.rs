//! the bakery HTTP client
//!
//! [Client] runs requests against bakery-protected services. When a
//! request fails with a discharge-required error, the client walks the
//! macaroon's third party caveats, obtains a discharge for each from the
//! discharger it names (driving [Interactor]s when the discharger demands
//! user interaction), binds the discharges to the primary, stores the
//! bundle as a cookie scoped to the service and retries the request once.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;
use url::Url;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;

use crate::bakery;
use crate::codec;
use crate::crypto::KeyPair;
use crate::discharge::discharge_macaroon;
use crate::macaroon::Macaroon;

use super::error::{Error, ErrorCode, BAKERY_PROTOCOL_HEADER};
use super::{latest_version_header, macaroons_expiry_time, DischargeResponse};

/// the default bound on recursive third party discharge depth
pub const DEFAULT_MAX_DISCHARGE_DEPTH: usize = 10;

/// errors from [Client] operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Bakery(#[from] crate::error::Error),

    /// A discharger refused or failed to produce a discharge macaroon.
    #[error("cannot get discharge from {location:?}: {reason}")]
    Discharge { location: String, reason: String },

    /// The discharge graph exceeded the configured depth bound,
    /// suggesting a discharger addressing caveats to itself.
    #[error("discharge chain too deep (depth limit {0})")]
    TooManyDischarges(usize),

    /// The server returned an error envelope the client cannot act on.
    #[error(transparent)]
    Response(#[from] Error),

    #[error("cannot encode macaroons: {0}")]
    Encoding(String),
}

/// A client-side strategy for completing an interactive discharge,
/// matched to the discharger's offer by its kind string.
#[async_trait]
pub trait Interactor: Send + Sync {
    fn kind(&self) -> &str;

    /// Completes the interaction described by `err` (an
    /// interaction-required error from the discharger at `location`) and
    /// returns the resulting discharge macaroon.
    async fn interact(
        &self,
        client: &Client,
        location: &str,
        err: &Error,
    ) -> Result<bakery::Macaroon, ClientError>;
}

/// An HTTP client that handles macaroon authorization.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    jar: Arc<Jar>,
    key: Option<Arc<KeyPair>>,
    interactors: Vec<Arc<dyn Interactor>>,
    max_discharge_depth: usize,
}

impl Client {
    pub fn new() -> Result<Client, ClientError> {
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()?;
        Ok(Client::with_http_client(http, jar))
    }

    /// Wraps an existing HTTP client. The jar must be the client's cookie
    /// provider, or discharged macaroons will not reach the service.
    pub fn with_http_client(http: reqwest::Client, jar: Arc<Jar>) -> Client {
        Client {
            http,
            jar,
            key: None,
            interactors: Vec::new(),
            max_discharge_depth: DEFAULT_MAX_DISCHARGE_DEPTH,
        }
    }

    /// Sets the client's key pair, used to discharge local third party
    /// caveats (see [bakery::local_third_party_caveat]).
    pub fn set_key(&mut self, key: KeyPair) {
        self.key = Some(Arc::new(key));
    }

    pub fn key(&self) -> Option<&KeyPair> {
        self.key.as_deref()
    }

    /// Registers an interaction strategy. Interactors are consulted in
    /// registration order.
    pub fn add_interactor(&mut self, interactor: Arc<dyn Interactor>) {
        self.interactors.push(interactor);
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Builds a request that will be executed with macaroon handling by
    /// [Client::execute].
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.http.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.http.post(url)
    }

    /// Executes the request. On a discharge-required response the
    /// discharges are acquired, the bound bundle is stored as a
    /// `macaroon-<suffix>` cookie for the request URL, and the request is
    /// retried once; a discharge-required response to the retry is
    /// surfaced as an error.
    pub async fn execute(&self, req: RequestBuilder) -> Result<Response, ClientError> {
        let request = req
            .header(BAKERY_PROTOCOL_HEADER, latest_version_header())
            .build()?;
        let retry = request.try_clone();
        let url = request.url().clone();

        let response = self.http.execute(request).await?;
        let err = match Self::error_envelope(response).await? {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        if err.code != Some(ErrorCode::DischargeRequired) {
            return Err(ClientError::Response(err));
        }
        let Some(retry) = retry else {
            // The request body cannot be replayed.
            return Err(ClientError::Response(err));
        };
        self.handle_discharge_required(&url, err).await?;

        let response = self.http.execute(retry).await?;
        Self::error_envelope(response)
            .await?
            .map_err(ClientError::Response)
    }

    /// Distinguishes an error-envelope response from an ordinary one.
    async fn error_envelope(response: Response) -> Result<Result<Response, Error>, ClientError> {
        if response.status() != StatusCode::UNAUTHORIZED
            && response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED
        {
            return Ok(Ok(response));
        }
        let err: Error = response.json().await?;
        Ok(Err(err))
    }

    async fn handle_discharge_required(&self, url: &Url, err: Error) -> Result<(), ClientError> {
        let info = err.info.unwrap_or_default();
        let Some(primary) = info.macaroon else {
            return Err(ClientError::Discharge {
                location: url.to_string(),
                reason: "no macaroon in discharge-required response".to_string(),
            });
        };
        debug!(%url, "discharging macaroon to retry request");
        let ms = self.discharge_all(&primary).await?;

        let suffix = if info.cookie_name_suffix.is_empty() {
            hex::encode(ms[0].signature())
        } else {
            info.cookie_name_suffix
        };
        let cookie_url = if info.macaroon_path.is_empty() {
            url.clone()
        } else {
            url.join(&info.macaroon_path)
                .map_err(|e| ClientError::Discharge {
                    location: url.to_string(),
                    reason: format!("bad macaroon path: {}", e),
                })?
        };
        let expiry = macaroons_expiry_time(primary.namespace(), &ms);
        set_cookie(self.jar.as_ref(), &cookie_url, &suffix, &ms, expiry)
    }

    /// Obtains discharge macaroons for every third party caveat reachable
    /// from `primary`, breadth first (a discharge may itself carry third
    /// party caveats), and returns the bundle with every discharge bound
    /// to the primary.
    pub async fn discharge_all(
        &self,
        primary: &bakery::Macaroon,
    ) -> Result<Vec<Macaroon>, ClientError> {
        let mut discharges: Vec<Macaroon> = Vec::new();
        let mut queue: VecDeque<(crate::macaroon::Caveat, usize)> = primary
            .macaroon()
            .caveats()
            .iter()
            .filter(|caveat| caveat.is_third_party())
            .cloned()
            .map(|caveat| (caveat, 1))
            .collect();

        while let Some((caveat, depth)) = queue.pop_front() {
            if depth > self.max_discharge_depth {
                return Err(ClientError::TooManyDischarges(self.max_discharge_depth));
            }
            let discharge = self.acquire_discharge(&caveat).await?;
            for sub in discharge
                .macaroon()
                .caveats()
                .iter()
                .filter(|caveat| caveat.is_third_party())
            {
                queue.push_back((sub.clone(), depth + 1));
            }
            discharges.push(discharge.into_macaroon());
        }
        Ok(primary.macaroon().prepare_for_request(&discharges))
    }

    async fn acquire_discharge(
        &self,
        caveat: &crate::macaroon::Caveat,
    ) -> Result<bakery::Macaroon, ClientError> {
        let location = caveat.location.clone().unwrap_or_default();
        if bakery::is_local_location(&location) {
            return self.discharge_local(&location, caveat).await;
        }

        let url = format!("{}/discharge", location.trim_end_matches('/'));
        let discharge_err = |reason: String| ClientError::Discharge {
            location: location.clone(),
            reason,
        };
        let response = self
            .http
            .post(&url)
            .header(BAKERY_PROTOCOL_HEADER, latest_version_header())
            .form(&[("id64", BASE64_URL.encode(&caveat.id))])
            .send()
            .await
            .map_err(|e| discharge_err(e.to_string()))?;

        if response.status().is_success() {
            let body: DischargeResponse = response
                .json()
                .await
                .map_err(|e| discharge_err(format!("cannot parse discharge response: {}", e)))?;
            return Ok(body.macaroon);
        }

        let err: Error = response
            .json()
            .await
            .map_err(|e| discharge_err(format!("cannot parse error response: {}", e)))?;
        if err.code == Some(ErrorCode::InteractionRequired) {
            return self.interact(&location, &err).await;
        }
        Err(discharge_err(format!(
            "third party refused discharge: {}",
            err.message
        )))
    }

    /// Discharges a caveat addressed to the client's own key without any
    /// network round trip.
    async fn discharge_local(
        &self,
        location: &str,
        caveat: &crate::macaroon::Caveat,
    ) -> Result<bakery::Macaroon, ClientError> {
        let discharge_err = |reason: String| ClientError::Discharge {
            location: location.to_string(),
            reason,
        };
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| discharge_err("no key to discharge local caveat".to_string()))?;
        let info = codec::decode_caveat(key, &caveat.id)
            .map_err(|e| discharge_err(e.to_string()))?;
        discharge_macaroon(&info, &[], key, None, "local", None)
            .await
            .map_err(|e| discharge_err(e.to_string()))
    }

    async fn interact(
        &self,
        location: &str,
        err: &Error,
    ) -> Result<bakery::Macaroon, ClientError> {
        for interactor in &self.interactors {
            if !err.supports_interaction_kind(interactor.kind()) {
                continue;
            }
            debug!(kind = interactor.kind(), location, "running interactor");
            return interactor.interact(self, location, err).await;
        }
        Err(ClientError::Discharge {
            location: location.to_string(),
            reason: ErrorCode::InteractionMethodNotFound.to_string(),
        })
    }
}

/// Stores a macaroon bundle as a single `macaroon-<suffix>` cookie for
/// the given URL. The cookie value is the base64 JSON encoding of the
/// bundle; the cookie expires at `expires`, or with the session when
/// absent.
pub fn set_cookie(
    jar: &Jar,
    url: &Url,
    suffix: &str,
    ms: &[Macaroon],
    expires: Option<DateTime<Utc>>,
) -> Result<(), ClientError> {
    let encoded = serde_json::to_vec(ms).map_err(|e| ClientError::Encoding(e.to_string()))?;
    let mut cookie = format!(
        "macaroon-{}={}; Path={}",
        suffix,
        BASE64.encode(encoded),
        url.path()
    );
    if let Some(expires) = expires {
        cookie.push_str(&format!(
            "; Expires={}",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    jar.add_cookie_str(&cookie, url);
    Ok(())
}

/// Returns every macaroon bundle whose cookie matches the URL.
pub fn macaroons_for_url(jar: &Jar, url: &Url) -> Vec<Vec<Macaroon>> {
    let Some(header) = jar.cookies(url) else {
        return Vec::new();
    };
    let Ok(cookies) = header.to_str() else {
        return Vec::new();
    };
    cookies
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            parse_macaroon_cookie(name, value)
        })
        .collect()
}

/// Returns every macaroon bundle presented in a request's Cookie
/// headers. This is how a service recovers the bundles a [Client] stored
/// with [set_cookie].
pub fn macaroons_for_request(headers: &HeaderMap) -> Vec<Vec<Macaroon>> {
    let mut bundles = Vec::new();
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(cookies) = value.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if let Some(ms) = parse_macaroon_cookie(name, value) {
                bundles.push(ms);
            }
        }
    }
    bundles
}

fn parse_macaroon_cookie(name: &str, value: &str) -> Option<Vec<Macaroon>> {
    name.strip_prefix("macaroon-")?;
    let bytes = BASE64.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trip() {
        let jar = Jar::default();
        let url: Url = "http://service.example.com/some/path".parse().unwrap();
        let mut m = Macaroon::new(b"key", b"id".to_vec(), "http://service.example.com");
        m.add_first_party_caveat("is something");

        set_cookie(&jar, &url, "abc", &[m.clone()], None).unwrap();
        let bundles = macaroons_for_url(&jar, &url);
        assert_eq!(bundles, vec![vec![m]]);

        // A URL outside the cookie path sees nothing.
        let other: Url = "http://service.example.com/other".parse().unwrap();
        assert!(macaroons_for_url(&jar, &other).is_empty());
    }

    #[test]
    fn expired_cookie_is_not_returned() {
        let jar = Jar::default();
        let url: Url = "http://service.example.com/".parse().unwrap();
        let m = Macaroon::new(b"key", b"id".to_vec(), "");

        let past = Utc::now() - chrono::Duration::hours(1);
        set_cookie(&jar, &url, "abc", &[m], Some(past)).unwrap();
        assert!(macaroons_for_url(&jar, &url).is_empty());
    }

    #[test]
    fn request_cookie_parsing() {
        let jar = Jar::default();
        let url: Url = "http://service.example.com/".parse().unwrap();
        let m = Macaroon::new(b"key", b"id".to_vec(), "");
        set_cookie(&jar, &url, "abc", &[m.clone()], None).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            jar.cookies(&url).unwrap().to_str().unwrap().parse().unwrap(),
        );
        let bundles = macaroons_for_request(&headers);
        assert_eq!(bundles, vec![vec![m]]);

        // Unrelated cookies are ignored.
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "foo=bar".parse().unwrap());
        assert!(macaroons_for_request(&headers).is_empty());
    }
}
