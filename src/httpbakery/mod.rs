//! the bakery over HTTP
//!
//! This module carries the wire protocol that turns the core bakery into
//! a distributed system:
//!
//! * a [Client] that runs HTTP requests, reacts to discharge-required
//!   errors by collecting discharge macaroons (driving [Interactor]s when
//!   a discharger demands user interaction) and retrying with the bundle
//!   attached as a cookie;
//! * a [Discharger] service exposing `POST /discharge` and
//!   `GET /publickey`, with a pluggable third party caveat checker and an
//!   interactive discharge state machine;
//! * the JSON error envelope both sides speak, and the request checkers
//!   (`client-ip-addr`, `origin`) that tie macaroons to HTTP requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkers::{self, Caveat, Namespace};
use crate::crypto::PublicKey;
use crate::error::LocatorError;
use crate::locator::ThirdPartyInfo;
use crate::macaroon::Macaroon;
use crate::version::{Version, LATEST_VERSION};

pub mod agent;
pub mod browser;
mod client;
mod discharger;
mod error;

pub use browser::{VisitWaitHandler, WebBrowserInteractor};
pub use client::{
    macaroons_for_request, macaroons_for_url, set_cookie, Client, ClientError, Interactor,
};
pub use discharger::{
    CheckError, DischargeRequestMeta, Discharger, DischargerParams, ServerInteractor,
    ThirdPartyCaveatChecker, ThirdPartyCaveatCheckerFunc,
};
pub use error::{
    request_version, Error, ErrorCode, ErrorInfo, VisitWaitParams, BAKERY_PROTOCOL_HEADER,
};

/// the URI of the HTTP request checkers namespace
pub const CHECKERS_NAMESPACE: &str = "httpbakery";

pub const COND_CLIENT_IP_ADDR: &str = "client-ip-addr";
pub const COND_ORIGIN: &str = "origin";

/// Returns a first party caveat checker with both the standard conditions
/// and the HTTP request conditions registered. The HTTP conditions check
/// request metadata carried in the
/// [CheckContext](crate::checkers::CheckContext).
pub fn new_checker() -> checkers::Checker {
    let mut checker = checkers::Checker::new();
    checker
        .register_namespace(CHECKERS_NAMESPACE, "http")
        .expect("static namespace registration");
    checker
        .register(
            COND_CLIENT_IP_ADDR,
            CHECKERS_NAMESPACE,
            Arc::new(|ctx, _name, arg| {
                let want: std::net::IpAddr = arg
                    .parse()
                    .map_err(|_| format!("cannot parse IP address {:?}", arg))?;
                match ctx.client_ip() {
                    Some(got) if got == want => Ok(()),
                    Some(got) => Err(format!("client IP address mismatch, got {}", got)),
                    None => Err("client has no remote address".to_string()),
                }
            }),
        )
        .expect("static checker registration");
    checker
        .register(
            COND_ORIGIN,
            CHECKERS_NAMESPACE,
            Arc::new(|ctx, _name, arg| match ctx.origin() {
                Some(got) if got == arg => Ok(()),
                Some(got) => Err(format!("request has invalid Origin header; got {:?}", got)),
                None => Err("request has no Origin header".to_string()),
            }),
        )
        .expect("static checker registration");
    checker
}

/// Returns a caveat that binds a macaroon to the client IP address.
pub fn client_ip_addr_caveat(ip: std::net::IpAddr) -> Caveat {
    Caveat {
        condition: format!("{} {}", COND_CLIENT_IP_ADDR, ip),
        namespace: Some(CHECKERS_NAMESPACE.to_string()),
        location: None,
    }
}

/// Returns a caveat that binds a macaroon to the request Origin header.
pub fn origin_caveat(origin: &str) -> Caveat {
    Caveat {
        condition: format!("{} {}", COND_ORIGIN, origin),
        namespace: Some(CHECKERS_NAMESPACE.to_string()),
        location: None,
    }
}

/// Returns the earliest `time-before` expiry found across all macaroons
/// of the slice, if any. This bounds the lifetime of a cookie storing the
/// slice.
pub fn macaroons_expiry_time(ns: &Namespace, ms: &[Macaroon]) -> Option<DateTime<Utc>> {
    let time_before = ns
        .resolve_caveat(checkers::STD_NAMESPACE, checkers::COND_TIME_BEFORE)
        .unwrap_or_else(|| checkers::COND_TIME_BEFORE.to_string());
    let mut expiry: Option<DateTime<Utc>> = None;
    for m in ms {
        for caveat in m.caveats() {
            if caveat.is_third_party() {
                continue;
            }
            let Ok(cond) = std::str::from_utf8(&caveat.id) else {
                continue;
            };
            let Ok((name, arg)) = checkers::parse_caveat(cond) else {
                continue;
            };
            if name != time_before {
                continue;
            }
            let Ok(t) = DateTime::parse_from_rfc3339(arg) else {
                continue;
            };
            let t = t.with_timezone(&Utc);
            if expiry.map_or(true, |prev| t < prev) {
                expiry = Some(t);
            }
        }
    }
    expiry
}

/// The body of `GET /publickey` and `GET /discharge/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    #[serde(rename = "PublicKey")]
    pub public_key: PublicKey,

    #[serde(rename = "Version", default)]
    pub version: Version,
}

/// A [crate::locator::ThirdPartyLocator] that asks dischargers for their
/// own information over HTTP and caches the answers.
pub struct ThirdPartyLocator {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, ThirdPartyInfo>>,
    allow_insecure: bool,
}

impl ThirdPartyLocator {
    pub fn new(http: reqwest::Client) -> ThirdPartyLocator {
        ThirdPartyLocator {
            http,
            cache: Mutex::new(HashMap::new()),
            allow_insecure: false,
        }
    }

    /// Permits resolving non-HTTPS locations. Intended for tests.
    pub fn allow_insecure(mut self) -> ThirdPartyLocator {
        self.allow_insecure = true;
        self
    }
}

#[async_trait]
impl crate::locator::ThirdPartyLocator for ThirdPartyLocator {
    async fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, LocatorError> {
        if !self.allow_insecure && !location.starts_with("https://") {
            return Err(LocatorError::InsecureLocation(location.to_string()));
        }
        let location = location.trim_end_matches('/');
        if let Some(info) = self
            .cache
            .lock()
            .expect("third party info cache lock")
            .get(location)
        {
            return Ok(info.clone());
        }

        let transport_err = |e: reqwest::Error| LocatorError::Transport {
            location: location.to_string(),
            reason: e.to_string(),
        };
        let response = self
            .http
            .get(format!("{}/discharge/info", location))
            .send()
            .await
            .map_err(transport_err)?;
        let info = if response.status().is_success() {
            let body: PublicKeyResponse = response.json().await.map_err(transport_err)?;
            ThirdPartyInfo {
                public_key: body.public_key,
                version: body.version,
            }
        } else {
            // Legacy dischargers predate /discharge/info.
            let response = self
                .http
                .get(format!("{}/publickey", location))
                .send()
                .await
                .map_err(transport_err)?;
            if !response.status().is_success() {
                return Err(LocatorError::NotFound(location.to_string()));
            }
            let body: PublicKeyResponse = response.json().await.map_err(transport_err)?;
            ThirdPartyInfo {
                public_key: body.public_key,
                version: Version::V1,
            }
        };

        self.cache
            .lock()
            .expect("third party info cache lock")
            .insert(location.to_string(), info.clone());
        Ok(info)
    }
}

/// The body of a successful `POST /discharge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DischargeResponse {
    #[serde(rename = "Macaroon")]
    pub macaroon: crate::bakery::Macaroon,
}

/// The body of a successful `GET /wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    #[serde(rename = "Macaroon")]
    pub macaroon: crate::bakery::Macaroon,
}

pub(crate) fn latest_version_header() -> String {
    LATEST_VERSION.as_u32().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::checkers::CheckContext;

    #[test]
    fn http_conditions_are_prefixed() {
        let caveat = client_ip_addr_caveat(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(caveat.condition, "client-ip-addr 127.0.0.1");
        assert_eq!(caveat.namespace.as_deref(), Some(CHECKERS_NAMESPACE));

        let checker = new_checker();
        let resolved = checker
            .namespace()
            .resolve_caveat(CHECKERS_NAMESPACE, &caveat.condition)
            .unwrap();
        assert_eq!(resolved, "http:client-ip-addr 127.0.0.1");
    }

    #[test]
    fn client_ip_checker() {
        let checker = new_checker();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7));
        let ctx = CheckContext::new().with_client_ip(ip);

        assert!(checker
            .check_first_party_caveat(&ctx, "http:client-ip-addr 192.168.0.7")
            .is_ok());
        assert!(checker
            .check_first_party_caveat(&ctx, "http:client-ip-addr 10.0.0.1")
            .is_err());
        assert!(checker
            .check_first_party_caveat(&CheckContext::new(), "http:client-ip-addr 10.0.0.1")
            .is_err());
    }

    #[test]
    fn origin_checker() {
        let checker = new_checker();
        let ctx = CheckContext::new().with_origin("https://app.example.com");
        assert!(checker
            .check_first_party_caveat(&ctx, "http:origin https://app.example.com")
            .is_ok());
        assert!(checker
            .check_first_party_caveat(&ctx, "http:origin https://evil.example.com")
            .is_err());
    }

    #[test]
    fn expiry_time_scans_the_whole_slice() {
        let ns = checkers::Checker::new().namespace().clone();
        let mut m1 = Macaroon::new(b"k", b"id1".to_vec(), "");
        m1.add_first_party_caveat("time-before 2031-01-01T00:00:00Z");
        let mut m2 = Macaroon::new(b"k", b"id2".to_vec(), "");
        m2.add_first_party_caveat("time-before 2030-01-01T00:00:00Z");
        m2.add_first_party_caveat("other condition");

        let expiry = macaroons_expiry_time(&ns, &[m1, m2]).unwrap();
        assert_eq!(
            expiry,
            DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z").unwrap()
        );

        let plain = Macaroon::new(b"k", b"id3".to_vec(), "");
        assert!(macaroons_expiry_time(&ns, &[plain]).is_none());
    }
}
