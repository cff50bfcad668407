//! the wire error envelope
//!
//! Every error a bakery HTTP endpoint returns is a JSON object
//! `{Code, Message, Info}`. The two codes that drive the protocol are
//! `macaroon discharge required`, which carries a macaroon for the client
//! to discharge and present, and `interaction required`, which carries a
//! map of interaction methods the client may use to satisfy a discharger
//! out of band.

use std::collections::BTreeMap;
use std::fmt::Display;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bakery;
use crate::version::{Version, LATEST_VERSION};

/// The request header carrying the client's bakery protocol version.
/// Absent or malformed means version 0; values beyond the latest known
/// version are clamped.
pub const BAKERY_PROTOCOL_HEADER: &str = "Bakery-Protocol-Version";

/// Classifies an error returned from a bakery HTTP endpoint. The strings
/// are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "bad request")]
    BadRequest,

    #[serde(rename = "macaroon discharge required")]
    DischargeRequired,

    #[serde(rename = "interaction required")]
    InteractionRequired,

    #[serde(rename = "discharger does not provide a supported interaction method")]
    InteractionMethodNotFound,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad request",
            ErrorCode::DischargeRequired => "macaroon discharge required",
            ErrorCode::InteractionRequired => "interaction required",
            ErrorCode::InteractionMethodNotFound => {
                "discharger does not provide a supported interaction method"
            }
        };
        write!(f, "{}", s)
    }
}

/// The JSON body of a bakery HTTP error response.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error, Default)]
#[error("{message}")]
pub struct Error {
    #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,

    #[serde(rename = "Message", default)]
    pub message: String,

    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ErrorInfo>,

    /// The protocol version the error was created for; decides the HTTP
    /// status the error maps to. Not part of the body.
    #[serde(skip)]
    pub version: Version,
}

/// Additional information carried by an [Error].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// A macaroon that, once discharged, may allow access to the service.
    /// Set for `macaroon discharge required` errors.
    #[serde(rename = "Macaroon", default, skip_serializing_if = "Option::is_none")]
    pub macaroon: Option<bakery::Macaroon>,

    /// The URL path the macaroon's cookie should be scoped to. Empty
    /// means the path of the request the error was returned for;
    /// relative paths resolve against that request's URL.
    #[serde(rename = "MacaroonPath", default, skip_serializing_if = "String::is_empty")]
    pub macaroon_path: String,

    /// The cookie is named `macaroon-<suffix>`. When empty, clients
    /// derive the suffix from the macaroon signature.
    #[serde(
        rename = "CookieNameSuffix",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub cookie_name_suffix: String,

    /// The interaction methods the discharger supports, keyed by kind.
    /// The parameter blobs are opaque to everything but the matching
    /// interactor. Set for `interaction required` errors.
    #[serde(
        rename = "InteractionMethods",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub interaction_methods: Option<BTreeMap<String, serde_json::Value>>,

    /// Legacy visit/wait URLs for clients that predate
    /// `InteractionMethods`.
    #[serde(rename = "VisitURL", default, skip_serializing_if = "String::is_empty")]
    pub visit_url: String,

    #[serde(rename = "WaitURL", default, skip_serializing_if = "String::is_empty")]
    pub wait_url: String,
}

/// The interaction parameters of the `browser-window` kind, doubling as
/// the legacy visit/wait form.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VisitWaitParams {
    #[serde(rename = "VisitURL", default)]
    pub visit_url: String,

    #[serde(rename = "WaitURL", default)]
    pub wait_url: String,
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Error {
        Error {
            code: Some(ErrorCode::BadRequest),
            message: message.into(),
            info: None,
            version: LATEST_VERSION,
        }
    }

    /// An error reporting that the client should discharge the given
    /// macaroon to allow the original request to be accepted. `version`
    /// should come from [request_version] so the HTTP status suits the
    /// client.
    pub fn new_discharge_required(
        macaroon: bakery::Macaroon,
        path: impl Into<String>,
        message: impl Into<String>,
        version: Version,
    ) -> Error {
        Error {
            code: Some(ErrorCode::DischargeRequired),
            message: message.into(),
            info: Some(ErrorInfo {
                macaroon: Some(macaroon),
                macaroon_path: path.into(),
                ..ErrorInfo::default()
            }),
            version,
        }
    }

    /// An error requesting out-of-band interaction from the client. The
    /// returned error supports no interaction kinds yet; interactors add
    /// theirs with [Error::set_interaction].
    pub fn new_interaction_required(message: impl Into<String>, version: Version) -> Error {
        Error {
            code: Some(ErrorCode::InteractionRequired),
            message: message.into(),
            info: None,
            version,
        }
    }

    /// Records the parameters for one interaction kind on an
    /// interaction-required error.
    pub fn set_interaction(&mut self, kind: &str, params: serde_json::Value) {
        self.info
            .get_or_insert_with(ErrorInfo::default)
            .interaction_methods
            .get_or_insert_with(BTreeMap::new)
            .insert(kind.to_string(), params);
    }

    /// Decodes the parameters for the interaction kind, synthesizing
    /// visit/wait parameters from the legacy fields when the error comes
    /// from an old discharger. Fails with
    /// [ErrorCode::InteractionMethodNotFound] when the kind is not
    /// offered.
    pub fn interaction_method<T: DeserializeOwned>(&self, kind: &str) -> Result<T, Error> {
        if self.code != Some(ErrorCode::InteractionRequired) {
            return Err(Error {
                code: None,
                message: format!("not an interaction-required error (code {:?})", self.code),
                info: None,
                version: self.version,
            });
        }
        let info = self.info.as_ref();
        let methods = info.and_then(|info| info.interaction_methods.as_ref());
        let value = match methods.and_then(|methods| methods.get(kind)) {
            Some(value) => value.clone(),
            None => {
                let visit_url = info.map(|info| info.visit_url.as_str()).unwrap_or("");
                if methods.map_or(true, BTreeMap::is_empty) && !visit_url.is_empty() {
                    // Legacy error: pretend it carried the modern form.
                    serde_json::to_value(VisitWaitParams {
                        visit_url: visit_url.to_string(),
                        wait_url: info.map(|info| info.wait_url.clone()).unwrap_or_default(),
                    })
                    .unwrap_or_default()
                } else {
                    return Err(Error {
                        code: Some(ErrorCode::InteractionMethodNotFound),
                        message: format!("interaction method {:?} not found", kind),
                        info: None,
                        version: self.version,
                    });
                }
            }
        };
        serde_json::from_value(value).map_err(|e| Error {
            code: None,
            message: format!("cannot unmarshal data for interaction method {:?}: {}", kind, e),
            info: None,
            version: self.version,
        })
    }

    /// Reports whether the error offers parameters for the given
    /// interaction kind (including the legacy visit/wait form, which any
    /// kind may read).
    pub fn supports_interaction_kind(&self, kind: &str) -> bool {
        let Some(info) = &self.info else {
            return false;
        };
        match &info.interaction_methods {
            Some(methods) if !methods.is_empty() => methods.contains_key(kind),
            _ => !info.visit_url.is_empty(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, authenticate) = match self.code {
            Some(ErrorCode::BadRequest) => (StatusCode::BAD_REQUEST, false),
            Some(ErrorCode::DischargeRequired) | Some(ErrorCode::InteractionRequired) => {
                match self.version {
                    Version::V0 => (StatusCode::PROXY_AUTHENTICATION_REQUIRED, false),
                    _ => (StatusCode::UNAUTHORIZED, true),
                }
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
        };
        let mut response = (status, Json(self)).into_response();
        if authenticate {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Macaroon"));
        }
        response
    }
}

/// Determines the bakery protocol version from a client request's
/// headers.
pub fn request_version(headers: &HeaderMap) -> Version {
    let Some(value) = headers.get(BAKERY_PROTOCOL_HEADER) else {
        return Version::V0;
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .map(Version::from_u32_clamped)
        .unwrap_or(Version::V0)
}
