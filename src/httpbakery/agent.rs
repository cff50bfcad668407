//! the agent login interaction method
//!
//! Agents authenticate without user interaction. The client stores an
//! `agent-login` cookie naming the agent and its public key on the
//! discharger's origin; a discharger that recognizes the agent answers
//! the discharge attempt with an interaction-required error whose `agent`
//! parameters already carry the discharge macaroon, guarded by a local
//! third party caveat encrypted to the agent's key. Only the holder of
//! the matching private key can discharge that caveat, which the client
//! does locally, completing the login.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::bakery::{self, local_third_party_caveat};
use crate::checkers::declared_caveat;
use crate::crypto::PublicKey;
use crate::discharge::discharge_macaroon;

use super::client::{Client, ClientError, Interactor};
use super::discharger::{DischargeRequestMeta, Discharger, ServerInteractor};
use super::error::Error;

/// the interaction kind implemented by this module
pub const INTERACTION_KIND: &str = "agent";

/// the cookie an agent presents to identify itself
pub const COOKIE_NAME: &str = "agent-login";

/// the contents of the `agent-login` cookie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogin {
    pub username: String,

    #[serde(rename = "public_key")]
    pub public_key: PublicKey,
}

/// the parameters of the `agent` interaction method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionInfo {
    #[serde(rename = "macaroon")]
    pub macaroon: bakery::Macaroon,
}

/// Encodes an [AgentLogin] the way the cookie carries it.
pub fn login_cookie_value(login: &AgentLogin) -> Result<String, ClientError> {
    let encoded =
        serde_json::to_vec(login).map_err(|e| ClientError::Encoding(e.to_string()))?;
    Ok(BASE64.encode(encoded))
}

/// Configures `client` to log in to the discharger at `discharger_url` as
/// the agent `username`: stores the agent cookie on the discharger's
/// origin and registers the agent interactor. The client must already
/// hold the agent's key pair.
pub fn set_up_auth(
    client: &mut Client,
    discharger_url: &Url,
    username: &str,
) -> Result<(), ClientError> {
    let key = client.key().ok_or_else(|| ClientError::Discharge {
        location: discharger_url.to_string(),
        reason: "agent client has no key".to_string(),
    })?;
    let value = login_cookie_value(&AgentLogin {
        username: username.to_string(),
        public_key: key.public(),
    })?;
    client.jar().add_cookie_str(
        &format!("{}={}; Path=/", COOKIE_NAME, value),
        discharger_url,
    );
    client.add_interactor(std::sync::Arc::new(AgentInteractor));
    Ok(())
}

/// Client-side agent interactor: the discharge macaroon arrives inside
/// the interaction parameters, so no further network interaction is
/// needed. Its local third party caveat is discharged later by the
/// client's own key during the normal discharge walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentInteractor;

#[async_trait]
impl Interactor for AgentInteractor {
    fn kind(&self) -> &str {
        INTERACTION_KIND
    }

    async fn interact(
        &self,
        _client: &Client,
        _location: &str,
        err: &Error,
    ) -> Result<bakery::Macaroon, ClientError> {
        let info: InteractionInfo = err
            .interaction_method(INTERACTION_KIND)
            .map_err(ClientError::Response)?;
        Ok(info.macaroon)
    }
}

/// Server-side agent interaction: recognizes registered agents by their
/// cookie and issues the discharge immediately, bound to the agent's key
/// with a local third party caveat and declaring the agent's username.
#[derive(Default)]
pub struct AgentInteractionHandler {
    agents: Mutex<HashMap<String, PublicKey>>,
}

impl AgentInteractionHandler {
    pub fn new() -> AgentInteractionHandler {
        AgentInteractionHandler::default()
    }

    /// Registers an agent allowed to log in to this discharger.
    pub fn register_agent(&self, username: impl Into<String>, key: PublicKey) {
        self.agents
            .lock()
            .expect("agent table lock")
            .insert(username.into(), key);
    }

    fn lookup(&self, username: &str) -> Option<PublicKey> {
        self.agents
            .lock()
            .expect("agent table lock")
            .get(username)
            .cloned()
    }
}

#[async_trait]
impl ServerInteractor for AgentInteractionHandler {
    fn kind(&self) -> &str {
        INTERACTION_KIND
    }

    async fn set_interaction(
        &self,
        discharger: &Discharger,
        req: &DischargeRequestMeta,
        info: &crate::codec::ThirdPartyCaveatInfo,
        discharge_id: &str,
        err: &mut Error,
    ) -> Result<(), Error> {
        // Not an agent client; other interaction methods may still apply.
        let Some(cookie) = req.cookie(COOKIE_NAME) else {
            return Ok(());
        };
        let login = decode_login_cookie(&cookie)?;
        match self.lookup(&login.username) {
            Some(key) if key == login.public_key => {}
            _ => {
                return Err(Error::bad_request(format!(
                    "unknown agent {:?}",
                    login.username
                )))
            }
        }

        let caveats = [
            declared_caveat("username", &login.username),
            local_third_party_caveat(&login.public_key, info.version),
        ];
        let macaroon = discharge_macaroon(
            info,
            &caveats,
            discharger.key(),
            discharger.locator(),
            discharger.location(),
            None,
        )
        .await
        .map_err(|e| Error::bad_request(format!("cannot mint agent discharge: {}", e)))?;

        err.set_interaction(
            INTERACTION_KIND,
            serde_json::to_value(InteractionInfo { macaroon }).unwrap_or_default(),
        );
        // The discharge has been handed over; nothing is left to wait
        // for.
        discharger.remove_interaction(discharge_id);
        Ok(())
    }
}

fn decode_login_cookie(value: &str) -> Result<AgentLogin, Error> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| Error::bad_request(format!("bad agent-login cookie: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::bad_request(format!("bad agent-login cookie: {}", e)))
}
