//! the authorization decision engine
//!
//! A [Checker] ties together first party caveat checking, identity
//! resolution and operation authorization. For each incoming request the
//! service asks it for an [AuthChecker] over the presented macaroons, then
//! calls [AuthChecker::allow] with the operations the request needs.
//!
//! The auth checker reconciles the bundle exactly once, lazily: each
//! macaroon slice is verified and indexed by the operations its id
//! declares, a login macaroon (one authorizing exactly [Op::login]) is
//! resolved to an [Identity], and invalid macaroons are skipped rather
//! than failing the request, since another slice may still authorize it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::authorizer::{Authorizer, ClosedAuthorizer};
use crate::checkers::{self, CheckContext, Namespace};
use crate::error::{DischargeRequiredError, Error};
use crate::identity::{Identity, IdentityClient, NoIdentities};
use crate::macaroon::Macaroon;

/// An entity and an action to be authorized on it.
///
/// The set of entities and actions is up to the service, but should stay
/// stable over time because authorization tokens record these names.
/// Entity names must not start with `login-` or `multi-`, which are
/// reserved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Op {
    pub entity: String,
    pub action: String,
}

impl Op {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Op {
        Op {
            entity: entity.into(),
            action: action.into(),
        }
    }

    /// The operation marking an authentication macaroon. A macaroon
    /// authorizing it never authorizes anything else.
    pub fn login() -> Op {
        Op::new("login", "login")
    }

    pub fn is_login(&self) -> bool {
        self.entity == "login" && self.action == "login"
    }
}

/// Verifies a presented macaroon bundle and reports the operations it
/// authorizes together with its unchecked first party caveat conditions.
/// [crate::oven::Oven] is the usual implementation.
#[async_trait]
pub trait MacaroonOpStore: Send + Sync {
    async fn macaroon_ops(&self, ms: &[Macaroon]) -> Result<(Vec<Op>, Vec<String>), Error>;
}

/// Configuration for [Checker]. Every field has a closed default: no
/// recognized identities and no authorizer fallback.
pub struct CheckerParams {
    /// First party caveat checker; the standard checkers by default.
    pub checker: Option<checkers::Checker>,

    /// Fallback for operations not covered by any macaroon;
    /// [ClosedAuthorizer] by default.
    pub authorizer: Option<Arc<dyn Authorizer>>,

    /// Client for the external identity service; [NoIdentities] by
    /// default.
    pub identity_client: Option<Arc<dyn IdentityClient>>,

    /// Verifies macaroons and recovers their operations.
    pub macaroon_opstore: Arc<dyn MacaroonOpStore>,
}

/// Authentication and authorization checks over macaroon bundles.
#[derive(Clone)]
pub struct Checker {
    first_party: Arc<checkers::Checker>,
    authorizer: Arc<dyn Authorizer>,
    identity_client: Arc<dyn IdentityClient>,
    macaroon_opstore: Arc<dyn MacaroonOpStore>,
}

impl Checker {
    pub fn new(p: CheckerParams) -> Checker {
        Checker {
            first_party: Arc::new(p.checker.unwrap_or_default()),
            authorizer: p.authorizer.unwrap_or_else(|| Arc::new(ClosedAuthorizer)),
            identity_client: p
                .identity_client
                .unwrap_or_else(|| Arc::new(NoIdentities)),
            macaroon_opstore: p.macaroon_opstore,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        self.first_party.namespace()
    }

    /// Makes a new [AuthChecker] that will use the given macaroon slices
    /// to inform its authorization decisions.
    pub fn auth(&self, macaroons: Vec<Vec<Macaroon>>) -> AuthChecker {
        AuthChecker {
            checker: self.clone(),
            macaroons,
            init: OnceCell::new(),
        }
    }
}

/// The outcome of a successful authorization decision.
#[derive(Clone, Debug)]
pub struct AuthInfo {
    /// The authenticated identity, if authentication took place.
    pub identity: Option<Arc<dyn Identity>>,

    /// The macaroon slices that were actually used; invalid or
    /// unnecessary slices are not included.
    pub macaroons: Vec<Vec<Macaroon>>,
}

struct InitState {
    conditions: Vec<Vec<String>>,
    auth_indexes: HashMap<Op, Vec<usize>>,
    identity: Option<Arc<dyn Identity>>,
    identity_caveats: Vec<checkers::Caveat>,
}

/// Authorizes operations with respect to one request's macaroons.
///
/// The bundle is reconciled once, on the first decision; concurrent
/// callers block until that completes and then observe the same snapshot.
pub struct AuthChecker {
    checker: Checker,
    macaroons: Vec<Vec<Macaroon>>,
    init: OnceCell<Result<InitState, Error>>,
}

impl AuthChecker {
    async fn init(&self, ctx: &CheckContext) -> Result<&InitState, Error> {
        let state = self
            .init
            .get_or_init(|| self.init_once(ctx))
            .await;
        state.as_ref().map_err(Error::clone)
    }

    async fn init_once(&self, ctx: &CheckContext) -> Result<InitState, Error> {
        let mut conditions = vec![Vec::new(); self.macaroons.len()];
        let mut auth_indexes: HashMap<Op, Vec<usize>> = HashMap::new();
        let mut identity: Option<Arc<dyn Identity>> = None;

        for (i, ms) in self.macaroons.iter().enumerate() {
            let (ops, conds) = match self.checker.macaroon_opstore.macaroon_ops(ms).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(slice = i, error = %e, "cannot get macaroon op info");
                    continue;
                }
            };
            // The slice is valid in principle; its first party caveats
            // have not been checked yet.
            if ops.len() == 1 && ops[0].is_login() {
                let declared = match self.check_conditions(ctx, &Op::login(), &conds) {
                    Ok(declared) => declared,
                    Err(e) => {
                        debug!(slice = i, error = %e, "login macaroon caveat check failed");
                        continue;
                    }
                };
                if identity.is_some() {
                    info!("ignoring duplicate authentication macaroon");
                    continue;
                }
                match self.checker.identity_client.declared_identity(&declared) {
                    Ok(id) => identity = Some(id),
                    Err(e) => {
                        debug!(error = %e, "cannot decode declared identity");
                        continue;
                    }
                }
            }
            conditions[i] = conds;
            for op in ops {
                auth_indexes.entry(op).or_default().push(i);
            }
        }

        let mut identity_caveats = Vec::new();
        if identity.is_none() {
            let (ctx_identity, caveats) = self
                .checker
                .identity_client
                .identity_from_context(ctx)
                .await
                .map_err(|e| Error::Identity(e.to_string()))?;
            identity = ctx_identity;
            identity_caveats = caveats;
        }

        Ok(InitState {
            conditions,
            auth_indexes,
            identity,
            identity_caveats,
        })
    }

    /// Checks that the request is authorized to perform all the given
    /// operations.
    ///
    /// If `ops` contains [Op::login], an authentication macaroon proving
    /// the client's identity must be among the presented macaroons.
    ///
    /// On failure the error may be [Error::DischargeRequired], carrying
    /// the operations that remain unauthorized and the caveats a new
    /// macaroon must satisfy for authorization to proceed.
    pub async fn allow(&self, ctx: &CheckContext, ops: &[Op]) -> Result<AuthInfo, Error> {
        let (_, used) = self.allow_any(ctx, ops).await?;
        let state = self.init(ctx).await?;
        Ok(self.new_auth_info(state, &used))
    }

    /// Checks that the request may perform all the given operations and,
    /// on success, returns the first party caveat conditions that a new
    /// "capability" macaroon conferring the same rights must carry.
    ///
    /// The conditions are squashed: only the earliest `time-before`
    /// survives; `allow`, `deny` and `declared` conditions are dropped
    /// because the capability's operations and identity are handled
    /// structurally; the rest are sorted and deduplicated.
    pub async fn allow_capability(
        &self,
        ctx: &CheckContext,
        ops: &[Op],
    ) -> Result<Vec<String>, Error> {
        if !ops.iter().any(|op| !op.is_login()) {
            return Err(Error::InvalidOp(
                "no non-login operations required in capability".to_string(),
            ));
        }
        let (_, used) = self.allow_any(ctx, ops).await?;
        let state = self.init(ctx).await?;
        let mut squasher = CaveatSquasher::default();
        for (i, is_used) in used.iter().enumerate() {
            if !is_used {
                continue;
            }
            for cond in &state.conditions[i] {
                squasher.add(cond);
            }
        }
        Ok(squasher.finalize())
    }

    fn new_auth_info(&self, state: &InitState, used: &[bool]) -> AuthInfo {
        AuthInfo {
            identity: state.identity.clone(),
            macaroons: used
                .iter()
                .enumerate()
                .filter(|(_, is_used)| **is_used)
                .map(|(i, _)| self.macaroons[i].clone())
                .collect(),
        }
    }

    /// Authorizes as many of `ops` as possible, reporting which succeeded
    /// and which macaroon slices were used. An error describes why the
    /// remainder could not be authorized.
    async fn allow_any(
        &self,
        ctx: &CheckContext,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<bool>), Error> {
        let state = self.init(ctx).await?;
        let mut used = vec![false; self.macaroons.len()];
        let mut authed = vec![false; ops.len()];
        let mut num_authed = 0;

        for (i, op) in ops.iter().enumerate() {
            if op.is_login() && ops.len() > 1 {
                // Login is never combined with other operations in one
                // macaroon, so it cannot be authorized here.
                continue;
            }
            let Some(indexes) = state.auth_indexes.get(op) else {
                continue;
            };
            for &mindex in indexes {
                match self.check_conditions(ctx, op, &state.conditions[mindex]) {
                    Ok(_) => {
                        authed[i] = true;
                        num_authed += 1;
                        used[mindex] = true;
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "caveat check failed");
                    }
                }
            }
        }

        if state.identity.is_some() {
            // An authentication macaroon's conditions were already
            // checked during init; record it as used.
            if let Some(&login_index) = state
                .auth_indexes
                .get(&Op::login())
                .and_then(|indexes| indexes.first())
            {
                used[login_index] = true;
            }
        }

        if num_authed == ops.len() {
            return Ok((authed, used));
        }

        let mut need = Vec::new();
        let mut need_index = Vec::new();
        for (i, ok) in authed.iter().enumerate() {
            if !ok {
                need_index.push(i);
                need.push(ops[i].clone());
            }
        }
        debug!(?need, "operations needed after macaroon sweep");

        let (oks, caveats) = self
            .checker
            .authorizer
            .authorize(state.identity.as_deref(), &need)
            .await?;
        if oks.len() != need.len() {
            return Err(Error::Identity(format!(
                "unexpected slice length returned from authorizer (got {}; want {})",
                oks.len(),
                need.len()
            )));
        }

        let mut still_need = Vec::new();
        for (i, ok) in oks.iter().enumerate() {
            if *ok {
                authed[need_index[i]] = true;
            } else {
                still_need.push(ops[need_index[i]].clone());
            }
        }
        if still_need.is_empty() && caveats.is_empty() {
            return Ok((authed, used));
        }
        debug!(?still_need, "operations still needed after authorizer");

        if state.identity.is_none() && !state.identity_caveats.is_empty() {
            return Err(Error::DischargeRequired(DischargeRequiredError {
                message: "authentication required".to_string(),
                ops: vec![Op::login()],
                caveats: state.identity_caveats.clone(),
            }));
        }
        if caveats.is_empty() {
            return Err(Error::PermissionDenied);
        }
        Err(Error::DischargeRequired(DischargeRequiredError {
            message: "some operations have extra caveats".to_string(),
            ops: ops.to_vec(),
            caveats,
        }))
    }

    /// Checks every condition under a context carrying the operation's
    /// action and the attributes the conditions themselves declare,
    /// returning the declared attributes on success.
    fn check_conditions(
        &self,
        ctx: &CheckContext,
        op: &Op,
        conditions: &[String],
    ) -> Result<HashMap<String, String>, Error> {
        let declared = checkers::infer_declared(self.checker.namespace(), conditions);
        let ctx = ctx
            .clone()
            .with_declared(declared.clone())
            .with_operations(vec![op.action.clone()]);
        for cond in conditions {
            self.checker.first_party.check_first_party_caveat(&ctx, cond)?;
        }
        Ok(declared)
    }
}

/// Rationalizes the first party conditions collected for a capability
/// macaroon.
#[derive(Default)]
struct CaveatSquasher {
    expiry: Option<DateTime<Utc>>,
    conds: Vec<String>,
}

impl CaveatSquasher {
    fn add(&mut self, cond: &str) {
        if self.add0(cond) {
            self.conds.push(cond.to_string());
        }
    }

    fn add0(&mut self, cond: &str) -> bool {
        let Ok((name, arg)) = checkers::parse_caveat(cond) else {
            // Unparseable: leave it in place, it will fail checking.
            return true;
        };
        match name {
            checkers::COND_TIME_BEFORE => {
                let Ok(t) = DateTime::parse_from_rfc3339(arg) else {
                    return true;
                };
                let t = t.with_timezone(&Utc);
                if self.expiry.map_or(true, |prev| t < prev) {
                    self.expiry = Some(t);
                }
                false
            }
            checkers::COND_ALLOW | checkers::COND_DENY | checkers::COND_DECLARED => false,
            _ => true,
        }
    }

    fn finalize(mut self) -> Vec<String> {
        if let Some(expiry) = self.expiry {
            self.conds
                .push(checkers::time_before_caveat(expiry).condition);
        }
        self.conds.sort();
        self.conds.dedup();
        self.conds
    }
}
