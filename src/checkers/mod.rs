//! first party caveat checking
//!
//! A [Checker] maps condition names, grouped by namespace, to predicate
//! functions. The standard namespace provides the conditions every bakery
//! participant understands: expiry times, declared attributes, operation
//! allow/deny lists and the always-failing error condition.
//!
//! Conditions are plain strings of the form `<name> [argument]`, where the
//! name may carry a namespace prefix (`http:origin`). The caveat
//! constructors in this module build [Caveat] values for the oven to attach
//! to macaroons.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::CaveatError;

mod namespace;

pub use namespace::Namespace;

/// the URI of the standard checkers namespace
pub const STD_NAMESPACE: &str = "std";

pub const COND_TIME_BEFORE: &str = "time-before";
pub const COND_DECLARED: &str = "declared";
pub const COND_ALLOW: &str = "allow";
pub const COND_DENY: &str = "deny";
pub const COND_ERROR: &str = "error";

/// A first or third party caveat to be attached to a macaroon.
///
/// When `location` is empty the caveat is first party and `condition` is
/// checked directly by the verifying service, written under the namespace
/// identified by `namespace` (the standard namespace when absent).
/// Otherwise the condition must be discharged by the third party at
/// `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    pub condition: String,
    pub namespace: Option<String>,
    pub location: Option<String>,
}

impl Caveat {
    /// a first party caveat in the standard namespace
    pub fn first_party(condition: impl Into<String>) -> Caveat {
        Caveat {
            condition: condition.into(),
            namespace: Some(STD_NAMESPACE.to_string()),
            location: None,
        }
    }

    /// a third party caveat to be discharged at `location`
    pub fn third_party(location: impl Into<String>, condition: impl Into<String>) -> Caveat {
        Caveat {
            condition: condition.into(),
            namespace: None,
            location: Some(location.into()),
        }
    }

    pub fn is_third_party(&self) -> bool {
        matches!(&self.location, Some(loc) if !loc.is_empty())
    }
}

/// Returns a caveat that expires the macaroon at time `t`.
pub fn time_before_caveat(t: DateTime<Utc>) -> Caveat {
    Caveat::first_party(format!(
        "{} {}",
        COND_TIME_BEFORE,
        t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    ))
}

/// Returns a caveat recording a declared key/value attribute.
pub fn declared_caveat(key: &str, value: &str) -> Caveat {
    if key.is_empty() || key.contains(' ') {
        return error_caveat(format!("invalid caveat 'declared' key {:?}", key));
    }
    Caveat::first_party(format!("{} {} {}", COND_DECLARED, key, value))
}

/// Returns a caveat that always fails with the given message. Used to
/// record an error discovered while building caveats, surfacing it at
/// verification time instead.
pub fn error_caveat(msg: impl Into<String>) -> Caveat {
    Caveat::first_party(format!("{} {}", COND_ERROR, msg.into()))
}

/// Returns a caveat restricting the macaroon to the given actions.
pub fn allow_caveat(ops: &[&str]) -> Caveat {
    operation_caveat(COND_ALLOW, ops)
}

/// Returns a caveat forbidding use of the macaroon for the given actions.
pub fn deny_caveat(ops: &[&str]) -> Caveat {
    operation_caveat(COND_DENY, ops)
}

fn operation_caveat(cond: &str, ops: &[&str]) -> Caveat {
    if ops.is_empty() {
        return error_caveat(format!("no operations allowed in {:?} caveat", cond));
    }
    for op in ops {
        if op.is_empty() || op.contains(' ') {
            return error_caveat(format!("invalid operation name {:?}", op));
        }
    }
    Caveat::first_party(format!("{} {}", cond, ops.join(" ")))
}

/// Splits a condition string into its name and argument at the first
/// space. The argument is empty when there is none.
pub fn parse_caveat(caveat: &str) -> Result<(&str, &str), CaveatError> {
    if caveat.is_empty() {
        return Err(CaveatError::BadCaveat("empty caveat".to_string()));
    }
    match caveat.split_once(' ') {
        Some(("", _)) => Err(CaveatError::BadCaveat(caveat.to_string())),
        Some((name, arg)) => Ok((name, arg)),
        None => Ok((caveat, "")),
    }
}

/// Collects the attributes declared by `declared <key> <value>` conditions.
/// A key declared more than once with conflicting values is dropped
/// entirely.
pub fn infer_declared(ns: &Namespace, conditions: &[String]) -> HashMap<String, String> {
    let declared_cond = ns
        .resolve_caveat(STD_NAMESPACE, COND_DECLARED)
        .unwrap_or_else(|| COND_DECLARED.to_string());

    let mut declared = HashMap::new();
    let mut conflicts = Vec::new();
    for cond in conditions {
        let (name, arg) = match parse_caveat(cond) {
            Ok(parts) => parts,
            Err(_) => continue,
        };
        if name != declared_cond {
            continue;
        }
        let Some((key, value)) = arg.split_once(' ') else {
            continue;
        };
        match declared.get(key) {
            Some(prev) if prev != value => conflicts.push(key.to_string()),
            _ => {
                declared.insert(key.to_string(), value.to_string());
            }
        }
    }
    for key in conflicts {
        declared.remove(&key);
    }
    declared
}

/// Wall clock used by the `time-before` checker, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// the real wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Ambient data that first party caveat predicates check against.
///
/// The authorization checker augments a caller-supplied base context with
/// the operation actions and declared attributes of the macaroon under
/// consideration before running its conditions.
#[derive(Clone, Default)]
pub struct CheckContext {
    clock: Option<Arc<dyn Clock>>,
    declared: HashMap<String, String>,
    operations: Vec<String>,
    client_ip: Option<IpAddr>,
    origin: Option<String>,
}

impl CheckContext {
    pub fn new() -> CheckContext {
        CheckContext::default()
    }

    /// Replaces the wall clock, letting tests pin time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> CheckContext {
        self.clock = Some(clock);
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> CheckContext {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> CheckContext {
        self.origin = Some(origin.into());
        self
    }

    pub(crate) fn with_declared(mut self, declared: HashMap<String, String>) -> CheckContext {
        self.declared = declared;
        self
    }

    pub(crate) fn with_operations(mut self, operations: Vec<String>) -> CheckContext {
        self.operations = operations;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock.now(),
            None => Utc::now(),
        }
    }

    pub fn declared(&self) -> &HashMap<String, String> {
        &self.declared
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

/// A predicate over `(context, condition name, argument)`. Returns the
/// reason for refusal on failure.
pub type CheckerFunc =
    Arc<dyn Fn(&CheckContext, &str, &str) -> Result<(), String> + Send + Sync>;

struct CheckerInfo {
    check: CheckerFunc,
}

/// Registry of first party caveat predicates, keyed by prefixed condition
/// name through an owned [Namespace].
pub struct Checker {
    namespace: Namespace,
    checkers: HashMap<String, CheckerInfo>,
}

impl Checker {
    /// Returns a checker with the standard namespace and conditions
    /// registered.
    pub fn new() -> Checker {
        let mut checker = Checker {
            namespace: Namespace::new(),
            checkers: HashMap::new(),
        };
        checker
            .register_namespace(STD_NAMESPACE, "")
            .expect("static namespace registration");
        checker.register_std();
        checker
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Registers a prefix for a namespace URI so that conditions can be
    /// registered and resolved under it.
    pub fn register_namespace(&mut self, uri: &str, prefix: &str) -> Result<(), crate::Error> {
        self.namespace.register(uri, prefix)
    }

    /// Registers the predicate for condition `name` in the namespace
    /// identified by `uri`, which must already be registered.
    pub fn register(
        &mut self,
        name: &str,
        uri: &str,
        check: CheckerFunc,
    ) -> Result<(), crate::Error> {
        let full = self.namespace.resolve_caveat(uri, name).ok_or_else(|| {
            crate::Error::InvalidNamespace(format!(
                "no prefix registered for namespace {:?}",
                uri
            ))
        })?;
        self.checkers.insert(full, CheckerInfo { check });
        Ok(())
    }

    /// Checks a single first party caveat condition against the context.
    pub fn check_first_party_caveat(
        &self,
        ctx: &CheckContext,
        caveat: &str,
    ) -> Result<(), CaveatError> {
        let (name, arg) = parse_caveat(caveat)?;
        let info = self
            .checkers
            .get(name)
            .ok_or(CaveatError::NotRecognized)?;
        (info.check)(ctx, name, arg)
            .map_err(|reason| CaveatError::not_satisfied(caveat, reason))
    }

    fn register_std(&mut self) {
        let entries: [(&str, CheckerFunc); 5] = [
            (COND_TIME_BEFORE, Arc::new(check_time_before)),
            (COND_DECLARED, Arc::new(check_declared)),
            (COND_ALLOW, Arc::new(check_allow)),
            (COND_DENY, Arc::new(check_deny)),
            (COND_ERROR, Arc::new(check_error)),
        ];
        for (name, check) in entries {
            self.register(name, STD_NAMESPACE, check)
                .expect("static checker registration");
        }
    }
}

impl Default for Checker {
    fn default() -> Self {
        Checker::new()
    }
}

fn check_time_before(ctx: &CheckContext, _name: &str, arg: &str) -> Result<(), String> {
    let t = DateTime::parse_from_rfc3339(arg)
        .map_err(|e| format!("cannot parse time: {}", e))?
        .with_timezone(&Utc);
    if ctx.now() >= t {
        return Err("macaroon has expired".to_string());
    }
    Ok(())
}

fn check_declared(ctx: &CheckContext, _name: &str, arg: &str) -> Result<(), String> {
    let (key, value) = arg
        .split_once(' ')
        .ok_or_else(|| format!("declared caveat has no value: {:?}", arg))?;
    match ctx.declared().get(key) {
        Some(actual) if actual == value => Ok(()),
        Some(actual) => Err(format!("got {}={:?}, expected {:?}", key, actual, value)),
        None => Err(format!("got {}=null, expected {:?}", key, value)),
    }
}

fn check_allow(ctx: &CheckContext, _name: &str, arg: &str) -> Result<(), String> {
    check_operations(ctx, true, arg)
}

fn check_deny(ctx: &CheckContext, _name: &str, arg: &str) -> Result<(), String> {
    check_operations(ctx, false, arg)
}

fn check_operations(ctx: &CheckContext, allow: bool, arg: &str) -> Result<(), String> {
    let listed: Vec<&str> = arg.split_whitespace().collect();
    if listed.is_empty() {
        return Err("no operations listed in caveat".to_string());
    }
    if ctx.operations().is_empty() {
        return Err("no operations in context".to_string());
    }
    for op in ctx.operations() {
        let found = listed.iter().any(|listed_op| listed_op == op);
        if found != allow {
            return Err(format!("{} not allowed", op));
        }
    }
    Ok(())
}

fn check_error(_ctx: &CheckContext, _name: &str, arg: &str) -> Result<(), String> {
    Err(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn ctx_at(t: DateTime<Utc>) -> CheckContext {
        CheckContext::new().with_clock(Arc::new(FixedClock(t)))
    }

    #[test]
    fn parse_caveat_splits_on_first_space() {
        assert_eq!(parse_caveat("time-before 2100-01-01").unwrap(), ("time-before", "2100-01-01"));
        assert_eq!(parse_caveat("declared user alice").unwrap(), ("declared", "user alice"));
        assert_eq!(parse_caveat("solo").unwrap(), ("solo", ""));
        assert!(parse_caveat("").is_err());
        assert!(parse_caveat(" leading").is_err());
    }

    #[test]
    fn time_before_respects_injected_clock() {
        let checker = Checker::new();
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cond = format!("time-before {}", expiry.to_rfc3339_opts(SecondsFormat::AutoSi, true));

        let before = ctx_at(expiry - chrono::Duration::seconds(1));
        assert!(checker.check_first_party_caveat(&before, &cond).is_ok());

        let at = ctx_at(expiry);
        assert!(checker.check_first_party_caveat(&at, &cond).is_err());

        let after = ctx_at(expiry + chrono::Duration::seconds(1));
        assert!(checker.check_first_party_caveat(&after, &cond).is_err());
    }

    #[test]
    fn unknown_condition_is_distinguished() {
        let checker = Checker::new();
        assert_eq!(
            checker.check_first_party_caveat(&CheckContext::new(), "is something"),
            Err(CaveatError::NotRecognized)
        );
    }

    #[test]
    fn declared_checks_context_attributes() {
        let checker = Checker::new();
        let ctx = CheckContext::new()
            .with_declared([("user".to_string(), "alice".to_string())].into());
        assert!(checker.check_first_party_caveat(&ctx, "declared user alice").is_ok());
        assert!(checker.check_first_party_caveat(&ctx, "declared user bob").is_err());
        assert!(checker.check_first_party_caveat(&ctx, "declared group admin").is_err());
    }

    #[test]
    fn allow_and_deny_match_context_operations() {
        let checker = Checker::new();
        let ctx = CheckContext::new().with_operations(vec!["read".to_string()]);
        assert!(checker.check_first_party_caveat(&ctx, "allow read write").is_ok());
        assert!(checker.check_first_party_caveat(&ctx, "allow write").is_err());
        assert!(checker.check_first_party_caveat(&ctx, "deny write").is_ok());
        assert!(checker.check_first_party_caveat(&ctx, "deny read").is_err());
    }

    #[test]
    fn error_caveat_always_fails() {
        let checker = Checker::new();
        let err = checker
            .check_first_party_caveat(&CheckContext::new(), "error it broke")
            .unwrap_err();
        assert_eq!(
            err,
            CaveatError::not_satisfied("error it broke", "it broke")
        );
    }

    #[test]
    fn infer_declared_drops_conflicts() {
        let ns = Checker::new().namespace().clone();
        let conds = vec![
            "declared user alice".to_string(),
            "declared group wheel".to_string(),
            "declared group staff".to_string(),
            "time-before 2100-01-01T00:00:00Z".to_string(),
        ];
        let declared = infer_declared(&ns, &conds);
        assert_eq!(declared.get("user").map(String::as_str), Some("alice"));
        assert_eq!(declared.get("group"), None);
    }

    #[test]
    fn bad_constructor_arguments_become_error_caveats() {
        assert!(declared_caveat("bad key", "v").condition.starts_with("error "));
        assert!(allow_caveat(&[]).condition.starts_with("error "));
        assert!(deny_caveat(&["with space"]).condition.starts_with("error "));
        assert_eq!(allow_caveat(&["read", "write"]).condition, "allow read write");
    }
}
