//! condition name namespaces

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::Error;

/// Maps namespace URIs to the short prefixes used when writing condition
/// names into macaroon caveats.
///
/// A caveat condition `allow read` written in a namespace with prefix `""`
/// appears verbatim; in a namespace with prefix `http` it appears as
/// `http:allow read`. Macaroons carry the serialized namespace table so that
/// verifiers can resolve prefixes back to URIs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    uri_to_prefix: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace::default()
    }

    /// Registers `prefix` as the prefix for the given namespace URI.
    /// Re-registering a URI keeps the original prefix.
    pub fn register(&mut self, uri: &str, prefix: &str) -> Result<(), Error> {
        if !is_valid_schema_uri(uri) {
            return Err(Error::InvalidNamespace(format!("invalid URI {:?}", uri)));
        }
        if !is_valid_prefix(prefix) {
            return Err(Error::InvalidNamespace(format!(
                "invalid prefix {:?} for URI {:?}",
                prefix, uri
            )));
        }
        self.uri_to_prefix
            .entry(uri.to_string())
            .or_insert_with(|| prefix.to_string());
        Ok(())
    }

    /// Returns the prefix registered for the given URI.
    pub fn resolve(&self, uri: &str) -> Option<&str> {
        self.uri_to_prefix.get(uri).map(String::as_str)
    }

    /// Prefixes a condition with the resolved prefix for `uri`.
    pub fn resolve_caveat(&self, uri: &str, condition: &str) -> Option<String> {
        self.resolve(uri).map(|prefix| {
            if prefix.is_empty() {
                condition.to_string()
            } else {
                format!("{}:{}", prefix, condition)
            }
        })
    }

    /// Merges all entries of `other` that are not yet present.
    pub fn merge(&mut self, other: &Namespace) {
        for (uri, prefix) in &other.uri_to_prefix {
            self.uri_to_prefix
                .entry(uri.clone())
                .or_insert_with(|| prefix.clone());
        }
    }
}

impl Display for Namespace {
    /// Serializes as space-separated `uri:prefix` fields, sorted by URI.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (uri, prefix) in &self.uri_to_prefix {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}:{}", uri, prefix)?;
        }
        Ok(())
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ns = Namespace::new();
        for field in s.split_whitespace() {
            let (uri, prefix) = field.rsplit_once(':').ok_or_else(|| {
                Error::InvalidNamespace(format!("no prefix separator in {:?}", field))
            })?;
            ns.register(uri, prefix)?;
        }
        Ok(ns)
    }
}

impl serde::Serialize for Namespace {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Namespace {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_valid_schema_uri(uri: &str) -> bool {
    !uri.is_empty() && !uri.contains(char::is_whitespace) && !uri.ends_with(':')
}

fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.contains(char::is_whitespace) && !prefix.contains(':')
}
