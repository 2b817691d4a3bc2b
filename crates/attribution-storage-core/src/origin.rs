use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AttributionError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct OriginParts {
    scheme: String,
    host: String,
    port: Option<u16>,
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    }
}

fn split_origin(value: &str) -> Result<OriginParts, AttributionError> {
    let (scheme, rest) = value
        .split_once("://")
        .ok_or_else(|| AttributionError::Validation(format!("origin {value:?} has no scheme")))?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return Err(AttributionError::Validation(format!(
            "origin {value:?} has an invalid scheme"
        )));
    }

    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if authority.contains('@') {
        return Err(AttributionError::Validation(format!(
            "origin {value:?} must not carry credentials"
        )));
    }

    let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
        let (inner, tail) = stripped.split_once(']').ok_or_else(|| {
            AttributionError::Validation(format!("origin {value:?} has an unterminated IPv6 host"))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port),
            None if tail.is_empty() => None,
            None => {
                return Err(AttributionError::Validation(format!(
                    "origin {value:?} has trailing characters after its host"
                )))
            }
        };
        (format!("[{}]", inner.to_ascii_lowercase()), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_ascii_lowercase(), Some(port)),
            None => (authority.to_ascii_lowercase(), None),
        }
    };

    let valid_host = !host.is_empty()
        && (host.starts_with('[')
            || host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'));
    if !valid_host {
        return Err(AttributionError::Validation(format!(
            "origin {value:?} has an invalid host"
        )));
    }

    let port = match port {
        Some(raw) => {
            let parsed = raw.parse::<u16>().map_err(|_| {
                AttributionError::Validation(format!("origin {value:?} has an invalid port"))
            })?;
            if default_port(&scheme) == Some(parsed) {
                None
            } else {
                Some(parsed)
            }
        }
        None => None,
    };

    Ok(OriginParts { scheme, host, port })
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "[::1]"
        || host.strip_prefix("127.").is_some_and(|rest| {
            rest.split('.').count() == 3 && rest.split('.').all(|octet| octet.parse::<u8>().is_ok())
        })
}

fn is_ip_literal(host: &str) -> bool {
    host.starts_with('[') || host.split('.').all(|label| label.parse::<u8>().is_ok())
}

/// An origin allowed to take part in attribution: `https`, or `http` on a
/// loopback host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SuitableOrigin {
    parts: OriginParts,
}

impl SuitableOrigin {
    /// Parses and checks an origin string. Paths, queries and fragments are
    /// ignored.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when the value is not a
    /// well-formed, potentially trustworthy origin.
    pub fn parse(value: &str) -> Result<Self, AttributionError> {
        let parts = split_origin(value)?;
        let trustworthy = match parts.scheme.as_str() {
            "https" => true,
            "http" => is_loopback_host(&parts.host),
            _ => false,
        };
        if !trustworthy {
            return Err(AttributionError::Validation(format!(
                "origin {value:?} is not potentially trustworthy"
            )));
        }
        Ok(Self { parts })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.parts.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.parts.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.parts.port
    }

    #[must_use]
    pub fn site(&self) -> SchemefulSite {
        SchemefulSite::from_parts(&self.parts)
    }
}

impl Display for SuitableOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.parts.scheme, self.parts.host)?;
        if let Some(port) = self.parts.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for SuitableOrigin {
    type Err = AttributionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SuitableOrigin {
    type Error = AttributionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SuitableOrigin> for String {
    fn from(value: SuitableOrigin) -> Self {
        value.to_string()
    }
}

/// Scheme plus registrable domain. The registrable domain is approximated by
/// the last two host labels; IP literals and single-label hosts stand alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemefulSite {
    scheme: String,
    registrable_domain: String,
}

impl SchemefulSite {
    fn from_parts(parts: &OriginParts) -> Self {
        let registrable_domain = if is_ip_literal(&parts.host) {
            parts.host.clone()
        } else {
            let labels: Vec<&str> = parts.host.split('.').filter(|l| !l.is_empty()).collect();
            if labels.len() <= 2 {
                labels.join(".")
            } else {
                labels[labels.len() - 2..].join(".")
            }
        };
        Self {
            scheme: parts.scheme.clone(),
            registrable_domain,
        }
    }

    /// Parses a serialized site (or any URL on it).
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] for malformed values and for
    /// schemes other than `http`/`https`.
    pub fn parse(value: &str) -> Result<Self, AttributionError> {
        let parts = split_origin(value)?;
        if parts.scheme != "https" && parts.scheme != "http" {
            return Err(AttributionError::Validation(format!(
                "site {value:?} must use http or https"
            )));
        }
        Ok(Self::from_parts(&parts))
    }

    #[must_use]
    pub fn registrable_domain(&self) -> &str {
        &self.registrable_domain
    }
}

impl Display for SchemefulSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.registrable_domain)
    }
}

impl FromStr for SchemefulSite {
    type Err = AttributionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SchemefulSite {
    type Error = AttributionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SchemefulSite> for String {
    fn from(value: SchemefulSite) -> Self {
        value.to_string()
    }
}

impl From<&SuitableOrigin> for SchemefulSite {
    fn from(value: &SuitableOrigin) -> Self {
        value.site()
    }
}

/// Key handed to data-clearing filters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    origin: SuitableOrigin,
}

impl StorageKey {
    #[must_use]
    pub fn first_party(origin: SuitableOrigin) -> Self {
        Self { origin }
    }

    #[must_use]
    pub fn origin(&self) -> &SuitableOrigin {
        &self.origin
    }
}

/// Per-reporting-origin key used by site-data management.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataKey {
    pub reporting_origin: SuitableOrigin,
}

impl DataKey {
    #[must_use]
    pub fn new(reporting_origin: SuitableOrigin) -> Self {
        Self { reporting_origin }
    }

    #[must_use]
    pub fn storage_key(&self) -> StorageKey {
        StorageKey::first_party(self.reporting_origin.clone())
    }
}
