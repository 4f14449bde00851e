//! `WWW-Authenticate` challenge values.
//!
//! A challenge is a scheme followed by space-separated `key="value"` pairs.
//! Values are always quoted and never contain escaped quotes.

use thiserror::Error;

pub const SCHEME_BEARER: &str = "Bearer";
pub const SCHEME_ZT_SESSION: &str = "zt-session";
pub const REALM_PRIMARY_EXT_JWT: &str = "openziti-primary-ext-jwt";
pub const REALM_SECONDARY_EXT_JWT: &str = "openziti-secondary-ext-jwt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeError {
    Missing,
    Invalid,
    Expired,
}

impl ChallengeError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeError::Missing => "missing",
            ChallengeError::Invalid => "invalid",
            ChallengeError::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeParseError {
    #[error("empty challenge")]
    Empty,
    #[error("parameter {0:?} has no '='")]
    MissingEquals(String),
    #[error("parameter {0:?} expected quoted value")]
    ExpectedQuote(String),
    #[error("parameter {0:?} has an unterminated quoted value")]
    Unterminated(String),
}

impl Challenge {
    fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            params: Vec::new(),
        }
    }

    fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn bearer(error: ChallengeError) -> Self {
        Self::new(SCHEME_BEARER).param("error", error.as_str())
    }

    pub fn zt_session(error: ChallengeError) -> Self {
        Self::new(SCHEME_ZT_SESSION).param("error", error.as_str())
    }

    /// Ext-jwt challenge naming every signer that could satisfy it; ids and
    /// issuers are pipe-joined in the same order.
    pub fn ext_jwt<'a>(
        realm: &str,
        error: ChallengeError,
        signers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let (ids, issuers): (Vec<&str>, Vec<&str>) = signers.into_iter().unzip();
        Self::new(SCHEME_BEARER)
            .param("realm", realm)
            .param("error", error.as_str())
            .param("id", ids.join("|"))
            .param("issuer", issuers.join("|"))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_header_value(&self) -> String {
        let mut out = self.scheme.clone();
        for (key, value) in &self.params {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(value);
            out.push('"');
        }
        out
    }

    pub fn parse(raw: &str) -> Result<Self, ChallengeParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ChallengeParseError::Empty);
        }

        let (scheme, mut rest) = match raw.split_once(' ') {
            Some((scheme, rest)) => (scheme, rest),
            None => (raw, ""),
        };

        let mut challenge = Self::new(scheme);
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }

            let Some(eq) = rest.find('=') else {
                return Err(ChallengeParseError::MissingEquals(rest.to_string()));
            };
            let key = rest[..eq].trim().to_string();
            let after = &rest[eq + 1..];

            let Some(quoted) = after.strip_prefix('"') else {
                return Err(ChallengeParseError::ExpectedQuote(key));
            };
            let Some(end) = quoted.find('"') else {
                return Err(ChallengeParseError::Unterminated(key));
            };

            challenge.params.push((key, quoted[..end].to_string()));
            rest = &quoted[end + 1..];
        }

        Ok(challenge)
    }
}

impl std::fmt::Display for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_header_value())
    }
}
