//! Certificate authority model - third-party CAs trusted for authentication
//! and enrollment once ownership has been proven.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_IDENTITY_NAME_FORMAT: &str = "[caName]-[commonName]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimLocation {
    CommonName,
    SanUri,
    SanEmail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimMatcher {
    All,
    Prefix,
    Suffix,
    Scheme,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimParser {
    None,
    Split,
}

/// Where in a client certificate an identity's external id is read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIdClaim {
    pub location: ClaimLocation,
    pub matcher: ClaimMatcher,
    #[serde(default)]
    pub matcher_criteria: String,
    pub parser: ClaimParser,
    #[serde(default)]
    pub parser_criteria: String,
    #[serde(default)]
    pub index: i64,
}

/// The certificate fields an [`ExternalIdClaim`] can address.
#[derive(Debug, Clone, Default)]
pub struct CertClaims {
    pub common_name: String,
    pub san_uris: Vec<String>,
    pub san_emails: Vec<String>,
}

impl ExternalIdClaim {
    pub fn resolve(&self, claims: &CertClaims) -> Option<String> {
        let candidates: Vec<&str> = match self.location {
            ClaimLocation::CommonName => vec![claims.common_name.as_str()],
            ClaimLocation::SanUri => claims.san_uris.iter().map(String::as_str).collect(),
            ClaimLocation::SanEmail => claims.san_emails.iter().map(String::as_str).collect(),
        };

        let criteria = self.matcher_criteria.as_str();
        let matched = candidates.into_iter().filter(|value| match self.matcher {
            ClaimMatcher::All => true,
            ClaimMatcher::Prefix => value.starts_with(criteria),
            ClaimMatcher::Suffix => value.ends_with(criteria),
            ClaimMatcher::Scheme => value
                .split_once(':')
                .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case(criteria)),
        });

        let parsed: Vec<String> = match self.parser {
            ClaimParser::None => matched.map(str::to_string).collect(),
            ClaimParser::Split if self.parser_criteria.is_empty() => {
                matched.map(str::to_string).collect()
            }
            ClaimParser::Split => matched
                .flat_map(|value| value.split(self.parser_criteria.as_str()))
                .map(str::to_string)
                .collect(),
        };

        let index = usize::try_from(self.index).ok()?;
        parsed.into_iter().nth(index).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthority {
    pub id: String,
    pub name: String,
    pub cert_pem: String,
    pub fingerprint: String,
    pub is_verified: bool,
    /// Proof-of-possession challenge: a certificate signed by this CA whose
    /// common name equals the token verifies it. Cleared once verified.
    pub verification_token: Option<String>,
    pub is_auto_ca_enrollment_enabled: bool,
    pub is_ott_ca_enrollment_enabled: bool,
    pub is_auth_enabled: bool,
    pub identity_roles: Vec<String>,
    pub identity_name_format: String,
    pub external_id_claim: Option<ExternalIdClaim>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateAuthority {
    pub fn new(name: String, cert_pem: String, fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            cert_pem,
            fingerprint,
            is_verified: false,
            verification_token: Some(Uuid::new_v4().to_string()),
            is_auto_ca_enrollment_enabled: false,
            is_ott_ca_enrollment_enabled: false,
            is_auth_enabled: false,
            identity_roles: Vec::new(),
            identity_name_format: DEFAULT_IDENTITY_NAME_FORMAT.to_string(),
            external_id_claim: None,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Expands the CA's identity name format. An absent requested name falls
    /// back to the certificate common name.
    pub fn render_identity_name(
        &self,
        common_name: &str,
        requested_name: Option<&str>,
        identity_id: &str,
    ) -> String {
        let format = if self.identity_name_format.trim().is_empty() {
            DEFAULT_IDENTITY_NAME_FORMAT
        } else {
            self.identity_name_format.as_str()
        };
        let requested = requested_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(common_name);

        format
            .replace("[caName]", &self.name)
            .replace("[caId]", &self.id)
            .replace("[commonName]", common_name)
            .replace("[requestedName]", requested)
            .replace("[identityId]", identity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> CertClaims {
        CertClaims {
            common_name: "device-01".into(),
            san_uris: vec![
                "spiffe://example.org/workload/a".into(),
                "https://example.org/ids/b".into(),
            ],
            san_emails: vec!["ops@example.org".into(), "dev@example.org".into()],
        }
    }

    fn claim(location: ClaimLocation, matcher: ClaimMatcher, criteria: &str) -> ExternalIdClaim {
        ExternalIdClaim {
            location,
            matcher,
            matcher_criteria: criteria.into(),
            parser: ClaimParser::None,
            parser_criteria: String::new(),
            index: 0,
        }
    }

    #[test]
    fn common_name_all() {
        let c = claim(ClaimLocation::CommonName, ClaimMatcher::All, "");
        assert_eq!(c.resolve(&claims()).as_deref(), Some("device-01"));
    }

    #[test]
    fn san_uri_scheme_match() {
        let c = claim(ClaimLocation::SanUri, ClaimMatcher::Scheme, "spiffe");
        assert_eq!(
            c.resolve(&claims()).as_deref(),
            Some("spiffe://example.org/workload/a")
        );
    }

    #[test]
    fn san_email_suffix_with_index() {
        let mut c = claim(ClaimLocation::SanEmail, ClaimMatcher::Suffix, "@example.org");
        c.index = 1;
        assert_eq!(c.resolve(&claims()).as_deref(), Some("dev@example.org"));
    }

    #[test]
    fn split_parser_selects_segment() {
        let mut c = claim(ClaimLocation::SanUri, ClaimMatcher::Prefix, "https://");
        c.parser = ClaimParser::Split;
        c.parser_criteria = "/".into();
        c.index = 4;
        assert_eq!(c.resolve(&claims()).as_deref(), Some("b"));
    }

    #[test]
    fn out_of_range_index_is_none() {
        let mut c = claim(ClaimLocation::SanEmail, ClaimMatcher::All, "");
        c.index = 9;
        assert_eq!(c.resolve(&claims()), None);
    }

    #[test]
    fn identity_name_format_symbols() {
        let mut ca = CertificateAuthority::new("corp".into(), String::new(), String::new());
        assert_eq!(ca.render_identity_name("laptop", None, "i1"), "corp-laptop");

        ca.identity_name_format = "[requestedName]@[caName]/[identityId]".into();
        assert_eq!(ca.render_identity_name("laptop", Some("alice"), "i1"), "alice@corp/i1");
        assert_eq!(ca.render_identity_name("laptop", None, "i1"), "laptop@corp/i1");
    }
}
