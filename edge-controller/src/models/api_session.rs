//! API session model - a live authenticated session, legacy or OIDC.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Opaque `zt-session` token.
    Legacy,
    /// Access/refresh/id token triple whose `z_asid` names this session.
    Oidc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthMethod {
    #[serde(rename = "cert")]
    Cert,
    #[serde(rename = "password")]
    Updb,
    #[serde(rename = "ext-jwt")]
    ExtJwt,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Cert => "cert",
            AuthMethod::Updb => "password",
            AuthMethod::ExtJwt => "ext-jwt",
        }
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cert" => Ok(AuthMethod::Cert),
            "updb" | "password" | "username" => Ok(AuthMethod::Updb),
            "ext-jwt" => Ok(AuthMethod::ExtJwt),
            _ => Err(format!("unsupported authentication method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
    pub id: String,
    #[serde(skip)]
    pub token: String,
    pub kind: SessionKind,
    pub identity_id: String,
    pub authenticator_id: Option<String>,
    pub auth_method: AuthMethod,
    /// Admin flag captured at issuance.
    pub is_admin: bool,
    pub is_cert_extend_requested: bool,
    pub is_cert_key_roll_requested: bool,
    pub cert_fingerprints: Vec<String>,
    /// Set while a TOTP code is still owed.
    pub totp_pending: bool,
    pub ip_address: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ApiSession {
    pub fn new(kind: SessionKind, identity_id: String, auth_method: AuthMethod) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().to_string(),
            kind,
            identity_id,
            authenticator_id: None,
            auth_method,
            is_admin: false,
            is_cert_extend_requested: false,
            is_cert_key_roll_requested: false,
            cert_fingerprints: Vec::new(),
            totp_pending: false,
            ip_address: None,
            last_activity_at: now,
            created_at: now,
        }
    }

    /// Only legacy sessions idle out; OIDC sessions live as long as their
    /// refresh tokens are honored.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.kind == SessionKind::Legacy && now - self.last_activity_at > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_sessions_idle_out() {
        let mut session = ApiSession::new(SessionKind::Legacy, "i".into(), AuthMethod::Updb);
        session.last_activity_at = Utc::now() - Duration::minutes(31);
        assert!(session.is_idle(Utc::now(), Duration::minutes(30)));

        session.kind = SessionKind::Oidc;
        assert!(!session.is_idle(Utc::now(), Duration::minutes(30)));
    }

    #[test]
    fn method_aliases_parse() {
        assert_eq!("password".parse::<AuthMethod>(), Ok(AuthMethod::Updb));
        assert_eq!("updb".parse::<AuthMethod>(), Ok(AuthMethod::Updb));
        assert_eq!("ext-jwt".parse::<AuthMethod>(), Ok(AuthMethod::ExtJwt));
        assert!("kerberos".parse::<AuthMethod>().is_err());
    }
}
