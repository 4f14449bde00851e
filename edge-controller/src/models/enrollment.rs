//! Enrollment model - a single-use, time-bounded ticket to obtain credentials.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentMethod {
    Ott,
    Ottca,
    Updb,
}

impl EnrollmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentMethod::Ott => "ott",
            EnrollmentMethod::Ottca => "ottca",
            EnrollmentMethod::Updb => "updb",
        }
    }
}

impl std::str::FromStr for EnrollmentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ott" => Ok(EnrollmentMethod::Ott),
            "ottca" => Ok(EnrollmentMethod::Ottca),
            "updb" => Ok(EnrollmentMethod::Updb),
            _ => Err(format!("unsupported enrollment method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub identity_id: String,
    pub method: EnrollmentMethod,
    pub token: String,
    pub ca_id: Option<String>,
    pub username: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub jwt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(identity_id: String, method: EnrollmentMethod, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity_id,
            method,
            token: Uuid::new_v4().to_string(),
            ca_id: None,
            username: None,
            expires_at: expires_at.trunc_subsecs(3),
            jwt: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Moves the expiry and rotates the token; the old token stops working.
    pub fn refresh(&mut self, expires_at: DateTime<Utc>) {
        self.expires_at = expires_at.trunc_subsecs(3);
        self.token = Uuid::new_v4().to_string();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn expiry_is_truncated_to_millis() {
        let at = Utc.timestamp_opt(1_900_000_000, 123_456_789).single().unwrap();
        let enrollment = Enrollment::new("id".into(), EnrollmentMethod::Ott, at);
        assert_eq!(enrollment.expires_at.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn refresh_rotates_token() {
        let mut enrollment =
            Enrollment::new("id".into(), EnrollmentMethod::Updb, Utc::now() + Duration::hours(1));
        let old = enrollment.token.clone();
        enrollment.refresh(Utc::now() + Duration::hours(2));
        assert_ne!(enrollment.token, old);
        assert!(!enrollment.is_expired(Utc::now()));
    }
}
