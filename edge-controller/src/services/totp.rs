//! TOTP second factor: enrollment, code checks with replay protection,
//! and single-use recovery codes.

use chrono::Utc;
use rand::Rng;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};

use super::database::Database;
use super::error::ServiceError;
use crate::models::Mfa;

pub const TOTP_STEP_SECONDS: u64 = 30;
pub const TOTP_DIGITS: usize = 6;
pub const RECOVERY_CODE_COUNT: usize = 20;
pub const RECOVERY_CODE_LENGTH: usize = 6;
const SECRET_BYTES: usize = 20;
const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const ALPHABET: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

fn totp_for(secret: &str, issuer: &str, account: &str) -> Result<TOTP, ServiceError> {
    let bytes = base32::decode(ALPHABET, secret)
        .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("stored TOTP secret is not base32")))?;
    Ok(TOTP::new_unchecked(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP_SECONDS,
        bytes,
        Some(issuer.to_string()),
        account.to_string(),
    ))
}

/// The code for the step containing `unix_time`, zero-padded.
pub fn generate_code(secret: &str, unix_time: u64) -> Option<String> {
    let bytes = base32::decode(ALPHABET, secret)?;
    let totp = TOTP::new_unchecked(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP_SECONDS,
        bytes,
        None,
        String::new(),
    );
    Some(totp.generate(unix_time))
}

pub fn new_secret() -> String {
    let bytes: [u8; SECRET_BYTES] = rand::thread_rng().gen();
    base32::encode(ALPHABET, &bytes)
}

pub fn new_recovery_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..RECOVERY_CODE_COUNT)
        .map(|_| {
            (0..RECOVERY_CODE_LENGTH)
                .map(|_| BASE32_ALPHABET[rng.gen_range(0..BASE32_ALPHABET.len())] as char)
                .collect()
        })
        .collect()
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Accepts a TOTP code within one step of `unix_time`, never at or before
/// the last step consumed. Returns the step matched.
fn match_totp(mfa: &Mfa, code: &str, unix_time: u64) -> Option<u64> {
    let current = unix_time / TOTP_STEP_SECONDS;
    let candidates = [current.saturating_sub(1), current, current + 1];
    candidates
        .into_iter()
        .filter(|step| mfa.last_used_step.map_or(true, |last| *step > last))
        .find(|step| {
            generate_code(&mfa.secret, step * TOTP_STEP_SECONDS)
                .is_some_and(|expected| ct_eq(&expected, code))
        })
}

/// Checks a recovery code first, consuming it, then a TOTP code. A TOTP
/// match records its step so the code cannot be replayed.
pub fn consume_code(mfa: &mut Mfa, code: &str, unix_time: u64, allow_recovery: bool) -> bool {
    let code = code.trim();
    if code.is_empty() {
        return false;
    }

    if allow_recovery {
        let upper = code.to_ascii_uppercase();
        if let Some(index) = mfa.recovery_codes.iter().position(|rc| ct_eq(rc, &upper)) {
            mfa.recovery_codes.remove(index);
            mfa.updated_at = Utc::now();
            return true;
        }
    }

    match match_totp(mfa, code, unix_time) {
        Some(step) => {
            mfa.last_used_step = Some(step);
            mfa.updated_at = Utc::now();
            true
        }
        None => false,
    }
}

/// What a caller offers to authorize removing MFA or reading recovery codes.
#[derive(Debug, Clone, Copy)]
pub enum MfaProof<'a> {
    /// A TOTP or recovery code, consumed on use.
    Code(&'a str),
    /// A TOTP token already checked against the caller's API session.
    TotpToken,
}

impl MfaProof<'_> {
    fn consume(&self, mfa: &mut Mfa, unix_time: u64) -> bool {
        match self {
            MfaProof::Code(code) => consume_code(mfa, code, unix_time, true),
            MfaProof::TotpToken => true,
        }
    }
}

fn now_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[derive(Clone)]
pub struct MfaService {
    db: Database,
    issuer: String,
}

impl MfaService {
    pub fn new(db: Database, issuer: String) -> Self {
        Self { db, issuer }
    }

    pub async fn create(&self, identity_id: &str) -> Result<Mfa, ServiceError> {
        let mut tables = self.db.write().await;
        tables.identity(identity_id)?;
        if tables.mfas.contains_key(identity_id) {
            return Err(ServiceError::MfaExists);
        }

        let mfa = Mfa::new(identity_id.to_string(), new_secret(), new_recovery_codes());
        tables.mfas.insert(identity_id.to_string(), mfa.clone());
        tracing::info!(identity_id = %identity_id, "MFA enrollment started");
        Ok(mfa)
    }

    pub async fn get(&self, identity_id: &str) -> Result<Mfa, ServiceError> {
        self.db
            .read()
            .await
            .mfas
            .get(identity_id)
            .cloned()
            .ok_or(ServiceError::MfaNotEnrolled)
    }

    pub fn provisioning_url(&self, mfa: &Mfa, account: &str) -> Result<String, ServiceError> {
        Ok(totp_for(&mfa.secret, &self.issuer, account)?.get_url())
    }

    /// PNG of the provisioning QR code. Only available until verified.
    pub async fn qr_png(&self, identity_id: &str, account: &str) -> Result<Vec<u8>, ServiceError> {
        let mfa = self.get(identity_id).await?;
        if mfa.is_verified {
            return Err(ServiceError::NotFound("unverified MFA enrollment"));
        }
        totp_for(&mfa.secret, &self.issuer, account)?
            .get_qr_png()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to render QR code: {}", e)))
    }

    /// Completes enrollment with a TOTP code.
    pub async fn verify(&self, identity_id: &str, code: &str) -> Result<Mfa, ServiceError> {
        let mut tables = self.db.write().await;
        let mfa = tables
            .mfas
            .get_mut(identity_id)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        if mfa.is_verified {
            return Err(ServiceError::validation("MFA is already verified"));
        }
        if !consume_code(mfa, code, now_secs(), false) {
            return Err(ServiceError::MfaInvalidToken);
        }

        mfa.is_verified = true;
        tracing::info!(identity_id = %identity_id, "MFA enrollment verified");
        Ok(mfa.clone())
    }

    /// Checks a code against a verified enrollment.
    pub async fn check(&self, identity_id: &str, code: &str) -> Result<(), ServiceError> {
        let mut tables = self.db.write().await;
        let mfa = tables
            .mfas
            .get_mut(identity_id)
            .filter(|m| m.is_verified)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        if consume_code(mfa, code, now_secs(), true) {
            Ok(())
        } else {
            tracing::warn!(identity_id = %identity_id, "MFA code rejected");
            Err(ServiceError::MfaInvalidToken)
        }
    }

    /// A verified enrollment needs a valid code to remove; an unverified one
    /// does not.
    pub async fn delete(&self, identity_id: &str, proof: MfaProof<'_>) -> Result<(), ServiceError> {
        let mut tables = self.db.write().await;
        let mfa = tables
            .mfas
            .get_mut(identity_id)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        if mfa.is_verified && !proof.consume(mfa, now_secs()) {
            return Err(ServiceError::MfaInvalidToken);
        }
        tables.mfas.remove(identity_id);
        tracing::info!(identity_id = %identity_id, "MFA removed");
        Ok(())
    }

    pub async fn admin_delete(&self, identity_id: &str) -> Result<(), ServiceError> {
        let mut tables = self.db.write().await;
        tables.identity(identity_id)?;
        tables
            .mfas
            .remove(identity_id)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        tracing::info!(identity_id = %identity_id, "MFA removed by administrator");
        Ok(())
    }

    /// Consumes `proof` against a verified enrollment.
    async fn confirm(&self, identity_id: &str, proof: MfaProof<'_>) -> Result<(), ServiceError> {
        let mut tables = self.db.write().await;
        let mfa = tables
            .mfas
            .get_mut(identity_id)
            .filter(|m| m.is_verified)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        if proof.consume(mfa, now_secs()) {
            Ok(())
        } else {
            tracing::warn!(identity_id = %identity_id, "MFA proof rejected");
            Err(ServiceError::MfaInvalidToken)
        }
    }

    pub async fn recovery_codes(&self, identity_id: &str, proof: MfaProof<'_>) -> Result<Vec<String>, ServiceError> {
        self.confirm(identity_id, proof).await?;
        Ok(self.get(identity_id).await?.recovery_codes)
    }

    pub async fn regenerate_recovery_codes(
        &self,
        identity_id: &str,
        proof: MfaProof<'_>,
    ) -> Result<Vec<String>, ServiceError> {
        self.confirm(identity_id, proof).await?;
        let mut tables = self.db.write().await;
        let mfa = tables
            .mfas
            .get_mut(identity_id)
            .ok_or(ServiceError::MfaNotEnrolled)?;
        mfa.recovery_codes = new_recovery_codes();
        mfa.updated_at = Utc::now();
        tracing::info!(identity_id = %identity_id, "MFA recovery codes regenerated");
        Ok(mfa.recovery_codes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mfa() -> Mfa {
        Mfa::new("i".into(), new_secret(), new_recovery_codes())
    }

    #[test]
    fn codes_are_six_zero_padded_digits() {
        let secret = new_secret();
        for t in [0u64, 59, 1_111_111_109, 2_000_000_000] {
            let code = generate_code(&secret, t).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn rfc6238_sha1_vector() {
        // RFC 6238 appendix B secret "12345678901234567890", 8 digits truncated to 6.
        let secret = base32::encode(ALPHABET, b"12345678901234567890");
        assert_eq!(generate_code(&secret, 59).unwrap(), "287082");
        assert_eq!(generate_code(&secret, 1_111_111_109).unwrap(), "081804");
    }

    #[test]
    fn code_is_accepted_once_per_step() {
        let mut mfa = mfa();
        let now = 1_700_000_000;
        let code = generate_code(&mfa.secret, now).unwrap();
        assert!(consume_code(&mut mfa, &code, now, false));
        assert!(!consume_code(&mut mfa, &code, now, false));
    }

    #[test]
    fn adjacent_step_is_tolerated() {
        let mut mfa = mfa();
        let now = 1_700_000_000;
        let previous = generate_code(&mfa.secret, now - TOTP_STEP_SECONDS).unwrap();
        assert!(consume_code(&mut mfa, &previous, now, false));
        assert_eq!(mfa.last_used_step, Some(now / TOTP_STEP_SECONDS - 1));
    }

    #[test]
    fn recovery_codes_are_single_use() {
        let mut mfa = mfa();
        let code = mfa.recovery_codes[3].clone();
        assert!(consume_code(&mut mfa, &code.to_lowercase(), 0, true));
        assert_eq!(mfa.recovery_codes.len(), RECOVERY_CODE_COUNT - 1);
        assert!(!consume_code(&mut mfa, &code, 0, true));
    }

    #[test]
    fn recovery_codes_ignored_when_not_allowed() {
        let mut mfa = mfa();
        let code = mfa.recovery_codes[0].clone();
        assert!(!consume_code(&mut mfa, &code, 0, false));
        assert_eq!(mfa.recovery_codes.len(), RECOVERY_CODE_COUNT);
    }

    #[tokio::test]
    async fn totp_token_proof_skips_code_but_needs_verified_mfa() {
        let db = Database::new();
        let service = MfaService::new(db.clone(), "edge".into());
        let mut enrolled = mfa();
        db.write().await.mfas.insert("i".into(), enrolled.clone());

        assert!(matches!(
            service.recovery_codes("i", MfaProof::TotpToken).await,
            Err(ServiceError::MfaNotEnrolled)
        ));

        enrolled.is_verified = true;
        db.write().await.mfas.insert("i".into(), enrolled);
        let codes = service.recovery_codes("i", MfaProof::TotpToken).await.unwrap();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        assert!(matches!(
            service.delete("i", MfaProof::Code("000000x")).await,
            Err(ServiceError::MfaInvalidToken)
        ));
        service.delete("i", MfaProof::TotpToken).await.unwrap();
        assert!(db.read().await.mfas.is_empty());
    }

    #[test]
    fn provisioning_url_uses_otpauth_scheme() {
        let service = MfaService::new(Database::new(), "edge".into());
        let mfa = mfa();
        let url = service.provisioning_url(&mfa, "alice").unwrap();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains(&format!("secret={}", mfa.secret)));
    }
}
