//! Controller PKI: the signing CA for enrolled clients, plus certificate
//! parsing and chain checks for third-party CAs and ext-jwt signers.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::config::PkiConfig;
use crate::models::CertClaims;

const CA_COMMON_NAME: &str = "edge-controller signing CA";
const CA_VALIDITY_DAYS: i64 = 3650;
const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("invalid PEM: {0}")]
    Pem(String),
    #[error("invalid certificate: {0}")]
    Parse(String),
    #[error("invalid certificate signing request: {0}")]
    Csr(String),
    #[error("could not sign certificate: {0}")]
    Sign(String),
    #[error("unsupported public key type")]
    UnsupportedKey,
}

/// The fields of a certificate the controller acts on.
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub der: Vec<u8>,
    pub fingerprint: String,
    pub claims: CertClaims,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

impl ParsedCert {
    pub fn is_time_valid(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub pem: String,
    pub der: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Ec,
    Rsa,
}

/// Lowercase hex SHA-256 of the DER encoding.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Every `CERTIFICATE` block in a PEM bundle, in order.
pub fn pem_to_ders(pem: &str) -> Result<Vec<Vec<u8>>, CertError> {
    let mut ders = Vec::new();
    for item in Pem::iter_from_buffer(pem.as_bytes()) {
        let item = item.map_err(|e| CertError::Pem(e.to_string()))?;
        if item.label == "CERTIFICATE" {
            ders.push(item.contents);
        }
    }
    if ders.is_empty() {
        return Err(CertError::Pem("no certificates found".to_string()));
    }
    Ok(ders)
}

pub fn der_to_pem(der: &[u8]) -> String {
    let block = pem::Pem::new("CERTIFICATE", der.to_vec());
    pem::encode_config(&block, pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF))
}

pub fn parse_der(der: &[u8]) -> Result<ParsedCert, CertError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| CertError::Parse(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut claims = CertClaims {
        common_name,
        ..CertClaims::default()
    };
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::URI(uri) => claims.san_uris.push(uri.to_string()),
                GeneralName::RFC822Name(email) => claims.san_emails.push(email.to_string()),
                _ => {}
            }
        }
    }

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| CertError::Parse("notBefore out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| CertError::Parse("notAfter out of range".to_string()))?;

    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

    Ok(ParsedCert {
        der: der.to_vec(),
        fingerprint: fingerprint(der),
        claims,
        not_before,
        not_after,
        is_ca,
    })
}

/// The first certificate of a PEM bundle.
pub fn parse_pem(pem: &str) -> Result<ParsedCert, CertError> {
    let ders = pem_to_ders(pem)?;
    parse_der(&ders[0])
}

/// Whether `issuer_der`'s key produced the signature on `child_der`.
pub fn is_issued_by(child_der: &[u8], issuer_der: &[u8]) -> bool {
    let Ok((_, child)) = X509Certificate::from_der(child_der) else {
        return false;
    };
    let Ok((_, issuer)) = X509Certificate::from_der(issuer_der) else {
        return false;
    };
    child.verify_signature(Some(issuer.public_key())).is_ok()
}

/// Walks from the leaf (first element of `presented`) through any presented
/// CA intermediates until one of `anchors` signs the current link. Returns
/// the index of that anchor.
pub fn verify_chain(presented: &[Vec<u8>], anchors: &[Vec<u8>]) -> Option<usize> {
    let (leaf, intermediates) = presented.split_first()?;
    let mut current = leaf;

    for _ in 0..MAX_CHAIN_DEPTH {
        if let Some(index) = anchors.iter().position(|a| is_issued_by(current, a)) {
            return Some(index);
        }
        let next = intermediates.iter().find(|candidate| {
            *candidate != current
                && parse_der(candidate).is_ok_and(|c| c.is_ca)
                && is_issued_by(current, candidate)
        })?;
        current = next;
    }
    None
}

/// A JWT verification key from the public key of the first certificate in
/// `pem`.
pub fn decoding_key_for(pem: &str) -> Result<(DecodingKey, KeyFamily), CertError> {
    let ders = pem_to_ders(pem)?;
    let (_, cert) =
        X509Certificate::from_der(&ders[0]).map_err(|e| CertError::Parse(e.to_string()))?;
    let spki = cert.public_key();
    let raw: &[u8] = &spki.subject_public_key.data;

    match spki.parsed() {
        Ok(PublicKey::EC(_)) => Ok((DecodingKey::from_ec_der(raw), KeyFamily::Ec)),
        Ok(PublicKey::RSA(_)) => Ok((DecodingKey::from_rsa_der(raw), KeyFamily::Rsa)),
        _ => Err(CertError::UnsupportedKey),
    }
}

struct SigningCa {
    issuer: Certificate,
    key: KeyPair,
    pem: String,
    der: Vec<u8>,
    validity_days: i64,
}

/// The controller's own CA. Clients enrolled by OTT, token exchange, or
/// certificate extension get leaf certificates from here.
#[derive(Clone)]
pub struct CertService {
    ca: Arc<SigningCa>,
}

impl CertService {
    pub fn new(config: &PkiConfig) -> Result<Self, anyhow::Error> {
        match (&config.ca_cert_path, &config.ca_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read CA certificate from {}: {}", cert_path, e)
                })?;
                let key_pem = fs::read_to_string(key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read CA key from {}: {}", key_path, e)
                })?;
                Self::from_pem(&cert_pem, &key_pem, config.cert_validity_days)
            }
            _ => Self::generate(config.cert_validity_days),
        }
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str, validity_days: i64) -> Result<Self, anyhow::Error> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse CA key: {}", e))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse CA certificate: {}", e))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| anyhow::anyhow!("Failed to load CA: {}", e))?;
        let der = pem_to_ders(cert_pem)?.remove(0);

        tracing::info!(fingerprint = %fingerprint(&der), "Loaded signing CA");
        Ok(Self {
            ca: Arc::new(SigningCa {
                issuer,
                key,
                pem: cert_pem.to_string(),
                der,
                validity_days,
            }),
        })
    }

    /// An ephemeral CA. Certificates it issued become untrusted on restart.
    pub fn generate(validity_days: i64) -> Result<Self, anyhow::Error> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

        let issuer = params.self_signed(&key)?;
        let pem = issuer.pem();
        let der = issuer.der().to_vec();

        tracing::warn!(fingerprint = %fingerprint(&der), "Generated ephemeral signing CA");
        Ok(Self {
            ca: Arc::new(SigningCa {
                issuer,
                key,
                pem,
                der,
                validity_days,
            }),
        })
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca.pem
    }

    pub fn ca_der(&self) -> &[u8] {
        &self.ca.der
    }

    /// Signs a PEM PKCS#10 request as a client-auth leaf. The subject and
    /// SANs of the request are kept.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<IssuedCert, CertError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem.trim())
            .map_err(|e| CertError::Csr(e.to_string()))?;

        let mut serial: [u8; 16] = rand::random();
        serial[0] &= 0x7f;

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::minutes(5);
        csr.params.not_after = now + time::Duration::days(self.ca.validity_days);
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.serial_number = Some(SerialNumber::from_slice(&serial));
        csr.params.use_authority_key_identifier_extension = true;

        let cert = csr
            .signed_by(&self.ca.issuer, &self.ca.key)
            .map_err(|e| CertError::Sign(e.to_string()))?;

        Ok(IssuedCert {
            pem: cert.pem(),
            der: cert.der().to_vec(),
        })
    }

    pub fn issued_by_controller(&self, presented: &[Vec<u8>]) -> bool {
        verify_chain(presented, std::slice::from_ref(&self.ca.der)).is_some()
    }
}
