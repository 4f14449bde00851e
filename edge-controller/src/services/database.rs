//! In-memory store.
//!
//! Durable entities live in [`Tables`] behind one async `RwLock` so that
//! referential checks and the writes they guard are atomic. API sessions are
//! read on every request and live in concurrent maps beside it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::ServiceError;
use crate::config::BootstrapConfig;
use crate::models::{
    ApiSession, AuthPolicy, Authenticator, CertificateAuthority, EdgeSession, Enrollment,
    ExternalJwtSigner, Identity, Mfa, Service, ServicePolicy, DEFAULT_AUTH_POLICY_ID,
};
use crate::utils::{hash_password, Password};

#[derive(Debug, Default)]
pub struct Tables {
    pub identities: HashMap<String, Identity>,
    pub authenticators: HashMap<String, Authenticator>,
    pub auth_policies: HashMap<String, AuthPolicy>,
    pub ext_jwt_signers: HashMap<String, ExternalJwtSigner>,
    pub enrollments: HashMap<String, Enrollment>,
    pub cas: HashMap<String, CertificateAuthority>,
    /// Keyed by identity id; an identity has at most one.
    pub mfas: HashMap<String, Mfa>,
    pub services: HashMap<String, Service>,
    pub service_policies: HashMap<String, ServicePolicy>,
    pub edge_sessions: HashMap<String, EdgeSession>,
}

impl Tables {
    pub fn identity(&self, id: &str) -> Result<&Identity, ServiceError> {
        self.identities
            .get(id)
            .ok_or(ServiceError::NotFound("identity"))
    }

    pub fn identity_mut(&mut self, id: &str) -> Result<&mut Identity, ServiceError> {
        self.identities
            .get_mut(id)
            .ok_or(ServiceError::NotFound("identity"))
    }

    pub fn identity_by_external_id(&self, external_id: &str) -> Option<&Identity> {
        self.identities
            .values()
            .find(|i| i.external_id.as_deref() == Some(external_id))
    }

    pub fn identity_name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.identities
            .values()
            .any(|i| i.name == name && Some(i.id.as_str()) != except_id)
    }

    /// The identity's assigned policy. A dangling reference falls back to
    /// the system default, which always exists.
    pub fn policy_for(&self, identity: &Identity) -> Result<&AuthPolicy, ServiceError> {
        self.auth_policies
            .get(&identity.auth_policy_id)
            .or_else(|| self.auth_policies.get(DEFAULT_AUTH_POLICY_ID))
            .ok_or(ServiceError::NotFound("auth policy"))
    }

    pub fn auth_policy(&self, id: &str) -> Result<&AuthPolicy, ServiceError> {
        self.auth_policies
            .get(id)
            .ok_or(ServiceError::NotFound("auth policy"))
    }

    pub fn authenticator(&self, id: &str) -> Result<&Authenticator, ServiceError> {
        self.authenticators
            .get(id)
            .ok_or(ServiceError::NotFound("authenticator"))
    }

    pub fn authenticators_of<'a>(
        &'a self,
        identity_id: &'a str,
    ) -> impl Iterator<Item = &'a Authenticator> + 'a {
        self.authenticators
            .values()
            .filter(move |a| a.identity_id == identity_id)
    }

    pub fn authenticator_by_fingerprint(&self, fingerprint: &str) -> Option<&Authenticator> {
        self.authenticators
            .values()
            .find(|a| a.fingerprint() == Some(fingerprint))
    }

    pub fn authenticator_by_username(&self, username: &str) -> Option<&Authenticator> {
        self.authenticators
            .values()
            .find(|a| a.username() == Some(username))
    }

    pub fn signer(&self, id: &str) -> Result<&ExternalJwtSigner, ServiceError> {
        self.ext_jwt_signers
            .get(id)
            .ok_or(ServiceError::NotFound("external jwt signer"))
    }

    pub fn signer_by_issuer(&self, issuer: &str) -> Option<&ExternalJwtSigner> {
        self.ext_jwt_signers.values().find(|s| s.issuer == issuer)
    }

    pub fn ca(&self, id: &str) -> Result<&CertificateAuthority, ServiceError> {
        self.cas
            .get(id)
            .ok_or(ServiceError::NotFound("certificate authority"))
    }

    pub fn enrollment_by_token(&self, token: &str) -> Option<&Enrollment> {
        self.enrollments.values().find(|e| e.token == token)
    }

    pub fn service(&self, id: &str) -> Result<&Service, ServiceError> {
        self.services
            .get(id)
            .ok_or(ServiceError::NotFound("service"))
    }

    /// Removes an identity with everything that belongs to it. Returns the
    /// ids of the edge sessions that were dropped.
    pub fn remove_identity_cascade(&mut self, identity_id: &str) -> Vec<String> {
        self.identities.remove(identity_id);
        self.authenticators.retain(|_, a| a.identity_id != identity_id);
        self.enrollments.retain(|_, e| e.identity_id != identity_id);
        self.mfas.remove(identity_id);

        let dropped: Vec<String> = self
            .edge_sessions
            .values()
            .filter(|s| s.identity_id == identity_id)
            .map(|s| s.id.clone())
            .collect();
        for id in &dropped {
            self.edge_sessions.remove(id);
        }
        dropped
    }
}

#[derive(Clone)]
pub struct Database {
    tables: Arc<RwLock<Tables>>,
    api_sessions: Arc<DashMap<String, ApiSession>>,
    session_tokens: Arc<DashMap<String, String>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// An empty store holding only the system default auth policy.
    pub fn new() -> Self {
        let mut tables = Tables::default();
        let default_policy = AuthPolicy::system_default();
        tables
            .auth_policies
            .insert(default_policy.id.clone(), default_policy);

        Self {
            tables: Arc::new(RwLock::new(tables)),
            api_sessions: Arc::new(DashMap::new()),
            session_tokens: Arc::new(DashMap::new()),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().await
    }

    /// Creates the default admin with a password authenticator unless one
    /// already exists.
    pub async fn bootstrap_admin(&self, config: &BootstrapConfig) -> Result<Identity, ServiceError> {
        let mut tables = self.write().await;
        if let Some(existing) = tables.identities.values().find(|i| i.is_default_admin) {
            return Ok(existing.clone());
        }

        let mut admin = Identity::new(config.admin_name.clone(), true);
        admin.is_default_admin = true;

        let hash = hash_password(&Password::new(config.admin_password.clone()))?;
        let authenticator =
            Authenticator::updb(admin.id.clone(), config.admin_username.clone(), hash.into_string());

        tables
            .authenticators
            .insert(authenticator.id.clone(), authenticator);
        tables.identities.insert(admin.id.clone(), admin.clone());

        tracing::info!(identity_id = %admin.id, "Default admin bootstrapped");
        Ok(admin)
    }

    pub fn insert_api_session(&self, session: ApiSession) {
        self.session_tokens
            .insert(session.token.clone(), session.id.clone());
        self.api_sessions.insert(session.id.clone(), session);
    }

    pub fn api_session(&self, id: &str) -> Option<ApiSession> {
        self.api_sessions.get(id).map(|s| s.value().clone())
    }

    pub fn api_session_by_token(&self, token: &str) -> Option<ApiSession> {
        let id = self.session_tokens.get(token)?.clone();
        self.api_session(&id)
    }

    pub fn update_api_session<F>(&self, id: &str, f: F) -> Option<ApiSession>
    where
        F: FnOnce(&mut ApiSession),
    {
        let mut entry = self.api_sessions.get_mut(id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }

    pub fn remove_api_session(&self, id: &str) -> Option<ApiSession> {
        let (_, session) = self.api_sessions.remove(id)?;
        self.session_tokens.remove(&session.token);
        Some(session)
    }

    pub fn api_sessions_of(&self, identity_id: &str) -> Vec<ApiSession> {
        self.api_sessions
            .iter()
            .filter(|s| s.identity_id == identity_id)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Removes every API session of the identity, returning their ids.
    pub fn remove_api_sessions_of(&self, identity_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .api_sessions_of(identity_id)
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.remove_api_session(id);
        }
        ids
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        let tables = self.read().await;
        if tables.auth_policies.contains_key(DEFAULT_AUTH_POLICY_ID) {
            Ok(())
        } else {
            Err(ServiceError::Internal(anyhow::anyhow!(
                "system default auth policy is missing"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthMethod, SessionKind};

    fn bootstrap_config() -> BootstrapConfig {
        BootstrapConfig {
            admin_name: "Admin".into(),
            admin_username: "admin".into(),
            admin_password: "admin-pass".into(),
        }
    }

    #[tokio::test]
    async fn new_store_has_default_policy() {
        let db = Database::new();
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn bootstrap_admin_is_idempotent() {
        let db = Database::new();
        let first = db.bootstrap_admin(&bootstrap_config()).await.unwrap();
        let second = db.bootstrap_admin(&bootstrap_config()).await.unwrap();
        assert_eq!(first.id, second.id);
        let tables = db.read().await;
        assert!(tables.authenticator_by_username("admin").is_some());
    }

    #[test]
    fn api_sessions_resolve_by_token_until_removed() {
        let db = Database::new();
        let session = ApiSession::new(SessionKind::Legacy, "identity".into(), AuthMethod::Updb);
        let (id, token) = (session.id.clone(), session.token.clone());
        db.insert_api_session(session);

        assert_eq!(db.api_session_by_token(&token).map(|s| s.id), Some(id.clone()));
        assert_eq!(db.remove_api_sessions_of("identity"), vec![id]);
        assert!(db.api_session_by_token(&token).is_none());
    }
}
