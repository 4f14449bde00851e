//! Live enforcement of dial and bind grants.
//!
//! Every edge session owns a cancellation token; listeners and circuits
//! opened under it hold child tokens. Mutations that may withdraw a grant
//! enqueue an [`EnforcementEvent`], and a background worker re-evaluates the
//! affected sessions and cancels those no longer permitted.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::database::{Database, Tables};
use super::error::ServiceError;
use super::metrics::record_revocation;
use crate::models::{EdgeSession, PolicyType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementEvent {
    /// A service policy was created, updated or deleted.
    PoliciesChanged,
    IdentityChanged(String),
    ServiceChanged(String),
    ApiSessionRemoved(String),
    /// Edge sessions already dropped from the store.
    SessionsRemoved(Vec<String>),
}

/// Whether any service policy currently grants `kind` on the service to
/// the identity.
pub fn is_permitted(tables: &Tables, identity_id: &str, service_id: &str, kind: PolicyType) -> bool {
    let (Some(identity), Some(service)) = (
        tables.identities.get(identity_id),
        tables.services.get(service_id),
    ) else {
        return false;
    };

    tables.service_policies.values().any(|policy| {
        policy.grants(
            kind,
            &identity.id,
            &identity.role_attributes,
            &service.id,
            &service.role_attributes,
        )
    })
}

/// A bound listener or a dialed circuit hanging off an edge session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub kind: PolicyType,
    pub edge_session_id: String,
    pub service_id: String,
    token: CancellationToken,
}

pub type Listener = Connection;
pub type Circuit = Connection;

impl Connection {
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

#[derive(Clone)]
pub struct EnforcementHub {
    sessions: Arc<DashMap<String, CancellationToken>>,
    events: UnboundedSender<EnforcementEvent>,
    receiver: Arc<Mutex<Option<UnboundedReceiver<EnforcementEvent>>>>,
}

impl Default for EnforcementHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EnforcementHub {
    pub fn new() -> Self {
        let (events, receiver) = unbounded_channel();
        Self {
            sessions: Arc::new(DashMap::new()),
            events,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Spawns the evaluation worker. Only the first call has an effect.
    pub fn start(&self, db: Database) {
        let receiver = self.receiver.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut receiver) = receiver else {
            return;
        };

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                hub.evaluate(&db, event).await;
            }
            tracing::debug!("Enforcement worker stopped");
        });
    }

    /// True once the worker owns the event stream and is still receiving.
    pub fn is_running(&self) -> bool {
        let started = self.receiver.lock().map(|guard| guard.is_none()).unwrap_or(false);
        started && !self.events.is_closed()
    }

    pub fn notify(&self, event: EnforcementEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("Enforcement worker is not running; event dropped");
        }
    }

    pub fn register(&self, session: &EdgeSession) {
        self.sessions
            .insert(session.id.clone(), CancellationToken::new());
    }

    /// Cancels the edge session and everything opened under it.
    pub fn revoke(&self, edge_session_id: &str) -> bool {
        match self.sessions.remove(edge_session_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, edge_session_id: &str) -> bool {
        self.sessions.contains_key(edge_session_id)
    }

    async fn open(
        &self,
        db: &Database,
        edge_session_id: &str,
        kind: PolicyType,
    ) -> Result<Connection, ServiceError> {
        let tables = db.read().await;
        let session = tables
            .edge_sessions
            .get(edge_session_id)
            .ok_or(ServiceError::NotFound("session"))?;
        if session.session_type != kind {
            return Err(ServiceError::validation(format!(
                "session {} is not a {:?} session",
                edge_session_id, kind
            )));
        }

        let parent = self
            .sessions
            .get(edge_session_id)
            .ok_or(ServiceError::NotFound("session"))?;

        Ok(Connection {
            id: Uuid::new_v4().to_string(),
            kind,
            edge_session_id: session.id.clone(),
            service_id: session.service_id.clone(),
            token: parent.value().child_token(),
        })
    }

    pub async fn open_listener(&self, db: &Database, edge_session_id: &str) -> Result<Listener, ServiceError> {
        self.open(db, edge_session_id, PolicyType::Bind).await
    }

    pub async fn open_circuit(&self, db: &Database, edge_session_id: &str) -> Result<Circuit, ServiceError> {
        self.open(db, edge_session_id, PolicyType::Dial).await
    }

    /// Re-checks the sessions an event may affect, dropping and cancelling
    /// the ones no longer granted.
    pub async fn evaluate(&self, db: &Database, event: EnforcementEvent) {
        let revoked: Vec<EdgeSession> = match &event {
            EnforcementEvent::SessionsRemoved(ids) => {
                for id in ids {
                    self.revoke(id);
                }
                return;
            }
            EnforcementEvent::ApiSessionRemoved(api_session_id) => {
                let mut tables = db.write().await;
                let ids: Vec<String> = tables
                    .edge_sessions
                    .values()
                    .filter(|s| &s.api_session_id == api_session_id)
                    .map(|s| s.id.clone())
                    .collect();
                ids.iter()
                    .filter_map(|id| tables.edge_sessions.remove(id))
                    .collect()
            }
            _ => {
                let mut tables = db.write().await;
                let ids: Vec<String> = tables
                    .edge_sessions
                    .values()
                    .filter(|s| match &event {
                        EnforcementEvent::IdentityChanged(id) => &s.identity_id == id,
                        EnforcementEvent::ServiceChanged(id) => &s.service_id == id,
                        _ => true,
                    })
                    .filter(|s| !is_permitted(&tables, &s.identity_id, &s.service_id, s.session_type))
                    .map(|s| s.id.clone())
                    .collect();
                ids.iter()
                    .filter_map(|id| tables.edge_sessions.remove(id))
                    .collect()
            }
        };

        for session in revoked {
            self.revoke(&session.id);
            let kind = match session.session_type {
                PolicyType::Bind => "bind",
                PolicyType::Dial => "dial",
            };
            record_revocation(kind);
            tracing::info!(
                edge_session_id = %session.id,
                identity_id = %session.identity_id,
                service_id = %session.service_id,
                kind = kind,
                "Edge session revoked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, Semantic, Service, ServicePolicy};
    use std::time::Duration;

    struct Fixture {
        db: Database,
        hub: EnforcementHub,
        bind_policy: String,
        web_session: String,
        db_session: String,
    }

    async fn fixture() -> Fixture {
        let db = Database::new();
        let hub = EnforcementHub::new();

        let mut identity = Identity::new("server", false);
        identity.role_attributes = vec!["servers".into()];
        let web = Service::new("web".into(), vec!["web".into()]);
        let database = Service::new("db".into(), vec!["db".into()]);
        let web_policy = ServicePolicy::new(
            "bind-web".into(),
            PolicyType::Bind,
            Semantic::AnyOf,
            vec!["#servers".into()],
            vec!["#web".into()],
        );
        let db_policy = ServicePolicy::new(
            "bind-db".into(),
            PolicyType::Bind,
            Semantic::AnyOf,
            vec!["#servers".into()],
            vec!["@".to_string() + &database.id],
        );
        let web_session = EdgeSession::new("as".into(), identity.id.clone(), web.id.clone(), PolicyType::Bind);
        let db_session = EdgeSession::new("as".into(), identity.id.clone(), database.id.clone(), PolicyType::Bind);

        {
            let mut tables = db.write().await;
            tables.identities.insert(identity.id.clone(), identity);
            tables.services.insert(web.id.clone(), web);
            tables.services.insert(database.id.clone(), database);
            tables.service_policies.insert(web_policy.id.clone(), web_policy.clone());
            tables.service_policies.insert(db_policy.id.clone(), db_policy);
            tables.edge_sessions.insert(web_session.id.clone(), web_session.clone());
            tables.edge_sessions.insert(db_session.id.clone(), db_session.clone());
        }
        hub.register(&web_session);
        hub.register(&db_session);
        hub.start(db.clone());

        Fixture {
            db,
            hub,
            bind_policy: web_policy.id,
            web_session: web_session.id,
            db_session: db_session.id,
        }
    }

    #[tokio::test]
    async fn deleting_bind_policy_closes_only_its_listeners() {
        let f = fixture().await;
        let web_listener = f.hub.open_listener(&f.db, &f.web_session).await.unwrap();
        let db_listener = f.hub.open_listener(&f.db, &f.db_session).await.unwrap();

        f.db.write().await.service_policies.remove(&f.bind_policy);
        f.hub.notify(EnforcementEvent::PoliciesChanged);

        tokio::time::timeout(Duration::from_secs(10), web_listener.closed())
            .await
            .expect("listener should close after its policy is deleted");
        assert!(!db_listener.is_closed());
        assert!(f.hub.is_active(&f.db_session));
        assert!(!f.db.read().await.edge_sessions.contains_key(&f.web_session));
    }

    #[tokio::test]
    async fn listener_requires_bind_session() {
        let f = fixture().await;
        assert!(matches!(
            f.hub.open_circuit(&f.db, &f.web_session).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn removing_api_session_revokes_its_edge_sessions() {
        let f = fixture().await;
        let listener = f.hub.open_listener(&f.db, &f.db_session).await.unwrap();
        f.hub.evaluate(&f.db, EnforcementEvent::ApiSessionRemoved("as".into())).await;
        assert!(listener.is_closed());
        assert!(f.db.read().await.edge_sessions.is_empty());
    }

    #[tokio::test]
    async fn closing_one_connection_leaves_siblings_open() {
        let f = fixture().await;
        let a = f.hub.open_listener(&f.db, &f.web_session).await.unwrap();
        let b = f.hub.open_listener(&f.db, &f.web_session).await.unwrap();
        a.close();
        assert!(a.is_closed());
        assert!(!b.is_closed());
    }
}
