//! Session registry and lifecycle.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use jid::Jid;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ClientSession, SessionEventDispatcher, SessionStatus};
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::{stream_error_element, stream_errors, RouterError, StanzaErrorCondition, StanzaErrorType};
use crate::metrics;

/// Tracks every client session of this node.
///
/// Sessions live in the pre-authenticated map keyed by stream ID until a
/// resource is bound, then in the bound map keyed by full JID.
pub struct SessionManager {
    ctx: Weak<ServerContext>,
    pre_authenticated: DashMap<String, Arc<ClientSession>>,
    sessions: DashMap<String, Arc<ClientSession>>,
    events: SessionEventDispatcher,
}

impl SessionManager {
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        Self {
            ctx,
            pre_authenticated: DashMap::new(),
            sessions: DashMap::new(),
            events: SessionEventDispatcher::default(),
        }
    }

    fn context(&self) -> Result<Arc<ServerContext>, RouterError> {
        self.ctx
            .upgrade()
            .ok_or_else(|| RouterError::internal("server context dropped"))
    }

    pub fn events(&self) -> &SessionEventDispatcher {
        &self.events
    }

    /// Create a session for a freshly accepted connection.
    #[instrument(skip(self, connection), fields(peer = ?connection.peer_address()))]
    pub fn create_client_session(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<ClientSession>, RouterError> {
        let ctx = self.context()?;
        let stream_id = Uuid::new_v4().simple().to_string();
        let session = ClientSession::new(
            stream_id.clone(),
            ctx.domain().to_string(),
            Arc::clone(&connection),
            ctx.backup_deliverer(),
        )?;
        self.pre_authenticated
            .insert(stream_id.clone(), Arc::clone(&session));

        let weak_ctx = self.ctx.clone();
        let weak_session = Arc::downgrade(&session);
        connection.register_close_listener(Box::new(move || {
            if let (Some(ctx), Some(session)) = (weak_ctx.upgrade(), weak_session.upgrade()) {
                ctx.session_manager().connection_closed(&session);
            }
        }))?;

        debug!(stream_id = %stream_id, "Client session created");
        Ok(session)
    }

    /// Record successful authentication of `username`.
    pub fn authenticate(
        &self,
        session: &Arc<ClientSession>,
        username: &str,
    ) -> Result<(), RouterError> {
        session.set_authenticated(username, false)?;
        info!(stream_id = %session.stream_id(), username, "Session authenticated");
        Ok(())
    }

    /// Authenticate with a generated username.
    pub fn authenticate_anonymous(&self, session: &Arc<ClientSession>) -> Result<(), RouterError> {
        let username = Uuid::new_v4().simple().to_string()[..12].to_string();
        session.set_authenticated(&username, true)?;
        info!(stream_id = %session.stream_id(), username = %username, "Anonymous session authenticated");
        Ok(())
    }

    /// Bind a resource, making the session routable.
    ///
    /// A local session already bound to the same full JID is sent a
    /// `conflict` stream error and closed.
    #[instrument(skip(self, session), fields(stream_id = %session.stream_id()))]
    pub async fn bind(
        &self,
        session: &Arc<ClientSession>,
        resource: Option<&str>,
    ) -> Result<Jid, RouterError> {
        if !session.is_authenticated() {
            return Err(RouterError::not_authorized(None));
        }
        let ctx = self.context()?;
        let resource = match resource.map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        let bare = session.address().to_bare();
        let full = Jid::new(&format!("{}/{}", bare, resource)).map_err(|e| RouterError::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text: Some(format!("invalid resource: {}", e)),
        })?;
        let key = full.to_string();

        // The route goes in first so a failed cluster write leaves the
        // session pre-authenticated and unbound.
        let previous = session.address();
        session.set_address(full.clone());
        if let Err(e) = ctx.routing_table().add_client_route(session) {
            session.set_address(previous);
            warn!(jid = %full, error = %e, "Unable to add client route, bind refused");
            return Err(e);
        }
        let replaced = self.sessions.insert(key.clone(), Arc::clone(session));
        self.pre_authenticated.remove(session.stream_id());
        metrics::record_sessions(self.sessions.len() as i64);

        if session.mark_bound() {
            self.events.created(session);
        }
        self.events.resource_bound(session);
        info!(jid = %full, "Resource bound");

        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, session)) {
            warn!(jid = %full, old_stream = %old.stream_id(), "Resource conflict, closing older session");
            let conflict = stream_error_element(stream_errors::CONFLICT, None);
            if let Err(e) = old.connection().deliver_raw_text_sync(&conflict).await {
                debug!(error = %e, "Conflict notice not delivered");
            }
            old.close().await;
        }
        Ok(full)
    }

    /// Tear down routing state of a session whose connection closed.
    ///
    /// Runs from the connection close listener, so at most once per session.
    pub(crate) fn connection_closed(&self, session: &Arc<ClientSession>) {
        session.set_status(SessionStatus::Closed);
        self.pre_authenticated.remove(session.stream_id());
        if !session.is_bound() || !session.mark_destroyed() {
            return;
        }

        let key = session.address().to_string();
        let current = self
            .sessions
            .remove_if(&key, |_, s| Arc::ptr_eq(s, session))
            .is_some();

        if current {
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.presence_update_handler().session_closed(session);
                if let Err(e) = ctx.routing_table().remove_client_session(session) {
                    warn!(jid = %key, error = %e, "Unable to remove client route");
                }
            }
        }

        metrics::record_sessions(self.sessions.len() as i64);
        self.events.destroyed(session);
        info!(jid = %key, "Session destroyed");
    }

    /// Bound session for a full JID.
    pub fn session(&self, address: &Jid) -> Option<Arc<ClientSession>> {
        self.sessions
            .get(&address.to_string())
            .map(|s| Arc::clone(s.value()))
    }

    /// Pre-authenticated session by stream ID.
    pub fn pre_authenticated_session(&self, stream_id: &str) -> Option<Arc<ClientSession>> {
        self.pre_authenticated
            .get(stream_id)
            .map(|s| Arc::clone(s.value()))
    }

    /// Sessions that have not bound a resource yet.
    pub fn pre_authenticated_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.pre_authenticated
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    /// All bound sessions.
    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Bound sessions of one user.
    pub fn user_sessions(&self, username: &str) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .filter(|s| s.value().username().as_deref() == Some(username))
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pre_authenticated_count(&self) -> usize {
        self.pre_authenticated.len()
    }

    /// Send system-shutdown to every session and close them.
    pub async fn close_all(&self) {
        let mut all: Vec<Arc<ClientSession>> = self.sessions();
        all.extend(self.pre_authenticated.iter().map(|s| Arc::clone(s.value())));
        info!(sessions = all.len(), "Closing all client sessions");
        join_all(all.iter().map(|s| s.connection().system_shutdown())).await;
    }
}
