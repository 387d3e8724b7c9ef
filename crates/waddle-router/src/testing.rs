//! Fixtures shared by unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use minidom::Element;
use parking_lot::Mutex;

use crate::connection::{CloseListener, CloseNotifier, Connection, PacketDeliverer};
use crate::context::ServerContext;
use crate::error::RouterError;
use crate::session::{ClientSession, SessionStatus};
use crate::stanza::{ns, PresenceType, Stanza, StanzaKind};

/// Connection that records everything written to it.
#[derive(Default)]
pub(crate) struct RecordingConnection {
    session: Mutex<Weak<ClientSession>>,
    delivered: Mutex<Vec<Stanza>>,
    raw: Mutex<Vec<String>>,
    close: CloseNotifier,
}

impl RecordingConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn delivered(&self) -> Vec<Stanza> {
        self.delivered.lock().clone()
    }

    pub(crate) fn raw(&self) -> Vec<String> {
        self.raw.lock().clone()
    }

    /// Delivered stanzas of one kind.
    pub(crate) fn delivered_of(&self, kind: StanzaKind) -> Vec<Stanza> {
        self.delivered
            .lock()
            .iter()
            .filter(|s| s.kind() == kind)
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.delivered.lock().clear();
        self.raw.lock().clear();
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn init(&self, session: Weak<ClientSession>) {
        *self.session.lock() = session;
    }

    fn deliver(&self, stanza: Stanza) {
        if !self.close.is_closing() {
            self.delivered.lock().push(stanza);
        }
    }

    fn deliver_raw_text(&self, text: &str) {
        if !self.close.is_closing() {
            self.raw.lock().push(text.to_string());
        }
    }

    async fn deliver_raw_text_sync(&self, text: &str) -> Result<(), RouterError> {
        self.deliver_raw_text(text);
        Ok(())
    }

    async fn close(&self) {
        if !self.close.begin_close() {
            return;
        }
        let session = self.session.lock().upgrade();
        if let Some(session) = session {
            session.set_status(SessionStatus::Closed);
        }
        self.close.finish_close();
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn register_close_listener(&self, listener: CloseListener) -> Result<(), RouterError> {
        self.close.register(listener)
    }

    fn remove_close_listener(&self) -> bool {
        self.close.remove()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Backup deliverer that keeps what it is given.
#[derive(Default)]
pub(crate) struct RecordingDeliverer {
    delivered: Mutex<Vec<Stanza>>,
}

impl RecordingDeliverer {
    pub(crate) fn delivered(&self) -> Vec<Stanza> {
        self.delivered.lock().clone()
    }
}

impl PacketDeliverer for RecordingDeliverer {
    fn deliver(&self, stanza: Stanza) {
        self.delivered.lock().push(stanza);
    }
}

/// Standalone context serving `example.com`.
pub(crate) fn context() -> Arc<ServerContext> {
    ServerContext::builder()
        .domain("example.com")
        .build()
        .unwrap()
}

/// Context serving `example.com` with extra properties.
pub(crate) fn context_with(pairs: &[(&str, &str)]) -> Arc<ServerContext> {
    let mut builder = ServerContext::builder().domain("example.com");
    for (name, value) in pairs {
        builder = builder.property(name, value);
    }
    builder.build().unwrap()
}

/// Available presence with a priority.
pub(crate) fn available_presence(priority: i8) -> Stanza {
    Stanza::presence(PresenceType::Available).with_child(
        Element::builder("priority", ns::JABBER_CLIENT)
            .append(priority.to_string())
            .build(),
    )
}

/// Send available presence for `session` to the server.
pub(crate) fn go_available(ctx: &Arc<ServerContext>, session: &Arc<ClientSession>, priority: i8) {
    ctx.packet_router()
        .route_from_session(session, available_presence(priority));
}

/// Authenticate and bind `user@example.com/resource` on `ctx`.
pub(crate) async fn bound_session(
    ctx: &Arc<ServerContext>,
    user: &str,
    resource: &str,
) -> (Arc<ClientSession>, Arc<RecordingConnection>) {
    let conn = RecordingConnection::new();
    let session = ctx.session_manager().create_client_session(conn.clone()).unwrap();
    ctx.session_manager().authenticate(&session, user).unwrap();
    ctx.session_manager().bind(&session, Some(resource)).await.unwrap();
    (session, conn)
}
