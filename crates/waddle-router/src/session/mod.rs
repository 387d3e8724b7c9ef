//! Client sessions.

mod events;
mod manager;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::Jid;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

pub use events::{SessionEventDispatcher, SessionEventListener};
pub use manager::SessionManager;

use crate::connection::{Connection, PacketDeliverer};
use crate::error::RouterError;
use crate::stanza::{PresenceType, Show, Stanza};

/// Lifecycle of a client session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionStatus {
    Connecting = 0,
    Connected = 1,
    Authenticated = 2,
    Closed = 3,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Connected,
            2 => SessionStatus::Authenticated,
            _ => SessionStatus::Closed,
        }
    }
}

/// Snapshot of a session used for resource selection and cross-node lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub address: String,
    pub available: bool,
    pub priority: i8,
    pub show: Show,
    pub last_active: DateTime<Utc>,
    pub anonymous: bool,
    pub presence: Option<Stanza>,
}

/// An XMPP client session.
pub struct ClientSession {
    stream_id: String,
    server_domain: String,
    address: RwLock<Jid>,
    status: AtomicU8,
    major_version: AtomicU8,
    minor_version: AtomicU8,
    connection: Arc<dyn Connection>,
    backup: Arc<dyn PacketDeliverer>,
    presence: RwLock<Stanza>,
    language: RwLock<String>,
    username: RwLock<Option<String>>,
    anonymous: AtomicBool,
    bound: AtomicBool,
    destroyed: AtomicBool,
    created: DateTime<Utc>,
    last_active: RwLock<DateTime<Utc>>,
    last_inbound: Mutex<Instant>,
    incoming: AtomicU64,
    outgoing: AtomicU64,
}

impl ClientSession {
    /// Create a session over `connection` and attach it.
    ///
    /// Until authentication the address is `domain/stream_id`.
    pub fn new(
        stream_id: String,
        server_domain: String,
        connection: Arc<dyn Connection>,
        backup: Arc<dyn PacketDeliverer>,
    ) -> Result<Arc<Self>, RouterError> {
        let address = Jid::new(&format!("{}/{}", server_domain, stream_id))
            .map_err(|e| RouterError::config(format!("invalid server domain: {}", e)))?;
        let now = Utc::now();
        let session = Arc::new(Self {
            stream_id,
            server_domain,
            address: RwLock::new(address),
            status: AtomicU8::new(SessionStatus::Connecting as u8),
            major_version: AtomicU8::new(0),
            minor_version: AtomicU8::new(0),
            connection,
            backup,
            presence: RwLock::new(Stanza::presence(PresenceType::Unavailable)),
            language: RwLock::new("en".to_string()),
            username: RwLock::new(None),
            anonymous: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            created: now,
            last_active: RwLock::new(now),
            last_inbound: Mutex::new(Instant::now()),
            incoming: AtomicU64::new(0),
            outgoing: AtomicU64::new(0),
        });
        session.connection.init(Arc::downgrade(&session));
        Ok(session)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    pub fn address(&self) -> Jid {
        self.address.read().clone()
    }

    pub fn set_address(&self, address: Jid) {
        *self.address.write() = address;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Advance the status. Moving backwards is refused.
    pub fn set_status(&self, next: SessionStatus) -> bool {
        let next = next as u8;
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if next <= current {
                return next == current;
            }
            match self
                .status
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// XMPP version announced in the client's stream header, `(0, 0)` when
    /// the header carried none.
    pub fn stream_version(&self) -> (u8, u8) {
        (
            self.major_version.load(Ordering::SeqCst),
            self.minor_version.load(Ordering::SeqCst),
        )
    }

    pub fn set_stream_version(&self, major: u8, minor: u8) {
        self.major_version.store(major, Ordering::SeqCst);
        self.minor_version.store(minor, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// Mark the session authenticated as `username` on this domain.
    pub fn set_authenticated(&self, username: &str, anonymous: bool) -> Result<(), RouterError> {
        let address = Jid::new(&format!("{}@{}", username, self.server_domain))
            .map_err(|e| RouterError::auth_failed(format!("invalid username: {}", e)))?;
        *self.username.write() = Some(username.to_string());
        self.anonymous.store(anonymous, Ordering::SeqCst);
        self.set_address(address);
        self.set_status(SessionStatus::Authenticated);
        Ok(())
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous.load(Ordering::SeqCst)
    }

    pub fn language(&self) -> String {
        self.language.read().clone()
    }

    pub fn set_language(&self, language: &str) {
        *self.language.write() = language.to_string();
    }

    /// Last presence broadcast by the client.
    pub fn presence(&self) -> Stanza {
        self.presence.read().clone()
    }

    pub fn set_presence(&self, presence: Stanza) {
        *self.presence.write() = presence;
    }

    pub fn is_available(&self) -> bool {
        self.presence.read().is_available_presence()
    }

    pub fn priority(&self) -> i8 {
        self.presence.read().priority()
    }

    pub fn show(&self) -> Show {
        self.presence.read().show()
    }

    pub fn info(&self) -> SessionInfo {
        let presence = self.presence();
        SessionInfo {
            address: self.address().to_string(),
            available: presence.is_available_presence(),
            priority: presence.priority(),
            show: presence.show(),
            last_active: *self.last_active.read(),
            anonymous: self.is_anonymous(),
            presence: Some(presence),
        }
    }

    /// Deliver a stanza to the client. A closed session hands it to the
    /// backup deliverer instead.
    pub fn process(&self, stanza: Stanza) {
        if self.is_closed() {
            debug!(stream_id = %self.stream_id, "Session closed, diverting stanza");
            self.backup.deliver(stanza);
            return;
        }
        self.outgoing.fetch_add(1, Ordering::Relaxed);
        self.connection.deliver(stanza);
    }

    pub fn deliver_raw_text(&self, text: &str) {
        if !self.is_closed() {
            self.connection.deliver_raw_text(text);
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Count an inbound stanza and refresh activity timestamps.
    pub fn record_inbound(&self) {
        self.incoming.fetch_add(1, Ordering::Relaxed);
        *self.last_active.write() = Utc::now();
        self.touch();
    }

    /// Note inbound traffic that is not a stanza, such as whitespace.
    pub fn touch(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.read()
    }

    pub fn incoming_count(&self) -> u64 {
        self.incoming.load(Ordering::Relaxed)
    }

    pub fn outgoing_count(&self) -> u64 {
        self.outgoing.load(Ordering::Relaxed)
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Returns `true` the first time only.
    pub(crate) fn mark_bound(&self) -> bool {
        !self.bound.swap(true, Ordering::SeqCst)
    }

    /// Returns `true` the first time only.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("stream_id", &self.stream_id)
            .field("address", &self.address().to_string())
            .field("status", &self.status())
            .finish()
    }
}
