//! Client connections.
//!
//! A [`Connection`] is the transport below a client session. Delivery never
//! fails from the caller's point of view: a stanza that cannot be written
//! is handed to the backup [`PacketDeliverer`] instead, exactly once.

mod idle;
mod socket;

use std::net::SocketAddr;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::Mutex;

pub use idle::spawn_idle_monitor;
pub use socket::SocketConnection;

use crate::error::{stream_error_element, stream_errors, RouterError};
use crate::session::ClientSession;
use crate::stanza::Stanza;

/// Fallback for stanzas that could not be delivered to a connection.
pub trait PacketDeliverer: Send + Sync {
    fn deliver(&self, stanza: Stanza);
}

/// Callback run once when a connection closes.
pub type CloseListener = Box<dyn FnOnce() + Send>;

/// Transport of a single client session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Attach the session this connection carries.
    fn init(&self, session: Weak<ClientSession>);

    /// Queue a stanza for delivery. Stanzas that cannot be written go to the
    /// backup deliverer.
    fn deliver(&self, stanza: Stanza);

    /// Queue raw text. Dropped if the connection is closed.
    fn deliver_raw_text(&self, text: &str);

    /// Write raw text and wait until it reached the socket.
    ///
    /// If the write does not complete within the acknowledgement timeout the
    /// connection is closed.
    async fn deliver_raw_text_sync(&self, text: &str) -> Result<(), RouterError>;

    /// Close the connection. Safe to call concurrently; only the first call
    /// does any work and the close listener runs at most once.
    async fn close(&self);

    /// Notify the peer that the server is going down, then close.
    async fn system_shutdown(&self) {
        let error = stream_error_element(stream_errors::SYSTEM_SHUTDOWN, None);
        if let Err(e) = self.deliver_raw_text_sync(&error).await {
            tracing::debug!(error = %e, "Unable to send system-shutdown to peer");
        }
        self.close().await;
    }

    fn is_closed(&self) -> bool;

    /// Register the close listener. If the connection is already closed the
    /// listener runs immediately. Only one listener may be registered.
    fn register_close_listener(&self, listener: CloseListener) -> Result<(), RouterError>;

    /// Remove the close listener, returning whether one was registered.
    fn remove_close_listener(&self) -> bool;

    /// Probe the connection with whitespace and report whether it is open.
    fn validate(&self) -> bool {
        self.deliver_raw_text(" ");
        !self.is_closed()
    }

    fn is_secure(&self) -> bool;

    fn peer_address(&self) -> Option<SocketAddr>;
}

#[derive(Default)]
struct CloseState {
    closing: bool,
    closed: bool,
    listener: Option<CloseListener>,
}

/// Close bookkeeping shared by connection implementations.
///
/// Collapses concurrent closes into one and guarantees the close listener
/// runs exactly once, outside the internal lock.
#[derive(Default)]
pub struct CloseNotifier {
    state: Mutex<CloseState>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: CloseListener) -> Result<(), RouterError> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            listener();
            return Ok(());
        }
        if state.listener.is_some() {
            return Err(RouterError::CloseListenerRegistered);
        }
        state.listener = Some(listener);
        Ok(())
    }

    pub fn remove(&self) -> bool {
        self.state.lock().listener.take().is_some()
    }

    /// Start closing. Returns `true` only for the first caller.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing {
            return false;
        }
        state.closing = true;
        true
    }

    /// Mark the connection closed and run the listener, if any.
    pub fn finish_close(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.closed = true;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Closing has started.
    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
