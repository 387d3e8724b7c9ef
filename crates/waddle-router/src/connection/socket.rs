//! Socket-backed connection with a dedicated writer task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{CloseListener, CloseNotifier, Connection, PacketDeliverer};
use crate::error::{RouterError, STREAM_CLOSE};
use crate::metrics;
use crate::session::{ClientSession, SessionStatus};
use crate::stanza::Stanza;

static OPEN_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

enum Outbound {
    Stanza(Stanza),
    Raw(String),
    /// Raw text whose write result is reported back
    RawAck(String, oneshot::Sender<std::io::Result<()>>),
}

/// Connection writing to an async socket half.
///
/// Writes go through a bounded queue drained by a writer task. A full queue
/// or a failed write closes the connection; the stanza involved and every
/// stanza still queued are handed to the backup deliverer.
pub struct SocketConnection {
    peer: Option<SocketAddr>,
    secure: bool,
    queue: mpsc::Sender<Outbound>,
    writer_cancel: CancellationToken,
    notifier: CloseNotifier,
    session: RwLock<Weak<ClientSession>>,
    backup: Arc<dyn PacketDeliverer>,
    ack_timeout: Duration,
}

impl SocketConnection {
    /// Create the connection and spawn its writer task.
    pub fn spawn<W>(
        writer: W,
        peer: Option<SocketAddr>,
        secure: bool,
        backup: Arc<dyn PacketDeliverer>,
        queue_size: usize,
        ack_timeout: Duration,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let connection = Arc::new(Self {
            peer,
            secure,
            queue: tx,
            writer_cancel: CancellationToken::new(),
            notifier: CloseNotifier::new(),
            session: RwLock::new(Weak::new()),
            backup: Arc::clone(&backup),
            ack_timeout,
        });

        tokio::spawn(write_loop(
            writer,
            rx,
            connection.writer_cancel.clone(),
            Arc::downgrade(&connection),
            backup,
        ));

        let open = OPEN_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_connections(open);
        connection
    }

    /// Token cancelled once the connection has closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.writer_cancel.clone()
    }

    /// Close without sending the closing tag. Used when the socket is broken.
    fn abort(&self) {
        if !self.notifier.begin_close() {
            return;
        }
        debug!(peer = ?self.peer, "Aborting connection");
        self.finish_close();
    }

    fn finish_close(&self) {
        if let Some(session) = self.session.read().upgrade() {
            session.set_status(SessionStatus::Closed);
        }
        self.writer_cancel.cancel();
        self.notifier.finish_close();
        let open = OPEN_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::record_connections(open.max(0));
    }

    async fn write_and_wait(&self, text: String) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        let write = async {
            self.queue
                .send(Outbound::RawAck(text, tx))
                .await
                .map_err(|_| RouterError::stream("connection writer stopped"))?;
            rx.await
                .map_err(|_| RouterError::stream("connection writer stopped"))?
                .map_err(RouterError::Io)
        };
        match tokio::time::timeout(self.ack_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::stream("timed out waiting for write")),
        }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    fn init(&self, session: Weak<ClientSession>) {
        *self.session.write() = session;
    }

    fn deliver(&self, stanza: Stanza) {
        if self.notifier.is_closing() {
            self.backup.deliver(stanza);
            return;
        }
        if let Err(e) = self.queue.try_send(Outbound::Stanza(stanza)) {
            let full = matches!(e, TrySendError::Full(_));
            warn!(peer = ?self.peer, full, "Unable to queue stanza, closing connection");
            metrics::record_delivery_failure();
            self.abort();
            if let Outbound::Stanza(stanza) = e.into_inner() {
                self.backup.deliver(stanza);
            }
        }
    }

    fn deliver_raw_text(&self, text: &str) {
        if self.notifier.is_closing() {
            return;
        }
        if self.queue.try_send(Outbound::Raw(text.to_string())).is_err() {
            metrics::record_delivery_failure();
            self.abort();
        }
    }

    #[instrument(skip(self, text), fields(peer = ?self.peer))]
    async fn deliver_raw_text_sync(&self, text: &str) -> Result<(), RouterError> {
        if self.notifier.is_closing() {
            return Err(RouterError::stream("connection closed"));
        }
        let result = self.write_and_wait(text.to_string()).await;
        if let Err(e) = &result {
            warn!(error = %e, "Synchronous write failed, closing connection");
            self.abort();
        }
        result
    }

    async fn close(&self) {
        if !self.notifier.begin_close() {
            return;
        }
        if let Err(e) = self.write_and_wait(STREAM_CLOSE.to_string()).await {
            debug!(peer = ?self.peer, error = %e, "Closing tag not delivered");
        }
        self.finish_close();
        debug!(peer = ?self.peer, "Connection closed");
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn register_close_listener(&self, listener: CloseListener) -> Result<(), RouterError> {
        self.notifier.register(listener)
    }

    fn remove_close_listener(&self) -> bool {
        self.notifier.remove()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    connection: Weak<SocketConnection>,
    backup: Arc<dyn PacketDeliverer>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let (text, stanza, ack) = match item {
            Outbound::Stanza(stanza) => (stanza.to_xml(), Some(stanza), None),
            Outbound::Raw(text) => (text, None, None),
            Outbound::RawAck(text, ack) => (text, None, Some(ack)),
        };

        let result = async {
            writer.write_all(text.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(error = %e, "Socket write failed");
                metrics::record_delivery_failure();
                if let Some(ack) = ack {
                    let _ = ack.send(Err(e));
                }
                if let Some(connection) = connection.upgrade() {
                    connection.abort();
                }
                if let Some(stanza) = stanza {
                    backup.deliver(stanza);
                }
                break;
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        match item {
            Outbound::Stanza(stanza) => backup.deliver(stanza),
            Outbound::RawAck(_, ack) => {
                let _ = ack.send(Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "connection closed",
                )));
            }
            Outbound::Raw(_) => {}
        }
    }
    let _ = writer.shutdown().await;
}
