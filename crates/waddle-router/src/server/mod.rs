//! Client-to-server listener.
//!
//! Accepts plain TCP client connections on `c2s.listen` (default
//! `0.0.0.0:5222`). Each connection gets a read task, a writer task owned
//! by its [`SocketConnection`](crate::connection::SocketConnection) and an
//! idle monitor; stanzas are routed on the shared [`StanzaWorkers`] pool.

mod parser;
mod stream;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

pub use parser::{StreamEvent, StreamHeader, XmlParser, MAX_ELEMENT_SIZE};
pub use stream::serve_connection;
pub use workers::StanzaWorkers;

use crate::config::{C2S_LISTEN, DEFAULT_C2S_LISTEN};
use crate::context::ServerContext;
use crate::error::RouterError;

/// C2S listener bound to its address.
pub struct C2sServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    workers: Arc<StanzaWorkers>,
}

impl C2sServer {
    /// Bind the address configured in `c2s.listen`.
    pub async fn bind(ctx: Arc<ServerContext>) -> Result<Self, RouterError> {
        let configured = ctx.properties().get_or(C2S_LISTEN, DEFAULT_C2S_LISTEN);
        let addr: SocketAddr = configured
            .parse()
            .map_err(|e| RouterError::config(format!("invalid {} '{}': {}", C2S_LISTEN, configured, e)))?;
        Self::bind_addr(ctx, addr).await
    }

    pub async fn bind_addr(ctx: Arc<ServerContext>, addr: SocketAddr) -> Result<Self, RouterError> {
        let listener = TcpListener::bind(addr).await?;
        let workers = Arc::new(StanzaWorkers::from_context(&ctx));
        info!(
            addr = %listener.local_addr()?,
            domain = %ctx.domain(),
            workers = workers.len(),
            "XMPP C2S server listening"
        );
        Ok(Self {
            ctx,
            listener,
            workers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RouterError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the server context shuts down.
    pub async fn run(self) -> Result<(), RouterError> {
        let shutdown = self.ctx.shutdown_token();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept C2S connection");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "Unable to disable Nagle's algorithm");
            }

            let ctx = Arc::clone(&self.ctx);
            let workers = Arc::clone(&self.workers);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(ctx, workers, stream, Some(peer)).await {
                    warn!(error = %e, "Connection error");
                }
            });
        }
        info!("XMPP C2S server stopped");
        Ok(())
    }
}
