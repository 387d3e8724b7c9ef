//! Test utilities for routing integration tests.
//!
//! Provides an in-memory client connection, helpers for building server
//! contexts and binding sessions, and a raw XMPP client for driving the
//! C2S listener over TCP.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use waddle_router::connection::{CloseListener, CloseNotifier, Connection};
use waddle_router::server::C2sServer;
use waddle_router::session::{ClientSession, SessionStatus};
use waddle_router::{ns, PresenceType, RouterError, ServerContext, Stanza, StanzaKind};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DOMAIN: &str = "example.com";

/// Initialize tracing once for the test binary.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    Jid::new(s).expect("valid test JID")
}

/// Client connection that keeps everything the server writes to it.
#[derive(Default)]
pub struct MockConnection {
    session: Mutex<Weak<ClientSession>>,
    delivered: Mutex<Vec<Stanza>>,
    raw: Mutex<Vec<String>>,
    close: CloseNotifier,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<Stanza> {
        self.delivered.lock().clone()
    }

    pub fn delivered_of(&self, kind: StanzaKind) -> Vec<Stanza> {
        self.delivered
            .lock()
            .iter()
            .filter(|s| s.kind() == kind)
            .cloned()
            .collect()
    }

    /// Message bodies in delivery order.
    pub fn bodies(&self) -> Vec<String> {
        self.delivered.lock().iter().filter_map(|s| s.body()).collect()
    }

    pub fn raw(&self) -> Vec<String> {
        self.raw.lock().clone()
    }

    pub fn clear(&self) {
        self.delivered.lock().clear();
        self.raw.lock().clear();
    }
}

#[async_trait]
impl Connection for MockConnection {
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

/// Context serving `example.com` with extra properties.
pub fn context_with(pairs: &[(&str, &str)]) -> Arc<ServerContext> {
    let mut builder = ServerContext::builder().domain(DOMAIN);
    for (name, value) in pairs {
        builder = builder.property(name, value);
    }
    builder.build().expect("test context")
}

pub fn context() -> Arc<ServerContext> {
    context_with(&[])
}

/// Authenticate and bind `user@example.com/resource`.
pub async fn bind(
    ctx: &Arc<ServerContext>,
    user: &str,
    resource: &str,
) -> (Arc<ClientSession>, Arc<MockConnection>) {
    let conn = MockConnection::new();
    let session = ctx
        .session_manager()
        .create_client_session(conn.clone())
        .expect("session created");
    ctx.session_manager()
        .authenticate(&session, user)
        .expect("authenticated");
    ctx.session_manager()
        .bind(&session, Some(resource))
        .await
        .expect("resource bound");
    (session, conn)
}

pub fn presence(priority: i8) -> Stanza {
    Stanza::presence(PresenceType::Available).with_child(
        Element::builder("priority", ns::JABBER_CLIENT)
            .append(priority.to_string())
            .build(),
    )
}

/// Send initial or updated presence for `session`.
pub fn available(ctx: &Arc<ServerContext>, session: &Arc<ClientSession>, priority: i8) {
    ctx.packet_router()
        .route_from_session(session, presence(priority));
}

pub fn unavailable(ctx: &Arc<ServerContext>, session: &Arc<ClientSession>) {
    ctx.packet_router()
        .route_from_session(session, Stanza::presence(PresenceType::Unavailable));
}

pub fn chat(to: &str, body: &str) -> Stanza {
    Stanza::message(jid(to), body).with_type("chat")
}

/// C2S listener running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
}

impl TestServer {
    pub async fn start(pairs: &[(&str, &str)]) -> Self {
        let mut all = vec![("c2s.listen", "127.0.0.1:0")];
        all.extend_from_slice(pairs);
        let ctx = context_with(&all);
        let server = C2sServer::bind(Arc::clone(&ctx))
            .await
            .expect("Failed to bind test server");
        let addr = server.local_addr().expect("Failed to get local addr");
        tokio::spawn(server.run());
        Self { addr, ctx }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to test server");
        TestClient {
            stream,
            buffer: Vec::new(),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ctx.shutdown_token().cancel();
    }
}

/// Raw XMPP client over TCP.
pub struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn send(&mut self, data: &str) -> Result<(), std::io::Error> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Read until the buffer contains `pattern`.
    pub async fn read_until(&mut self, pattern: &str) -> Result<String, std::io::Error> {
        let start = std::time::Instant::now();
        loop {
            let data = String::from_utf8_lossy(&self.buffer).to_string();
            if data.contains(pattern) {
                return Ok(data);
            }
            let Some(remaining) = DEFAULT_TIMEOUT.checked_sub(start.elapsed()) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for pattern: {}", pattern),
                ));
            };

            let mut buf = [0u8; 4096];
            let n = match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Timeout waiting for pattern: {}", pattern),
                    ))
                }
            };
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed while waiting for: {}", pattern),
                ));
            }
            self.buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Read until the server closes the connection.
    pub async fn read_to_end(&mut self) -> Result<String, std::io::Error> {
        let mut rest = Vec::new();
        timeout(DEFAULT_TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Read timeout"))??;
        self.buffer.extend_from_slice(&rest);
        Ok(String::from_utf8_lossy(&self.buffer).to_string())
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub async fn send_stream_header(&mut self, to: &str) -> Result<(), std::io::Error> {
        let header = format!(
            "<?xml version='1.0'?>\
            <stream:stream \
            xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' \
            to='{}' \
            version='1.0'>",
            to
        );
        self.send(&header).await
    }

    pub async fn expect_features(&mut self) -> Result<String, std::io::Error> {
        let features = self.read_until("</stream:features>").await?;
        self.clear_buffer();
        Ok(features)
    }

    /// SASL PLAIN authentication followed by stream restart.
    pub async fn authenticate_plain(&mut self, user: &str, password: &str) -> Result<(), std::io::Error> {
        use base64::prelude::*;
        let payload = BASE64_STANDARD.encode(format!("\0{}\0{}", user, password));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await?;
        self.read_until("<success").await?;
        self.clear_buffer();
        self.send_stream_header(DOMAIN).await?;
        self.expect_features().await?;
        Ok(())
    }

    /// Bind `resource` and return the server's reply.
    pub async fn bind(&mut self, resource: &str) -> Result<String, std::io::Error> {
        self.send(&format!(
            "<iq type='set' id='bind_1'>\
            <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind>\
            </iq>",
            resource
        ))
        .await?;
        let reply = self.read_until("</iq>").await?;
        self.clear_buffer();
        Ok(reply)
    }

    /// Full login: header, PLAIN auth, bind.
    pub async fn login(&mut self, user: &str, password: &str, resource: &str) -> Result<String, std::io::Error> {
        self.send_stream_header(DOMAIN).await?;
        self.expect_features().await?;
        self.authenticate_plain(user, password).await?;
        self.bind(resource).await
    }
}
