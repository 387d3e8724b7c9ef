//! Per-connection client stream: negotiation and the read loop.
//!
//! The stream opens with a header exchange, authenticates with SASL PLAIN
//! (or ANONYMOUS when `xmpp.auth.anonymous` is set), restarts, binds a
//! resource and from then on hands every stanza to the worker pool.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::prelude::*;
use jid::Jid;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use super::parser::{StreamEvent, StreamHeader, XmlParser};
use super::workers::StanzaWorkers;
use crate::config::{ANONYMOUS_LOGIN, CONNECTION_QUEUE, DEFAULT_CONNECTION_QUEUE};
use crate::connection::{spawn_idle_monitor, Connection, SocketConnection};
use crate::context::ServerContext;
use crate::error::{stream_error_element, stream_errors, RouterError};
use crate::session::{ClientSession, SessionStatus};
use crate::stanza::{ns, IqType, Stanza, StanzaKind};

const READ_BUFFER_SIZE: usize = 8192;

/// Where the stream stands in negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Waiting for the initial header
    Connected,
    /// SASL features sent
    Authenticating,
    /// Authenticated, waiting for the restarted header
    Restarting,
    /// Bind features sent
    Binding,
    /// Resource bound, stanzas are routed
    Established,
}

enum Flow {
    Continue,
    Close,
}

/// A stream error to send before closing.
struct StreamFailure {
    condition: &'static str,
    text: Option<String>,
}

impl StreamFailure {
    fn new(condition: &'static str, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }
}

impl From<RouterError> for StreamFailure {
    fn from(error: RouterError) -> Self {
        match error {
            RouterError::XmlParse(reason) => {
                StreamFailure::new(stream_errors::NOT_WELL_FORMED, reason)
            }
            other => {
                warn!(error = %other, "Client stream failed");
                StreamFailure {
                    condition: stream_errors::INTERNAL_SERVER_ERROR,
                    text: None,
                }
            }
        }
    }
}

/// Serve one client connection until it closes.
///
/// Protocol violations end with a stream error on this connection only.
#[instrument(
    name = "xmpp.connection.lifecycle",
    skip_all,
    fields(client_ip = ?peer, jid = tracing::field::Empty)
)]
pub async fn serve_connection<S>(
    ctx: Arc<ServerContext>,
    workers: Arc<StanzaWorkers>,
    stream: S,
    peer: Option<SocketAddr>,
) -> Result<(), RouterError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let properties = ctx.properties();
    let connection = SocketConnection::spawn(
        writer,
        peer,
        false,
        ctx.backup_deliverer(),
        properties.get_usize(CONNECTION_QUEUE, DEFAULT_CONNECTION_QUEUE),
        properties.ack_timeout(),
    );
    let session = ctx
        .session_manager()
        .create_client_session(Arc::clone(&connection) as Arc<dyn Connection>)?;
    info!(stream_id = %session.stream_id(), "Client connected");

    let closed = connection.closed_token();
    if let Some(idle) = properties.client_idle() {
        spawn_idle_monitor(&session, idle, closed.clone());
    }

    let mut stream = ClientStream {
        ctx: Arc::clone(&ctx),
        session: Arc::clone(&session),
        workers,
        parser: XmlParser::new(),
        state: StreamState::Connected,
    };
    let shutdown = ctx.shutdown_token();
    let result = stream.run(reader, &closed, &shutdown).await;

    if let Err(failure) = result {
        if stream.state == StreamState::Connected {
            // The peer never saw our header, so the error needs one.
            let _ = connection
                .deliver_raw_text_sync(&stream.header_text())
                .await;
        }
        debug!(condition = failure.condition, text = ?failure.text, "Closing stream with error");
        let error = stream_error_element(failure.condition, failure.text.as_deref());
        if let Err(e) = connection.deliver_raw_text_sync(&error).await {
            debug!(error = %e, "Stream error not delivered");
        }
    }
    connection.close().await;
    info!(stream_id = %session.stream_id(), "Client disconnected");
    Ok(())
}

struct ClientStream {
    ctx: Arc<ServerContext>,
    session: Arc<ClientSession>,
    workers: Arc<StanzaWorkers>,
    parser: XmlParser,
    state: StreamState,
}

impl ClientStream {
    async fn run<R>(
        &mut self,
        mut reader: R,
        closed: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<(), StreamFailure>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = closed.cancelled() => return Ok(()),
                _ = shutdown.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Read failed");
                        return Ok(());
                    }
                },
            };
            if n == 0 {
                debug!(stream_id = %self.session.stream_id(), "Peer closed the connection");
                return Ok(());
            }
            self.session.touch();
            self.parser.feed(&buf[..n]);

            while let Some(event) = self.parser.next_event()? {
                if let Flow::Close = self.handle_event(event).await? {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<Flow, StreamFailure> {
        match event {
            StreamEvent::Header(header) => self.open_stream(header).await,
            StreamEvent::End => {
                debug!(stream_id = %self.session.stream_id(), "Client closed the stream");
                Ok(Flow::Close)
            }
            StreamEvent::Element(element) => match self.state {
                StreamState::Authenticating => self.authenticate(&element).await,
                StreamState::Binding | StreamState::Established => {
                    self.handle_stanza(&element).await
                }
                StreamState::Connected | StreamState::Restarting => Err(StreamFailure::new(
                    stream_errors::NOT_WELL_FORMED,
                    "element before stream header",
                )),
            },
        }
    }

    fn header_text(&self) -> String {
        format!(
            "<?xml version='1.0'?>\
            <stream:stream xmlns='{}' \
            xmlns:stream='{}' \
            id='{}' from='{}' version='1.0' xml:lang='en'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.session.stream_id(),
            self.ctx.domain()
        )
    }

    async fn write(&self, text: &str) -> Result<(), StreamFailure> {
        self.session
            .connection()
            .deliver_raw_text_sync(text)
            .await
            .map_err(StreamFailure::from)
    }

    async fn open_stream(&mut self, header: StreamHeader) -> Result<Flow, StreamFailure> {
        if let Some(to) = header.to.as_deref() {
            if to != self.ctx.domain() {
                return Err(StreamFailure::new(
                    stream_errors::HOST_UNKNOWN,
                    format!("this server does not serve {}", to),
                ));
            }
        }
        if let Some(version) = header.version.as_deref() {
            match parse_version(version) {
                Some((1, minor)) => self.session.set_stream_version(1, minor),
                _ => {
                    return Err(StreamFailure::new(
                        stream_errors::UNSUPPORTED_VERSION,
                        format!("unsupported XMPP version: {}", version),
                    ))
                }
            }
        }
        if let Some(lang) = header.lang.as_deref() {
            self.session.set_language(lang);
        }

        let features = match self.state {
            StreamState::Connected => {
                self.session.set_status(SessionStatus::Connected);
                self.state = StreamState::Authenticating;
                self.sasl_features()
            }
            StreamState::Restarting => {
                self.state = StreamState::Binding;
                format!(
                    "<stream:features>\
                        <bind xmlns='{}'/>\
                        <session xmlns='{}'><optional/></session>\
                    </stream:features>",
                    ns::BIND,
                    ns::SESSION
                )
            }
            _ => {
                return Err(StreamFailure::new(
                    stream_errors::NOT_WELL_FORMED,
                    "unexpected stream header",
                ))
            }
        };

        self.write(&format!("{}{}", self.header_text(), features)).await?;
        debug!(state = ?self.state, "Sent stream features");
        Ok(Flow::Continue)
    }

    fn anonymous_allowed(&self) -> bool {
        self.ctx.properties().get_bool(ANONYMOUS_LOGIN, false)
    }

    fn sasl_features(&self) -> String {
        let mut mechanisms = String::new();
        if self.ctx.providers().auth.is_some() {
            mechanisms.push_str("<mechanism>PLAIN</mechanism>");
        }
        if self.anonymous_allowed() {
            mechanisms.push_str("<mechanism>ANONYMOUS</mechanism>");
        }
        format!(
            "<stream:features><mechanisms xmlns='{}'>{}</mechanisms></stream:features>",
            ns::SASL,
            mechanisms
        )
    }

    #[instrument(name = "xmpp.stream.authenticate", skip_all, fields(mechanism = ?element.attr("mechanism")))]
    async fn authenticate(&mut self, element: &Element) -> Result<Flow, StreamFailure> {
        if element.name() != "auth" || element.ns() != ns::SASL {
            return Err(StreamFailure::new(
                stream_errors::NOT_AUTHORIZED,
                "authentication required",
            ));
        }

        let outcome = match element.attr("mechanism").unwrap_or_default() {
            "PLAIN" => self.authenticate_plain(&element.text()),
            "ANONYMOUS" if self.anonymous_allowed() => self
                .ctx
                .session_manager()
                .authenticate_anonymous(&self.session)
                .map_err(|_| "temporary-auth-failure"),
            other => {
                debug!(mechanism = other, "Unsupported SASL mechanism");
                Err("invalid-mechanism")
            }
        };

        match outcome {
            Ok(()) => {
                self.write(&format!("<success xmlns='{}'/>", ns::SASL)).await?;
                self.parser.restart();
                self.state = StreamState::Restarting;
            }
            Err(condition) => {
                self.write(&format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Check PLAIN credentials, returning the SASL failure condition.
    fn authenticate_plain(&self, payload: &str) -> Result<(), &'static str> {
        let Some(auth) = self.ctx.providers().auth.as_ref() else {
            return Err("invalid-mechanism");
        };
        let (username, password) = decode_plain(payload).ok_or("malformed-request")?;
        match auth.authenticate(&username, &password) {
            Ok(()) => self
                .ctx
                .session_manager()
                .authenticate(&self.session, &username)
                .map_err(|_| "not-authorized"),
            Err(e) => {
                info!(username = %username, error = %e, "Authentication failed");
                Err("not-authorized")
            }
        }
    }

    async fn handle_stanza(&mut self, element: &Element) -> Result<Flow, StreamFailure> {
        let Some(kind) = StanzaKind::from_name(element.name()) else {
            return Err(StreamFailure::new(
                stream_errors::UNSUPPORTED_STANZA_TYPE,
                format!("unsupported element <{}/>", element.name()),
            ));
        };
        let stanza = match Stanza::from_element(element) {
            Ok(stanza) => stanza,
            Err(e) => {
                let mut rejected = Stanza::new(kind);
                rejected.set_id(element.attr("id").map(str::to_string));
                let (condition, error_type) = e.stanza_condition();
                self.session
                    .process(rejected.error_reply(condition, error_type, None));
                return Ok(Flow::Continue);
            }
        };

        if self.state == StreamState::Binding && is_bind_request(&stanza) {
            if let Some(full) = self.bind(stanza).await {
                Span::current().record("jid", tracing::field::display(&full));
            }
            return Ok(Flow::Continue);
        }

        self.workers
            .dispatch(&self.session, stanza)
            .await
            .map_err(StreamFailure::from)?;
        Ok(Flow::Continue)
    }

    #[instrument(name = "xmpp.stream.bind", skip_all)]
    async fn bind(&mut self, request: Stanza) -> Option<Jid> {
        let resource = request
            .child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("resource", ns::BIND))
            .map(|r| r.text());

        match self
            .ctx
            .session_manager()
            .bind(&self.session, resource.as_deref())
            .await
        {
            Ok(full) => {
                let payload = Element::builder("bind", ns::BIND)
                    .append(Element::builder("jid", ns::BIND).append(full.to_string()).build())
                    .build();
                let mut reply = Stanza::iq(IqType::Result, request.id().unwrap_or_default(), Some(payload));
                reply.set_to(Some(full.clone()));
                self.session.process(reply);
                self.state = StreamState::Established;
                Some(full)
            }
            Err(e) => {
                debug!(error = %e, "Resource binding failed");
                let (condition, error_type) = e.stanza_condition();
                self.session.process(request.error_reply(condition, error_type, None));
                None
            }
        }
    }
}

fn is_bind_request(stanza: &Stanza) -> bool {
    stanza.iq_type() == Some(IqType::Set) && stanza.child("bind", ns::BIND).is_some()
}

/// `major.minor` of a stream header version attribute.
fn parse_version(version: &str) -> Option<(u8, u8)> {
    let (major, minor) = version.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Decode a SASL PLAIN payload: `authzid \0 authcid \0 password`.
fn decode_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64_STANDARD.decode(payload.trim()).ok()?;
    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let (username, password) = match parts.as_slice() {
        [_authzid, authcid, password] => (*authcid, *password),
        [authcid, password] => (*authcid, *password),
        _ => return None,
    };
    let username = String::from_utf8(username.to_vec()).ok()?;
    let password = String::from_utf8(password.to_vec()).ok()?;
    // A full JID as the authentication identity names the local part only.
    let username = username
        .split_once('@')
        .map(|(node, _)| node.to_string())
        .unwrap_or(username);
    if username.is_empty() {
        return None;
    }
    Some((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_payload() {
        let payload = BASE64_STANDARD.encode(b"\0alice\0secret");
        assert_eq!(
            decode_plain(&payload),
            Some(("alice".to_string(), "secret".to_string()))
        );

        let with_domain = BASE64_STANDARD.encode(b"\0alice@example.com\0secret");
        assert_eq!(decode_plain(&with_domain).map(|(u, _)| u), Some("alice".to_string()));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.0"), Some((1, 0)));
        assert_eq!(parse_version("1.12"), Some((1, 12)));
        assert_eq!(parse_version("1"), None);
        assert_eq!(parse_version("one.zero"), None);
    }

    #[test]
    fn test_decode_plain_rejects_garbage() {
        assert_eq!(decode_plain("not base64!"), None);
        assert_eq!(decode_plain(&BASE64_STANDARD.encode(b"nonull")), None);
        assert_eq!(decode_plain(&BASE64_STANDARD.encode(b"\0\0secret")), None);
    }
}
