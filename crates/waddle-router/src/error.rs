//! Error types for the routing core.

use thiserror::Error;

use crate::stanza::ns;

/// Errors surfaced by the routing core.
///
/// Only [`RouterError::Stanza`] carries a protocol condition as-is; every
/// other variant is mapped by [`RouterError::stanza_condition`].
#[derive(Debug, Error)]
pub enum RouterError {
    /// Socket or listener failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound bytes are not well-formed XML
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream negotiation or transport failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error, fatal for the operation that raised it
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials rejected by the auth provider
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A close listener is already registered on the connection
    #[error("Close listener already registered")]
    CloseListenerRegistered,

    /// Cache layer error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Cluster coordination error
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Fault that must not reach the wire
    #[error("Internal error: {0}")]
    Internal(String),

    /// Protocol error returned to the sender in an error reply
    #[error("Stanza error: {condition}")]
    Stanza {
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<String>,
    },
}

impl RouterError {
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// `not-authorized` / `auth`
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAuthorized,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// `bad-request` / `modify`
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// `feature-not-implemented` / `cancel`
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// `service-unavailable` / `cancel`
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Map any error onto the stanza condition reported to the sender.
    ///
    /// Internal faults collapse to `internal-server-error` so no implementation
    /// detail reaches the wire.
    pub fn stanza_condition(&self) -> (StanzaErrorCondition, StanzaErrorType) {
        match self {
            Self::Stanza {
                condition,
                error_type,
                ..
            } => (*condition, *error_type),
            Self::AuthFailed(_) => (StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth),
            Self::XmlParse(_) => (StanzaErrorCondition::BadRequest, StanzaErrorType::Modify),
            Self::Cluster(_) | Self::Cache(_) => (
                StanzaErrorCondition::ServiceUnavailable,
                StanzaErrorType::Cancel,
            ),
            _ => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
            ),
        }
    }
}

/// Errors raised by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The distributed lock service could not grant the lock
    #[error("Lock unavailable for {key} in cache {cache}")]
    LockUnavailable { cache: String, key: String },

    /// The cluster cache backend failed
    #[error("Cache backend failure: {0}")]
    Backend(String),

    /// An entry could not be encoded or decoded
    #[error("Cache codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A cache was requested with types other than the ones it was created with
    #[error("Cache {0} exists with different key or value types")]
    TypeMismatch(String),
}

/// Errors raised by cluster coordination.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Distributed coordination failed
    #[error("Cluster coordination failed: {0}")]
    Coordination(String),

    /// A cluster task could not be encoded or decoded
    #[error("Cluster task codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The target node is not a member of the cluster
    #[error("Unknown cluster node: {0}")]
    UnknownNode(String),
}

/// Controlled rejection signalled by an interceptor.
///
/// Not an error path: routers catch it, optionally notify the sender with
/// `message`, and stop processing the stanza.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketRejected {
    /// Optional text sent back to the sender
    pub message: Option<String>,
}

impl PacketRejected {
    /// Reject without notifying the sender.
    pub fn silent() -> Self {
        Self { message: None }
    }

    /// Reject and tell the sender why.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for PacketRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "packet rejected: {}", m),
            None => write!(f, "packet rejected"),
        }
    }
}

/// Defined stanza error conditions, RFC 6120 §8.3.3.
///
/// Only the conditions the core emits are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    RecipientUnavailable,
    RemoteServerNotFound,
    ServiceUnavailable,
    UndefinedCondition,
    UnexpectedRequest,
}

const CONDITION_NAMES: &[(StanzaErrorCondition, &str)] = &[
    (StanzaErrorCondition::BadRequest, "bad-request"),
    (StanzaErrorCondition::Conflict, "conflict"),
    (StanzaErrorCondition::FeatureNotImplemented, "feature-not-implemented"),
    (StanzaErrorCondition::Forbidden, "forbidden"),
    (StanzaErrorCondition::InternalServerError, "internal-server-error"),
    (StanzaErrorCondition::ItemNotFound, "item-not-found"),
    (StanzaErrorCondition::JidMalformed, "jid-malformed"),
    (StanzaErrorCondition::NotAcceptable, "not-acceptable"),
    (StanzaErrorCondition::NotAllowed, "not-allowed"),
    (StanzaErrorCondition::NotAuthorized, "not-authorized"),
    (StanzaErrorCondition::RecipientUnavailable, "recipient-unavailable"),
    (StanzaErrorCondition::RemoteServerNotFound, "remote-server-not-found"),
    (StanzaErrorCondition::ServiceUnavailable, "service-unavailable"),
    (StanzaErrorCondition::UndefinedCondition, "undefined-condition"),
    (StanzaErrorCondition::UnexpectedRequest, "unexpected-request"),
];

impl StanzaErrorCondition {
    /// Local name of the condition element.
    pub fn as_str(&self) -> &'static str {
        CONDITION_NAMES
            .iter()
            .find(|(condition, _)| condition == self)
            .map(|(_, name)| *name)
            .unwrap_or("undefined-condition")
    }

    /// Condition for an element name, `None` for names the core never emits.
    pub fn from_name(name: &str) -> Option<Self> {
        CONDITION_NAMES
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(condition, _)| *condition)
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `type` attribute on `<error/>`, RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closing tag of an XMPP stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// `<stream:error/>` for `condition`, leaving the stream open.
pub fn stream_error_element(condition: &str, text: Option<&str>) -> String {
    match text {
        Some(text) => format!(
            "<stream:error><{condition} xmlns='{ns}'/><text xmlns='{ns}' xml:lang='en'>{text}</text></stream:error>",
            ns = ns::STREAMS_ERROR,
        ),
        None => format!(
            "<stream:error><{condition} xmlns='{ns}'/></stream:error>",
            ns = ns::STREAMS_ERROR,
        ),
    }
}

/// `<stream:error/>` followed by the closing tag. A stream error always
/// ends the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    stream_error_element(condition, text) + STREAM_CLOSE
}

/// Stream error condition names, RFC 6120 §4.9.3.
pub mod stream_errors {
    pub const BAD_FORMAT: &str = "bad-format";
    /// Another stream bound the same full JID.
    pub const CONFLICT: &str = "conflict";
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// `to` names a domain this node does not serve.
    pub const HOST_UNKNOWN: &str = "host-unknown";
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    pub const POLICY_VIOLATION: &str = "policy-violation";
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    pub const UNSUPPORTED_STANZA_TYPE: &str = "unsupported-stanza-type";
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}
