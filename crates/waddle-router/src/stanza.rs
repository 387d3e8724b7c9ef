//! Addressed, typed stanzas with an opaque XML payload.
//!
//! The routing core only reads the stanza header (`to`, `from`, `id`,
//! `type`) and a handful of well-known children (presence `show` and
//! `priority`, message `body`). Everything else is carried through untouched.

use std::fmt;

use jid::Jid;
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;
use crate::error::{RouterError, StanzaErrorCondition, StanzaErrorType};

/// Namespace URIs used by the routing core
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAMS_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XEP-0199 ping
    pub const PING: &str = "urn:xmpp:ping";
    /// XEP-0033 extended stanza addressing
    pub const ADDRESS: &str = "http://jabber.org/protocol/address";
    /// XEP-0115 entity capabilities
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
}

/// Top-level stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    /// Element name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Presence `type` attribute values (RFC 6121).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None => Some(Self::Available),
            Some("unavailable") => Some(Self::Unavailable),
            Some("subscribe") => Some(Self::Subscribe),
            Some("subscribed") => Some(Self::Subscribed),
            Some("unsubscribe") => Some(Self::Unsubscribe),
            Some("unsubscribed") => Some(Self::Unsubscribed),
            Some("probe") => Some(Self::Probe),
            Some("error") => Some(Self::Error),
            Some(_) => None,
        }
    }

    /// Attribute value, `None` for available presence.
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Probe => Some("probe"),
            Self::Error => Some("error"),
        }
    }

    /// Whether this is one of the four subscription management types.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Subscribed | Self::Unsubscribe | Self::Unsubscribed
        )
    }
}

/// Presence `show` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Show {
    Chat,
    /// No `show` element
    #[default]
    Available,
    Away,
    Xa,
    Dnd,
}

impl Show {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "chat" => Show::Chat,
            "away" => Show::Away,
            "xa" => Show::Xa,
            "dnd" => Show::Dnd,
            _ => Show::Available,
        }
    }

    /// Rank used when picking a resource for a bare-JID message; lower wins.
    pub fn rank(&self) -> u8 {
        match self {
            Show::Chat => 1,
            Show::Available => 2,
            Show::Away => 3,
            Show::Xa => 4,
            Show::Dnd => 5,
        }
    }
}

/// Message `type` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

/// IQ `type` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    /// Whether the IQ expects a response.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// A routable stanza.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Stanza {
    kind: StanzaKind,
    to: Option<Jid>,
    from: Option<Jid>,
    id: Option<String>,
    stanza_type: Option<String>,
    lang: Option<String>,
    children: Vec<Element>,
}

impl Stanza {
    /// Create an empty stanza of the given kind.
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            to: None,
            from: None,
            id: None,
            stanza_type: None,
            lang: None,
            children: Vec::new(),
        }
    }

    /// Create a message with a body.
    pub fn message(to: Jid, body: &str) -> Self {
        let mut stanza = Self::new(StanzaKind::Message).with_to(to);
        stanza.add_child(
            Element::builder("body", ns::JABBER_CLIENT)
                .append(body)
                .build(),
        );
        stanza
    }

    /// Create a presence of the given type.
    pub fn presence(presence_type: PresenceType) -> Self {
        let mut stanza = Self::new(StanzaKind::Presence);
        stanza.stanza_type = presence_type.as_attr().map(str::to_string);
        stanza
    }

    /// Create an IQ of the given type with a single payload child.
    pub fn iq(iq_type: IqType, id: &str, payload: Option<Element>) -> Self {
        let mut stanza = Self::new(StanzaKind::Iq).with_id(id);
        stanza.stanza_type = Some(
            match iq_type {
                IqType::Get => "get",
                IqType::Set => "set",
                IqType::Result => "result",
                IqType::Error => "error",
            }
            .to_string(),
        );
        if let Some(payload) = payload {
            stanza.add_child(payload);
        }
        stanza
    }

    /// Build a stanza from a parsed element.
    pub fn from_element(element: &Element) -> Result<Self, RouterError> {
        let kind = StanzaKind::from_name(element.name()).ok_or_else(|| {
            RouterError::xml_parse(format!("Not a stanza: <{}/>", element.name()))
        })?;

        Ok(Self {
            kind,
            to: parse_jid_attr(element, "to")?,
            from: parse_jid_attr(element, "from")?,
            id: element.attr("id").map(str::to_string),
            stanza_type: element.attr("type").map(str::to_string),
            lang: element.attr("xml:lang").map(str::to_string),
            children: element.children().cloned().collect(),
        })
    }

    /// Parse a stanza from its XML text.
    pub fn from_xml(xml: &str) -> Result<Self, RouterError> {
        let element: Element = xml
            .parse()
            .map_err(|e| RouterError::xml_parse(format!("Failed to parse stanza: {}", e)))?;
        Self::from_element(&element)
    }

    /// Render the stanza as an element in the client namespace.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.kind.name(), ns::JABBER_CLIENT);
        if let Some(to) = &self.to {
            builder = builder.attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            builder = builder.attr("from", from.to_string());
        }
        if let Some(id) = &self.id {
            builder = builder.attr("id", id.as_str());
        }
        if let Some(stanza_type) = &self.stanza_type {
            builder = builder.attr("type", stanza_type.as_str());
        }
        if let Some(lang) = &self.lang {
            builder = builder.attr("xml:lang", lang.as_str());
        }
        for child in &self.children {
            builder = builder.append(child.clone());
        }
        builder.build()
    }

    /// Serialize to XML text.
    pub fn to_xml(&self) -> String {
        String::from(&self.to_element())
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Raw `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.stanza_type.as_deref()
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn set_to(&mut self, to: Option<Jid>) {
        self.to = to;
    }

    pub fn set_from(&mut self, from: Option<Jid>) {
        self.from = from;
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    pub fn set_stanza_type(&mut self, stanza_type: Option<String>) {
        self.stanza_type = stanza_type;
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_type(mut self, stanza_type: &str) -> Self {
        self.stanza_type = Some(stanza_type.to_string());
        self
    }

    /// Payload children.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn add_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// First child with the given name and namespace.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name() == name && c.ns() == namespace)
    }

    /// First child with the given name in the client namespace.
    fn client_child(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name() == name && (c.ns() == ns::JABBER_CLIENT || c.ns() == ns::JABBER_SERVER))
    }

    /// Namespace of the first payload child, used to dispatch IQs.
    pub fn payload_namespace(&self) -> Option<String> {
        self.children.first().map(|c| c.ns())
    }

    /// Message body text.
    pub fn body(&self) -> Option<String> {
        self.client_child("body").map(|b| b.text())
    }

    /// Message thread id.
    pub fn thread(&self) -> Option<String> {
        self.client_child("thread").map(|t| t.text())
    }

    /// Presence type, `None` when the attribute holds an unknown value or
    /// the stanza is not a presence.
    pub fn presence_type(&self) -> Option<PresenceType> {
        if self.kind != StanzaKind::Presence {
            return None;
        }
        PresenceType::parse(self.stanza_type())
    }

    /// Whether this is an available presence.
    pub fn is_available_presence(&self) -> bool {
        self.presence_type() == Some(PresenceType::Available)
    }

    /// Presence `show`, defaults to available.
    pub fn show(&self) -> Show {
        self.client_child("show")
            .map(|s| Show::parse(&s.text()))
            .unwrap_or_default()
    }

    /// Presence priority clamped to the RFC range, 0 when absent or invalid.
    pub fn priority(&self) -> i8 {
        self.client_child("priority")
            .and_then(|p| p.text().trim().parse::<i32>().ok())
            .map(|p| p.clamp(i8::MIN as i32, i8::MAX as i32) as i8)
            .unwrap_or(0)
    }

    /// Message type, defaults to normal.
    pub fn message_type(&self) -> MessageType {
        match self.stanza_type() {
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            _ => MessageType::Normal,
        }
    }

    /// IQ type, `None` if missing or invalid.
    pub fn iq_type(&self) -> Option<IqType> {
        match self.stanza_type() {
            Some("get") => Some(IqType::Get),
            Some("set") => Some(IqType::Set),
            Some("result") => Some(IqType::Result),
            Some("error") => Some(IqType::Error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    /// Reply with addresses swapped and the same id and no payload.
    pub fn create_reply(&self) -> Self {
        Self {
            kind: self.kind,
            to: self.from.clone(),
            from: self.to.clone(),
            id: self.id.clone(),
            stanza_type: self.stanza_type.clone(),
            lang: None,
            children: Vec::new(),
        }
    }

    /// Error reply carrying the original payload and an error element.
    pub fn error_reply(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Self {
        let mut error = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", error_type.as_str())
            .append(Element::builder(condition.as_str(), ns::STANZAS).build());
        if let Some(text) = text {
            error = error.append(
                Element::builder("text", ns::STANZAS)
                    .attr("xml:lang", "en")
                    .append(text)
                    .build(),
            );
        }

        let mut reply = self.create_reply();
        reply.stanza_type = Some("error".to_string());
        reply.children = self
            .children
            .iter()
            .filter(|c| c.name() != "error")
            .cloned()
            .collect();
        reply.children.push(error.build());
        reply
    }

    /// Error condition carried by an error stanza.
    pub fn error_condition(&self) -> Option<String> {
        self.client_child("error")
            .and_then(|e| e.children().find(|c| c.ns() == ns::STANZAS && c.name() != "text"))
            .map(|c| c.name().to_string())
    }
}

fn parse_jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, RouterError> {
    match element.attr(name) {
        Some(value) if !value.is_empty() => Jid::new(value).map(Some).map_err(|e| {
            RouterError::Stanza {
                condition: StanzaErrorCondition::JidMalformed,
                error_type: StanzaErrorType::Modify,
                text: Some(format!("invalid '{}' address: {}", name, e)),
            }
        }),
        _ => Ok(None),
    }
}

impl Cacheable for Stanza {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.to_xml().len()
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

impl From<Stanza> for String {
    fn from(stanza: Stanza) -> Self {
        stanza.to_xml()
    }
}

impl TryFrom<String> for Stanza {
    type Error = RouterError;

    fn try_from(xml: String) -> Result<Self, Self::Error> {
        Stanza::from_xml(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presence_header_and_children() {
        let stanza = Stanza::from_xml(
            "<presence xmlns='jabber:client' from='alice@example.com/phone' to='bob@example.com'>\
             <show>away</show><priority>7</priority></presence>",
        )
        .unwrap();

        assert_eq!(stanza.kind(), StanzaKind::Presence);
        assert_eq!(stanza.from().unwrap().to_string(), "alice@example.com/phone");
        assert_eq!(stanza.to().unwrap().to_string(), "bob@example.com");
        assert!(stanza.is_available_presence());
        assert_eq!(stanza.show(), Show::Away);
        assert_eq!(stanza.priority(), 7);
    }

    #[test]
    fn test_priority_clamps_and_defaults() {
        let stanza = Stanza::from_xml(
            "<presence xmlns='jabber:client'><priority>500</priority></presence>",
        )
        .unwrap();
        assert_eq!(stanza.priority(), 127);

        let stanza = Stanza::from_xml(
            "<presence xmlns='jabber:client'><priority>high</priority></presence>",
        )
        .unwrap();
        assert_eq!(stanza.priority(), 0);
    }

    #[test]
    fn test_unknown_presence_type_is_rejected() {
        let stanza = Stanza::from_xml("<presence xmlns='jabber:client' type='bogus'/>").unwrap();
        assert_eq!(stanza.presence_type(), None);
    }

    #[test]
    fn test_non_stanza_element_fails() {
        let err = Stanza::from_xml("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap_err();
        assert!(matches!(err, RouterError::XmlParse(_)));
    }

    #[test]
    fn test_malformed_address_is_jid_malformed() {
        let err = Stanza::from_xml("<message xmlns='jabber:client' to='@@/'/>").unwrap_err();
        assert!(matches!(
            err,
            RouterError::Stanza {
                condition: StanzaErrorCondition::JidMalformed,
                ..
            }
        ));
    }

    #[test]
    fn test_error_reply_swaps_addresses() {
        let request = Stanza::iq(
            IqType::Get,
            "q1",
            Some(Element::builder("query", "urn:example:q").build()),
        )
        .with_from(Jid::new("alice@example.com/phone").unwrap())
        .with_to(Jid::new("example.com").unwrap());

        let reply = request.error_reply(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            None,
        );

        assert_eq!(reply.to().unwrap().to_string(), "alice@example.com/phone");
        assert_eq!(reply.from().unwrap().to_string(), "example.com");
        assert_eq!(reply.id(), Some("q1"));
        assert!(reply.is_error());
        assert_eq!(
            reply.error_condition().as_deref(),
            Some("service-unavailable")
        );
        assert!(reply.child("query", "urn:example:q").is_some());
    }

    #[test]
    fn test_message_body_and_thread_survive_xml() {
        let mut message = Stanza::message(Jid::new("bob@example.com").unwrap(), "hello")
            .with_type("chat");
        message.add_child(
            Element::builder("thread", ns::JABBER_CLIENT)
                .append("t-1")
                .build(),
        );

        let parsed = Stanza::from_xml(&message.to_xml()).unwrap();
        assert_eq!(parsed.body().as_deref(), Some("hello"));
        assert_eq!(parsed.thread().as_deref(), Some("t-1"));
        assert_eq!(parsed.message_type(), MessageType::Chat);
    }

    #[test]
    fn test_show_rank_order() {
        assert!(Show::Chat.rank() < Show::Available.rank());
        assert!(Show::Available.rank() < Show::Away.rank());
        assert!(Show::Xa.rank() < Show::Dnd.rank());
    }
}
