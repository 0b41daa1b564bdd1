use std::{fmt, str::FromStr};

use jid::Jid;
use minidom::Element;

use crate::error::StanzaError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error condition namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl StanzaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Iq => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "iq" => Some(StanzaKind::Iq),
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

impl FromStr for IqType {
    type Err = StanzaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(StanzaError::InvalidIqType(Some(other.to_string()))),
        }
    }
}

/// Semantic envelope around a top-level protocol element.
///
/// The payload is opaque: extension elements are carried verbatim and never
/// interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    id: Option<String>,
    stanza_type: Option<String>,
    from: Option<Jid>,
    to: Option<Jid>,
    payload: Vec<Element>,
    error: Option<Element>,
}

impl Stanza {
    /// An info-query request or response. The id is assigned when sent.
    pub fn iq(iq_type: IqType, to: Option<Jid>, payload: Option<Element>) -> Self {
        Self {
            kind: StanzaKind::Iq,
            id: None,
            stanza_type: Some(iq_type.as_str().to_string()),
            from: None,
            to,
            payload: payload.into_iter().collect(),
            error: None,
        }
    }

    pub fn message(to: Option<Jid>, message_type: Option<&str>, payload: Vec<Element>) -> Self {
        Self {
            kind: StanzaKind::Message,
            id: None,
            stanza_type: message_type.map(str::to_string),
            from: None,
            to,
            payload,
            error: None,
        }
    }

    pub fn presence(to: Option<Jid>, presence_type: Option<&str>, payload: Vec<Element>) -> Self {
        Self {
            kind: StanzaKind::Presence,
            id: None,
            stanza_type: presence_type.map(str::to_string),
            from: None,
            to,
            payload,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_error(mut self, error: Element) -> Self {
        self.error = Some(error);
        self
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The raw `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.stanza_type.as_deref()
    }

    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        self.stanza_type.as_deref().and_then(|t| t.parse().ok())
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn payload(&self) -> &[Element] {
        &self.payload
    }

    /// The first payload child, which for IQs is the query element.
    pub fn first_payload(&self) -> Option<&Element> {
        self.payload.first()
    }

    pub fn error(&self) -> Option<&Element> {
        self.error.as_ref()
    }

    pub fn is_response(&self) -> bool {
        matches!(self.iq_type(), Some(IqType::Result | IqType::Error))
    }

    pub fn to_element(&self) -> Element {
        Element::builder(self.kind.as_str(), ns::JABBER_CLIENT)
            .attr("id", self.id.clone())
            .attr("type", self.stanza_type.clone())
            .attr("from", self.from.as_ref().map(|jid| jid.to_string()))
            .attr("to", self.to.as_ref().map(|jid| jid.to_string()))
            .append_all(self.payload.iter().cloned())
            .append_all(self.error.iter().cloned())
            .build()
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let kind = StanzaKind::from_name(element.name())
            .ok_or_else(|| StanzaError::UnknownKind(element.name().to_string()))?;
        let id = element.attr("id").map(str::to_string);
        let stanza_type = element.attr("type").map(str::to_string);

        if kind == StanzaKind::Iq {
            if id.is_none() {
                return Err(StanzaError::MissingId);
            }
            match stanza_type.as_deref() {
                Some(value) => {
                    value.parse::<IqType>()?;
                }
                None => return Err(StanzaError::InvalidIqType(None)),
            }
        }

        let from = parse_address(&element, "from")?;
        let to = parse_address(&element, "to")?;

        let mut payload = Vec::new();
        let mut error = None;
        for child in element.children() {
            if child.name() == "error" && stanza_type.as_deref() == Some("error") {
                error = Some(child.clone());
            } else {
                payload.push(child.clone());
            }
        }

        Ok(Self {
            kind,
            id,
            stanza_type,
            from,
            to,
            payload,
            error,
        })
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        value.to_element()
    }
}

fn parse_address(element: &Element, attribute: &'static str) -> Result<Option<Jid>, StanzaError> {
    element
        .attr(attribute)
        .map(|value| {
            value
                .parse::<Jid>()
                .map_err(|error| StanzaError::InvalidAddress {
                    attribute,
                    value: value.to_string(),
                    reason: error.to_string(),
                })
        })
        .transpose()
}

/// A page of results from a windowed query, with the window that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultWindow<T> {
    pub offset: usize,
    pub max_count: usize,
    /// The server has more results past this window.
    pub more: bool,
    pub items: Vec<T>,
}

impl<T> ResultWindow<T> {
    pub fn new(offset: usize, max_count: usize, more: bool, items: Vec<T>) -> Self {
        Self {
            offset,
            max_count,
            more,
            items,
        }
    }

    /// Offset to request the following window with, if any.
    pub fn next_offset(&self) -> Option<usize> {
        self.more.then(|| self.offset + self.items.len())
    }
}
