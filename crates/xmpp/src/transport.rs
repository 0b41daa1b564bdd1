//! Seam between the engine and the byte-level transport.
//!
//! The transport owns the socket, TLS and XML tokenizing. It hands parsed
//! elements to the client and drains [`WireFrame`]s from a [`WireSink`].

use minidom::Element;
use tokio::sync::mpsc;

use crate::{error::ConnectionError, stanza::ns};

/// Stream header attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    /// Stream id, set by the server.
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Header the client opens (and restarts) its stream with.
    pub fn client(domain: &str) -> Self {
        Self {
            to: Some(domain.to_string()),
            version: Some("1.0".to_string()),
            ..Self::default()
        }
    }

    /// Parses the opening `<stream:stream ...>` tag, which is never closed
    /// and so cannot go through a regular element parser.
    pub fn parse(data: &str) -> Result<Self, ConnectionError> {
        let stream_start = data
            .find("<stream:stream")
            .ok_or_else(|| ConnectionError::TransportFailure("no stream header found".to_string()))?;

        let stream_end = data[stream_start..]
            .find('>')
            .map(|i| stream_start + i)
            .ok_or_else(|| {
                ConnectionError::TransportFailure("incomplete stream header".to_string())
            })?;

        let tag = &data[stream_start..=stream_end];

        Ok(Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }

    /// RFC 6120 streams are version 1.0. A missing version means a pre-1.0
    /// server without stream features.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        match self.version.as_deref() {
            Some("1.0") => Ok(()),
            Some(other) => Err(ConnectionError::UnsupportedVersion(other.to_string())),
            None => Err(ConnectionError::UnsupportedVersion("<none>".to_string())),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}'",
            ns::JABBER_CLIENT,
            ns::STREAM
        );
        for (name, value) in [
            ("to", &self.to),
            ("from", &self.from),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ] {
            if let Some(value) = value {
                xml.push_str(&format!(" {name}='{value}'"));
            }
        }
        xml.push('>');
        xml
    }
}

fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!(" {name}={quote}");
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Something the engine wants written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    StreamHeader(StreamHeader),
    Element(Element),
    /// Start the TLS handshake, then report back through
    /// `XmppClient::on_security_established`.
    StartTlsUpgrade,
    StreamClose,
}

impl WireFrame {
    pub fn element(&self) -> Option<&Element> {
        match self {
            WireFrame::Element(element) => Some(element),
            _ => None,
        }
    }
}

/// Outbound half of the transport. Sends must not block.
pub trait WireSink: Send + Sync + 'static {
    fn send(&self, frame: WireFrame) -> Result<(), ConnectionError>;
}

/// A [`WireSink`] that queues frames for a writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WireFrame>,
}

impl WireSink for ChannelSink {
    fn send(&self, frame: WireFrame) -> Result<(), ConnectionError> {
        self.tx
            .send(frame)
            .map_err(|_| ConnectionError::TransportFailure("writer task has gone away".to_string()))
    }
}

pub fn wire_channel() -> (ChannelSink, mpsc::UnboundedReceiver<WireFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}
