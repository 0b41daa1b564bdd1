//! Test utilities for driving an [`XmppClient`] through scripted server frames.
//!
//! The scripted server plays the other end of the wire: it feeds the client
//! synthetic elements and records every [`WireFrame`] the client emits.

#![allow(dead_code)]

use std::sync::Arc;

use jid::FullJid;
use minidom::Element;
use tokio::sync::mpsc::UnboundedReceiver;
use xmpp_engine::{
    stanza::ns, wire_channel, EngineConfig, StreamHeader, WireFrame, XmppClient,
};

pub const JID: &str = "tim@example.com";
pub const PASSWORD: &str = "tanstaaftanstaaf";
pub const BOUND_JID: &str = "tim@example.com/engine";

/// RFC 2195 challenge and the response it must produce for tim.
pub const CRAM_CHALLENGE: &str = "PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+";
pub const CRAM_RESPONSE: &str = "dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw";

pub const RSM_NS: &str = "http://jabber.org/protocol/rsm";

pub fn config() -> EngineConfig {
    EngineConfig::new(JID, PASSWORD)
}

pub struct ScriptedServer {
    pub client: XmppClient,
    pub wire: UnboundedReceiver<WireFrame>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let (sink, wire) = wire_channel();
        let client = XmppClient::new(config, Arc::new(sink)).expect("test config should be valid");
        Self { client, wire }
    }

    pub fn feed(&self, element: Element) {
        self.client.handle_element(element);
    }

    pub fn next_frame(&mut self) -> WireFrame {
        self.wire
            .try_recv()
            .expect("client should have sent a frame")
    }

    pub fn next_element(&mut self) -> Element {
        match self.next_frame() {
            WireFrame::Element(element) => element,
            other => panic!("expected an element, got {other:?}"),
        }
    }

    pub fn expect_header(&mut self) {
        match self.next_frame() {
            WireFrame::StreamHeader(header) => {
                assert_eq!(header.to.as_deref(), Some("example.com"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
            }
            other => panic!("expected a stream header, got {other:?}"),
        }
    }

    pub fn drain(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.wire.try_recv() {
            frames.push(frame);
        }
        frames
    }

    // ── Negotiation steps ─────────────────────────────────────────

    /// Offline → NegotiatingStream, with the server's header received.
    pub fn open_stream(&mut self) {
        self.client.connect().expect("connect from offline");
        self.client
            .on_transport_connected()
            .expect("transport connected while connecting");
        self.expect_header();
        self.client.handle_stream_header(&server_header());
    }

    /// NegotiatingStream → NegotiatingSecurity.
    pub fn offer_starttls(&mut self) {
        self.feed(features(vec![starttls(), mechanisms(&["CRAM-MD5", "PLAIN"])]));
        let request = self.next_element();
        assert!(request.is("starttls", ns::TLS));
    }

    /// NegotiatingSecurity → NegotiatingStream over TLS.
    pub fn upgrade(&mut self) {
        self.feed(Element::bare("proceed", ns::TLS));
        assert_eq!(self.next_frame(), WireFrame::StartTlsUpgrade);
        self.client
            .on_security_established()
            .expect("upgrade was requested");
        self.expect_header();
        self.client.handle_stream_header(&server_header());
    }

    /// NegotiatingStream → Authenticating.
    pub fn offer_mechanisms(&mut self, names: &[&str]) -> Element {
        self.feed(features(vec![mechanisms(names)]));
        let auth = self.next_element();
        assert!(auth.is("auth", ns::SASL));
        auth
    }

    pub fn answer_cram_challenge(&mut self) {
        self.feed(challenge(CRAM_CHALLENGE));
        let response = self.next_element();
        assert!(response.is("response", ns::SASL));
        assert_eq!(response.text(), CRAM_RESPONSE);
    }

    /// Authenticating → NegotiatingStream (restarted).
    pub fn succeed(&mut self) {
        self.feed(Element::bare("success", ns::SASL));
        self.expect_header();
        self.client.handle_stream_header(&server_header());
    }

    /// NegotiatingStream → BindingResource. Returns the bind request.
    pub fn offer_bind(&mut self) -> Element {
        self.feed(features(vec![Element::bare("bind", ns::BIND)]));
        let request = self.next_element();
        assert_eq!(request.name(), "iq");
        assert_eq!(request.attr("type"), Some("set"));
        assert!(request.get_child("bind", ns::BIND).is_some());
        request
    }

    /// BindingResource → Online.
    pub fn bind(&mut self, request: &Element) {
        let id = request.attr("id").expect("bind request has an id");
        self.feed(bind_result(id, BOUND_JID));
    }

    pub fn drive_to_online(&mut self) -> FullJid {
        self.open_stream();
        self.offer_starttls();
        self.upgrade();
        self.offer_mechanisms(&["PLAIN", "CRAM-MD5"]);
        self.answer_cram_challenge();
        self.succeed();
        let request = self.offer_bind();
        self.bind(&request);
        assert!(self.drain().is_empty(), "no frames after binding");
        self.client.bound_jid().expect("bound after negotiation")
    }
}

pub fn server_header() -> StreamHeader {
    StreamHeader {
        from: Some("example.com".to_string()),
        id: Some("s1".to_string()),
        version: Some("1.0".to_string()),
        ..StreamHeader::default()
    }
}

// ── Element builders ──────────────────────────────────────────────

pub fn features(children: Vec<Element>) -> Element {
    Element::builder("features", ns::STREAM)
        .append_all(children)
        .build()
}

pub fn starttls() -> Element {
    Element::bare("starttls", ns::TLS)
}

pub fn mechanisms(names: &[&str]) -> Element {
    Element::builder("mechanisms", ns::SASL)
        .append_all(names.iter().map(|name| {
            Element::builder("mechanism", ns::SASL)
                .append(name.to_string())
                .build()
        }))
        .build()
}

pub fn challenge(payload: &str) -> Element {
    Element::builder("challenge", ns::SASL)
        .append(payload.to_string())
        .build()
}

pub fn sasl_failure(condition: &str, text: Option<&str>) -> Element {
    let mut failure =
        Element::builder("failure", ns::SASL).append(Element::bare(condition, ns::SASL));
    if let Some(text) = text {
        failure = failure.append(
            Element::builder("text", ns::SASL)
                .append(text.to_string())
                .build(),
        );
    }
    failure.build()
}

pub fn stream_error(condition: &str) -> Element {
    Element::builder("error", ns::STREAM)
        .append(Element::bare(condition, ns::STREAMS))
        .build()
}

pub fn bind_result(id: &str, jid: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .append(
            Element::builder("bind", ns::BIND)
                .append(
                    Element::builder("jid", ns::BIND)
                        .append(jid.to_string())
                        .build(),
                )
                .build(),
        )
        .build()
}

pub fn iq_result(id: &str, payload: Option<Element>) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .attr("from", "pubsub.example.com")
        .append_all(payload)
        .build()
}

pub fn iq_error(id: &str, error_type: &str, condition: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "error")
        .attr("id", id)
        .attr("from", "pubsub.example.com")
        .append(
            Element::builder("error", ns::JABBER_CLIENT)
                .attr("type", error_type)
                .append(Element::bare(condition, ns::STANZAS))
                .build(),
        )
        .build()
}

pub fn iq_request(id: &str, iq_type: &str, payload: Element) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", iq_type)
        .attr("id", id)
        .attr("from", "example.com")
        .append(payload)
        .build()
}

pub fn chat(from: &str, body: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("type", "chat")
        .attr("from", from)
        .append(
            Element::builder("body", ns::JABBER_CLIENT)
                .append(body.to_string())
                .build(),
        )
        .build()
}

pub fn presence(from: &str) -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr("from", from)
        .build()
}

pub fn query(namespace: &str) -> Element {
    Element::bare("query", namespace)
}
